use std::sync::Arc;

use async_trait::async_trait;

use crate::handlers::{parse_command, Handler, HandlerResult};
use crate::models::{Classification, HandlerDescriptor, Role, User};
use crate::user_store::UserStore;

static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "users",
    aliases: &["users"],
    category: "admin",
    min_role: Role::Admin,
    cooldown_secs: 1,
    daily_cap: None,
    sensitive: true,
};

/// `!users list|search|info|update|delete|stats [...]`. Delete requires a
/// trailing `confirm` token.
pub struct UsersHandler {
    store: Arc<UserStore>,
}

impl UsersHandler {
    pub fn new(store: Arc<UserStore>) -> Self {
        UsersHandler { store }
    }

    fn resolve<'a>(&self, addressing: &'a str) -> Result<Option<User>, crate::error::StoreError> {
        if let Some(user) = self.store.get_by_address(addressing)? {
            return Ok(Some(user));
        }
        self.store.get_by_phone(addressing)
    }
}

#[async_trait]
impl Handler for UsersHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "users").unwrap_or(false)
    }

    async fn execute(&self, raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        let (_, args) = parse_command(raw_text, &['!', '/']).unwrap_or(("", vec![]));
        match args.as_slice() {
            ["list", ..] => match self.store.list(20, 0) {
                Ok(users) => {
                    let lines: Vec<String> = users.iter().map(|u| format!("{} ({})", u.display_name, u.role.as_str())).collect();
                    HandlerResult::reply(&user.address, lines.join("\n"))
                }
                Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
            },
            ["search", term, ..] => match self.store.search(term, 20) {
                Ok(users) => {
                    let lines: Vec<String> = users.iter().map(|u| format!("{} — {}", u.display_name, u.address)).collect();
                    HandlerResult::reply(&user.address, if lines.is_empty() { "Sin resultados.".to_string() } else { lines.join("\n") })
                }
                Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
            },
            ["info", addressing, ..] => match self.resolve(addressing) {
                Ok(Some(target)) => HandlerResult::reply(
                    &user.address,
                    format!("{} | rol={} | activo={} | mensajes={}", target.display_name, target.role.as_str(), target.active, target.message_count),
                ),
                Ok(None) => HandlerResult::reply(&user.address, "Usuario no encontrado."),
                Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
            },
            ["update", addressing, field, value, ..] => match self.resolve(addressing) {
                Ok(Some(mut target)) => {
                    match *field {
                        "role" => match Role::parse(value) {
                            Some(role) => target.role = role,
                            None => return HandlerResult::reply(&user.address, "Rol inválido."),
                        },
                        "name" => target.display_name = value.to_string(),
                        _ => return HandlerResult::reply(&user.address, "Campo no soportado."),
                    }
                    match self.store.update(&target) {
                        Ok(()) => HandlerResult::reply(&user.address, "Usuario actualizado."),
                        Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
                    }
                }
                Ok(None) => HandlerResult::reply(&user.address, "Usuario no encontrado."),
                Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
            },
            ["delete", addressing, "confirm", ..] => match self.store.delete(addressing) {
                Ok(()) => HandlerResult::reply(&user.address, "Usuario eliminado."),
                Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
            },
            ["delete", ..] => HandlerResult::reply(&user.address, "Se requiere 'confirm' para eliminar: !users delete <addr|phone> confirm"),
            ["stats", ..] => match self.store.stats() {
                Ok(stats) => HandlerResult::reply(&user.address, format!("{} usuarios, {} mensajes", stats.total_users, stats.total_messages)),
                Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
            },
            _ => HandlerResult::reply(&user.address, "Uso: !users list|search|info|update|delete|stats [...]"),
        }
    }
}

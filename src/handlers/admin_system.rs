use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConfigService;
use crate::handlers::{parse_command, Handler, HandlerResult};
use crate::models::{Classification, HandlerDescriptor, Role, User};
use crate::user_store::UserStore;

static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "admin-system",
    aliases: &["admin-system"],
    category: "admin",
    min_role: Role::Admin,
    cooldown_secs: 1,
    daily_cap: None,
    sensitive: true,
};

/// `!admin-system [stats|reload|toggle|help]`.
pub struct AdminSystemHandler {
    store: Arc<UserStore>,
    config: Arc<ConfigService>,
}

impl AdminSystemHandler {
    pub fn new(store: Arc<UserStore>, config: Arc<ConfigService>) -> Self {
        AdminSystemHandler { store, config }
    }
}

#[async_trait]
impl Handler for AdminSystemHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "admin-system").unwrap_or(false)
    }

    async fn execute(&self, raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        let (_, args) = parse_command(raw_text, &['!', '/']).unwrap_or(("", vec![]));
        match args.first().copied().unwrap_or("help") {
            "stats" => match self.store.stats() {
                Ok(stats) => HandlerResult::reply(
                    &user.address,
                    format!(
                        "Usuarios: {} | Mensajes: {} | Activos 24h: {}",
                        stats.total_users, stats.total_messages, stats.active_24h
                    ),
                ),
                Err(e) => HandlerResult::reply(&user.address, format!("Error al leer estadísticas: {e}")),
            },
            "reload" => match self.config.reload().await {
                Ok(warnings) if warnings.is_empty() => HandlerResult::reply(&user.address, "Configuración recargada."),
                Ok(warnings) => HandlerResult::reply(
                    &user.address,
                    format!("Configuración recargada con {} advertencias de validación.", warnings.len()),
                ),
                Err(e) => HandlerResult::reply(&user.address, format!("Error al recargar: {e}")),
            },
            "toggle" => HandlerResult::reply(&user.address, "toggle no implementado para esta bandera."),
            _ => HandlerResult::reply(&user.address, "Uso: !admin-system [stats|reload|toggle|help]"),
        }
    }
}

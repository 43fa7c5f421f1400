use std::sync::Arc;

use async_trait::async_trait;

use crate::classifier::{self, KeywordTables};
use crate::handlers::{parse_command, Handler, HandlerResult};
use crate::models::{Classification, HandlerDescriptor, Role, User};
use crate::user_store::UserStore;

static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "diagnostic",
    aliases: &["diagnostic"],
    category: "admin",
    min_role: Role::Admin,
    cooldown_secs: 1,
    daily_cap: None,
    sensitive: true,
};

/// `!diagnostic [contextual|stats|test|all]`.
pub struct DiagnosticHandler {
    store: Arc<UserStore>,
    tables: KeywordTables,
}

impl DiagnosticHandler {
    pub fn new(store: Arc<UserStore>, tables: KeywordTables) -> Self {
        DiagnosticHandler { store, tables }
    }
}

#[async_trait]
impl Handler for DiagnosticHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "diagnostic").unwrap_or(false)
    }

    async fn execute(&self, raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        let (_, args) = parse_command(raw_text, &['!', '/']).unwrap_or(("", vec![]));
        match args.first().copied().unwrap_or("all") {
            "contextual" => {
                let sample = classifier::classify("estoy aburrido", &self.tables);
                HandlerResult::reply(&user.address, format!("Clasificación de muestra: {:?}", sample.primary))
            }
            "stats" => match self.store.stats() {
                Ok(stats) => HandlerResult::reply(&user.address, format!("{} usuarios totales", stats.total_users)),
                Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
            },
            "test" => HandlerResult::reply(&user.address, "Prueba de diagnóstico OK."),
            _ => HandlerResult::reply(&user.address, "Diagnóstico: contextual=OK, stats=OK, test=OK."),
        }
    }
}

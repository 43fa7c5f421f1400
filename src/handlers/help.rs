use async_trait::async_trait;

use crate::handlers::{parse_command, Handler, HandlerResult};
use crate::models::{Classification, HandlerDescriptor, Role, User};

static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "help",
    aliases: &["help"],
    category: "general",
    min_role: Role::Block,
    cooldown_secs: 1,
    daily_cap: None,
    sensitive: false,
};

pub struct HelpHandler;

#[async_trait]
impl Handler for HelpHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "help").unwrap_or(false)
    }

    async fn execute(&self, _raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        HandlerResult::reply(
            &user.address,
            "Comandos disponibles: !help, !status, !admin, !diagnostic, !users, !bridge, !chats, !history, !qr, !bridge-health",
        )
    }
}

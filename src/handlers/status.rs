use async_trait::async_trait;

use crate::handlers::{parse_command, Handler, HandlerResult};
use crate::models::{Classification, HandlerDescriptor, Role, User};

static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "status",
    aliases: &["status", "ping"],
    category: "general",
    min_role: Role::Block,
    cooldown_secs: 1,
    daily_cap: None,
    sensitive: false,
};

pub struct StatusHandler;

#[async_trait]
impl Handler for StatusHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "status" || c == "ping").unwrap_or(false)
    }

    async fn execute(&self, _raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        HandlerResult::reply(&user.address, "pong — el bot está en línea.")
    }
}

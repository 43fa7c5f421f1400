use async_trait::async_trait;

use crate::handlers::{parse_command, Handler, HandlerResult};
use crate::models::{Classification, HandlerDescriptor, Role, User};

static DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "admin",
    aliases: &["admin"],
    category: "admin",
    min_role: Role::Admin,
    cooldown_secs: 1,
    daily_cap: None,
    sensitive: true,
};

/// The `!admin` panel: a terse menu of admin-only subsystems. Deeper
/// operations (stats/reload/toggle) live in `admin_system`.
pub struct AdminHandler;

#[async_trait]
impl Handler for AdminHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "admin").unwrap_or(false)
    }

    async fn execute(&self, _raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        HandlerResult::reply(
            &user.address,
            "Panel admin: !admin-system, !diagnostic, !users, !bridge, !chats, !history, !qr, !bridge-health",
        )
    }
}

//! Handler Registry. `HandlerDescriptor` is a static table in the style of
//! a slash-command table, but registered entries additionally carry a boxed
//! executor — not expressible as a `const` table since executors close over
//! collaborators — so the registry is built once at composition time and
//! sorted by priority.

mod admin;
mod admin_system;
mod bridge_ops;
mod diagnostic;
mod help;
mod status;
mod users;

pub use admin::AdminHandler;
pub use admin_system::AdminSystemHandler;
pub use bridge_ops::{BridgeHealthHandler, BridgeHandler, ChatsHandler, HistoryHandler, QrHandler};
pub use diagnostic::DiagnosticHandler;
pub use help::HelpHandler;
pub use status::StatusHandler;
pub use users::UsersHandler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Classification, HandlerDescriptor, OutgoingMessage, Role, User};
use crate::rate_guard::RateGuard;

#[derive(Debug, Clone, Default)]
pub struct HandlerResult {
    pub success: bool,
    pub response: Option<OutgoingMessage>,
    pub should_reply: bool,
    pub claimed: bool,
    pub error: Option<String>,
}

impl HandlerResult {
    pub fn reply(to: &str, text: impl Into<String>) -> Self {
        HandlerResult {
            success: true,
            response: Some(OutgoingMessage::Text { to: to.to_string(), text: text.into() }),
            should_reply: true,
            claimed: true,
            error: None,
        }
    }

    pub fn denied(to: &str, text: impl Into<String>) -> Self {
        HandlerResult {
            success: false,
            response: Some(OutgoingMessage::Text { to: to.to_string(), text: text.into() }),
            should_reply: true,
            claimed: true,
            error: None,
        }
    }

    pub fn silent_claim() -> Self {
        HandlerResult { success: true, response: None, should_reply: false, claimed: true, error: None }
    }
}

/// Uniform trait for every command/contextual handler: heterogeneous
/// executors behind one interface.
#[async_trait]
pub trait Handler: Send + Sync {
    fn descriptor(&self) -> &'static HandlerDescriptor;

    /// Whether this handler wants to process the message. Called before any
    /// permission/cooldown checks.
    fn matches(&self, raw_text: &str, classification: &Classification) -> bool;

    async fn execute(&self, raw_text: &str, user: &User, classification: &Classification) -> HandlerResult;
}

struct RegisteredHandler {
    priority: i32,
    handler: Box<dyn Handler>,
}

/// Ordered set of handlers. Priority ascending, first match wins.
pub struct Registry {
    handlers: Vec<RegisteredHandler>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { handlers: Vec::new() }
    }

    /// Registers a handler at the given priority (lower runs earlier).
    /// Panics at startup if an alias collides — aliases are globally unique
    /// across the registry.
    pub fn register(&mut self, priority: i32, handler: Box<dyn Handler>) {
        let new_aliases = handler.descriptor().aliases;
        for existing in &self.handlers {
            for alias in existing.handler.descriptor().aliases {
                assert!(
                    !new_aliases.contains(alias),
                    "alias '{alias}' registered by both '{}' and '{}'",
                    existing.handler.descriptor().name,
                    handler.descriptor().name
                );
            }
        }
        self.handlers.push(RegisteredHandler { priority, handler });
        self.handlers.sort_by_key(|r| r.priority);
    }

    /// Role ordering total order for min-role checks:
    /// `block < customer < friend = familiar < provider < employee < admin`.
    fn role_sufficient(user_role: Role, min_role: Role) -> bool {
        user_role.at_least(min_role)
    }

    /// Walks handlers in priority order. Each candidate is checked for role,
    /// then for its own cooldown/daily cap and the caller's per-role hourly
    /// quota against `rate`, before it's executed.
    pub async fn dispatch(&self, raw_text: &str, user: &User, classification: &Classification, rate: &RateGuard, now: DateTime<Utc>) -> Option<(&'static str, HandlerResult)> {
        for entry in &self.handlers {
            let handler = entry.handler.as_ref();
            if !handler.matches(raw_text, classification) {
                continue;
            }
            let descriptor = handler.descriptor();
            if (descriptor.sensitive || descriptor.min_role.is_admin()) && !user.role.is_admin() {
                return Some((
                    descriptor.name,
                    HandlerResult::denied(&user.address, "No tienes permisos para ejecutar este comando."),
                ));
            }
            if !Self::role_sufficient(user.role, descriptor.min_role) {
                return Some((
                    descriptor.name,
                    HandlerResult::denied(&user.address, "No tienes permisos para ejecutar este comando."),
                ));
            }
            if !rate.check_command(&user.address, descriptor.name, user.role, descriptor.cooldown_secs, descriptor.daily_cap, now) {
                return Some((
                    descriptor.name,
                    HandlerResult::denied(&user.address, "Has alcanzado el límite de uso de este comando; inténtalo más tarde."),
                ));
            }
            let result = handler.execute(raw_text, user, classification).await;
            if result.success {
                rate.record_command(&user.address, descriptor.name, now);
            }
            if result.claimed || result.response.is_some() {
                return Some((descriptor.name, result));
            }
        }
        None
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses `!command arg1 arg2` into (command, args), stripping the
/// configured prefix. Shared by every built-in handler's `matches`.
pub fn parse_command<'a>(raw_text: &'a str, prefixes: &[char]) -> Option<(&'a str, Vec<&'a str>)> {
    let trimmed = raw_text.trim();
    let first = trimmed.chars().next()?;
    if !prefixes.contains(&first) {
        return None;
    }
    let rest = &trimmed[first.len_utf8()..];
    let mut parts = rest.split_whitespace();
    let command = parts.next()?;
    Some((command, parts.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Kind, Sentiment};
    use crate::rate_guard::RateLimits;

    fn classification(kind: Kind) -> Classification {
        Classification { primary: kind, confidence: 0.95, secondary: vec![], sentiment: Sentiment::Neutral }
    }

    #[test]
    fn parse_command_strips_prefix() {
        let (cmd, args) = parse_command("!users search juan", &['!', '/']).unwrap();
        assert_eq!(cmd, "users");
        assert_eq!(args, vec!["search", "juan"]);
    }

    #[test]
    fn parse_command_rejects_non_prefixed() {
        assert!(parse_command("hola", &['!', '/']).is_none());
    }

    #[tokio::test]
    async fn registry_denies_sensitive_handler_for_non_admin() {
        let mut registry = Registry::new();
        registry.register(10, Box::new(AdminHandler));
        let user = User::new_customer("A", None, "es");
        let rate = RateGuard::new(RateLimits::default());
        let (name, result) = registry.dispatch("!admin", &user, &classification(Kind::Command), &rate, Utc::now()).await.unwrap();
        assert_eq!(name, "admin");
        assert!(!result.success);
    }

    #[tokio::test]
    async fn registry_denies_on_cooldown_without_executing_handler() {
        let mut registry = Registry::new();
        registry.register(10, Box::new(StatusHandler));
        let user = User::new_customer("A", None, "es");
        let rate = RateGuard::new(RateLimits::default());
        let now = Utc::now();

        let (name, first) = registry.dispatch("!status", &user, &classification(Kind::Command), &rate, now).await.unwrap();
        assert_eq!(name, "status");
        assert!(first.success);

        let (name, second) = registry.dispatch("!status", &user, &classification(Kind::Command), &rate, now).await.unwrap();
        assert_eq!(name, "status");
        assert!(!second.success);
    }

    #[test]
    #[should_panic(expected = "alias")]
    fn registry_panics_on_duplicate_alias() {
        let mut registry = Registry::new();
        registry.register(10, Box::new(HelpHandler));
        registry.register(20, Box::new(HelpHandler));
    }
}

//! Shared data model.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of roles, totally ordered `block < customer < friend = familiar
/// < provider < employee < admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Block,
    Customer,
    Friend,
    Familiar,
    Provider,
    Employee,
    Admin,
}

impl Role {
    /// Numeric rank for the partial order; `Friend` and `Familiar` tie.
    fn rank(self) -> u8 {
        match self {
            Role::Block => 0,
            Role::Customer => 1,
            Role::Friend | Role::Familiar => 2,
            Role::Provider => 3,
            Role::Employee => 4,
            Role::Admin => 5,
        }
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn at_least(self, min: Role) -> bool {
        self.rank() >= min.rank()
    }

    /// Privileges never silently downgrade: the greater of the two ranks,
    /// ties keeping `self`.
    pub fn upgraded(self, proposed: Role) -> Role {
        if proposed.rank() > self.rank() { proposed } else { self }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Block => "block",
            Role::Customer => "customer",
            Role::Friend => "friend",
            Role::Familiar => "familiar",
            Role::Provider => "provider",
            Role::Employee => "employee",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        Some(match s {
            "block" => Role::Block,
            "customer" => Role::Customer,
            "friend" => Role::Friend,
            "familiar" => Role::Familiar,
            "provider" => Role::Provider,
            "employee" => Role::Employee,
            "admin" => Role::Admin,
            _ => return None,
        })
    }
}

/// `registrationData` step, nested inside `User.metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStep {
    None,
    AwaitingName,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationData {
    pub step: RegistrationStep,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for RegistrationData {
    fn default() -> Self {
        RegistrationData { step: RegistrationStep::None, attempts: 0, started_at: None }
    }
}

/// Identity of a remote participant. `address` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub address: String,
    pub phone: Option<String>,
    pub display_name: String,
    pub role: Role,
    pub language: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: u64,
    pub registration: RegistrationData,
    /// Open key-value metadata bag beyond `registrationData`.
    pub metadata: HashMap<String, Value>,
}

impl User {
    pub fn new_customer(address: impl Into<String>, phone: Option<String>, language: &str) -> Self {
        let now = Utc::now();
        let address = address.into();
        User {
            display_name: phone.clone().unwrap_or_else(|| address.clone()),
            address,
            phone,
            role: Role::Customer,
            language: language.to_string(),
            active: true,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
            message_count: 0,
            registration: RegistrationData::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn needs_registration(&self) -> bool {
        !matches!(self.registration.step, RegistrationStep::Completed)
    }
}

/// Kind of an inbound or outbound media payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Sticker,
    Location,
    Other,
}

/// A single event drained from the bridge. Consumed exactly once by the
/// processor, deduplicated by `id`, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

/// Payload a handler wants sent back through the bridge. Owned by the
/// processor only until acknowledged by the bridge client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutgoingMessage {
    Text { to: String, text: String },
    Media { to: String, local_path: String, caption: Option<String> },
}

impl OutgoingMessage {
    pub fn to(&self) -> &str {
        match self {
            OutgoingMessage::Text { to, .. } | OutgoingMessage::Media { to, .. } => to,
        }
    }
}

/// Immutable registry entry. Aliases are globally unique across the
/// registry (enforced by `handlers::Registry::register`).
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub category: &'static str,
    pub min_role: Role,
    pub cooldown_secs: u64,
    pub daily_cap: Option<u32>,
    pub sensitive: bool,
}

/// Keyed by address. Destroyed on success, timeout, or max-attempts
/// fallback.
#[derive(Debug, Clone)]
pub struct PendingRegistration {
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub last_message_id: String,
}

/// Per-address rate bookkeeping. The sliding window is purged on every read
/// so its size never exceeds the configured max.
#[derive(Debug, Clone, Default)]
pub struct RateState {
    pub response_timestamps: std::collections::VecDeque<DateTime<Utc>>,
    pub daily_count: u32,
    pub daily_reset_date: Option<NaiveDate>,
    pub last_denied_at: Option<DateTime<Utc>>,
}

/// Message classification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Command,
    Greeting,
    Farewell,
    Question,
    Help,
    Contextual,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// Pure value, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub primary: Kind,
    pub confidence: f32,
    pub secondary: Vec<Kind>,
    pub sentiment: Sentiment,
}

/// Monotonically non-decreasing high-water mark the poller has drained up
/// to.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cursor(pub i64);

impl Cursor {
    pub fn advance_to(&mut self, ts: i64) {
        if ts > self.0 {
            self.0 = ts;
        }
    }
}

//! Registration engine. Drives new senders through a name-capture state
//! machine. Has no direct dependency on the bridge or the store; all side
//! effects go through the injected [`RegistrationEffects`] callbacks, in the
//! same trait-object-collaborator style as an LLM provider interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RegistrationError;
use crate::models::PendingRegistration;

#[derive(Debug, Clone)]
pub struct RegistrationPolicy {
    pub max_attempts: u32,
    pub timeout: std::time::Duration,
    pub min_len: usize,
    pub max_len: usize,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        RegistrationPolicy {
            max_attempts: 3,
            timeout: std::time::Duration::from_secs(30 * 60),
            min_len: 2,
            max_len: 50,
        }
    }
}

const FORBIDDEN_WORDS: &[&str] = &["bot", "admin", "sistema", "test", "usuario", "client", "customer"];

/// Three callbacks the engine drives; the engine owns no state about the
/// user or bridge beyond the `PendingRegistration` entry it's handed.
#[async_trait]
pub trait RegistrationEffects: Send + Sync {
    async fn update_name(&self, address: &str, name: &str, is_temporary: bool);
    async fn send_message(&self, address: &str, text: &str);
    async fn notify_registered(&self, address: &str, name: &str);
}

/// Outcome of feeding one inbound message through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Registration completed this step; entry should be removed.
    Completed { name: String },
    /// Attempt was invalid; entry updated in place, still awaiting.
    Retry { attempts: u32, error: RegistrationError },
    /// Max attempts or timeout; temp name assigned, entry removed.
    FallbackAssigned { name: String },
}

/// Strips surrounding whitespace and collapses internal runs. Idempotent on
/// its own output.
pub fn clean_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn last4(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 4 { digits[digits.len() - 4..].to_string() } else { digits }
}

/// First-failure-wins validation, applied in a fixed order: empty, all-digit,
/// length, invalid characters, looks-like-a-phone-number, forbidden word.
pub fn validate_name(name: &str, phone: Option<&str>, policy: &RegistrationPolicy) -> Result<(), RegistrationError> {
    if name.is_empty() {
        return Err(RegistrationError::Empty);
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        return Err(RegistrationError::AllDigits);
    }
    if name.chars().count() < policy.min_len || name.chars().count() > policy.max_len {
        return Err(RegistrationError::Length { min: policy.min_len, max: policy.max_len });
    }
    let allowed = |c: char| c.is_alphabetic() || c.is_ascii_digit() || c == ' ' || c == '\'' || c == '-';
    if !name.chars().all(allowed) {
        return Err(RegistrationError::InvalidChars);
    }
    if let Some(phone) = phone {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        let name_digits: String = name.chars().filter(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() && (name == phone || contains_digit_run(&name_digits, &digits, 6)) {
            return Err(RegistrationError::IsPhoneNumber);
        }
    }
    let lower = name.to_lowercase();
    if FORBIDDEN_WORDS.iter().any(|w| lower.contains(w)) {
        return Err(RegistrationError::ForbiddenWord);
    }
    Ok(())
}

fn contains_digit_run(haystack_digits: &str, phone_digits: &str, min_run: usize) -> bool {
    if phone_digits.len() < min_run {
        return false;
    }
    phone_digits
        .as_bytes()
        .windows(min_run)
        .any(|w| haystack_digits.as_bytes().windows(min_run).any(|h| h == w))
}

/// Drives one inbound message through the state machine for `address`.
/// `entry` is `None` on the first message from an unregistered sender.
pub async fn step(
    address: &str,
    phone: Option<&str>,
    attempted_name: &str,
    message_id: &str,
    now: DateTime<Utc>,
    entry: &mut Option<PendingRegistration>,
    policy: &RegistrationPolicy,
    effects: &dyn RegistrationEffects,
) -> RegistrationOutcome {
    let pending = entry.get_or_insert_with(|| PendingRegistration {
        attempts: 0,
        started_at: now,
        last_message_id: message_id.to_string(),
    });
    pending.last_message_id = message_id.to_string();

    let timed_out = now.signed_duration_since(pending.started_at).to_std().unwrap_or_default() >= policy.timeout;

    let cleaned = clean_name(attempted_name);
    let validation = validate_name(&cleaned, phone, policy);

    match validation {
        Ok(()) if !timed_out => {
            effects.update_name(address, &cleaned, false).await;
            effects.send_message(address, &format!("¡Perfecto, {cleaned}!")).await;
            effects.notify_registered(address, &cleaned).await;
            *entry = None;
            RegistrationOutcome::Completed { name: cleaned }
        }
        _ => {
            pending.attempts += 1;
            if timed_out || pending.attempts >= policy.max_attempts {
                let temp = format!("Usuario_{}", phone.map(last4).unwrap_or_else(|| "0000".to_string()));
                effects.update_name(address, &temp, true).await;
                *entry = None;
                RegistrationOutcome::FallbackAssigned { name: temp }
            } else {
                let error = validation.err().unwrap_or(RegistrationError::Empty);
                RegistrationOutcome::Retry { attempts: pending.attempts, error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEffects {
        updates: Mutex<Vec<(String, String, bool)>>,
        notified: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RegistrationEffects for RecordingEffects {
        async fn update_name(&self, address: &str, name: &str, is_temporary: bool) {
            self.updates.lock().unwrap().push((address.to_string(), name.to_string(), is_temporary));
        }
        async fn send_message(&self, _address: &str, _text: &str) {}
        async fn notify_registered(&self, address: &str, name: &str) {
            self.notified.lock().unwrap().push((address.to_string(), name.to_string()));
        }
    }

    #[test]
    fn boundary_min_len() {
        let policy = RegistrationPolicy::default();
        assert!(validate_name("Jo", None, &policy).is_ok());
        assert_eq!(validate_name("J", None, &policy), Err(RegistrationError::Length { min: 2, max: 50 }));
    }

    #[test]
    fn boundary_max_len() {
        let policy = RegistrationPolicy::default();
        let at_max = "a".repeat(50);
        let over_max = "a".repeat(51);
        assert!(validate_name(&at_max, None, &policy).is_ok());
        assert_eq!(validate_name(&over_max, None, &policy), Err(RegistrationError::Length { min: 2, max: 50 }));
    }

    #[test]
    fn clean_name_is_idempotent() {
        let raw = "  Juan    Pérez  ";
        let once = clean_name(raw);
        let twice = clean_name(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_symbols_but_allows_digits_mixed_with_letters() {
        let policy = RegistrationPolicy::default();
        assert_eq!(validate_name("Juan@Perez", None, &policy), Err(RegistrationError::InvalidChars));
        assert!(validate_name("Juan2", None, &policy).is_ok());
    }

    #[test]
    fn rejects_all_digits() {
        let policy = RegistrationPolicy::default();
        assert_eq!(validate_name("123456", None, &policy), Err(RegistrationError::AllDigits));
    }

    #[test]
    fn rejects_forbidden_word() {
        let policy = RegistrationPolicy::default();
        assert_eq!(validate_name("Admin Bob", None, &policy), Err(RegistrationError::ForbiddenWord));
    }

    #[test]
    fn rejects_phone_number_run() {
        let policy = RegistrationPolicy::default();
        assert_eq!(validate_name("Maria551234", Some("5215551234567"), &policy), Err(RegistrationError::IsPhoneNumber));
    }

    #[tokio::test]
    async fn happy_path_completes_and_notifies_once() {
        let effects = RecordingEffects::default();
        let mut entry = None;
        let now = Utc::now();
        let outcome = step("A", Some("5215551234"), "Juan Pérez", "m1", now, &mut entry, &RegistrationPolicy::default(), &effects).await;
        assert_eq!(outcome, RegistrationOutcome::Completed { name: "Juan Pérez".to_string() });
        assert!(entry.is_none());
        assert_eq!(effects.notified.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fallback_after_max_attempts() {
        let effects = RecordingEffects::default();
        let mut entry = None;
        let now = Utc::now();
        let policy = RegistrationPolicy::default();

        let o1 = step("A", Some("5215551234"), "123456789", "m1", now, &mut entry, &policy, &effects).await;
        assert!(matches!(o1, RegistrationOutcome::Retry { attempts: 1, .. }));
        let o2 = step("A", Some("5215551234"), "123", "m2", now, &mut entry, &policy, &effects).await;
        assert!(matches!(o2, RegistrationOutcome::Retry { attempts: 2, .. }));
        let o3 = step("A", Some("5215551234"), "456", "m3", now, &mut entry, &policy, &effects).await;
        match o3 {
            RegistrationOutcome::FallbackAssigned { name } => assert_eq!(name, "Usuario_1234"),
            other => panic!("expected fallback, got {other:?}"),
        }
        assert!(entry.is_none());
    }
}

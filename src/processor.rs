//! Message processor: wires the bridge client, user store, dedup/rate
//! guard, registration policy, classifier, and handler registry end to
//! end. The per-processing timeout uses `tokio::time::timeout`; the
//! typing bracket is `concurrency::TypingGuard`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge_client::BridgeClient;
use crate::classifier::{self, KeywordTables};
use crate::concurrency::{AddressLocks, ConcurrencyCap};
use crate::error::ProcessingError;
use crate::handlers::{HandlerResult, Registry};
use crate::models::{IncomingMessage, Kind, OutgoingMessage, PendingRegistration, User};
use crate::rate_guard::{DedupGuard, RateGuard};
use crate::registration::{self, RegistrationEffects, RegistrationOutcome, RegistrationPolicy};
use crate::user_store::UserStore;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub bridge_integration_enabled: bool,
    pub processing_timeout: Duration,
    pub default_language: String,
    pub default_response: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            bridge_integration_enabled: true,
            processing_timeout: Duration::from_secs(30),
            default_language: "es".to_string(),
            default_response: Some("No entendí tu mensaje. Escribe !help para ver los comandos.".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Success,
    AlreadyProcessed,
    Failure,
}

#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub processing_id: String,
    pub terminal: Terminal,
    pub user: Option<User>,
    pub handler_name: Option<String>,
    /// Whether the dispatched handler itself reported success (vs. a
    /// permission/cooldown denial). `None` when no handler was dispatched.
    pub handler_success: Option<bool>,
    pub errors: Vec<String>,
}

/// End-to-end pipeline wiring the bridge client, store, guards, policy,
/// classifier, and registry. Construct once, share via `Arc`.
pub struct Processor {
    pub bridge: Arc<BridgeClient>,
    pub store: Arc<UserStore>,
    pub dedup: Arc<DedupGuard>,
    pub rate: Arc<RateGuard>,
    pub registry: Arc<Registry>,
    pub tables: KeywordTables,
    pub registration_policy: RegistrationPolicy,
    pub pending_registrations: Arc<AsyncMutex<HashMap<String, PendingRegistration>>>,
    pub address_locks: AddressLocks,
    pub concurrency_cap: ConcurrencyCap,
    pub config: ProcessorConfig,
}

struct BridgeRegistrationEffects {
    bridge: Arc<BridgeClient>,
    store: Arc<UserStore>,
}

#[async_trait::async_trait]
impl RegistrationEffects for BridgeRegistrationEffects {
    async fn update_name(&self, address: &str, name: &str, is_temporary: bool) {
        if let Ok(Some(mut user)) = self.store.get_by_address(address) {
            user.display_name = name.to_string();
            user.updated_at = Utc::now();
            if is_temporary {
                user.metadata.insert("isTemporary".to_string(), serde_json::Value::Bool(true));
            }
            if let Err(e) = self.store.update(&user) {
                warn!(address, error = %e, "failed to persist registration name update");
            }
        }
    }

    async fn send_message(&self, address: &str, text: &str) {
        if let Err(e) = self.bridge.send(address, text).await {
            warn!(address, error = %e, "registration send failed (fire-and-forget)");
        }
    }

    async fn notify_registered(&self, _address: &str, _name: &str) {}
}

impl Processor {
    /// `process(message) -> ProcessingResult`: validate, dedup, resolve
    /// identity, classify, gate on registration, dispatch, and record.
    pub async fn process(&self, message: IncomingMessage) -> ProcessingResult {
        let processing_id = Uuid::new_v4().to_string();
        let _permit = self.concurrency_cap.acquire().await;
        let _address_guard = self.address_locks.acquire(&message.sender).await;

        let timed = tokio::time::timeout(self.config.processing_timeout, self.process_inner(&processing_id, &message)).await;

        match timed {
            Ok(result) => result,
            Err(_) => {
                self.dedup.check_and_record(&message.id);
                warn!(id = %message.id, "processing timed out");
                ProcessingResult {
                    processing_id,
                    terminal: Terminal::Failure,
                    user: None,
                    handler_name: None,
                    handler_success: None,
                    errors: vec![ProcessingError::Timeout(self.config.processing_timeout).to_string()],
                }
            }
        }
    }

    async fn process_inner(&self, processing_id: &str, message: &IncomingMessage) -> ProcessingResult {
        // Step 1: structural validation.
        let mut errors = Vec::new();
        if message.sender.trim().is_empty() {
            errors.push("sender is empty".to_string());
        }
        if message.id.trim().is_empty() {
            errors.push("id is empty".to_string());
        }
        let content = message.content.trim().to_string();
        if !errors.is_empty() {
            return ProcessingResult {
                processing_id: processing_id.to_string(),
                terminal: Terminal::Failure,
                user: None,
                handler_name: None,
                handler_success: None,
                errors,
            };
        }

        // Step 2: dedup.
        if !self.dedup.check_and_record(&message.id) {
            debug!(id = %message.id, "already processed");
            return ProcessingResult {
                processing_id: processing_id.to_string(),
                terminal: Terminal::AlreadyProcessed,
                user: None,
                handler_name: None,
                handler_success: None,
                errors: vec![],
            };
        }

        // Step 3: resolve identity.
        let user = match self.store.get_by_address(&message.sender) {
            Ok(Some(user)) => user,
            Ok(None) => {
                let phone = extract_phone(&message.sender);
                let new_user = User::new_customer(message.sender.clone(), phone, &self.config.default_language);
                match self.store.upsert_preserving_identity(new_user) {
                    Ok(user) => user,
                    Err(e) => {
                        return self.store_failure(processing_id, e);
                    }
                }
            }
            Err(e) => return self.store_failure(processing_id, e),
        };

        let classification = classifier::classify(&content, &self.tables);

        // Step 4: registration gate.
        if user.needs_registration() && classification.primary != Kind::Command {
            return self.run_registration(processing_id, message, &user, &content).await;
        }

        // Step 6: typing bracket, bracketed around the whole dispatch step.
        let bridge = self.bridge.clone();
        let typing_address = message.sender.clone();
        let _typing_guard = if self.config.bridge_integration_enabled {
            if let Err(e) = self.bridge.mark_read(&message.sender, &message.id).await {
                debug!(error = %e, "mark_read failed (fire-and-forget)");
            }
            if let Err(e) = self.bridge.set_typing(&message.sender, true).await {
                debug!(error = %e, "set_typing(on) failed (fire-and-forget)");
            }
            Some(crate::concurrency::TypingGuard::new(move || {
                let bridge = bridge.clone();
                let addr = typing_address.clone();
                tokio::spawn(async move {
                    if let Err(e) = bridge.set_typing(&addr, false).await {
                        debug!(error = %e, "set_typing(off) failed (fire-and-forget)");
                    }
                });
            }))
        } else {
            None
        };

        // Step 7: dispatch.
        let is_admin = user.role.is_admin();
        if !self.rate.can_respond(&message.sender, classification.primary, is_admin, Utc::now()) {
            self.rate.record_denied(&message.sender, Utc::now());
            return ProcessingResult {
                processing_id: processing_id.to_string(),
                terminal: Terminal::Success,
                user: Some(user),
                handler_name: None,
                handler_success: None,
                errors: vec![],
            };
        }

        let dispatched = self.registry.dispatch(&content, &user, &classification, &self.rate, Utc::now()).await;

        let (handler_name, handler_success, outcome) = match dispatched {
            Some((name, result)) => (Some(name.to_string()), Some(result.success), Some(result)),
            None if classification.primary == Kind::Contextual => (None, None, None),
            None => (
                None,
                None,
                self.config.default_response.as_ref().map(|text| HandlerResult::reply(&message.sender, text.clone())),
            ),
        };

        // Step 8: send a reply if one was produced and rate allows it.
        if let Some(HandlerResult { response: Some(outgoing), .. }) = &outcome {
            if self.rate.can_respond(&message.sender, classification.primary, is_admin, Utc::now()) {
                if let Err(e) = self.send(outgoing).await {
                    error!(error = %e, "failed to deliver outgoing message");
                    return ProcessingResult {
                        processing_id: processing_id.to_string(),
                        terminal: Terminal::Failure,
                        user: Some(user),
                        handler_name,
                        handler_success,
                        errors: vec![e.to_string()],
                    };
                }
                if !is_admin {
                    self.rate.record_response(&message.sender, Utc::now());
                }
            }
        }

        if let Ok(mut u) = self.store.get_by_address(&message.sender) {
            if let Some(u) = u.as_mut() {
                u.message_count += 1;
                u.last_activity_at = Utc::now();
                let _ = self.store.update(u);
            }
            let _ = self.store.record_interaction(&message.sender, Utc::now());
        }

        ProcessingResult {
            processing_id: processing_id.to_string(),
            terminal: Terminal::Success,
            user: Some(user),
            handler_name,
            handler_success,
            errors: vec![],
        }
    }

    async fn send(&self, outgoing: &OutgoingMessage) -> Result<String, crate::error::BridgeError> {
        match outgoing {
            OutgoingMessage::Text { to, text } => self.bridge.send(to, text).await,
            OutgoingMessage::Media { to, local_path, caption } => self.bridge.send_media(to, local_path, caption.as_deref()).await,
        }
    }

    fn store_failure(&self, processing_id: &str, e: crate::error::StoreError) -> ProcessingResult {
        error!(error = %e, "user store unavailable");
        ProcessingResult {
            processing_id: processing_id.to_string(),
            terminal: Terminal::Failure,
            user: None,
            handler_name: None,
            handler_success: None,
            errors: vec![e.to_string()],
        }
    }

    async fn run_registration(&self, processing_id: &str, message: &IncomingMessage, user: &User, content: &str) -> ProcessingResult {
        let effects = BridgeRegistrationEffects { bridge: self.bridge.clone(), store: self.store.clone() };
        let mut pending_map = self.pending_registrations.lock().await;
        let mut entry = pending_map.remove(&message.sender);

        let was_new = entry.is_none();
        if was_new {
            if let Err(e) = self.bridge.send(&message.sender, &greeting_for(&user.language)).await {
                debug!(error = %e, "greeting send failed");
            }
            if let Err(e) = self.bridge.send(&message.sender, "¿Cuál es tu nombre?").await {
                debug!(error = %e, "registration prompt failed");
            }
            // The message that triggered first contact (often a bare
            // greeting) is never itself consumed as a name attempt; only
            // the reply to this prompt is.
            pending_map.insert(
                message.sender.clone(),
                PendingRegistration { attempts: 0, started_at: Utc::now(), last_message_id: message.id.clone() },
            );
            return ProcessingResult {
                processing_id: processing_id.to_string(),
                terminal: Terminal::Success,
                user: Some(user.clone()),
                handler_name: None,
                handler_success: None,
                errors: vec![],
            };
        }

        let outcome = registration::step(
            &message.sender,
            user.phone.as_deref(),
            content,
            &message.id,
            Utc::now(),
            &mut entry,
            &self.registration_policy,
            &effects,
        )
        .await;

        if let Some(entry) = entry {
            pending_map.insert(message.sender.clone(), entry);
        }

        info!(address = %message.sender, ?outcome, "registration step");
        ProcessingResult {
            processing_id: processing_id.to_string(),
            terminal: Terminal::Success,
            user: Some(user.clone()),
            handler_name: Some("registration".to_string()),
            handler_success: None,
            errors: vec![],
        }
    }
}

fn extract_phone(address: &str) -> Option<String> {
    address.split('@').next().filter(|s| s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty()).map(|s| s.to_string())
}

fn greeting_for(language: &str) -> String {
    match language {
        "en" => "Hello! Welcome.".to_string(),
        _ => "¡Hola! Bienvenido.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge_client::{BridgeClient, BridgeConfig};
    use crate::handlers::HelpHandler;
    use crate::models::MessageKind;
    use crate::rate_guard::RateLimits;

    fn make_processor() -> Processor {
        let mut registry = Registry::new();
        registry.register(10, Box::new(HelpHandler));
        Processor {
            bridge: Arc::new(BridgeClient::new(BridgeConfig { base_url: "http://127.0.0.1:1".to_string(), ..Default::default() }).unwrap()),
            store: Arc::new(UserStore::open_in_memory().unwrap()),
            dedup: Arc::new(DedupGuard::new(100)),
            rate: Arc::new(RateGuard::new(RateLimits::default())),
            registry: Arc::new(registry),
            tables: KeywordTables::default(),
            registration_policy: RegistrationPolicy::default(),
            pending_registrations: Arc::new(AsyncMutex::new(HashMap::new())),
            address_locks: AddressLocks::new(),
            concurrency_cap: ConcurrencyCap::new(5),
            config: ProcessorConfig { bridge_integration_enabled: false, ..Default::default() },
        }
    }

    fn msg(id: &str, sender: &str, content: &str) -> IncomingMessage {
        IncomingMessage {
            id: id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_delivery_is_reported_and_no_user_store_write() {
        let processor = make_processor();
        let m = msg("m-42", "A@s.whatsapp.net", "hola");
        let r1 = processor.process(m.clone()).await;
        assert_ne!(r1.terminal, Terminal::AlreadyProcessed);
        let r2 = processor.process(m).await;
        assert_eq!(r2.terminal, Terminal::AlreadyProcessed);
    }

    #[tokio::test]
    async fn structural_validation_rejects_empty_sender() {
        let processor = make_processor();
        let m = msg("m-1", "", "hola");
        let r = processor.process(m).await;
        assert_eq!(r.terminal, Terminal::Failure);
        assert!(!r.errors.is_empty());
    }

    #[tokio::test]
    async fn cold_registration_creates_pending_entry() {
        let processor = make_processor();
        let m = msg("m-1", "A@s.whatsapp.net", "hola");
        let r = processor.process(m).await;
        assert_eq!(r.terminal, Terminal::Success);
        let user = r.user.unwrap();
        assert_eq!(user.role, crate::models::Role::Customer);
        assert!(processor.pending_registrations.lock().await.contains_key("A@s.whatsapp.net"));
    }
}

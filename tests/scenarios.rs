//! End-to-end scenarios against a composed `Processor`, exercising the
//! concrete scenarios spelled out for the orchestration core. A tiny
//! hand-rolled HTTP server stands in for the bridge gateway, in the style
//! of the mock transports used in `other_examples`' bridge integration
//! tests — just enough protocol to let `reqwest` parse a response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;

use wa_core::bridge_client::{BridgeClient, BridgeConfig};
use wa_core::classifier::KeywordTables;
use wa_core::concurrency::{AddressLocks, ConcurrencyCap};
use wa_core::handlers::{BridgeHealthHandler, QrHandler, Registry};
use wa_core::models::{IncomingMessage, MessageKind, RegistrationData, RegistrationStep, Role, User};
use wa_core::processor::{Processor, ProcessorConfig, Terminal};
use wa_core::rate_guard::{DedupGuard, RateGuard, RateLimits};
use wa_core::registration::RegistrationPolicy;
use wa_core::user_store::UserStore;

/// Minimal HTTP/1.1 responder. `fail_path`, when present, makes any request
/// whose request line contains that substring come back as a 500; every
/// other request gets a 200 with a body that satisfies every response type
/// the bridge client parses (`messageId`, `qr`, `status`/`connected`, or a
/// list field, none of which collide).
struct MockBridge {
    url: String,
    handle: tokio::task::JoinHandle<()>,
    qr_hit: Arc<AtomicBool>,
}

impl MockBridge {
    async fn spawn(fail_path: Option<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock bridge");
        let addr = listener.local_addr().expect("mock bridge addr");
        let qr_hit = Arc::new(AtomicBool::new(false));
        let qr_hit_task = qr_hit.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let qr_hit = qr_hit_task.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let Ok(n) = stream.read(&mut buf).await else { return };
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let request_line = request.lines().next().unwrap_or("");
                    if request_line.contains("/api/qr") {
                        qr_hit.store(true, Ordering::SeqCst);
                    }

                    let (status, body) = if fail_path.is_some_and(|p| request_line.contains(p)) {
                        ("500 Internal Server Error", "{\"error\":\"boom\"}".to_string())
                    } else {
                        ("200 OK", "{\"messageId\":\"m-ok\",\"qr\":null,\"status\":\"connected\",\"connected\":true,\"chats\":[],\"messages\":[]}".to_string())
                    };
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        MockBridge { url: format!("http://{addr}"), handle, qr_hit }
    }

    fn qr_was_requested(&self) -> bool {
        self.qr_hit.load(Ordering::SeqCst)
    }
}

impl Drop for MockBridge {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn bridge_config(base_url: &str) -> BridgeConfig {
    BridgeConfig { base_url: base_url.to_string(), max_retries: 0, ..Default::default() }
}

fn make_processor(bridge: Arc<BridgeClient>, bridge_integration_enabled: bool) -> Processor {
    let mut registry = Registry::new();
    registry.register(30, Box::new(QrHandler::new(bridge.clone())));
    registry.register(30, Box::new(BridgeHealthHandler::new(bridge.clone())));
    Processor {
        bridge,
        store: Arc::new(UserStore::open_in_memory().unwrap()),
        dedup: Arc::new(DedupGuard::new(1000)),
        rate: Arc::new(RateGuard::new(RateLimits::default())),
        registry: Arc::new(registry),
        tables: KeywordTables::default(),
        registration_policy: RegistrationPolicy::default(),
        pending_registrations: Arc::new(AsyncMutex::new(HashMap::new())),
        address_locks: AddressLocks::new(),
        concurrency_cap: ConcurrencyCap::new(8),
        config: ProcessorConfig { bridge_integration_enabled, ..Default::default() },
    }
}

fn msg(id: &str, sender: &str, content: &str) -> IncomingMessage {
    IncomingMessage { id: id.to_string(), sender: sender.to_string(), content: content.to_string(), kind: MessageKind::Text, timestamp: Utc::now(), metadata: HashMap::new() }
}

fn completed_customer(address: &str) -> User {
    let mut user = User::new_customer(address, None, "es");
    user.registration = RegistrationData { step: RegistrationStep::Completed, attempts: 0, started_at: None };
    user
}

/// Scenario 1: cold registration prompts and stores pending state without
/// firing any handler.
#[tokio::test]
async fn cold_registration_prompts_without_firing_a_handler() {
    let bridge = Arc::new(BridgeClient::new(bridge_config("http://127.0.0.1:1")).unwrap());
    let processor = make_processor(bridge, false);

    let result = processor.process(msg("m-1", "A@s.whatsapp.net", "hola")).await;

    assert_eq!(result.terminal, Terminal::Success);
    assert!(result.handler_name.is_none());
    assert_eq!(result.user.unwrap().role, Role::Customer);
    assert!(processor.pending_registrations.lock().await.contains_key("A@s.whatsapp.net"));
}

/// Scenario 2: replying with a valid name completes registration.
#[tokio::test]
async fn registration_happy_path_completes_and_clears_pending() {
    let bridge = Arc::new(BridgeClient::new(bridge_config("http://127.0.0.1:1")).unwrap());
    let processor = make_processor(bridge, false);
    processor.process(msg("m-1", "A@s.whatsapp.net", "hola")).await;

    let result = processor.process(msg("m-2", "A@s.whatsapp.net", "Juan Pérez")).await;

    assert_eq!(result.terminal, Terminal::Success);
    assert_eq!(result.handler_name.as_deref(), Some("registration"));
    assert!(!processor.pending_registrations.lock().await.contains_key("A@s.whatsapp.net"));

    let stored = processor.store.get_by_address("A@s.whatsapp.net").unwrap().unwrap();
    assert_eq!(stored.display_name, "Juan Pérez");
}

/// Scenario 3: three consecutive invalid attempts fall back to a temp name.
#[tokio::test]
async fn registration_fallback_after_three_invalid_attempts() {
    let bridge = Arc::new(BridgeClient::new(bridge_config("http://127.0.0.1:1")).unwrap());
    let processor = make_processor(bridge, false);
    let address = "5215551234567@s.whatsapp.net";
    processor.process(msg("m-1", address, "hola")).await;

    processor.process(msg("m-2", address, "123456789")).await;
    processor.process(msg("m-3", address, "123")).await;
    processor.process(msg("m-4", address, "456")).await;

    assert!(!processor.pending_registrations.lock().await.contains_key(address));
    let stored = processor.store.get_by_address(address).unwrap().unwrap();
    assert!(stored.display_name.starts_with("Usuario_"));
    assert_eq!(stored.metadata.get("isTemporary").and_then(|v| v.as_bool()), Some(true));
}

/// Scenario 4: a non-admin customer is denied a sensitive command; the
/// denial reply still goes out but the handler's own bridge call never
/// runs (the registry rejects on role before `execute` is reached).
#[tokio::test]
async fn sensitive_command_denied_for_non_admin() {
    let mock = MockBridge::spawn(None).await;
    let bridge = Arc::new(BridgeClient::new(bridge_config(&mock.url)).unwrap());
    let processor = make_processor(bridge, false);
    let address = "B@s.whatsapp.net";
    processor.store.create(&completed_customer(address)).unwrap();

    let result = processor.process(msg("m-1", address, "!qr")).await;

    assert_eq!(result.terminal, Terminal::Success);
    assert_eq!(result.handler_name.as_deref(), Some("qr"));
    assert_eq!(result.handler_success, Some(false));
    assert!(!mock.qr_was_requested());
}

/// Scenario 5: redelivering the same id reports already-processed with no
/// user-store write on the second call.
#[tokio::test]
async fn duplicate_delivery_reports_already_processed() {
    let bridge = Arc::new(BridgeClient::new(bridge_config("http://127.0.0.1:1")).unwrap());
    let processor = make_processor(bridge, false);
    let m = msg("m-42", "C@s.whatsapp.net", "hola");

    let first = processor.process(m.clone()).await;
    assert_ne!(first.terminal, Terminal::AlreadyProcessed);

    let second = processor.process(m).await;
    assert_eq!(second.terminal, Terminal::AlreadyProcessed);
    assert!(second.user.is_none());
}

/// Scenario 6: typing turns on successfully, the reply send then fails —
/// typing is still cleared and the result is a reported failure, with the
/// inbound id already recorded as seen.
#[tokio::test]
async fn bridge_flap_during_send_still_clears_typing_and_reports_failure() {
    let mock = MockBridge::spawn(Some("/api/send")).await;
    let bridge = Arc::new(BridgeClient::new(bridge_config(&mock.url)).unwrap());
    let processor = make_processor(bridge, true);
    let address = "D@s.whatsapp.net";
    processor.store.create(&completed_customer(address)).unwrap();

    let result = processor.process(msg("m-1", address, "hola, como estas")).await;

    assert_eq!(result.terminal, Terminal::Failure);
    assert!(!result.errors.is_empty());
    assert_eq!(processor.dedup.len(), 1);
}

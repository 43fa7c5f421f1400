use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge_client::BridgeClient;
use crate::handlers::{parse_command, Handler, HandlerResult};
use crate::models::{Classification, HandlerDescriptor, Role, User};

static QR_DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "qr",
    aliases: &["qr"],
    category: "bridge",
    min_role: Role::Admin,
    cooldown_secs: 5,
    daily_cap: None,
    sensitive: true,
};

pub struct QrHandler {
    bridge: Arc<BridgeClient>,
}

impl QrHandler {
    pub fn new(bridge: Arc<BridgeClient>) -> Self {
        QrHandler { bridge }
    }
}

#[async_trait]
impl Handler for QrHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &QR_DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "qr").unwrap_or(false)
    }

    async fn execute(&self, _raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        match self.bridge.get_qr().await {
            Ok(Some(qr)) => HandlerResult::reply(&user.address, format!("QR: {qr}")),
            Ok(None) => HandlerResult::reply(&user.address, "No hay QR pendiente; WhatsApp ya está vinculado."),
            Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
        }
    }
}

static BRIDGE_HEALTH_DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "bridge-health",
    aliases: &["bridge-health"],
    category: "bridge",
    min_role: Role::Admin,
    cooldown_secs: 5,
    daily_cap: None,
    sensitive: true,
};

pub struct BridgeHealthHandler {
    bridge: Arc<BridgeClient>,
}

impl BridgeHealthHandler {
    pub fn new(bridge: Arc<BridgeClient>) -> Self {
        BridgeHealthHandler { bridge }
    }
}

#[async_trait]
impl Handler for BridgeHealthHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &BRIDGE_HEALTH_DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "bridge-health").unwrap_or(false)
    }

    async fn execute(&self, _raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        let health = self.bridge.health_check().await;
        HandlerResult::reply(
            &user.address,
            format!("bridge_available={} whatsapp_connected={} ({})", health.bridge_available, health.whatsapp_connected, health.details),
        )
    }
}

static BRIDGE_DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "bridge",
    aliases: &["bridge"],
    category: "bridge",
    min_role: Role::Employee,
    cooldown_secs: 5,
    daily_cap: None,
    sensitive: false,
};

pub struct BridgeHandler {
    bridge: Arc<BridgeClient>,
}

impl BridgeHandler {
    pub fn new(bridge: Arc<BridgeClient>) -> Self {
        BridgeHandler { bridge }
    }
}

#[async_trait]
impl Handler for BridgeHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &BRIDGE_DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "bridge").unwrap_or(false)
    }

    async fn execute(&self, _raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        match self.bridge.get_connection().await {
            Ok(info) => HandlerResult::reply(&user.address, format!("status={} connected={}", info.status, info.connected)),
            Err(e) => HandlerResult::reply(&user.address, format!("Error consultando el bridge: {e}")),
        }
    }
}

static CHATS_DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "chats",
    aliases: &["chats"],
    category: "bridge",
    min_role: Role::Employee,
    cooldown_secs: 5,
    daily_cap: None,
    sensitive: false,
};

pub struct ChatsHandler {
    bridge: Arc<BridgeClient>,
}

impl ChatsHandler {
    pub fn new(bridge: Arc<BridgeClient>) -> Self {
        ChatsHandler { bridge }
    }
}

#[async_trait]
impl Handler for ChatsHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &CHATS_DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "chats").unwrap_or(false)
    }

    async fn execute(&self, raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        let (_, args) = parse_command(raw_text, &['!', '/']).unwrap_or(("", vec![]));
        let limit: u32 = args.first().and_then(|s| s.parse().ok()).unwrap_or(20);
        match self.bridge.get_chats(limit).await {
            Ok(chats) => {
                let lines: Vec<String> = chats.iter().map(|c| format!("{} ({})", c.name, c.jid)).collect();
                HandlerResult::reply(&user.address, if lines.is_empty() { "Sin chats.".to_string() } else { lines.join("\n") })
            }
            Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
        }
    }
}

static HISTORY_DESCRIPTOR: HandlerDescriptor = HandlerDescriptor {
    name: "history",
    aliases: &["history"],
    category: "bridge",
    min_role: Role::Employee,
    cooldown_secs: 5,
    daily_cap: None,
    sensitive: false,
};

pub struct HistoryHandler {
    bridge: Arc<BridgeClient>,
}

impl HistoryHandler {
    pub fn new(bridge: Arc<BridgeClient>) -> Self {
        HistoryHandler { bridge }
    }
}

#[async_trait]
impl Handler for HistoryHandler {
    fn descriptor(&self) -> &'static HandlerDescriptor {
        &HISTORY_DESCRIPTOR
    }

    fn matches(&self, raw_text: &str, _classification: &Classification) -> bool {
        parse_command(raw_text, &['!', '/']).map(|(c, _)| c == "history").unwrap_or(false)
    }

    async fn execute(&self, raw_text: &str, user: &User, _classification: &Classification) -> HandlerResult {
        let (_, args) = parse_command(raw_text, &['!', '/']).unwrap_or(("", vec![]));
        let Some(jid) = args.first() else {
            return HandlerResult::reply(&user.address, "Uso: !history <jid> [limit]");
        };
        let limit: u32 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(20);
        match self.bridge.get_history(jid, limit).await {
            Ok(messages) => {
                let lines: Vec<String> = messages.iter().map(|m| format!("[{}] {}: {}", m.timestamp, m.sender, m.content)).collect();
                HandlerResult::reply(&user.address, if lines.is_empty() { "Sin historial.".to_string() } else { lines.join("\n") })
            }
            Err(e) => HandlerResult::reply(&user.address, format!("Error: {e}")),
        }
    }
}

//! Composition root. Wires the components in dependency order (config,
//! store, bridge client, rate/dedup guard, registration policy, classifier,
//! handler registry, processor, poller) and tears them down in reverse on
//! shutdown: stop the poller first, drain in-flight work, then close
//! storage.

mod cli;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use wa_core::bridge_client::{BridgeClient, BridgeConfig};
use wa_core::classifier::KeywordTables;
use wa_core::concurrency::{AddressLocks, ConcurrencyCap};
use wa_core::config::{watcher as config_watcher, ConfigPaths, ConfigService};
use wa_core::handlers::{
    AdminHandler, AdminSystemHandler, BridgeHandler, BridgeHealthHandler, ChatsHandler, DiagnosticHandler, HelpHandler, HistoryHandler,
    QrHandler, Registry, StatusHandler, UsersHandler,
};
use wa_core::poller::{BridgePoller, PollerConfig, PollerCursor};
use wa_core::processor::{Processor, ProcessorConfig};
use wa_core::rate_guard::{RateGuard, RateLimits};
use wa_core::registration::RegistrationPolicy;
use wa_core::user_store::UserStore;

use cli::{Cli, Commands, ConfigAction};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run => run(&cli.root).await,
        Commands::Config { action } => config_command(&cli.root, action).await,
        Commands::Doctor => doctor(&cli.root).await,
    }
}

fn load_config(root: &std::path::Path) -> Result<(ConfigService, Vec<wa_core::config::ConfigWarning>)> {
    let paths = ConfigPaths::new(root);
    ConfigService::load(paths, "WACORE").context("loading layered configuration")
}

async fn config_command(root: &std::path::Path, action: ConfigAction) -> Result<()> {
    let (service, warnings) = load_config(root)?;
    for w in &warnings {
        warn!(path = %w.path, message = %w.message, "config warning");
    }
    match action {
        ConfigAction::Show { format } => {
            println!("{}", service.export(&format, None)?);
        }
        ConfigAction::Validate => {
            if warnings.is_empty() {
                println!("config valid, no warnings");
            } else {
                println!("{} warning(s):", warnings.len());
                for w in warnings {
                    println!("  {} — {}", w.path, w.message);
                }
            }
        }
        ConfigAction::Reload => {
            let reloaded = service.reload().await?;
            println!("reloaded, {} warning(s)", reloaded.len());
        }
    }
    Ok(())
}

async fn doctor(root: &std::path::Path) -> Result<()> {
    let (service, warnings) = load_config(root)?;
    println!("config: {} warning(s)", warnings.len());
    for w in &warnings {
        println!("  {} — {}", w.path, w.message);
    }

    let bridge_config = bridge_config_from(&service);
    let bridge = BridgeClient::new(bridge_config)?;
    let health = bridge.health_check().await;
    println!("bridge: bridge_available={} whatsapp_connected={} ({})", health.bridge_available, health.whatsapp_connected, health.details);

    let data_dir = ConfigPaths::new(root).data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let store_path = data_dir.join("users.db");
    let store = UserStore::open(store_path.to_str().context("non-utf8 data dir path")?).context("opening user store")?;
    let stats = store.stats()?;
    println!("store: {} users, {} messages", stats.total_users, stats.total_messages);

    Ok(())
}

fn bridge_config_from(service: &ConfigService) -> BridgeConfig {
    let base_url = service.get("bridge.baseUrl").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_else(|| "http://127.0.0.1:8080".to_string());
    let call_timeout = service.get("bridge.callTimeoutSeconds").and_then(|v| v.as_u64()).unwrap_or(15);
    let max_retries = service.get("bridge.maxRetries").and_then(|v| v.as_u64()).unwrap_or(3) as u32;
    let base_delay = service.get("bridge.baseDelayMs").and_then(|v| v.as_u64()).unwrap_or(1000);
    let backoff_factor = service.get("bridge.backoffFactor").and_then(|v| v.as_f64()).unwrap_or(2.0);
    BridgeConfig {
        base_url,
        api_key: std::env::var("WACORE_BRIDGE_API_KEY").ok(),
        call_timeout: Duration::from_secs(call_timeout),
        max_retries,
        base_delay: Duration::from_millis(base_delay),
        backoff_factor,
    }
}

fn rate_limits_from(service: &ConfigService) -> RateLimits {
    let mut limits = RateLimits::default();
    if let Some(secs) = service.get("rateLimits.defaultIntervalSeconds").and_then(|v| v.as_u64()) {
        limits.default_interval = Duration::from_secs(secs);
    }
    if let Some(max) = service.get("maxDailyResponses").and_then(|v| v.as_u64()) {
        limits.max_daily = max as u32;
    }
    limits
}

async fn run(root: &std::path::Path) -> Result<()> {
    // configuration service
    let (config, warnings) = load_config(root)?;
    for w in &warnings {
        warn!(path = %w.path, message = %w.message, "config warning at startup");
    }
    let config = Arc::new(config);

    // user store
    let data_dir = root.join("data");
    std::fs::create_dir_all(&data_dir)?;
    let store = Arc::new(UserStore::open(data_dir.join("users.db").to_str().context("non-utf8 data dir path")?)?);

    // bridge client
    let bridge = Arc::new(BridgeClient::new(bridge_config_from(&config))?);

    // rate/dedup guard
    let dedup_capacity = config.get("system.dedupCapacity").and_then(|v| v.as_u64()).unwrap_or(10_000) as usize;
    let dedup = Arc::new(wa_core::rate_guard::DedupGuard::new(dedup_capacity));
    let rate = Arc::new(RateGuard::new(rate_limits_from(&config)));

    // registration policy (the engine itself is stateless, driven per-message by the processor)
    let registration_policy = RegistrationPolicy::default();

    // classifier keyword tables
    let tables = KeywordTables::default();

    // handler registry
    let mut registry = Registry::new();
    registry.register(10, Box::new(HelpHandler));
    registry.register(10, Box::new(StatusHandler));
    registry.register(20, Box::new(AdminHandler));
    registry.register(20, Box::new(AdminSystemHandler::new(store.clone(), config.clone())));
    registry.register(20, Box::new(DiagnosticHandler::new(store.clone(), tables.clone())));
    registry.register(20, Box::new(UsersHandler::new(store.clone())));
    registry.register(30, Box::new(QrHandler::new(bridge.clone())));
    registry.register(30, Box::new(BridgeHealthHandler::new(bridge.clone())));
    registry.register(30, Box::new(BridgeHandler::new(bridge.clone())));
    registry.register(30, Box::new(ChatsHandler::new(bridge.clone())));
    registry.register(30, Box::new(HistoryHandler::new(bridge.clone())));
    let registry = Arc::new(registry);

    let concurrency_cap_size = config.get("system.concurrencyCap").and_then(|v| v.as_u64()).unwrap_or(32) as usize;
    let processing_timeout_secs = config.get("system.processingTimeoutSeconds").and_then(|v| v.as_u64()).unwrap_or(30);

    // message processor
    let processor = Arc::new(Processor {
        bridge: bridge.clone(),
        store: store.clone(),
        dedup,
        rate,
        registry,
        tables,
        registration_policy,
        pending_registrations: Arc::new(AsyncMutex::new(HashMap::new())),
        address_locks: AddressLocks::new(),
        concurrency_cap: ConcurrencyCap::new(concurrency_cap_size),
        config: ProcessorConfig { processing_timeout: Duration::from_secs(processing_timeout_secs), ..Default::default() },
    });

    // bridge poller
    let poller_interval = config.get("system.pollerIntervalSeconds").and_then(|v| v.as_u64()).unwrap_or(5);
    let poller_batch = config.get("system.pollerBatchSize").and_then(|v| v.as_u64()).unwrap_or(100) as u32;
    let cursor = Arc::new(PollerCursor::new(0));
    let poller = BridgePoller::new(
        bridge.clone(),
        processor.clone(),
        cursor,
        PollerConfig { tick_interval: Duration::from_secs(poller_interval), batch_size: poller_batch },
    );

    // Ambient: config hot-reload (file watcher + SIGHUP).
    let runtime_handle = tokio::runtime::Handle::current();
    let _file_watcher = match config_watcher::ConfigFileWatcher::start(config.clone(), root.join("config/custom"), runtime_handle) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "failed to start config file watcher, hot-reload via SIGHUP only");
            None
        }
    };
    let _sighup = config_watcher::spawn_sighup_handler(config.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let poller_handle = {
        let poller_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            poller.run(poller_rx).await;
        })
    };

    info!("wa-core running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(10), poller_handle).await;

    info!("shutdown complete");
    Ok(())
}

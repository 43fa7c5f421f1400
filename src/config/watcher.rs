//! Config hot-reload. Watches `config/custom/` for changes and triggers
//! [`ConfigService::reload`]; SIGHUP does the same manually. Generalized
//! from a single watched file to a watched directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::ConfigService;

const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(500);

/// Holds the `notify` watcher alive and debounces reload triggers.
pub struct ConfigFileWatcher {
    _watcher: RecommendedWatcher,
    watched_dir: PathBuf,
}

impl ConfigFileWatcher {
    /// Starts watching `service`'s custom config directory. Reloads are
    /// dispatched onto the given `tokio::runtime::Handle` since `notify`'s
    /// callback runs on its own background thread.
    pub fn start(service: Arc<ConfigService>, custom_dir: PathBuf, runtime: tokio::runtime::Handle) -> notify::Result<Self> {
        let last_reload = Arc::new(Mutex::new(Instant::now() - DEBOUNCE_INTERVAL));
        let watched_dir = custom_dir.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)) => {
                    let service = service.clone();
                    let last_reload = last_reload.clone();
                    runtime.spawn(async move {
                        let mut last = last_reload.lock().await;
                        let now = Instant::now();
                        if now.duration_since(*last) < DEBOUNCE_INTERVAL {
                            debug!("config change debounced");
                            return;
                        }
                        *last = now;
                        match service.reload().await {
                            Ok(warnings) if warnings.is_empty() => info!("config reloaded after file change"),
                            Ok(warnings) => warn!(?warnings, "config reloaded with validation warnings"),
                            Err(e) => warn!(error = %e, "failed to reload config after file change"),
                        }
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "config watch error"),
            },
            notify::Config::default(),
        )?;

        watcher.watch(&custom_dir, RecursiveMode::NonRecursive)?;
        debug!(dir = %custom_dir.display(), "watching config directory for changes");

        Ok(ConfigFileWatcher { _watcher: watcher, watched_dir })
    }

    pub fn watched_dir(&self) -> &std::path::Path {
        &self.watched_dir
    }
}

/// Reloads config on SIGHUP. No-op on non-Unix targets.
#[cfg(unix)]
pub fn spawn_sighup_handler(service: Arc<ConfigService>) -> tokio::task::JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };
        loop {
            sighup.recv().await;
            info!("received SIGHUP, reloading config");
            match service.reload().await {
                Ok(warnings) if !warnings.is_empty() => warn!(?warnings, "config reloaded with validation warnings"),
                Err(e) => warn!(error = %e, "failed to reload config on SIGHUP"),
                _ => {}
            }
        }
    })
}

#[cfg(not(unix))]
pub fn spawn_sighup_handler(_service: Arc<ConfigService>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigPaths;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn watcher_starts_against_an_existing_directory() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("config/default")).unwrap();
        fs::write(
            dir.path().join("config/default/bot-config.json"),
            r#"{"bot": {"name": "Nova", "commandPrefix": "!"}, "maxDailyResponses": 200}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("config/default/messages.json"),
            r#"{"messages": {"greetings": {"new": ["hola"]}, "help": {"general": ["x"]}, "responses": {"default": ["y"]}}}"#,
        )
        .unwrap();
        let (service, _) = ConfigService::load(ConfigPaths::new(dir.path()), "WACORE_WATCH_TEST").unwrap();
        let service = Arc::new(service);
        let handle = tokio::runtime::Handle::current();
        let watcher = ConfigFileWatcher::start(service, dir.path().join("config/custom"), handle).unwrap();
        assert_eq!(watcher.watched_dir(), dir.path().join("config/custom"));
    }
}

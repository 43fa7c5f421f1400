//! Configuration Service. Layered JSON rather than a single file, since the
//! on-disk layout is a `default/` + `custom/` directory pair deep-merged in
//! that order. Hot-reload and change-broadcast live in [`watcher`].

pub mod watcher;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

const DEFAULT_SECTION_FILES: &[&str] =
    &["bot-config", "messages", "commands", "errors", "system", "responses"];

/// Backups beyond this many are deleted, oldest first, after every write.
const MAX_BACKUPS: usize = 10;

/// On-disk layout: `config/default`, `config/custom`, `config/backups`, plus
/// the sibling `data/` and `logs/` directories the rest of the core writes
/// into.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub root: PathBuf,
}

impl ConfigPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ConfigPaths { root: root.into() }
    }

    pub fn default_dir(&self) -> PathBuf {
        self.root.join("config/default")
    }
    pub fn custom_dir(&self) -> PathBuf {
        self.root.join("config/custom")
    }
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("config/backups")
    }
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Idempotent directory creation for the whole on-disk layout.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [self.default_dir(), self.custom_dir(), self.backups_dir(), self.data_dir(), self.logs_dir()] {
            fs::create_dir_all(&dir).map_err(|e| ConfigError::Read { path: dir.display().to_string(), cause: e.to_string() })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigWarning {
    pub path: String,
    pub message: String,
}

/// One discrete mutation broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChangeEvent {
    pub path: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub section: String,
    pub source: String,
    pub user: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub merge: bool,
    pub validate: bool,
    pub backup: bool,
    pub dry_run: bool,
}

/// Layered configuration tree: defaults -> environment -> `custom/*.json`,
/// deep-merged in that order. Readers take a cheap clone of the current
/// snapshot; writers go through `set`/`import`/`reload`.
pub struct ConfigService {
    paths: ConfigPaths,
    env_prefix: String,
    tree: RwLock<Value>,
    change_tx: broadcast::Sender<ConfigChangeEvent>,
    snapshot_tx: watch::Sender<Value>,
}

impl ConfigService {
    /// Loads all three layers from disk and validates. Validation failures
    /// are returned as warnings — they don't prevent startup.
    pub fn load(paths: ConfigPaths, env_prefix: &str) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        paths.ensure_dirs()?;
        let tree = build_layered_tree(&paths, env_prefix)?;
        let warnings = validate(&tree);
        let (change_tx, _) = broadcast::channel(64);
        let (snapshot_tx, _) = watch::channel(tree.clone());
        let service = ConfigService { paths, env_prefix: env_prefix.to_string(), tree: RwLock::new(tree), change_tx, snapshot_tx };
        Ok((service, warnings))
    }

    /// `get(path)`: dot-separated path into the merged tree.
    pub fn get(&self, path: &str) -> Option<Value> {
        navigate(&self.tree.read().unwrap(), path).cloned()
    }

    pub fn get_section(&self, name: &str) -> Option<Value> {
        self.tree.read().unwrap().get(name).cloned()
    }

    /// `set(path, value, source)`: writes into the in-memory tree only —
    /// persistence happens via `export`/the custom-layer file, keeping the
    /// live config separate from the file that seeded it until an explicit
    /// save.
    pub fn set(&self, path: &str, value: Value, source: &str) {
        let old_value = self.get(path);
        {
            let mut tree = self.tree.write().unwrap();
            set_path(&mut tree, path, value.clone());
        }
        let section = path.split('.').next().unwrap_or(path).to_string();
        let event = ConfigChangeEvent {
            path: path.to_string(),
            old_value,
            new_value: Some(value),
            section,
            source: source.to_string(),
            user: None,
            timestamp: Utc::now(),
        };
        let _ = self.change_tx.send(event);
        let _ = self.snapshot_tx.send(self.tree.read().unwrap().clone());
    }

    /// `export(format, sections?)`. Only `json`/`pretty_json` are meaningful
    /// layered-JSON formats; anything else is a caller error.
    pub fn export(&self, format: &str, sections: Option<&[&str]>) -> Result<String, ConfigError> {
        let tree = self.tree.read().unwrap();
        let subset = match sections {
            Some(names) => {
                let mut obj = serde_json::Map::new();
                for name in names {
                    if let Some(v) = tree.get(*name) {
                        obj.insert(name.to_string(), v.clone());
                    }
                }
                Value::Object(obj)
            }
            None => tree.clone(),
        };
        match format {
            "json" => serde_json::to_string(&subset).map_err(|e| ConfigError::Invalid(e.to_string())),
            "pretty_json" => serde_json::to_string_pretty(&subset).map_err(|e| ConfigError::Invalid(e.to_string())),
            other => Err(ConfigError::Invalid(format!("unsupported export format: {other}"))),
        }
    }

    /// `import(data, {merge, validate, backup, dryRun})`.
    pub fn import(&self, data: &str, opts: ImportOptions) -> Result<Vec<ConfigWarning>, ConfigError> {
        let incoming: Value = serde_json::from_str(data).map_err(|e| ConfigError::Parse { path: "<import>".into(), cause: e.to_string() })?;

        let mut candidate = self.tree.read().unwrap().clone();
        if opts.merge {
            deep_merge(&mut candidate, &incoming);
        } else {
            candidate = incoming;
        }

        let warnings = if opts.validate { validate(&candidate) } else { Vec::new() };
        if opts.validate && !warnings.is_empty() {
            warn!(count = warnings.len(), "config import produced validation warnings");
        }

        if opts.dry_run {
            return Ok(warnings);
        }

        if opts.backup {
            self.write_backup()?;
        }

        *self.tree.write().unwrap() = candidate.clone();
        let _ = self.snapshot_tx.send(candidate);
        info!("config imported");
        Ok(warnings)
    }

    /// Manual reload: re-reads all three layers from disk. Also invoked by
    /// the file watcher and by SIGHUP — see [`watcher`].
    pub async fn reload(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let tree = build_layered_tree(&self.paths, &self.env_prefix)?;
        let warnings = validate(&tree);
        *self.tree.write().unwrap() = tree.clone();
        let _ = self.snapshot_tx.send(tree);
        info!("config reloaded from disk");
        Ok(warnings)
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_tx.subscribe()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Value> {
        self.snapshot_tx.subscribe()
    }

    fn write_backup(&self) -> Result<(), ConfigError> {
        let dir = self.paths.backups_dir();
        fs::create_dir_all(&dir).map_err(|e| ConfigError::Read { path: dir.display().to_string(), cause: e.to_string() })?;
        let name = format!("backup-{}.json", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let path = dir.join(name);
        let serialized = serde_json::to_string_pretty(&*self.tree.read().unwrap()).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        fs::write(&path, serialized).map_err(|e| ConfigError::Read { path: path.display().to_string(), cause: e.to_string() })?;
        debug!(path = %path.display(), "wrote config backup");
        rotate_backups(&dir, MAX_BACKUPS)?;
        Ok(())
    }
}

/// Keeps the newest `max` backup files under `dir`, deleting the rest.
/// Filenames sort chronologically (`backup-<timestamp>.json`), so a plain
/// lexicographic sort orders oldest-first.
fn rotate_backups(dir: &Path, max: usize) -> Result<(), ConfigError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| ConfigError::Read { path: dir.display().to_string(), cause: e.to_string() })?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .collect();
    files.sort();
    if files.len() <= max {
        return Ok(());
    }
    for stale in &files[..files.len() - max] {
        if let Err(e) = fs::remove_file(stale) {
            warn!(path = %stale.display(), error = %e, "failed to remove stale config backup");
        }
    }
    Ok(())
}

fn build_layered_tree(paths: &ConfigPaths, env_prefix: &str) -> Result<Value, ConfigError> {
    let mut tree = Value::Object(serde_json::Map::new());

    for name in DEFAULT_SECTION_FILES {
        let path = paths.default_dir().join(format!("{name}.json"));
        if let Some(layer) = read_json_file(&path)? {
            deep_merge(&mut tree, &layer);
        }
    }

    let env_layer = read_env_overrides(env_prefix);
    deep_merge(&mut tree, &env_layer);

    if let Ok(entries) = fs::read_dir(paths.custom_dir()) {
        let mut files: Vec<PathBuf> = entries.flatten().map(|e| e.path()).filter(|p| p.extension().is_some_and(|e| e == "json")).collect();
        files.sort();
        for path in files {
            if let Some(layer) = read_json_file(&path)? {
                deep_merge(&mut tree, &layer);
            }
        }
    }

    Ok(tree)
}

fn read_json_file(path: &Path) -> Result<Option<Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Read { path: path.display().to_string(), cause: e.to_string() })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| ConfigError::Parse { path: path.display().to_string(), cause: e.to_string() })?;
    Ok(Some(value))
}

/// `WACORE__bot__name=Nova` -> `{"bot": {"name": "Nova"}}`. A
/// prefix-scanned namespace rather than one fixed variable.
fn read_env_overrides(prefix: &str) -> Value {
    let mut layer = Value::Object(serde_json::Map::new());
    let scan_prefix = format!("{prefix}__");
    for (key, raw_value) in std::env::vars() {
        let Some(rest) = key.strip_prefix(&scan_prefix) else { continue };
        let path = rest.to_lowercase().replace("__", ".");
        let value = parse_env_scalar(&raw_value);
        set_path(&mut layer, &path, value);
    }
    layer
}

fn parse_env_scalar(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

fn navigate<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = current.as_object_mut().unwrap().entry(segment.to_string()).or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    current.as_object_mut().unwrap().insert(segments[segments.len() - 1].to_string(), value);
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

/// Required-key / bound checks. Non-fatal: returned as warnings rather than
/// an error.
fn validate(tree: &Value) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    let required = ["bot.name", "bot.commandPrefix"];
    for path in required {
        if navigate(tree, path).is_none() {
            warnings.push(ConfigWarning { path: path.to_string(), message: "required key is missing".to_string() });
        }
    }

    match navigate(tree, "maxDailyResponses").and_then(Value::as_i64) {
        Some(n) if n < 1 => warnings.push(ConfigWarning { path: "maxDailyResponses".to_string(), message: "must be >= 1".to_string() }),
        None => warnings.push(ConfigWarning { path: "maxDailyResponses".to_string(), message: "required key is missing".to_string() }),
        _ => {}
    }

    let non_empty_lists = ["messages.greetings.new", "messages.help.general", "messages.responses.default"];
    for path in non_empty_lists {
        match navigate(tree, path) {
            Some(Value::Array(items)) if !items.is_empty() => {}
            Some(_) => warnings.push(ConfigWarning { path: path.to_string(), message: "must be a non-empty list".to_string() }),
            None => warnings.push(ConfigWarning { path: path.to_string(), message: "required key is missing".to_string() }),
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_defaults(dir: &TempDir) {
        let default_dir = dir.path().join("config/default");
        fs::create_dir_all(&default_dir).unwrap();
        fs::write(
            default_dir.join("bot-config.json"),
            r#"{"bot": {"name": "Nova", "commandPrefix": "!"}, "maxDailyResponses": 200}"#,
        )
        .unwrap();
        fs::write(
            default_dir.join("messages.json"),
            r#"{"messages": {"greetings": {"new": ["hola"]}, "help": {"general": ["usa !help"]}, "responses": {"default": ["no entendi"]}}}"#,
        )
        .unwrap();
    }

    #[test]
    fn loads_layered_defaults_with_no_warnings() {
        let dir = TempDir::new().unwrap();
        write_defaults(&dir);
        let (service, warnings) = ConfigService::load(ConfigPaths::new(dir.path()), "WACORE_TEST").unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(service.get("bot.name").unwrap(), Value::String("Nova".to_string()));
    }

    #[test]
    fn missing_required_key_produces_warning() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("config/default")).unwrap();
        let (_, warnings) = ConfigService::load(ConfigPaths::new(dir.path()), "WACORE_TEST2").unwrap();
        assert!(warnings.iter().any(|w| w.path == "bot.name"));
    }

    #[test]
    fn custom_layer_overrides_default() {
        let dir = TempDir::new().unwrap();
        write_defaults(&dir);
        let custom_dir = dir.path().join("config/custom");
        fs::create_dir_all(&custom_dir).unwrap();
        fs::write(custom_dir.join("overrides.json"), r#"{"bot": {"name": "Override"}}"#).unwrap();
        let (service, _) = ConfigService::load(ConfigPaths::new(dir.path()), "WACORE_TEST3").unwrap();
        assert_eq!(service.get("bot.name").unwrap(), Value::String("Override".to_string()));
        assert_eq!(service.get("bot.commandPrefix").unwrap(), Value::String("!".to_string()));
    }

    #[test]
    fn set_emits_change_event_with_old_and_new_value() {
        let dir = TempDir::new().unwrap();
        write_defaults(&dir);
        let (service, _) = ConfigService::load(ConfigPaths::new(dir.path()), "WACORE_TEST4").unwrap();
        let mut rx = service.subscribe_changes();
        service.set("bot.name", Value::String("Renamed".to_string()), "admin-command");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.old_value, Some(Value::String("Nova".to_string())));
        assert_eq!(event.new_value, Some(Value::String("Renamed".to_string())));
    }

    #[test]
    fn import_merge_dry_run_does_not_mutate() {
        let dir = TempDir::new().unwrap();
        write_defaults(&dir);
        let (service, _) = ConfigService::load(ConfigPaths::new(dir.path()), "WACORE_TEST5").unwrap();
        service
            .import(r#"{"bot": {"name": "Dry"}}"#, ImportOptions { merge: true, validate: false, backup: false, dry_run: true })
            .unwrap();
        assert_eq!(service.get("bot.name").unwrap(), Value::String("Nova".to_string()));
    }

    #[test]
    fn export_section_only_includes_requested_keys() {
        let dir = TempDir::new().unwrap();
        write_defaults(&dir);
        let (service, _) = ConfigService::load(ConfigPaths::new(dir.path()), "WACORE_TEST6").unwrap();
        let exported = service.export("json", Some(&["bot"])).unwrap();
        assert!(exported.contains("Nova"));
        assert!(!exported.contains("greetings"));
    }

    #[test]
    fn rotate_backups_deletes_oldest_beyond_cap() {
        let dir = TempDir::new().unwrap();
        for i in 0..15 {
            fs::write(dir.path().join(format!("backup-{i:04}.json")), "{}").unwrap();
        }
        rotate_backups(dir.path(), 10).unwrap();
        let mut remaining: Vec<String> = fs::read_dir(dir.path()).unwrap().flatten().map(|e| e.file_name().into_string().unwrap()).collect();
        remaining.sort();
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining.first().unwrap(), "backup-0005.json");
        assert_eq!(remaining.last().unwrap(), "backup-0014.json");
    }

    #[test]
    fn import_with_backup_rotates_old_backups() {
        let dir = TempDir::new().unwrap();
        write_defaults(&dir);
        let (service, _) = ConfigService::load(ConfigPaths::new(dir.path()), "WACORE_TEST7").unwrap();
        let backups_dir = dir.path().join("config/backups");
        fs::create_dir_all(&backups_dir).unwrap();
        for i in 0..(MAX_BACKUPS + 3) {
            fs::write(backups_dir.join(format!("backup-202001{i:02}T000000.000Z.json", i = i + 1)), "{}").unwrap();
        }
        service
            .import(r#"{"bot": {"name": "Rotated"}}"#, ImportOptions { merge: true, validate: false, backup: true, dry_run: false })
            .unwrap();
        let backups_dir_entries = fs::read_dir(&backups_dir).unwrap();
        let count = backups_dir_entries.flatten().filter(|e| e.path().extension().is_some_and(|x| x == "json")).count();
        assert_eq!(count, MAX_BACKUPS);
    }
}

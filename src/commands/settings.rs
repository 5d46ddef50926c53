use crate::analysis::staleness::DEFAULT_STALENESS_WINDOW;
use crate::error::SyncResult;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_SCHEMA_VERSION: i64 = 2;
const SETTINGS_FILE: &str = "settings.json";

const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STALE_WRITE_RETRIES: u64 = 1;
const DEFAULT_CACHE_FILE: &str = "profile_cache.db";

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSyncSettings {
    pub staleness_window: Duration,
    pub remote_timeout: Duration,
    pub stale_write_retries: u32,
    pub cache_file_name: String,
}

impl Default for EffectiveSyncSettings {
    fn default() -> Self {
        Self {
            staleness_window: DEFAULT_STALENESS_WINDOW,
            remote_timeout: Duration::from_millis(DEFAULT_REMOTE_TIMEOUT_MS),
            stale_write_retries: DEFAULT_STALE_WRITE_RETRIES as u32,
            cache_file_name: DEFAULT_CACHE_FILE.to_string(),
        }
    }
}

impl EffectiveSyncSettings {
    pub fn cache_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.cache_file_name)
    }
}

pub fn load_effective_sync_settings(data_dir: &Path) -> SyncResult<EffectiveSyncSettings> {
    let settings = load_settings_from_disk(data_dir)?;
    Ok(effective_from_value(&settings))
}

fn effective_from_value(settings: &Value) -> EffectiveSyncSettings {
    let defaults = EffectiveSyncSettings::default();

    let staleness_secs = settings
        .get("stalenessWindowSecs")
        .and_then(Value::as_u64)
        .unwrap_or(defaults.staleness_window.as_secs());
    let timeout_ms = settings
        .get("remoteTimeoutMs")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_REMOTE_TIMEOUT_MS);
    let retries = settings
        .get("staleWriteRetries")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_STALE_WRITE_RETRIES);
    let cache_file_name = settings
        .get("cacheFileName")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_CACHE_FILE)
        .to_string();

    EffectiveSyncSettings {
        staleness_window: Duration::from_secs(staleness_secs),
        remote_timeout: Duration::from_millis(timeout_ms),
        stale_write_retries: retries.min(u64::from(u32::MAX)) as u32,
        cache_file_name,
    }
}

pub fn load_settings_from_disk(data_dir: &Path) -> SyncResult<Value> {
    let path = settings_path(data_dir);
    fs::create_dir_all(data_dir)?;

    let original = if path.exists() {
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str::<Value>(&raw).unwrap_or_else(|e| {
            log::warn!("settings file {} is unreadable, using defaults: {e}", path.display());
            json!({})
        })
    } else {
        json!({})
    };

    let migrated = migrate_settings(original.clone());
    if migrated != original || !path.exists() {
        write_settings_file(&path, &migrated)?;
    }

    Ok(migrated)
}

pub fn save_settings_to_disk(data_dir: &Path, settings: Value) -> SyncResult<Value> {
    let path = settings_path(data_dir);
    fs::create_dir_all(data_dir)?;

    let mut merged = load_settings_from_disk(data_dir).unwrap_or_else(|_| default_settings());
    merge_settings(&mut merged, &settings);

    let migrated = migrate_settings(merged);
    write_settings_file(&path, &migrated)?;
    Ok(migrated)
}

fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SETTINGS_FILE)
}

fn write_settings_file(path: &Path, settings: &Value) -> SyncResult<()> {
    let raw = serde_json::to_string_pretty(settings)?;
    fs::write(path, raw)?;
    Ok(())
}

fn migrate_settings(input: Value) -> Value {
    let mut out = match input {
        Value::Object(map) => Value::Object(map),
        _ => Value::Object(Map::new()),
    };

    let version = out
        .get("schema_version")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    if version < 2 {
        // v1 kept the window in minutes.
        migrate_window_from_minutes(&mut out);
    }

    deep_merge_defaults(&mut out, &default_settings());
    sanitize_settings(&mut out);
    if let Some(obj) = out.as_object_mut() {
        obj.insert("schema_version".to_string(), json!(SETTINGS_SCHEMA_VERSION));
    }

    out
}

fn default_settings() -> Value {
    json!({
        "schema_version": SETTINGS_SCHEMA_VERSION,
        "stalenessWindowSecs": DEFAULT_STALENESS_WINDOW.as_secs(),
        "remoteTimeoutMs": DEFAULT_REMOTE_TIMEOUT_MS,
        "staleWriteRetries": DEFAULT_STALE_WRITE_RETRIES,
        "cacheFileName": DEFAULT_CACHE_FILE
    })
}

fn deep_merge_defaults(target: &mut Value, defaults: &Value) {
    let (Some(target_obj), Some(default_obj)) = (target.as_object_mut(), defaults.as_object()) else {
        return;
    };

    for (key, default_value) in default_obj {
        match target_obj.get_mut(key) {
            Some(existing) => {
                if existing.is_object() && default_value.is_object() {
                    deep_merge_defaults(existing, default_value);
                }
            }
            None => {
                target_obj.insert(key.clone(), default_value.clone());
            }
        }
    }
}

fn merge_settings(target: &mut Value, incoming: &Value) {
    match (target, incoming) {
        (Value::Object(target_obj), Value::Object(incoming_obj)) => {
            for (key, value) in incoming_obj {
                if let Some(existing) = target_obj.get_mut(key) {
                    merge_settings(existing, value);
                } else {
                    target_obj.insert(key.clone(), value.clone());
                }
            }
        }
        (target_slot, incoming_value) => {
            *target_slot = incoming_value.clone();
        }
    }
}

fn migrate_window_from_minutes(settings: &mut Value) {
    let Some(obj) = settings.as_object_mut() else {
        return;
    };

    if let Some(minutes) = obj.remove("stalenessWindowMinutes").and_then(|v| v.as_u64()) {
        obj.entry("stalenessWindowSecs".to_string())
            .or_insert(json!(minutes.saturating_mul(60)));
    }
}

fn sanitize_settings(settings: &mut Value) {
    let Some(obj) = settings.as_object_mut() else {
        return;
    };

    clamp_u64(obj, "stalenessWindowSecs", 30, 86_400, DEFAULT_STALENESS_WINDOW.as_secs());
    clamp_u64(obj, "remoteTimeoutMs", 500, 120_000, DEFAULT_REMOTE_TIMEOUT_MS);
    clamp_u64(obj, "staleWriteRetries", 0, 3, DEFAULT_STALE_WRITE_RETRIES);
    sanitize_file_name(obj, "cacheFileName", DEFAULT_CACHE_FILE);
}

fn clamp_u64(map: &mut Map<String, Value>, key: &str, min: u64, max: u64, default: u64) {
    let raw = map.get(key).and_then(Value::as_u64).unwrap_or(default);
    map.insert(key.to_string(), json!(raw.clamp(min, max)));
}

// The cache file always lives directly inside the data directory.
fn sanitize_file_name(map: &mut Map<String, Value>, key: &str, default: &str) {
    let valid = map
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.contains(['/', '\\']) && *name != "..")
        .unwrap_or(default)
        .to_string();
    map.insert(key.to_string(), json!(valid));
}

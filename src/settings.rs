//! User settings persistence: a nested JSON document with dotted-path access
//! and default fallback. Saved values are deep-merged over the built-in
//! defaults so old or partial files keep working after upgrades.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::default_settings;

pub struct SettingsManager {
    path: PathBuf,
    values: Mutex<Value>,
}

impl SettingsManager {
    /// Load settings from `path`, creating the file with defaults if missing.
    /// A corrupt file is logged and replaced by the defaults in memory.
    pub fn load_or_create(path: &Path) -> Self {
        let mut values = default_settings();

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(saved) => {
                    merge(&mut values, &saved);
                    info!("Settings loaded from {}", path.display());
                }
                Err(e) => warn!("Failed to parse {}: {} (using defaults)", path.display(), e),
            },
            Err(_) => {
                info!("No settings file at {}, creating defaults", path.display());
            }
        }

        let manager = Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        };
        if !path.exists() {
            if let Err(e) = manager.save() {
                warn!("Failed to write default settings: {}", e);
            }
        }
        manager
    }

    pub fn save(&self) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let values = self.values.lock().unwrap();
        let contents = serde_json::to_string_pretty(&*values).map_err(|e| e.to_string())?;
        std::fs::write(&self.path, contents).map_err(|e| e.to_string())
    }

    /// Fetch a value by dotted path, e.g. `"hotkey.silence_threshold"`.
    pub fn get(&self, path: &str) -> Option<Value> {
        let values = self.values.lock().unwrap();
        let mut node = &*values;
        for key in path.split('.') {
            node = node.get(key)?;
        }
        Some(node.clone())
    }

    /// Set a value by dotted path, creating intermediate objects as needed.
    pub fn set(&self, path: &str, value: Value) {
        let mut values = self.values.lock().unwrap();
        let mut node = &mut *values;
        let keys: Vec<&str> = path.split('.').collect();
        for key in &keys[..keys.len() - 1] {
            if !node.get(*key).map(Value::is_object).unwrap_or(false) {
                node[*key] = Value::Object(serde_json::Map::new());
            }
            node = node.get_mut(*key).unwrap();
        }
        node[keys[keys.len() - 1]] = value;
    }

    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        self.get(path).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_f32(&self, path: &str, default: f32) -> f32 {
        self.get(path)
            .and_then(|v| v.as_f64())
            .map(|v| v as f32)
            .unwrap_or(default)
    }

    pub fn get_u64(&self, path: &str, default: u64) -> u64 {
        self.get(path).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    pub fn get_string(&self, path: &str, default: &str) -> String {
        self.get(path)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    }

    /// Optional string: `null` and missing both map to `None`.
    pub fn get_opt_string(&self, path: &str) -> Option<String> {
        self.get(path)?.as_str().map(str::to_string)
    }

    pub fn get_string_list(&self, path: &str, default: &[&str]) -> Vec<String> {
        self.get(path)
            .and_then(|v| {
                v.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
            })
            .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
    }
}

/// Recursively overlay `saved` onto `base`. Objects merge key-by-key; any
/// other value replaces the default wholesale.
fn merge(base: &mut Value, saved: &Value) {
    match (base, saved) {
        (Value::Object(base_map), Value::Object(saved_map)) => {
            for (key, saved_value) in saved_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && saved_value.is_object() => {
                        merge(base_value, saved_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), saved_value.clone());
                    }
                }
            }
        }
        (base, saved) => *base = saved.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be set")
            .as_nanos();
        std::env::temp_dir().join(format!("voxkey-{name}-{nanos}.json"))
    }

    #[test]
    fn defaults_available_without_file() {
        let path = temp_path("defaults");
        let settings = SettingsManager::load_or_create(&path);
        assert!(settings.get_bool("hotkey.push_to_talk.enabled", false));
        assert_eq!(settings.get_u64("hotkey.push_to_talk.long_press_ms", 0), 300);
        assert_eq!(settings.get_f32("speaker_verification.threshold", 0.0), 0.25);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn saved_values_merge_over_defaults() {
        let path = temp_path("merge");
        std::fs::write(
            &path,
            r#"{"hotkey": {"silence_threshold": 0.05}, "output": {"restore_clipboard": false}}"#,
        )
        .unwrap();
        let settings = SettingsManager::load_or_create(&path);
        // Overridden keys take effect...
        assert_eq!(settings.get_f32("hotkey.silence_threshold", 0.0), 0.05);
        assert!(!settings.get_bool("output.restore_clipboard", true));
        // ...while untouched siblings keep their defaults.
        assert_eq!(settings.get_f32("hotkey.silence_duration", 0.0), 0.8);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn set_and_save_round_trip() {
        let path = temp_path("roundtrip");
        let settings = SettingsManager::load_or_create(&path);
        settings.set("hotkey.progressive", Value::Bool(true));
        settings.set("speaker_verification.threshold", serde_json::json!(0.3));
        settings.save().unwrap();

        let reloaded = SettingsManager::load_or_create(&path);
        assert!(reloaded.get_bool("hotkey.progressive", false));
        assert_eq!(reloaded.get_f32("speaker_verification.threshold", 0.0), 0.3);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_path_falls_back_to_default() {
        let path = temp_path("missing");
        let settings = SettingsManager::load_or_create(&path);
        assert_eq!(settings.get_f32("no.such.key", 1.5), 1.5);
        assert!(settings.get_opt_string("audio.input_device").is_none());
        let _ = std::fs::remove_file(path);
    }
}

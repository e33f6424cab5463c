use std::path::PathBuf;

pub const APP_NAME: &str = "voxkey";

/// Target capture format. All audio handed to the ASR and the speaker
/// verifier is mono f32 at this rate.
pub const SAMPLE_RATE: u32 = 16_000;

/// Helper: the per-user configuration directory (settings, enrollment,
/// vocabulary). Created on demand.
pub fn config_dir() -> Result<PathBuf, String> {
    let base = dirs::config_dir().ok_or("Could not find config directory")?;
    let dir = base.join(APP_NAME);
    std::fs::create_dir_all(&dir)
        .map_err(|e| format!("Failed to create config directory: {}", e))?;
    Ok(dir)
}

/// Helper: find or create the directory where model files live.
pub fn models_dir() -> Result<PathBuf, String> {
    let app_data = dirs::data_local_dir().ok_or("Could not find AppData directory")?;
    let models_dir = app_data.join(APP_NAME).join("models");
    std::fs::create_dir_all(&models_dir)
        .map_err(|e| format!("Failed to create models directory: {}", e))?;
    Ok(models_dir)
}

pub fn settings_path() -> Result<PathBuf, String> {
    Ok(config_dir()?.join("settings.json"))
}

/// Directory holding the enrolled speaker profile (centroid + embeddings).
pub fn speaker_dir() -> Result<PathBuf, String> {
    Ok(config_dir()?.join("speaker"))
}

/// Optional per-user vocabulary file; one term per line, `#` comments.
/// The terms are joined into the ASR context hint string.
pub fn vocabulary_path() -> Result<PathBuf, String> {
    Ok(config_dir()?.join("vocabulary.txt"))
}

/// Default settings document. Saved values are deep-merged over this, so a
/// partial settings file always yields a complete configuration.
pub fn default_settings() -> serde_json::Value {
    serde_json::json!({
        "hotkey": {
            "push_to_talk": {
                "enabled": true,
                "keys": ["caps lock"],
                "long_press_ms": 300
            },
            "toggle": {
                "enabled": true,
                "keys": ["right ctrl"]
            },
            "progressive": false,
            "silence_threshold": 0.01,
            "silence_duration": 0.8
        },
        "asr": {
            "model": "ggml-base.bin",
            "language": "auto"
        },
        "audio": {
            "sample_rate": 16000,
            "min_duration": 0.3,
            "input_device": null
        },
        "output": {
            "restore_clipboard": true
        },
        "vocabulary": {
            "enabled": true
        },
        "speaker_verification": {
            "enabled": false,
            "model": "speaker_embedding.onnx",
            "threshold": 0.25,
            "high_threshold": 0.40,
            "low_threshold": 0.10
        },
        "text_processing": {
            "remove_fillers": true,
            "smart_punctuation": true
        }
    })
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};

const SETTINGS_DIR_NAME: &str = "live-call";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Model used for live voice calls.
    pub live_model: String,

    /// Prebuilt voice the model answers with.
    pub voice_name: String,

    /// System instruction sent when a live call opens.
    pub system_instruction: String,

    /// Rate microphone audio is captured and sent at.
    pub capture_sample_rate: u32,

    /// Rate of the audio the model streams back.
    pub playback_sample_rate: u32,

    /// Samples per captured frame.
    pub capture_chunk_size: usize,

    /// Captured frames buffered for sending before new ones are dropped.
    pub outbound_queue_capacity: usize,

    /// Model used for text chat.
    pub chat_model: String,

    /// Model used for text chat when deep thinking is on.
    pub deep_thinking_model: String,

    pub chat_system_instruction: String,

    /// Route chat through the deep thinking model with a thinking budget.
    pub use_deep_thinking: bool,

    pub thinking_budget: u32,

    /// Model used to animate images.
    pub video_model: String,

    /// Seconds between video operation status checks.
    pub video_poll_interval_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            live_model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice_name: "Zephyr".to_string(),
            system_instruction: "You are a helpful, conversational AI assistant.".to_string(),
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            capture_chunk_size: 4096,
            outbound_queue_capacity: 64,
            chat_model: "gemini-2.5-flash".to_string(),
            deep_thinking_model: "gemini-3-pro-preview".to_string(),
            chat_system_instruction: "You are a helpful assistant in a chat application. Keep responses concise unless asked for detail.".to_string(),
            use_deep_thinking: false,
            thinking_budget: 32768,
            video_model: "veo-3.1-fast-generate-preview".to_string(),
            video_poll_interval_secs: 5,
        }
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> AppSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);

        let settings = AppSettings {
            voice_name: "Puck".to_string(),
            use_deep_thinking: true,
            outbound_queue_capacity: 8,
            ..AppSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();

        assert_eq!(load_settings_from(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"voice_name": "Kore"}"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.voice_name, "Kore");
        assert_eq!(settings.capture_sample_rate, 16_000);
        assert_eq!(settings.video_poll_interval_secs, 5);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(load_settings_from(&path), AppSettings::default());
    }
}

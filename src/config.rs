//! Configuration management for stillwater.
//!
//! Loads config from a YAML file in standard locations. Every section has
//! defaults, so a missing or partial file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::speech::VoiceName;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Messages API host, without the `/v1/messages` path.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub script_max_tokens: u32,
    pub chat_max_tokens: u32,
    /// Optional request timeout. Unset means no timeout beyond the transport's.
    pub timeout_secs: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".into(),
            model: "claude-3-5-sonnet-20241022".into(),
            api_key_env: "ANTHROPIC_API_KEY".into(),
            script_max_tokens: 2048,
            chat_max_tokens: 1024,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub enabled: bool,
    pub voice: VoiceName,
    /// Kokoro ONNX model. Empty means `./kokoro-v1.0.onnx`.
    pub model_path: String,
    /// Empty means `./voices-v1.0.bin`.
    pub voices_path: String,
    /// Empty means `./tokenizer.json`.
    pub tokenizer_path: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            voice: VoiceName::Serene,
            model_path: String::new(),
            voices_path: String::new(),
            tokenizer_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file backing the session store. Empty means the user data dir.
    pub path: String,
}

impl StorageConfig {
    pub fn resolved_path(&self) -> PathBuf {
        if self.path.is_empty() {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("stillwater")
                .join("storage.json")
        } else {
            PathBuf::from(&self.path)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub speech: SpeechConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./stillwater.yaml
    /// 2. ~/.config/stillwater/config.yaml
    /// 3. /etc/stillwater/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("stillwater.yaml")),
                dirs::home_dir().map(|h| h.join(".config/stillwater/config.yaml")),
                Some(PathBuf::from("/etc/stillwater/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }

    /// Reject values that would only fail later, at request time.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |message: &str| {
            Err(crate::Error::Config {
                message: message.to_string(),
            })
        };
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return invalid("api.base_url must be an http(s) URL");
        }
        if self.api.model.trim().is_empty() {
            return invalid("api.model must not be empty");
        }
        if self.api.api_key_env.trim().is_empty() {
            return invalid("api.api_key_env must name an environment variable");
        }
        if self.api.script_max_tokens == 0 || self.api.chat_max_tokens == 0 {
            return invalid("api token budgets must be positive");
        }
        if self.api.timeout_secs == Some(0) {
            return invalid("api.timeout_secs must be positive when set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::from_yaml("api:\n  model: claude-test\nspeech:\n  voice: gentle\n")
            .unwrap();
        assert_eq!(config.api.model, "claude-test");
        assert_eq!(config.api.base_url, "https://api.anthropic.com");
        assert_eq!(config.api.script_max_tokens, 2048);
        assert_eq!(config.speech.voice, VoiceName::Gentle);
        assert!(config.speech.enabled);
        assert!(config.api.timeout_secs.is_none());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/stillwater.yaml")));
        assert_eq!(config.api.api_key_env, "ANTHROPIC_API_KEY");
        assert_eq!(config.speech.voice, VoiceName::Serene);
    }

    #[test]
    fn validate_rejects_unusable_values() {
        assert!(Config::default().validate().is_ok());

        let config = Config::from_yaml("api:\n  base_url: api.anthropic.com\n").unwrap();
        assert!(matches!(config.validate(), Err(crate::Error::Config { .. })));

        let config = Config::from_yaml("api:\n  chat_max_tokens: 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("token budgets"));
    }

    #[test]
    fn explicit_storage_path_wins() {
        let storage = StorageConfig {
            path: "/tmp/sessions.json".into(),
        };
        assert_eq!(storage.resolved_path(), PathBuf::from("/tmp/sessions.json"));
        assert!(StorageConfig::default()
            .resolved_path()
            .ends_with("stillwater/storage.json"));
    }
}

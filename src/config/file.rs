//! TOML configuration file loading
//!
//! Supports `~/.config/talkback/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct TalkbackConfigFile {
    /// Remote exchange configuration
    #[serde(default)]
    pub exchange: ExchangeFileConfig,

    /// Speech recognition configuration
    #[serde(default)]
    pub recognition: RecognitionFileConfig,

    /// Turn-taking timing
    #[serde(default)]
    pub turn: TurnFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Remote exchange configuration
#[derive(Debug, Default, Deserialize)]
pub struct ExchangeFileConfig {
    /// Endpoint receiving `{"pergunta": ...}` and answering with audio
    pub endpoint: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// Speech recognition configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognitionFileConfig {
    /// Recognition locale (e.g. "pt-BR")
    pub language: Option<String>,

    /// STT provider ("whisper" or "deepgram")
    pub provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub model: Option<String>,
}

/// Silence windows in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct TurnFileConfig {
    pub silence_ms: Option<u64>,
    pub no_speech_ms: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<SecretString>,
    pub deepgram: Option<SecretString>,
}

/// Load the TOML config file from the standard path
///
/// Returns `TalkbackConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> TalkbackConfigFile {
    config_file_path().map_or_else(TalkbackConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
pub fn load_config_file_from(path: &Path) -> TalkbackConfigFile {
    if !path.exists() {
        return TalkbackConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                TalkbackConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            TalkbackConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/talkback/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("talkback").join("config.toml"))
}

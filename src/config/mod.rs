//! Configuration management for talkback
//!
//! Values resolve env > TOML file > default.

pub mod file;

use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::recognition::SttProvider;
use crate::{Error, Result};

use file::TalkbackConfigFile;

/// Default inter-fragment silence window
pub const DEFAULT_SILENCE_MS: u64 = 1500;

/// Default "no speech yet" window at the start of a turn
pub const DEFAULT_NO_SPEECH_MS: u64 = 5000;

/// Default recognition locale
pub const DEFAULT_LANGUAGE: &str = "pt-BR";

/// Default remote request timeout
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// talkback configuration
#[derive(Debug)]
pub struct Config {
    /// Remote exchange configuration
    pub exchange: ExchangeConfig,

    /// Speech recognition configuration
    pub recognition: RecognitionConfig,

    /// Turn-taking timing
    pub turn: TurnConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Remote exchange configuration
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Endpoint receiving the transcript
    pub endpoint: Option<String>,

    /// Request timeout
    pub timeout: Duration,
}

/// Speech recognition configuration
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// Recognition locale (BCP 47, e.g. "pt-BR")
    pub language: String,

    /// STT provider backend
    pub provider: SttProvider,

    /// STT model identifier
    pub model: String,
}

/// Silence windows driving end-of-utterance detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnConfig {
    /// Silence after the latest speech fragment that ends the utterance
    pub silence_window: Duration,

    /// Time allowed before the first fragment arrives
    pub no_speech_window: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_window: Duration::from_millis(DEFAULT_SILENCE_MS),
            no_speech_window: Duration::from_millis(DEFAULT_NO_SPEECH_MS),
        }
    }
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper)
    pub openai: Option<SecretString>,

    /// `Deepgram` API key
    pub deepgram: Option<SecretString>,
}

impl ApiKeys {
    /// Key for the given STT provider, ignoring empty values
    #[must_use]
    pub fn for_provider(&self, provider: SttProvider) -> Option<&SecretString> {
        match provider {
            SttProvider::Whisper => self.openai.as_ref(),
            SttProvider::Deepgram => self.deepgram.as_ref(),
        }
        .filter(|k| !k.expose_secret().trim().is_empty())
    }
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is invalid
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is invalid
    pub fn from_sources<F>(fc: TalkbackConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let exchange = ExchangeConfig {
            endpoint: env("TALKBACK_ENDPOINT")
                .or(fc.exchange.endpoint)
                .filter(|s| !s.trim().is_empty()),
            timeout: Duration::from_secs(
                parse_env(&env, "TALKBACK_REQUEST_TIMEOUT_SECS")
                    .or(fc.exchange.timeout_secs)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
        };

        let provider = match env("TALKBACK_STT_PROVIDER").or(fc.recognition.provider) {
            Some(p) => p.parse()?,
            None => SttProvider::Whisper,
        };
        let recognition = RecognitionConfig {
            language: env("TALKBACK_LANGUAGE")
                .or(fc.recognition.language)
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            provider,
            model: env("TALKBACK_STT_MODEL")
                .or(fc.recognition.model)
                .unwrap_or_else(|| provider.default_model().to_string()),
        };

        let turn = TurnConfig {
            silence_window: Duration::from_millis(
                parse_env(&env, "TALKBACK_SILENCE_MS")
                    .or(fc.turn.silence_ms)
                    .unwrap_or(DEFAULT_SILENCE_MS),
            ),
            no_speech_window: Duration::from_millis(
                parse_env(&env, "TALKBACK_NO_SPEECH_MS")
                    .or(fc.turn.no_speech_ms)
                    .unwrap_or(DEFAULT_NO_SPEECH_MS),
            ),
        };

        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY")
                .map(SecretString::from)
                .or(fc.api_keys.openai),
            deepgram: env("DEEPGRAM_API_KEY")
                .map(SecretString::from)
                .or(fc.api_keys.deepgram),
        };

        let config = Self {
            exchange,
            recognition,
            turn,
            api_keys,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check resolved values
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.exchange.endpoint {
            validate_endpoint(endpoint)?;
        }

        if self.turn.silence_window.is_zero() || self.turn.no_speech_window.is_zero() {
            return Err(Error::Config(
                "silence windows must be greater than zero".to_string(),
            ));
        }

        if self.turn.no_speech_window < self.turn.silence_window {
            return Err(Error::Config(format!(
                "no-speech window ({} ms) must not be shorter than silence window ({} ms)",
                self.turn.no_speech_window.as_millis(),
                self.turn.silence_window.as_millis()
            )));
        }

        if self.recognition.language.trim().is_empty() {
            return Err(Error::Config("recognition language is empty".to_string()));
        }

        Ok(())
    }

    /// The configured endpoint
    ///
    /// # Errors
    ///
    /// Returns error if no endpoint is configured
    pub fn require_endpoint(&self) -> Result<&str> {
        self.exchange.endpoint.as_deref().ok_or_else(|| {
            Error::Config(
                "endpoint required (set TALKBACK_ENDPOINT or [exchange] endpoint)".to_string(),
            )
        })
    }
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let parsed = url::Url::parse(endpoint)
        .map_err(|e| Error::Config(format!("invalid endpoint {endpoint:?}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::Config(format!(
            "endpoint must use http or https, got {other}"
        ))),
    }
}

fn parse_env<T, F>(env: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = env(key)?;
    raw.trim().parse().map_or_else(
        |_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable env value");
            None
        },
        Some,
    )
}

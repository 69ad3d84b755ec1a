//! Speech-to-text (STT) services
//!
//! One utterance goes up as a WAV file and its transcript comes back. Whisper
//! takes a multipart form, Deepgram takes the raw WAV body.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEEPGRAM_URL: &str = "https://api.deepgram.com/v1/listen";

/// Turns one recorded utterance into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a mono WAV utterance
    ///
    /// # Errors
    ///
    /// Returns error if the service cannot be reached or rejects the audio
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

impl DeepgramResponse {
    /// Best alternative of the first channel; empty when nothing was heard
    fn into_transcript(self) -> String {
        self.results
            .channels
            .into_iter()
            .next()
            .and_then(|channel| channel.alternatives.into_iter().next())
            .map(|alternative| alternative.transcript)
            .unwrap_or_default()
    }
}

/// STT provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttProvider {
    Whisper,
    Deepgram,
}

impl SttProvider {
    /// Model used when none is configured
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::Whisper => "whisper-1",
            Self::Deepgram => "nova-2",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Whisper => "Whisper",
            Self::Deepgram => "Deepgram",
        }
    }
}

impl FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// Hosted STT client for one provider, model and language
pub struct SpeechToText {
    client: reqwest::Client,
    provider: SttProvider,
    api_key: SecretString,
    model: String,
    language: String,
    timeout: Duration,
}

impl SpeechToText {
    /// Create a client; every request gives up after `timeout`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(
        provider: SttProvider,
        api_key: &str,
        model: String,
        language: String,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Error::Config(format!(
                "{} API key required",
                provider.label()
            )));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            provider,
            api_key: SecretString::from(api_key.to_owned()),
            model,
            language,
            timeout,
        })
    }

    fn request(&self, wav: &[u8]) -> Result<reqwest::RequestBuilder> {
        let key = self.api_key.expose_secret();

        let builder = match self.provider {
            SttProvider::Whisper => {
                let file = Part::bytes(wav.to_vec())
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?;
                let form = Form::new()
                    .part("file", file)
                    .text("model", self.model.clone())
                    .text("language", whisper_language(&self.language).to_string());

                self.client.post(WHISPER_URL).bearer_auth(key).multipart(form)
            }
            SttProvider::Deepgram => self
                .client
                .post(DEEPGRAM_URL)
                .query(&[
                    ("model", self.model.as_str()),
                    ("language", self.language.as_str()),
                    ("punctuate", "true"),
                ])
                .header(AUTHORIZATION, format!("Token {key}"))
                .header(CONTENT_TYPE, "audio/wav")
                .body(wav.to_vec()),
        };

        Ok(builder.timeout(self.timeout))
    }

    fn parse(&self, body: &[u8]) -> Result<String> {
        Ok(match self.provider {
            SttProvider::Whisper => serde_json::from_slice::<WhisperResponse>(body)?.text,
            SttProvider::Deepgram => {
                serde_json::from_slice::<DeepgramResponse>(body)?.into_transcript()
            }
        })
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        let provider = self.provider.label();
        tracing::debug!(provider, audio_bytes = wav.len(), "transcribing utterance");

        let response = self
            .request(wav)?
            .send()
            .await
            .inspect_err(|e| tracing::error!(provider, error = %e, "STT request failed"))?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let detail = String::from_utf8_lossy(&body);
            tracing::error!(provider, status = %status, body = %detail, "STT API error");
            return Err(Error::Stt(format!("{provider} API error {status}: {detail}")));
        }

        let transcript = self.parse(&body)?;
        tracing::debug!(provider, transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

/// Whisper takes ISO-639-1 codes, not full locales
fn whisper_language(locale: &str) -> &str {
    locale.split(['-', '_']).next().unwrap_or(locale)
}

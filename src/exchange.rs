//! Remote exchange: transcript in, audio out

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::{Config, Error, Result};

/// Sends a finalized transcript and receives the spoken answer
#[async_trait]
pub trait RemoteExchange: Send + Sync {
    /// Send `transcript` and return the audio payload
    ///
    /// A single attempt; no retry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Communication`] on transport failure or a non-success status
    async fn send(&self, transcript: &str) -> Result<Vec<u8>>;
}

/// JSON body of the exchange request
#[derive(Debug, Serialize)]
pub struct ExchangeRequest<'a> {
    pub pergunta: &'a str,
}

/// Exchange over HTTP POST
pub struct HttpExchange {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExchange {
    /// Create an exchange posting to `endpoint`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Create an exchange from configuration
    ///
    /// # Errors
    ///
    /// Returns error if no endpoint is configured
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.require_endpoint()?, config.exchange.timeout)
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteExchange for HttpExchange {
    async fn send(&self, transcript: &str) -> Result<Vec<u8>> {
        tracing::debug!(endpoint = %self.endpoint, chars = transcript.len(), "sending transcript");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&ExchangeRequest {
                pergunta: transcript,
            })
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "exchange request failed");
                Error::Communication(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "exchange returned error status");
            return Err(Error::Communication(format!("server responded {status}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Communication(format!("failed to read response body: {e}")))?;

        tracing::debug!(bytes = audio.len(), "received audio response");
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_string(&ExchangeRequest { pergunta: "oi" }).unwrap();
        assert_eq!(body, r#"{"pergunta":"oi"}"#);
    }

    #[test]
    fn test_request_body_escapes() {
        let body = serde_json::to_value(ExchangeRequest {
            pergunta: "diga \"olá\"",
        })
        .unwrap();
        assert_eq!(body["pergunta"], "diga \"olá\"");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_communication_failure() {
        // Port 9 (discard) on localhost is closed in any sane test environment
        let exchange =
            HttpExchange::new("http://127.0.0.1:9/perguntar", Duration::from_secs(2)).unwrap();
        let err = exchange.send("oi").await.unwrap_err();
        assert!(matches!(err, Error::Communication(_)));
    }
}

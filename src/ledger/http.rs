//! REST ledger client.
//!
//! Endpoints (relative to the configured base URL):
//!
//! | Method | Path | Body / response |
//! |---|---|---|
//! | GET | `/subjects/{id}` | [`SubjectState`], 404 if unknown |
//! | GET | `/params` | [`LedgerParams`] |
//! | GET | `/accounts/{address}/sequence` | `{"sequence_number": u64}` |
//! | POST | `/transactions/group` | `{"signed": [base64]}` → `{"txid": ..}` |
//! | POST | `/transactions/envelope` | `{"envelope": base64}` → `{"txid": ..}` |
//!
//! Connection failures and 5xx responses are network errors; 4xx responses
//! are rejections and carry the node's message verbatim.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use super::state::{LedgerParams, SubjectState};
use super::{LedgerClient, LedgerError};
use crate::wire::{address_to_hex, Address};

#[derive(Serialize)]
struct SubmitGroupRequest {
    signed: Vec<String>,
}

#[derive(Serialize)]
struct SubmitEnvelopeRequest {
    envelope: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    txid: String,
}

#[derive(Deserialize)]
struct SequenceResponse {
    sequence_number: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "message")]
    error: String,
}

/// Ledger node reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpLedgerClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("sponsor-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `/subjects/<id>` with the id percent-encoded as one path segment
    fn subject_url(&self, subject_id: &str) -> Result<reqwest::Url, LedgerError> {
        let mut url = reqwest::Url::parse(&self.url("/subjects"))
            .map_err(|e| LedgerError::Network(format!("invalid ledger url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| LedgerError::Network("ledger url cannot carry a path".into()))?
            .push(subject_id);
        Ok(url)
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, LedgerError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| LedgerError::Network(format!("invalid ledger response: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or(text);
        if status.is_client_error() {
            Err(LedgerError::Rejected(message))
        } else {
            Err(LedgerError::Network(format!("HTTP {status}: {message}")))
        }
    }
}

fn network(e: reqwest::Error) -> LedgerError {
    LedgerError::Network(e.to_string())
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn get_state(&self, subject_id: &str) -> Result<Option<SubjectState>, LedgerError> {
        let response = self
            .http_client
            .get(self.subject_url(subject_id)?)
            .send()
            .await
            .map_err(network)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::read(response).await.map(Some)
    }

    async fn params(&self) -> Result<LedgerParams, LedgerError> {
        let response = self
            .http_client
            .get(self.url("/params"))
            .send()
            .await
            .map_err(network)?;
        Self::read(response).await
    }

    async fn sequence_number(&self, address: &Address) -> Result<u64, LedgerError> {
        let response = self
            .http_client
            .get(self.url(&format!("/accounts/{}/sequence", address_to_hex(address))))
            .send()
            .await
            .map_err(network)?;
        Self::read::<SequenceResponse>(response)
            .await
            .map(|r| r.sequence_number)
    }

    async fn submit_group(&self, signed: Vec<Vec<u8>>) -> Result<String, LedgerError> {
        let body = SubmitGroupRequest {
            signed: signed.iter().map(|b| BASE64.encode(b)).collect(),
        };
        debug!(slots = body.signed.len(), "Submitting group to ledger");
        let response = self
            .http_client
            .post(self.url("/transactions/group"))
            .json(&body)
            .send()
            .await
            .map_err(network)?;
        Self::read::<SubmitResponse>(response).await.map(|r| r.txid)
    }

    async fn submit_envelope(&self, envelope: Vec<u8>) -> Result<String, LedgerError> {
        let body = SubmitEnvelopeRequest {
            envelope: BASE64.encode(&envelope),
        };
        debug!(len = envelope.len(), "Submitting fee-payer envelope to ledger");
        let response = self
            .http_client
            .post(self.url("/transactions/envelope"))
            .json(&body)
            .send()
            .await
            .map_err(network)?;
        Self::read::<SubmitResponse>(response).await.map(|r| r.txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = HttpLedgerClient::new("http://ledger.local:8080/", Duration::from_secs(5));
        assert_eq!(client.url("/params"), "http://ledger.local:8080/params");
    }

    #[test]
    fn test_subject_id_stays_one_path_segment() {
        let client = HttpLedgerClient::new("http://ledger.local:8080/", Duration::from_secs(5));
        assert_eq!(
            client.subject_url("42").unwrap().as_str(),
            "http://ledger.local:8080/subjects/42"
        );

        let url = client.subject_url("43/../42").unwrap();
        assert_eq!(url.path(), "/subjects/43%2F..%2F42");

        let url = client.subject_url("42?x=1#y").unwrap();
        assert_eq!(url.path(), "/subjects/42%3Fx=1%23y");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[tokio::test]
    async fn test_unreachable_ledger_is_network_error() {
        // Port 9 (discard) on localhost is closed in test environments
        let client = HttpLedgerClient::new("http://127.0.0.1:9", Duration::from_secs(2));
        assert!(matches!(client.params().await, Err(LedgerError::Network(_))));
    }
}

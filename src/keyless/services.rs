//! External services a keyless login depends on: the pepper service (a
//! per-identity secret salt) and the proving service (zk proof that the
//! identity token commits to the ephemeral key).

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::deriver::IdentityClaims;
use crate::crypto::sha3_256;
use crate::types::{GatewayError, Result};

/// Per-identity salt mixed into the identity commitment
pub type Pepper = [u8; 32];

#[async_trait]
pub trait PepperService: Send + Sync {
    async fn fetch_pepper(&self, identity_token: &str, claims: &IdentityClaims) -> Result<Pepper>;
}

/// Inputs the prover needs
#[derive(Debug, Clone, Serialize)]
pub struct ProofRequest {
    pub jwt: String,
    #[serde(serialize_with = "as_hex")]
    pub ephemeral_public_key: [u8; 32],
    pub expiry_secs: u64,
    #[serde(serialize_with = "as_hex")]
    pub blinder: [u8; 31],
    #[serde(serialize_with = "as_hex")]
    pub pepper: Pepper,
    #[serde(serialize_with = "as_hex")]
    pub identity_commitment: [u8; 32],
}

fn as_hex<S: serde::Serializer, T: AsRef<[u8]>>(
    value: &T,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(value))
}

#[async_trait]
pub trait ProofService: Send + Sync {
    async fn prove(&self, request: &ProofRequest) -> Result<Vec<u8>>;
}

// =============================================================================
// Local implementations
// =============================================================================

/// Pepper derived from a server secret: `sha256(secret || iss || aud || sub)`
pub struct LocalPepperService {
    secret: Vec<u8>,
}

impl LocalPepperService {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn derive(&self, claims: &IdentityClaims) -> Pepper {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(claims.iss.as_bytes());
        hasher.update(claims.audience().as_bytes());
        hasher.update(claims.sub.as_bytes());
        hasher.finalize().into()
    }
}

#[async_trait]
impl PepperService for LocalPepperService {
    async fn fetch_pepper(&self, _identity_token: &str, claims: &IdentityClaims) -> Result<Pepper> {
        Ok(self.derive(claims))
    }
}

/// Dev-mode prover: a hash over the statement instead of a real proof
#[derive(Debug, Default)]
pub struct LocalProofService;

#[async_trait]
impl ProofService for LocalProofService {
    async fn prove(&self, request: &ProofRequest) -> Result<Vec<u8>> {
        Ok(sha3_256(&[
            b"LOCAL_PROOF",
            &request.identity_commitment,
            &request.ephemeral_public_key,
            &request.expiry_secs.to_be_bytes(),
        ])
        .to_vec())
    }
}

// =============================================================================
// HTTP implementations
// =============================================================================

#[derive(Serialize)]
struct PepperRequest<'a> {
    jwt: &'a str,
}

#[derive(Deserialize)]
struct PepperResponse {
    pepper: String,
}

#[derive(Deserialize)]
struct ProofResponse {
    proof: String,
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("sponsor-gateway/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// Map a failed HTTP exchange: unreachable or 5xx is retryable, 4xx is not
async fn service_error(what: &str, response: reqwest::Response) -> GatewayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        GatewayError::IdentityToken(format!("{what} refused ({status}): {body}"))
    } else {
        GatewayError::ProofUnavailable(format!("{what} returned {status}"))
    }
}

/// Pepper service reached over HTTP
pub struct HttpPepperService {
    url: String,
    http_client: reqwest::Client,
}

impl HttpPepperService {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            http_client: http_client(timeout),
        }
    }
}

#[async_trait]
impl PepperService for HttpPepperService {
    async fn fetch_pepper(&self, identity_token: &str, claims: &IdentityClaims) -> Result<Pepper> {
        debug!(iss = %claims.iss, "Fetching pepper");
        let response = self
            .http_client
            .post(&self.url)
            .json(&PepperRequest { jwt: identity_token })
            .send()
            .await
            .map_err(|e| GatewayError::ProofUnavailable(format!("pepper service: {e}")))?;
        if !response.status().is_success() {
            return Err(service_error("pepper service", response).await);
        }
        let body: PepperResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProofUnavailable(format!("pepper response: {e}")))?;
        let bytes = hex::decode(body.pepper.trim_start_matches("0x"))
            .map_err(|e| GatewayError::ProofUnavailable(format!("pepper is not hex: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| GatewayError::ProofUnavailable("pepper must be 32 bytes".into()))
    }
}

/// Proving service reached over HTTP
pub struct HttpProofService {
    url: String,
    http_client: reqwest::Client,
}

impl HttpProofService {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            http_client: http_client(timeout),
        }
    }
}

#[async_trait]
impl ProofService for HttpProofService {
    async fn prove(&self, request: &ProofRequest) -> Result<Vec<u8>> {
        let response = self
            .http_client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| GatewayError::ProofUnavailable(format!("prover: {e}")))?;
        if !response.status().is_success() {
            return Err(service_error("prover", response).await);
        }
        let body: ProofResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProofUnavailable(format!("prover response: {e}")))?;
        Ok(BASE64.decode(body.proof)?)
    }
}

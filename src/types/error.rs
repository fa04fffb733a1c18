//! Error types for the sponsor gateway
//!
//! Every failure is classified so callers can tell "try again" apart from
//! "do not retry". Assembly errors are always fatal: they mean a wire-format
//! bug, and nothing that produced one may reach the ledger.

use hyper::StatusCode;
use serde::{Deserialize, Serialize};

/// Broad family an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transport,
    Preparation,
    Assembly,
    Ledger,
    Keyless,
    Request,
    Internal,
}

/// Main error type for gateway and client operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    // ---- transport -------------------------------------------------------
    #[error("Session not open: {0}")]
    NotOpen(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Session channel closed before a response arrived")]
    ChannelClosed,

    #[error("Request already in flight for {0}")]
    AlreadyInFlight(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // ---- preparation -----------------------------------------------------
    #[error("Subject not found: {0}")]
    SubjectNotFound(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Subject not ready for this action: {0}")]
    InvalidState(String),

    #[error("Action already finalized: {0}")]
    ActionFinalized(String),

    #[error("Ledger query failed: {0}")]
    LedgerQuery(String),

    // ---- assembly --------------------------------------------------------
    #[error("Unexpected raw transaction tag 0x{0:02x}")]
    UnexpectedRawTransactionTag(u8),

    #[error("Unexpected account authenticator tag: {0}")]
    UnexpectedAuthenticatorTag(String),

    #[error("Sponsor address mismatch: requested {requested}, configured {configured}")]
    SponsorAddressMismatch { requested: String, configured: String },

    #[error("Assembled envelope failed self-check: {0}")]
    EnvelopeSelfCheck(String),

    #[error("Malformed wire data: {0}")]
    Wire(String),

    // ---- ledger ----------------------------------------------------------
    #[error("Ledger rejected transaction: {0}")]
    LedgerRejected(String),

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    // ---- keyless ---------------------------------------------------------
    #[error("Identity token nonce does not match ephemeral key nonce")]
    NonceMismatch,

    #[error("Ephemeral key expired")]
    EphemeralExpired,

    #[error("Identity token invalid: {0}")]
    IdentityToken(String),

    #[error("Proof service unavailable: {0}")]
    ProofUnavailable(String),

    // ---- request / misc --------------------------------------------------
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Pending transaction not found: {0}")]
    PendingNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Error frame relayed from the gateway to a client
    #[error("Gateway error: {message}")]
    Remote { message: String, retryable: bool },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Which family this error belongs to
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotOpen(_)
            | Self::Timeout(_)
            | Self::ChannelClosed
            | Self::AlreadyInFlight(_)
            | Self::WebSocket(_) => ErrorClass::Transport,
            Self::SubjectNotFound(_)
            | Self::NotAuthorized(_)
            | Self::InvalidState(_)
            | Self::ActionFinalized(_)
            | Self::LedgerQuery(_) => ErrorClass::Preparation,
            Self::UnexpectedRawTransactionTag(_)
            | Self::UnexpectedAuthenticatorTag(_)
            | Self::SponsorAddressMismatch { .. }
            | Self::EnvelopeSelfCheck(_)
            | Self::Wire(_) => ErrorClass::Assembly,
            Self::LedgerRejected(_) | Self::LedgerUnavailable(_) => ErrorClass::Ledger,
            Self::NonceMismatch
            | Self::EphemeralExpired
            | Self::IdentityToken(_)
            | Self::ProofUnavailable(_) => ErrorClass::Keyless,
            Self::BadRequest(_)
            | Self::PendingNotFound(_)
            | Self::Unauthorized(_)
            | Self::Remote { .. } => ErrorClass::Request,
            Self::Config(_) | Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether a caller may retry the operation that produced this error.
    ///
    /// `ChannelClosed` is retryable only after reopening the session, and
    /// the caller must re-run prepare first: the previous outcome is unknown.
    pub fn is_retryable(&self) -> bool {
        if let Self::Remote { retryable, .. } = self {
            return *retryable;
        }
        matches!(
            self,
            Self::NotOpen(_)
                | Self::Timeout(_)
                | Self::ChannelClosed
                | Self::WebSocket(_)
                | Self::LedgerQuery(_)
                | Self::LedgerUnavailable(_)
                | Self::ProofUnavailable(_)
        )
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self.class() {
            ErrorClass::Transport => StatusCode::BAD_GATEWAY,
            ErrorClass::Preparation => match self {
                Self::SubjectNotFound(_) => StatusCode::NOT_FOUND,
                Self::NotAuthorized(_) => StatusCode::FORBIDDEN,
                Self::LedgerQuery(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::CONFLICT,
            },
            ErrorClass::Assembly | ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorClass::Ledger => StatusCode::BAD_GATEWAY,
            ErrorClass::Keyless => StatusCode::UNAUTHORIZED,
            ErrorClass::Request => match self {
                Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                Self::PendingNotFound(_) => StatusCode::GONE,
                _ => StatusCode::BAD_REQUEST,
            },
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<base64::DecodeError> for GatewayError {
    fn from(err: base64::DecodeError) -> Self {
        Self::BadRequest(format!("base64 error: {}", err))
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized(format!("JWT error: {}", err))
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Terminal outcome of a sponsored action as seen by the caller.
///
/// Only `RetryableError` may be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success { txid: String },
    SuccessNoop,
    RetryableError { reason: String },
    FatalError { reason: String },
}

impl Outcome {
    pub fn from_result(result: Result<Option<String>>) -> Self {
        match result {
            Ok(Some(txid)) => Self::Success { txid },
            Ok(None) => Self::SuccessNoop,
            Err(e) if e.is_retryable() => Self::RetryableError {
                reason: e.to_string(),
            },
            Err(e) => Self::FatalError {
                reason: e.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::SuccessNoop)
    }
}

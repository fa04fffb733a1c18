//! Ledger access: query subject state, read chain parameters, broadcast.
//!
//! [`LedgerClient`] is the seam between the gateway and the ledger node.
//! [`HttpLedgerClient`] talks to a node's REST API; [`InMemoryLedger`]
//! validates groups and envelopes locally and is used in dev mode and tests.

pub mod http;
pub mod memory;
pub mod state;
pub mod transaction;

use async_trait::async_trait;

use crate::types::GatewayError;
use crate::wire::Address;

pub use http::HttpLedgerClient;
pub use memory::InMemoryLedger;
pub use state::{LedgerParams, SubjectKind, SubjectState, SubjectStatus};
pub use transaction::{LedgerTransaction, RawTransaction, SignedSlot, TxKind};

/// Failure talking to the ledger
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// Could not reach the ledger or it failed transiently
    #[error("ledger network error: {0}")]
    Network(String),

    /// The ledger understood the request and refused it
    #[error("{0}")]
    Rejected(String),
}

impl LedgerError {
    /// Mapping for read paths (prepare)
    pub fn into_query_error(self) -> GatewayError {
        match self {
            Self::Network(msg) => GatewayError::LedgerQuery(msg),
            Self::Rejected(msg) => GatewayError::LedgerRejected(msg),
        }
    }

    /// Mapping for broadcast paths (submit)
    pub fn into_submit_error(self) -> GatewayError {
        match self {
            Self::Network(msg) => GatewayError::LedgerUnavailable(msg),
            Self::Rejected(msg) => GatewayError::LedgerRejected(msg),
        }
    }
}

/// Ledger operations the gateway depends on
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current state of a subject, `None` if the ledger has no such subject
    async fn get_state(&self, subject_id: &str) -> Result<Option<SubjectState>, LedgerError>;

    /// Chain parameters at the current round
    async fn params(&self) -> Result<LedgerParams, LedgerError>;

    /// Next sequence number of an account (fee-payer path)
    async fn sequence_number(&self, address: &Address) -> Result<u64, LedgerError>;

    /// Broadcast an atomic group of signed slots; returns the transaction id
    async fn submit_group(&self, signed: Vec<Vec<u8>>) -> Result<String, LedgerError>;

    /// Broadcast a fee-payer envelope; returns the transaction hash
    async fn submit_envelope(&self, envelope: Vec<u8>) -> Result<String, LedgerError>;
}

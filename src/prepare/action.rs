//! Action identities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ledger::SubjectKind;
use crate::types::GatewayError;

/// Sponsored actions the gateway knows how to prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateEscrow,
    AcceptEscrow,
    MarkPaid,
    ReleasePayment,
    Withdraw,
    PurchaseTokens,
    BridgeTransfer,
}

impl ActionType {
    pub const ALL: [ActionType; 7] = [
        Self::CreateEscrow,
        Self::AcceptEscrow,
        Self::MarkPaid,
        Self::ReleasePayment,
        Self::Withdraw,
        Self::PurchaseTokens,
        Self::BridgeTransfer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateEscrow => "create_escrow",
            Self::AcceptEscrow => "accept_escrow",
            Self::MarkPaid => "mark_paid",
            Self::ReleasePayment => "release_payment",
            Self::Withdraw => "withdraw",
            Self::PurchaseTokens => "purchase_tokens",
            Self::BridgeTransfer => "bridge_transfer",
        }
    }

    /// Kind of subject the action operates on
    pub fn subject_kind(&self) -> SubjectKind {
        match self {
            Self::CreateEscrow | Self::AcceptEscrow | Self::MarkPaid | Self::ReleasePayment => {
                SubjectKind::Trade
            }
            Self::Withdraw => SubjectKind::Withdrawal,
            Self::PurchaseTokens => SubjectKind::Purchase,
            Self::BridgeTransfer => SubjectKind::Bridge,
        }
    }

    /// Whether the action is submitted as a fee-payer envelope rather than
    /// a sponsored group
    pub fn uses_fee_payer_envelope(&self) -> bool {
        matches!(self, Self::BridgeTransfer)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| GatewayError::BadRequest(format!("unknown action {s}")))
    }
}

/// Longest subject id accepted from a client
pub const MAX_SUBJECT_ID_LEN: usize = 128;

/// Subject ids are opaque ledger identifiers: `[A-Za-z0-9_-]{1,128}`.
///
/// They end up in ledger URLs and transaction notes, so anything that could
/// be read as a path, query or separator is refused.
pub fn validate_subject_id(subject_id: &str) -> Result<(), GatewayError> {
    let well_formed = !subject_id.is_empty()
        && subject_id.len() <= MAX_SUBJECT_ID_LEN
        && subject_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if well_formed {
        Ok(())
    } else {
        Err(GatewayError::BadRequest(format!(
            "invalid subject id {subject_id:?}"
        )))
    }
}

/// `(action, subject)`: the unit of idempotency and single-flight
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionKey {
    pub action: ActionType,
    pub subject_id: String,
}

impl ActionKey {
    pub fn new(action: ActionType, subject_id: impl Into<String>) -> Self {
        Self {
            action,
            subject_id: subject_id.into(),
        }
    }

    /// Note stamped on every transaction built for this key
    pub fn note(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action, self.subject_id)
    }
}

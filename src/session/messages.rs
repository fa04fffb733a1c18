//! Session wire protocol.
//!
//! ## Protocol
//!
//! Connect: `ws://host:port/session?token=<gateway jwt>` (or send the token
//! as `Authorization: Bearer`).
//!
//! Messages (client → server):
//! - `prepare` - Build the group for an action
//! - `submit` - Hand back signed transactions
//! - `ping` - Keep-alive
//!
//! Messages (server → client):
//! - `prepare_ready` - Group (or noop) for a prepare
//! - `submit_ok` - Ledger accepted the submission
//! - `error` - Request failed; `retryable` says whether to try again
//! - `pong`
//!
//! ## Example Messages
//!
//! ```json
//! {"type": "prepare", "action": "mark_paid", "subject_id": "42"}
//!
//! {
//!   "type": "prepare_ready",
//!   "action": "mark_paid",
//!   "subject_id": "42",
//!   "pack": {
//!     "status": "group",
//!     "group_id": "9f2c...",
//!     "slots": [
//!       {"index": 0, "payload": "AAECAw==", "signed": true},
//!       {"index": 1, "payload": "AQID", "signed": false, "pending_id": "5b1e..."}
//!     ]
//!   }
//! }
//!
//! {"type": "error", "action": "mark_paid", "subject_id": "42",
//!  "request": "prepare", "message": "Ledger query failed: timeout",
//!  "retryable": true}
//! ```
//!
//! Binary fields are standard-alphabet base64.

use serde::{Deserialize, Serialize};

use crate::prepare::{
    ActionKey, ActionType, PrepareOutcome, PrepareParams, TransactionGroup, TransactionGroupSlot,
};
use crate::submit::{SignedUserTransaction, SponsorTransaction};
use crate::types::{GatewayError, Result};
use crate::wire::{address_from_hex, address_to_hex};

// ============================================================================
// Client → server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Prepare {
        action: ActionType,
        subject_id: String,
        #[serde(default)]
        params: PrepareParams,
    },
    Submit {
        action: ActionType,
        subject_id: String,
        signed_user_txns: Vec<SignedUserTransaction>,
        #[serde(default)]
        sponsor_transactions: Vec<SponsorTransaction>,
        /// Fee-payer path only
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "crate::wire::serde_base64_opt"
        )]
        user_authenticator: Option<Vec<u8>>,
    },
    Ping,
}

// ============================================================================
// Server → client
// ============================================================================

/// Slot as sent to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMessage {
    pub index: usize,
    #[serde(with = "crate::wire::serde_base64")]
    pub payload: Vec<u8>,
    pub signed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_id: Option<String>,
}

/// Result of a prepare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Pack {
    Noop,
    Group {
        /// Hex group commitment
        group_id: String,
        slots: Vec<SlotMessage>,
        /// Hex fee-payer address, fee-payer path only
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sponsor_address: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    PrepareReady {
        action: ActionType,
        subject_id: String,
        pack: Pack,
    },
    SubmitOk {
        action: ActionType,
        subject_id: String,
        txid: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<ActionType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject_id: Option<String>,
        /// Which request failed, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<RequestKind>,
        message: String,
        retryable: bool,
    },
    Pong,
}

/// Which kind of request a response answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Prepare,
    Submit,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepare => f.write_str("prepare"),
            Self::Submit => f.write_str("submit"),
        }
    }
}

impl ClientMessage {
    /// Routing key of a request; `None` for pings
    pub fn route(&self) -> Option<(ActionKey, RequestKind)> {
        match self {
            Self::Prepare {
                action, subject_id, ..
            } => Some((ActionKey::new(*action, subject_id), RequestKind::Prepare)),
            Self::Submit {
                action, subject_id, ..
            } => Some((ActionKey::new(*action, subject_id), RequestKind::Submit)),
            Self::Ping => None,
        }
    }
}

impl ServerMessage {
    /// Error frame for a failed request
    pub fn error(route: Option<(&ActionKey, RequestKind)>, err: &GatewayError) -> Self {
        Self::Error {
            action: route.map(|(k, _)| k.action),
            subject_id: route.map(|(k, _)| k.subject_id.clone()),
            request: route.map(|(_, kind)| kind),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    /// Action key this response answers, with the request kind when the
    /// frame says which one
    pub fn route(&self) -> Option<(ActionKey, Option<RequestKind>)> {
        match self {
            Self::PrepareReady {
                action, subject_id, ..
            } => Some((
                ActionKey::new(*action, subject_id),
                Some(RequestKind::Prepare),
            )),
            Self::SubmitOk {
                action, subject_id, ..
            } => Some((ActionKey::new(*action, subject_id), Some(RequestKind::Submit))),
            Self::Error {
                action: Some(action),
                subject_id: Some(subject_id),
                request,
                ..
            } => Some((ActionKey::new(*action, subject_id), *request)),
            _ => None,
        }
    }
}

impl From<PrepareOutcome> for Pack {
    fn from(outcome: PrepareOutcome) -> Self {
        match outcome {
            PrepareOutcome::Noop => Pack::Noop,
            PrepareOutcome::Group(group) => Pack::Group {
                group_id: hex::encode(group.group_id),
                slots: group
                    .slots
                    .into_iter()
                    .map(|slot| SlotMessage {
                        index: slot.index,
                        payload: slot.payload,
                        signed: slot.signed,
                        pending_id: slot.pending_id,
                    })
                    .collect(),
                sponsor_address: group.sponsor_address.as_ref().map(address_to_hex),
            },
        }
    }
}

impl TryFrom<Pack> for PrepareOutcome {
    type Error = GatewayError;

    fn try_from(pack: Pack) -> Result<Self> {
        match pack {
            Pack::Noop => Ok(PrepareOutcome::Noop),
            Pack::Group {
                group_id,
                slots,
                sponsor_address,
            } => {
                let group_id = hex::decode(&group_id)
                    .ok()
                    .and_then(|b| <[u8; 32]>::try_from(b).ok())
                    .ok_or_else(|| GatewayError::BadRequest("invalid group id".into()))?;
                let mut slots: Vec<TransactionGroupSlot> = slots
                    .into_iter()
                    .map(|slot| TransactionGroupSlot {
                        index: slot.index,
                        payload: slot.payload,
                        signed: slot.signed,
                        pending_id: slot.pending_id,
                    })
                    .collect();
                slots.sort_by_key(|s| s.index);
                if slots.iter().any(|s| !s.signed && s.pending_id.is_none()) {
                    return Err(GatewayError::BadRequest(
                        "unsigned slot without pending id".into(),
                    ));
                }
                Ok(PrepareOutcome::Group(TransactionGroup {
                    group_id,
                    slots,
                    sponsor_address: sponsor_address
                        .as_deref()
                        .map(address_from_hex)
                        .transpose()?,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prepare_request_shape() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "prepare",
            "action": "mark_paid",
            "subject_id": "42"
        }))
        .unwrap();
        assert_eq!(
            msg.route(),
            Some((ActionKey::new(ActionType::MarkPaid, "42"), RequestKind::Prepare))
        );
    }

    #[test]
    fn test_submit_request_decodes_base64() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "submit",
            "action": "mark_paid",
            "subject_id": "42",
            "signed_user_txns": [{"index": 1, "pending_id": "p", "blob": "AQID"}],
            "sponsor_transactions": [{"index": 0, "blob": "BAU="}]
        }))
        .unwrap();
        let ClientMessage::Submit {
            signed_user_txns,
            sponsor_transactions,
            user_authenticator,
            ..
        } = msg
        else {
            panic!("expected submit");
        };
        assert_eq!(signed_user_txns[0].blob, vec![1, 2, 3]);
        assert_eq!(sponsor_transactions[0].blob, vec![4, 5]);
        assert!(user_authenticator.is_none());
    }

    #[test]
    fn test_noop_pack_shape() {
        let msg = ServerMessage::PrepareReady {
            action: ActionType::MarkPaid,
            subject_id: "42".into(),
            pack: Pack::from(PrepareOutcome::Noop),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "prepare_ready",
                "action": "mark_paid",
                "subject_id": "42",
                "pack": {"status": "noop"}
            })
        );
    }

    #[test]
    fn test_group_pack_converts_back() {
        let group = TransactionGroup {
            group_id: [7u8; 32],
            slots: vec![
                TransactionGroupSlot {
                    index: 0,
                    payload: vec![1, 2],
                    signed: true,
                    pending_id: None,
                },
                TransactionGroupSlot {
                    index: 1,
                    payload: vec![3],
                    signed: false,
                    pending_id: Some("abc".into()),
                },
            ],
            sponsor_address: Some([2u8; 32]),
        };
        let pack = Pack::from(PrepareOutcome::Group(group.clone()));
        let json = serde_json::to_value(&pack).unwrap();
        assert_eq!(json["slots"][1]["payload"], "Aw==");
        assert!(json["slots"][0].get("pending_id").is_none());

        let back = PrepareOutcome::try_from(pack).unwrap();
        assert_eq!(back, PrepareOutcome::Group(group));
    }

    #[test]
    fn test_error_frame_carries_retryability() {
        let key = ActionKey::new(ActionType::Withdraw, "w-1");
        let msg = ServerMessage::error(
            Some((&key, RequestKind::Prepare)),
            &GatewayError::LedgerQuery("timeout".into()),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["request"], "prepare");
        assert_eq!(json["retryable"], true);
        assert_eq!(msg.route(), Some((key, Some(RequestKind::Prepare))));

        let anonymous = ServerMessage::error(None, &GatewayError::BadRequest("bad json".into()));
        assert_eq!(anonymous.route(), None);
        assert!(serde_json::to_value(&anonymous).unwrap().get("request").is_none());
    }
}

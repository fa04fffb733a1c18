//! On-chain / off-chain state of the subjects actions operate on.

use serde::{Deserialize, Serialize};

use crate::wire::Address;

/// What kind of record a subject id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Trade,
    Withdrawal,
    Purchase,
    Bridge,
}

/// Lifecycle position of a subject.
///
/// Trades move `Draft → Open → Accepted → Paid → Released` and may end in
/// `Cancelled` or `Disputed`. Withdrawals and bridge transfers move
/// `Requested → Completed` or end `Rejected`. Purchases move
/// `Quoted → Settled` or end `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStatus {
    Draft,
    Open,
    Accepted,
    Paid,
    Released,
    Cancelled,
    Disputed,
    Requested,
    Completed,
    Rejected,
    Quoted,
    Settled,
    Expired,
}

/// Snapshot of a subject as reported by the ledger query endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectState {
    pub subject_id: String,
    pub kind: SubjectKind,
    pub status: SubjectStatus,
    /// Seller for trades, owner for withdrawals, purchases and bridge transfers
    #[serde(with = "hex_address")]
    pub initiator: Address,
    /// Buyer for trades, destination for withdrawals
    #[serde(default, with = "hex_address_opt")]
    pub counterparty: Option<Address>,
    /// Escrow application account for trades, treasury otherwise
    #[serde(with = "hex_address")]
    pub escrow: Address,
    /// Asset amount moved by the action
    pub amount: u64,
    /// Token amount delivered by a purchase
    #[serde(default)]
    pub token_amount: u64,
}

/// Chain-wide parameters needed to build transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerParams {
    /// Current round / block height
    pub round: u64,
    /// Minimum fee per transaction
    pub min_fee: u64,
    /// Minimum balance an escrow box must be funded with
    pub box_funding: u64,
    pub chain_id: u8,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self {
            round: 1,
            min_fee: 1_000,
            box_funding: 100_000,
            chain_id: 4,
        }
    }
}

mod hex_address {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::wire::{address_from_hex, address_to_hex, Address};

    pub(super) fn serialize<S: Serializer>(address: &Address, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&address_to_hex(address))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Address, D::Error> {
        let s = String::deserialize(d)?;
        address_from_hex(&s).map_err(serde::de::Error::custom)
    }
}

mod hex_address_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::wire::{address_from_hex, address_to_hex, Address};

    pub(super) fn serialize<S: Serializer>(
        address: &Option<Address>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match address {
            Some(a) => s.serialize_some(&address_to_hex(a)),
            None => s.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Address>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| address_from_hex(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_state_json_uses_hex_addresses() {
        let state = SubjectState {
            subject_id: "42".into(),
            kind: SubjectKind::Trade,
            status: SubjectStatus::Accepted,
            initiator: [1u8; 32],
            counterparty: Some([2u8; 32]),
            escrow: [3u8; 32],
            amount: 500,
            token_amount: 0,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "accepted");
        assert!(json["initiator"].as_str().unwrap().starts_with("0x0101"));

        let back: SubjectState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_counterparty_may_be_absent() {
        let json = serde_json::json!({
            "subject_id": "p-1",
            "kind": "purchase",
            "status": "quoted",
            "initiator": format!("0x{}", "11".repeat(32)),
            "escrow": format!("0x{}", "22".repeat(32)),
            "amount": 10,
        });
        let state: SubjectState = serde_json::from_value(json).unwrap();
        assert_eq!(state.counterparty, None);
        assert_eq!(state.token_amount, 0);
    }
}

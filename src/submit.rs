//! Submission of client-signed transactions.
//!
//! Every user slot must redeem the pending entry it was prepared under, come
//! back at the same index for the same action, and carry exactly the bytes
//! that were handed out. The ordered group is then forwarded to the ledger
//! as received; the ledger re-verifies the group commitment and signatures.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{PendingTransactionCache, PendingTransactionEntry};
use crate::envelope::FeePayerEnvelopeAssembler;
use crate::ledger::{LedgerClient, SignedSlot};
use crate::prepare::ActionKey;
use crate::types::{GatewayError, Result};
use crate::wire::{address_to_hex, Address};

/// A user slot returned signed by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUserTransaction {
    pub index: usize,
    pub pending_id: String,
    /// Signed slot bytes, or the raw transaction for the fee-payer path
    #[serde(with = "crate::wire::serde_base64")]
    pub blob: Vec<u8>,
}

/// A sponsor slot echoed back by the client exactly as prepared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorTransaction {
    pub index: usize,
    #[serde(with = "crate::wire::serde_base64")]
    pub blob: Vec<u8>,
}

pub struct TransactionSubmitter {
    ledger: Arc<dyn LedgerClient>,
    pending: Arc<PendingTransactionCache>,
    assembler: FeePayerEnvelopeAssembler,
}

impl TransactionSubmitter {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        pending: Arc<PendingTransactionCache>,
        assembler: FeePayerEnvelopeAssembler,
    ) -> Self {
        Self {
            ledger,
            pending,
            assembler,
        }
    }

    /// Redeem a pending entry and check it belongs to this request
    fn redeem(
        &self,
        caller: &Address,
        key: &ActionKey,
        txn: &SignedUserTransaction,
    ) -> Result<PendingTransactionEntry> {
        let entry = self.pending.take(&txn.pending_id)?;
        if entry.action_key != *key {
            return Err(GatewayError::BadRequest(format!(
                "pending transaction {} was prepared for {}",
                txn.pending_id, entry.action_key
            )));
        }
        if entry.slot_index != txn.index {
            return Err(GatewayError::BadRequest(format!(
                "pending transaction {} belongs at index {}, not {}",
                txn.pending_id, entry.slot_index, txn.index
            )));
        }
        if entry.sender != *caller {
            return Err(GatewayError::NotAuthorized(format!(
                "{} did not prepare {}",
                address_to_hex(caller),
                txn.pending_id
            )));
        }
        Ok(entry)
    }

    /// Submit a sponsored group; returns the ledger transaction id
    pub async fn submit_group(
        &self,
        caller: &Address,
        key: &ActionKey,
        user_txns: &[SignedUserTransaction],
        sponsor_txns: &[SponsorTransaction],
    ) -> Result<String> {
        if key.action.uses_fee_payer_envelope() {
            return Err(GatewayError::BadRequest(format!(
                "{key} is submitted with a user authenticator"
            )));
        }
        if user_txns.is_empty() {
            return Err(GatewayError::BadRequest("no signed user transactions".into()));
        }

        for txn in user_txns {
            let entry = self.redeem(caller, key, txn)?;
            let slot = SignedSlot::decode(&txn.blob)?;
            if slot.body != entry.raw_transaction {
                warn!(action = %key, index = txn.index, "Signed slot differs from prepared bytes");
                return Err(GatewayError::BadRequest(format!(
                    "signed slot {} differs from the prepared transaction",
                    txn.index
                )));
            }
        }

        let total = user_txns.len() + sponsor_txns.len();
        let mut ordered: Vec<Option<&[u8]>> = vec![None; total];
        let positions = user_txns
            .iter()
            .map(|t| (t.index, t.blob.as_slice()))
            .chain(sponsor_txns.iter().map(|t| (t.index, t.blob.as_slice())));
        for (index, blob) in positions {
            match ordered.get_mut(index) {
                Some(slot @ None) => *slot = Some(blob),
                Some(Some(_)) => {
                    return Err(GatewayError::BadRequest(format!("duplicate slot index {index}")))
                }
                None => {
                    return Err(GatewayError::BadRequest(format!(
                        "slot index {index} outside group of {total}"
                    )))
                }
            }
        }
        let signed: Vec<Vec<u8>> = ordered
            .into_iter()
            .map(|b| b.map(<[u8]>::to_vec))
            .collect::<Option<_>>()
            .ok_or_else(|| GatewayError::BadRequest("group has a missing slot".into()))?;

        let txid = self
            .ledger
            .submit_group(signed)
            .await
            .map_err(|e| e.into_submit_error())?;
        info!(action = %key, txid = %txid, slots = total, "Sponsored group submitted");
        Ok(txid)
    }

    /// Wrap a user-signed raw transaction in a fee-payer envelope and submit it
    pub async fn submit_fee_payer(
        &self,
        caller: &Address,
        key: &ActionKey,
        txn: &SignedUserTransaction,
        user_authenticator: &[u8],
    ) -> Result<String> {
        if !key.action.uses_fee_payer_envelope() {
            return Err(GatewayError::BadRequest(format!(
                "{key} is submitted as a sponsored group"
            )));
        }
        let entry = self.redeem(caller, key, txn)?;
        if txn.blob != entry.raw_transaction {
            return Err(GatewayError::BadRequest(
                "raw transaction differs from the prepared transaction".into(),
            ));
        }

        let sponsor = self.assembler.sponsor_address();
        let envelope = self
            .assembler
            .assemble(&txn.blob, user_authenticator, &sponsor)?;

        let txid = self
            .ledger
            .submit_envelope(envelope)
            .await
            .map_err(|e| e.into_submit_error())?;
        info!(action = %key, txid = %txid, "Fee-payer envelope submitted");
        Ok(txid)
    }
}

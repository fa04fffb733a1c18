//! Client signing flow: prepare, sign exactly what came back, submit.
//!
//! The wallet never builds or edits a transaction. It signs each unsigned
//! slot's bytes as received, echoes the sponsor's slots untouched and sends
//! the whole group back in the same order.

use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use tracing::{debug, info};

use crate::envelope::{fee_payer_signing_message, to_fee_payer_form};
use crate::keyless::KeylessAccount;
use crate::ledger::SignedSlot;
use crate::prepare::{ActionType, PrepareOutcome, PrepareParams, TransactionGroup};
use crate::submit::{SignedUserTransaction, SponsorTransaction};
use crate::types::{GatewayError, Outcome, Result};

use super::transport::SessionTransport;

/// Wallet key that signs user slots
pub trait TransactionSigner: Send + Sync {
    fn public_key(&self) -> [u8; 32];

    fn sign(&self, message: &[u8]) -> [u8; 64];
}

impl TransactionSigner for SigningKey {
    fn public_key(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        Signer::sign(self, message).to_bytes()
    }
}

pub struct ClientSigningFlow {
    transport: Arc<SessionTransport>,
    signer: Arc<dyn TransactionSigner>,
}

impl ClientSigningFlow {
    pub fn new(transport: Arc<SessionTransport>, signer: Arc<dyn TransactionSigner>) -> Self {
        Self { transport, signer }
    }

    /// Perform a sponsored-group action end to end
    pub async fn run(&self, action: ActionType, subject_id: &str, params: PrepareParams) -> Outcome {
        Outcome::from_result(self.execute(action, subject_id, params).await)
    }

    /// Perform a fee-payer action with a proved keyless account
    pub async fn run_fee_payer(
        &self,
        action: ActionType,
        subject_id: &str,
        account: &KeylessAccount,
    ) -> Outcome {
        Outcome::from_result(self.execute_fee_payer(action, subject_id, account).await)
    }

    async fn execute(
        &self,
        action: ActionType,
        subject_id: &str,
        params: PrepareParams,
    ) -> Result<Option<String>> {
        if action.uses_fee_payer_envelope() {
            return Err(GatewayError::BadRequest(format!(
                "{action} must be signed with a keyless account"
            )));
        }

        let group = match self.transport.prepare(action, subject_id, params).await? {
            PrepareOutcome::Noop => {
                info!(%action, subject_id, "Nothing to do");
                return Ok(None);
            }
            PrepareOutcome::Group(group) => group,
        };

        let (user, sponsor) = sign_group(&group, self.signer.as_ref())?;
        debug!(%action, subject_id, user_slots = user.len(), "Group signed");

        let txid = self
            .transport
            .submit(action, subject_id, user, sponsor, None)
            .await?;
        Ok(Some(txid))
    }

    async fn execute_fee_payer(
        &self,
        action: ActionType,
        subject_id: &str,
        account: &KeylessAccount,
    ) -> Result<Option<String>> {
        let group = match self
            .transport
            .prepare(action, subject_id, PrepareParams::default())
            .await?
        {
            PrepareOutcome::Noop => return Ok(None),
            PrepareOutcome::Group(group) => group,
        };

        let sponsor = group
            .sponsor_address
            .ok_or_else(|| GatewayError::BadRequest("prepared pack names no fee payer".into()))?;
        let [slot] = group.slots.as_slice() else {
            return Err(GatewayError::BadRequest(format!(
                "fee-payer pack has {} slots, expected 1",
                group.slots.len()
            )));
        };
        let pending_id = slot
            .pending_id
            .clone()
            .ok_or_else(|| GatewayError::BadRequest("raw transaction has no pending id".into()))?;

        let message = fee_payer_signing_message(&to_fee_payer_form(&slot.payload, &sponsor)?);
        let authenticator = account.sign(&message);

        let txn = SignedUserTransaction {
            index: slot.index,
            pending_id,
            blob: slot.payload.clone(),
        };
        let txid = self
            .transport
            .submit(action, subject_id, vec![txn], Vec::new(), Some(authenticator))
            .await?;
        Ok(Some(txid))
    }
}

/// Sign every unsigned slot in place order and echo the sponsor's slots
pub fn sign_group(
    group: &TransactionGroup,
    signer: &dyn TransactionSigner,
) -> Result<(Vec<SignedUserTransaction>, Vec<SponsorTransaction>)> {
    let mut user = Vec::new();
    let mut sponsor = Vec::new();
    let public_key = signer.public_key();

    for slot in &group.slots {
        if slot.signed {
            sponsor.push(SponsorTransaction {
                index: slot.index,
                blob: slot.payload.clone(),
            });
            continue;
        }
        let pending_id = slot.pending_id.clone().ok_or_else(|| {
            GatewayError::BadRequest(format!("slot {} has no pending id", slot.index))
        })?;
        let signed = SignedSlot::sign_with(slot.payload.clone(), public_key, |m| signer.sign(m));
        user.push(SignedUserTransaction {
            index: slot.index,
            pending_id,
            blob: signed.encode(),
        });
    }

    Ok((user, sponsor))
}

//! In-process ledger.
//!
//! Validates what it is given the way a node would (slot signatures, group
//! commitment, pooled fees, validity window, envelope signatures, sequence
//! numbers) and applies the action named in the first slot's note to the
//! subject it names. Used by dev mode and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::state::{LedgerParams, SubjectState, SubjectStatus};
use super::transaction::{verify_group, RawTransaction};
use super::{LedgerClient, LedgerError};
use crate::clock::SharedClock;
use crate::crypto::{account_address, sha3_256, verify_signature, SCHEME_ED25519};
use crate::envelope;
use crate::wire::Address;

/// Status an action requires and the status it leaves behind
fn transition(action: &str) -> Option<(SubjectStatus, SubjectStatus)> {
    use SubjectStatus::*;
    match action {
        "create_escrow" => Some((Draft, Open)),
        "accept_escrow" => Some((Open, Accepted)),
        "mark_paid" => Some((Accepted, Paid)),
        "release_payment" => Some((Paid, Released)),
        "withdraw" => Some((Requested, Completed)),
        "purchase_tokens" => Some((Quoted, Settled)),
        "bridge_transfer" => Some((Requested, Completed)),
        _ => None,
    }
}

/// `"<action>:<subject_id>"`
fn parse_action_note(note: &[u8]) -> Option<(&str, &str)> {
    std::str::from_utf8(note).ok()?.split_once(':')
}

/// Ledger kept entirely in memory
pub struct InMemoryLedger {
    subjects: DashMap<String, SubjectState>,
    sequences: DashMap<Address, u64>,
    applied: DashMap<String, ()>,
    params: LedgerParams,
    round: AtomicU64,
    submissions: AtomicUsize,
    offline: AtomicBool,
    clock: SharedClock,
}

impl InMemoryLedger {
    pub fn new(params: LedgerParams, clock: SharedClock) -> Self {
        Self {
            subjects: DashMap::new(),
            sequences: DashMap::new(),
            applied: DashMap::new(),
            round: AtomicU64::new(params.round),
            params,
            submissions: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            clock,
        }
    }

    pub fn insert_subject(&self, state: SubjectState) {
        self.subjects.insert(state.subject_id.clone(), state);
    }

    pub fn subject(&self, subject_id: &str) -> Option<SubjectState> {
        self.subjects.get(subject_id).map(|s| s.clone())
    }

    /// Number of accepted broadcasts
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Simulate losing connectivity: every call fails with a network error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn advance_round(&self, by: u64) {
        self.round.fetch_add(by, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), LedgerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::Network("connection refused".into()));
        }
        Ok(())
    }

    /// Apply `action` to `subject_id`, checking the state it requires
    fn apply(&self, action: &str, subject_id: &str) -> Result<(), LedgerError> {
        let (ready, next) = transition(action)
            .ok_or_else(|| LedgerError::Rejected(format!("unknown action {action}")))?;
        let mut subject = self
            .subjects
            .get_mut(subject_id)
            .ok_or_else(|| LedgerError::Rejected(format!("unknown subject {subject_id}")))?;
        if subject.status != ready {
            return Err(LedgerError::Rejected(format!(
                "subject {subject_id} is {:?}, {action} requires {:?}",
                subject.status, ready
            )));
        }
        subject.status = next;
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn get_state(&self, subject_id: &str) -> Result<Option<SubjectState>, LedgerError> {
        self.ensure_online()?;
        Ok(self.subject(subject_id))
    }

    async fn params(&self) -> Result<LedgerParams, LedgerError> {
        self.ensure_online()?;
        Ok(LedgerParams {
            round: self.round.load(Ordering::SeqCst),
            ..self.params
        })
    }

    async fn sequence_number(&self, address: &Address) -> Result<u64, LedgerError> {
        self.ensure_online()?;
        Ok(self.sequences.get(address).map(|s| *s).unwrap_or(0))
    }

    async fn submit_group(&self, signed: Vec<Vec<u8>>) -> Result<String, LedgerError> {
        self.ensure_online()?;
        let (txns, group) = verify_group(&signed).map_err(|e| {
            warn!(error = %e, "Group rejected");
            LedgerError::Rejected(e)
        })?;

        let txid = hex::encode(group);
        if self.applied.contains_key(&txid) {
            return Err(LedgerError::Rejected(format!("transaction {txid} already in ledger")));
        }

        let round = self.round.load(Ordering::SeqCst);
        if txns
            .iter()
            .any(|t| round < t.first_valid || round > t.last_valid)
        {
            return Err(LedgerError::Rejected(format!("round {round} outside validity window")));
        }

        let pooled: u64 = txns.iter().map(|t| t.fee).sum();
        let required = self.params.min_fee * txns.len() as u64;
        if pooled < required {
            return Err(LedgerError::Rejected(format!(
                "pooled fee {pooled} below required {required}"
            )));
        }

        let (action, subject_id) = parse_action_note(&txns[0].note)
            .ok_or_else(|| LedgerError::Rejected("group carries no action note".into()))?;
        self.apply(action, subject_id)?;

        self.applied.insert(txid.clone(), ());
        self.submissions.fetch_add(1, Ordering::SeqCst);
        info!(txid = %txid, action, subject_id, slots = txns.len(), "Group committed");
        Ok(txid)
    }

    async fn submit_envelope(&self, envelope_bytes: Vec<u8>) -> Result<String, LedgerError> {
        self.ensure_online()?;
        let parsed =
            envelope::parse(&envelope_bytes).map_err(|e| LedgerError::Rejected(e.to_string()))?;
        let message = parsed.signing_message();

        let sponsor = &parsed.sponsor_authenticator;
        if parsed.fee_payer_address != parsed.sponsor_address
            || account_address(&sponsor.public_key, SCHEME_ED25519) != parsed.sponsor_address
        {
            return Err(LedgerError::Rejected("fee payer authenticator mismatch".into()));
        }
        if !verify_signature(&sponsor.public_key, &message, &sponsor.signature) {
            return Err(LedgerError::Rejected("invalid fee payer signature".into()));
        }

        let user = &parsed.user_authenticator;
        let raw: &RawTransaction = &parsed.raw_transaction;
        if user.public_key.address() != raw.sender {
            return Err(LedgerError::Rejected("sender authenticator mismatch".into()));
        }
        if user.signature.proof.is_empty() {
            return Err(LedgerError::Rejected("keyless signature has no proof".into()));
        }
        let now = self.clock.now_secs();
        if user.signature.expiry_secs <= now {
            return Err(LedgerError::Rejected("ephemeral key expired".into()));
        }
        if !verify_signature(
            &user.signature.ephemeral_public_key,
            &message,
            &user.signature.ephemeral_signature,
        ) {
            return Err(LedgerError::Rejected("invalid sender signature".into()));
        }
        if raw.expiration_secs <= now {
            return Err(LedgerError::Rejected("transaction expired".into()));
        }
        if raw.chain_id != self.params.chain_id {
            return Err(LedgerError::Rejected(format!("wrong chain id {}", raw.chain_id)));
        }

        let mut sequence = self.sequences.entry(raw.sender).or_insert(0);
        if raw.sequence_number != *sequence {
            return Err(LedgerError::Rejected(format!(
                "sequence number {} != expected {}",
                raw.sequence_number, *sequence
            )));
        }

        let (action, subject_id) = parse_action_note(&raw.payload)
            .ok_or_else(|| LedgerError::Rejected("payload carries no action".into()))?;
        self.apply(action, subject_id)?;
        *sequence += 1;
        drop(sequence);

        let hash = hex::encode(sha3_256(&[&envelope_bytes]));
        self.submissions.fetch_add(1, Ordering::SeqCst);
        debug!(hash = %hash, action, subject_id, "Envelope committed");
        Ok(hash)
    }
}

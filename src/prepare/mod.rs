//! Transaction group preparation.
//!
//! Given an action on a subject, decide from ledger state whether anything
//! needs to happen, and if so build the ordered group: sponsor slots signed
//! here, user slots handed out unsigned and remembered in the pending cache.

pub mod action;
pub mod rules;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{PendingTransactionCache, PendingTransactionEntry};
use crate::clock::SharedClock;
use crate::crypto::{sha3_256, SponsorSigner};
use crate::ledger::transaction::assign_group;
use crate::ledger::{
    LedgerClient, LedgerParams, LedgerTransaction, RawTransaction, SignedSlot, SubjectState,
};
use crate::types::{GatewayError, Result};
use crate::wire::{address_to_hex, Address};

pub use action::{validate_subject_id, ActionKey, ActionType, MAX_SUBJECT_ID_LEN};
use rules::{rule, Readiness};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone)]
pub struct PreparerConfig {
    /// Length of the validity window, in rounds
    pub validity_rounds: u64,
    /// Gas limit for bridge transactions
    pub bridge_max_gas: u64,
    pub bridge_gas_unit_price: u64,
    /// How long a prepared bridge transaction stays valid
    pub bridge_expiration: Duration,
}

impl Default for PreparerConfig {
    fn default() -> Self {
        Self {
            validity_rounds: 1000,
            bridge_max_gas: 200_000,
            bridge_gas_unit_price: 100,
            bridge_expiration: Duration::from_secs(600),
        }
    }
}

/// Client-supplied options for a prepare request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareParams {
    /// Shorter validity window than the default; capped at the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_rounds: Option<u64>,
}

/// One position in a prepared group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionGroupSlot {
    pub index: usize,
    /// Signed slot bytes when `signed`, otherwise the body to sign
    pub payload: Vec<u8>,
    pub signed: bool,
    /// Present on every unsigned slot
    pub pending_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionGroup {
    pub group_id: [u8; 32],
    pub slots: Vec<TransactionGroupSlot>,
    /// Fee payer to name when the group is a single fee-payer transaction
    pub sponsor_address: Option<Address>,
}

impl TransactionGroup {
    pub fn unsigned_slots(&self) -> impl Iterator<Item = &TransactionGroupSlot> {
        self.slots.iter().filter(|s| !s.signed)
    }
}

/// Result of a successful prepare
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The action's effect is already on the ledger
    Noop,
    Group(TransactionGroup),
}

// =============================================================================
// Preparer
// =============================================================================

pub struct TransactionGroupPreparer {
    ledger: Arc<dyn LedgerClient>,
    pending: Arc<PendingTransactionCache>,
    sponsor: Arc<SponsorSigner>,
    clock: SharedClock,
    config: PreparerConfig,
}

/// Slot under construction: the transaction and whether the sponsor signs it
struct Draft {
    txn: LedgerTransaction,
    sponsor: bool,
}

impl TransactionGroupPreparer {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        pending: Arc<PendingTransactionCache>,
        sponsor: Arc<SponsorSigner>,
        clock: SharedClock,
        config: PreparerConfig,
    ) -> Self {
        Self {
            ledger,
            pending,
            sponsor,
            clock,
            config,
        }
    }

    pub fn sponsor_address(&self) -> Address {
        self.sponsor.address()
    }

    /// Decide what `caller` must sign to perform `action` on `subject_id`
    pub async fn prepare(
        &self,
        caller: &Address,
        action: ActionType,
        subject_id: &str,
        params: &PrepareParams,
    ) -> Result<PrepareOutcome> {
        validate_subject_id(subject_id)?;
        let key = ActionKey::new(action, subject_id);

        let state = self
            .ledger
            .get_state(subject_id)
            .await
            .map_err(|e| e.into_query_error())?
            .ok_or_else(|| GatewayError::SubjectNotFound(subject_id.to_string()))?;

        if state.kind != action.subject_kind() {
            return Err(GatewayError::BadRequest(format!(
                "{action} does not apply to a {:?} subject",
                state.kind
            )));
        }

        let action_rule = rule(action);
        let signer = action_rule
            .signer(&state)
            .ok_or_else(|| GatewayError::InvalidState(format!("{key}: no counterparty yet")))?;
        if signer != *caller {
            return Err(GatewayError::NotAuthorized(format!(
                "{} may not perform {key}",
                address_to_hex(caller)
            )));
        }

        match action_rule.readiness(state.status) {
            Readiness::Ready => {}
            Readiness::AlreadyApplied => {
                info!(action = %key, status = ?state.status, "Action already applied");
                return Ok(PrepareOutcome::Noop);
            }
            Readiness::Finalized(status) => {
                return Err(GatewayError::ActionFinalized(format!("{key} is {status:?}")));
            }
            Readiness::NotYet(status) => {
                return Err(GatewayError::InvalidState(format!(
                    "{key} is {status:?}, needs {:?}",
                    action_rule.ready
                )));
            }
        }

        let params_now = self.ledger.params().await.map_err(|e| e.into_query_error())?;

        let group = if action.uses_fee_payer_envelope() {
            self.prepare_fee_payer(&key, &state, &params_now).await?
        } else {
            self.prepare_group(&key, &state, &params_now, params)?
        };

        info!(
            action = %key,
            slots = group.slots.len(),
            user_slots = group.unsigned_slots().count(),
            "Group prepared"
        );
        Ok(PrepareOutcome::Group(group))
    }

    /// Ordered drafts for a sponsored group
    fn drafts(
        &self,
        key: &ActionKey,
        state: &SubjectState,
        box_funding: u64,
    ) -> Result<Vec<Draft>> {
        let sponsor = self.sponsor.address();
        let user = rule(key.action)
            .signer(state)
            .ok_or_else(|| GatewayError::InvalidState(format!("{key}: no signer")))?;
        let escrow = state.escrow;

        let fee_slot = |txn| Draft { txn, sponsor: true };
        let user_slot = |txn| Draft {
            txn,
            sponsor: false,
        };

        let drafts = match key.action {
            ActionType::CreateEscrow => vec![
                fee_slot(LedgerTransaction::payment(sponsor, escrow, box_funding)),
                user_slot(LedgerTransaction::asset_transfer(user, escrow, state.amount)),
                user_slot(LedgerTransaction::app_call(user, escrow, "create")),
            ],
            ActionType::AcceptEscrow => vec![
                fee_slot(LedgerTransaction::payment(sponsor, sponsor, 0)),
                user_slot(LedgerTransaction::app_call(user, escrow, "accept")),
            ],
            ActionType::MarkPaid => vec![
                fee_slot(LedgerTransaction::payment(sponsor, sponsor, 0)),
                user_slot(LedgerTransaction::app_call(user, escrow, "mark_paid")),
            ],
            ActionType::ReleasePayment => vec![
                fee_slot(LedgerTransaction::payment(sponsor, sponsor, 0)),
                user_slot(LedgerTransaction::app_call(user, escrow, "release")),
            ],
            ActionType::Withdraw => {
                let destination = state.counterparty.ok_or_else(|| {
                    GatewayError::InvalidState(format!("{key}: withdrawal has no destination"))
                })?;
                vec![
                    fee_slot(LedgerTransaction::payment(sponsor, sponsor, 0)),
                    user_slot(LedgerTransaction::asset_transfer(
                        user,
                        destination,
                        state.amount,
                    )),
                ]
            }
            ActionType::PurchaseTokens => vec![
                user_slot(LedgerTransaction::payment(user, sponsor, state.amount)),
                fee_slot(LedgerTransaction::asset_transfer(
                    sponsor,
                    user,
                    state.token_amount,
                )),
            ],
            ActionType::BridgeTransfer => {
                return Err(GatewayError::Internal(
                    "bridge transfers are not sponsored groups".into(),
                ))
            }
        };
        Ok(drafts)
    }

    fn prepare_group(
        &self,
        key: &ActionKey,
        state: &SubjectState,
        ledger_params: &LedgerParams,
        params: &PrepareParams,
    ) -> Result<TransactionGroup> {
        let mut drafts = self.drafts(key, state, ledger_params.box_funding)?;

        let rounds = params
            .validity_rounds
            .map(|r| r.clamp(1, self.config.validity_rounds))
            .unwrap_or(self.config.validity_rounds);
        let first_valid = ledger_params.round;
        let last_valid = first_valid.checked_add(rounds).ok_or_else(|| {
            GatewayError::LedgerQuery(format!("round {first_valid} leaves no validity window"))
        })?;
        let pooled_fee = ledger_params
            .min_fee
            .checked_mul(drafts.len() as u64)
            .ok_or_else(|| GatewayError::LedgerQuery("pooled fee overflows".into()))?;
        let note = key.note().into_bytes();

        // The sponsor's first slot pays for the whole group
        let mut fee_paid = false;
        for draft in drafts.iter_mut() {
            draft.txn.fee = if draft.sponsor && !fee_paid {
                fee_paid = true;
                pooled_fee
            } else {
                0
            };
            draft.txn.first_valid = first_valid;
            draft.txn.last_valid = last_valid;
            draft.txn.note = note.clone();
        }

        let mut txns: Vec<LedgerTransaction> = drafts.iter().map(|d| d.txn.clone()).collect();
        let group_id = assign_group(&mut txns);

        let public_key = self.sponsor.public_key();
        let created_at = self.pending.now();
        let mut slots = Vec::with_capacity(txns.len());
        for (index, (draft, txn)) in drafts.iter().zip(txns).enumerate() {
            let body = txn.encode();
            if draft.sponsor {
                let signed = SignedSlot::sign_with(body, public_key, |m| self.sponsor.sign(m));
                debug!(action = %key, index, "Sponsor slot signed");
                slots.push(TransactionGroupSlot {
                    index,
                    payload: signed.encode(),
                    signed: true,
                    pending_id: None,
                });
            } else {
                let pending_id = Uuid::new_v4().to_string();
                self.pending.put(PendingTransactionEntry {
                    id: pending_id.clone(),
                    raw_transaction: body.clone(),
                    sender: txn.sender,
                    recipient: txn.receiver,
                    action_key: key.clone(),
                    slot_index: index,
                    created_at,
                });
                slots.push(TransactionGroupSlot {
                    index,
                    payload: body,
                    signed: false,
                    pending_id: Some(pending_id),
                });
            }
        }

        Ok(TransactionGroup {
            group_id,
            slots,
            sponsor_address: None,
        })
    }

    /// Single user-signed raw transaction for the fee-payer envelope path
    async fn prepare_fee_payer(
        &self,
        key: &ActionKey,
        state: &SubjectState,
        ledger_params: &LedgerParams,
    ) -> Result<TransactionGroup> {
        let sender = state.initiator;
        let sequence_number = self
            .ledger
            .sequence_number(&sender)
            .await
            .map_err(|e| e.into_query_error())?;

        let expiration_secs = self
            .clock
            .now_secs()
            .checked_add(self.config.bridge_expiration.as_secs())
            .ok_or_else(|| GatewayError::LedgerQuery("bridge expiration overflows".into()))?;

        let raw = RawTransaction {
            sender,
            sequence_number,
            payload: key.note().into_bytes(),
            max_gas_amount: self.config.bridge_max_gas,
            gas_unit_price: self.config.bridge_gas_unit_price,
            expiration_secs,
            chain_id: ledger_params.chain_id,
        };
        let bytes = raw.to_multi_agent_bytes();

        let pending_id = Uuid::new_v4().to_string();
        self.pending.put(PendingTransactionEntry {
            id: pending_id.clone(),
            raw_transaction: bytes.clone(),
            sender,
            recipient: state.escrow,
            action_key: key.clone(),
            slot_index: 0,
            created_at: self.pending.now(),
        });

        Ok(TransactionGroup {
            group_id: sha3_256(&[&bytes]),
            slots: vec![TransactionGroupSlot {
                index: 0,
                payload: bytes,
                signed: false,
                pending_id: Some(pending_id),
            }],
            sponsor_address: Some(self.sponsor.address()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PendingCacheConfig;
    use crate::clock::ManualClock;
    use crate::crypto::{ed25519_address, generate_keypair};
    use crate::ledger::transaction::compute_group_id;
    use crate::ledger::{InMemoryLedger, SubjectKind, SubjectStatus};

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        pending: Arc<PendingTransactionCache>,
        preparer: TransactionGroupPreparer,
        seller: Address,
        buyer: Address,
    }

    fn fixture() -> Fixture {
        let clock: SharedClock = Arc::new(ManualClock::new(1_700_000_000_000));
        let ledger = Arc::new(InMemoryLedger::new(LedgerParams::default(), clock.clone()));
        let pending = Arc::new(PendingTransactionCache::new(
            PendingCacheConfig::default(),
            clock.clone(),
        ));
        let preparer = TransactionGroupPreparer::new(
            ledger.clone(),
            pending.clone(),
            Arc::new(SponsorSigner::generate()),
            clock,
            PreparerConfig::default(),
        );
        let seller = ed25519_address(&generate_keypair().1);
        let buyer = ed25519_address(&generate_keypair().1);
        Fixture {
            ledger,
            pending,
            preparer,
            seller,
            buyer,
        }
    }

    fn trade(f: &Fixture, status: SubjectStatus) -> SubjectState {
        SubjectState {
            subject_id: "42".into(),
            kind: SubjectKind::Trade,
            status,
            initiator: f.seller,
            counterparty: Some(f.buyer),
            escrow: [9u8; 32],
            amount: 5_000,
            token_amount: 0,
        }
    }

    async fn prepare(f: &Fixture, caller: Address, action: ActionType) -> Result<PrepareOutcome> {
        f.preparer
            .prepare(&caller, action, "42", &PrepareParams::default())
            .await
    }

    #[tokio::test]
    async fn test_mark_paid_group_layout() {
        let f = fixture();
        f.ledger.insert_subject(trade(&f, SubjectStatus::Accepted));

        let PrepareOutcome::Group(group) = prepare(&f, f.buyer, ActionType::MarkPaid).await.unwrap()
        else {
            panic!("expected a group");
        };

        assert_eq!(group.slots.len(), 2);
        assert!(group.slots[0].signed);
        assert!(group.slots[0].pending_id.is_none());
        assert!(!group.slots[1].signed);
        let pending_id = group.slots[1].pending_id.clone().unwrap();

        let sponsor_slot = SignedSlot::decode(&group.slots[0].payload).unwrap();
        let sponsor_txn = sponsor_slot.verify().unwrap();
        assert_eq!(sponsor_txn.fee, LedgerParams::default().min_fee * 2);
        assert_eq!(sponsor_txn.sender, f.preparer.sponsor_address());

        let user_txn = LedgerTransaction::decode(&group.slots[1].payload).unwrap();
        assert_eq!(user_txn.sender, f.buyer);
        assert_eq!(user_txn.fee, 0);
        assert_eq!(user_txn.method, b"mark_paid");
        assert_eq!(user_txn.note, b"mark_paid:42");
        assert_eq!(compute_group_id(&[sponsor_txn, user_txn]), group.group_id);

        let entry = f.pending.take(&pending_id).unwrap();
        assert_eq!(entry.raw_transaction, group.slots[1].payload);
        assert_eq!(entry.action_key, ActionKey::new(ActionType::MarkPaid, "42"));
        assert_eq!(entry.slot_index, 1);
    }

    #[tokio::test]
    async fn test_already_applied_is_noop() {
        let f = fixture();
        f.ledger.insert_subject(trade(&f, SubjectStatus::Paid));
        assert_eq!(
            prepare(&f, f.buyer, ActionType::MarkPaid).await.unwrap(),
            PrepareOutcome::Noop
        );
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_party_not_authorized() {
        let f = fixture();
        f.ledger.insert_subject(trade(&f, SubjectStatus::Accepted));
        let err = prepare(&f, f.seller, ActionType::MarkPaid).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotAuthorized(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_trade_is_finalized() {
        let f = fixture();
        f.ledger.insert_subject(trade(&f, SubjectStatus::Cancelled));
        let err = prepare(&f, f.buyer, ActionType::MarkPaid).await.unwrap_err();
        assert!(matches!(err, GatewayError::ActionFinalized(_)));
    }

    #[tokio::test]
    async fn test_missing_subject() {
        let f = fixture();
        let err = prepare(&f, f.buyer, ActionType::MarkPaid).await.unwrap_err();
        assert!(matches!(err, GatewayError::SubjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_ledger_outage_is_retryable() {
        let f = fixture();
        f.ledger.set_offline(true);
        let err = prepare(&f, f.buyer, ActionType::MarkPaid).await.unwrap_err();
        assert!(matches!(err, GatewayError::LedgerQuery(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_create_escrow_funds_box_from_sponsor() {
        let f = fixture();
        f.ledger.insert_subject(trade(&f, SubjectStatus::Draft));
        let PrepareOutcome::Group(group) =
            prepare(&f, f.seller, ActionType::CreateEscrow).await.unwrap()
        else {
            panic!("expected a group");
        };
        assert_eq!(group.slots.len(), 3);
        assert_eq!(group.unsigned_slots().count(), 2);
        let funding = SignedSlot::decode(&group.slots[0].payload)
            .unwrap()
            .verify()
            .unwrap();
        assert_eq!(funding.amount, LedgerParams::default().box_funding);
        assert_eq!(funding.receiver, [9u8; 32]);
        assert_eq!(f.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_purchase_puts_sponsor_slot_second() {
        let f = fixture();
        f.ledger.insert_subject(SubjectState {
            subject_id: "42".into(),
            kind: SubjectKind::Purchase,
            status: SubjectStatus::Quoted,
            initiator: f.buyer,
            counterparty: None,
            escrow: [9u8; 32],
            amount: 250,
            token_amount: 10_000,
        });
        let PrepareOutcome::Group(group) =
            prepare(&f, f.buyer, ActionType::PurchaseTokens).await.unwrap()
        else {
            panic!("expected a group");
        };
        assert!(!group.slots[0].signed);
        assert!(group.slots[1].signed);
        let delivery = SignedSlot::decode(&group.slots[1].payload)
            .unwrap()
            .verify()
            .unwrap();
        assert_eq!(delivery.amount, 10_000);
        assert_eq!(delivery.fee, LedgerParams::default().min_fee * 2);
    }

    #[tokio::test]
    async fn test_validity_window_can_only_shrink() {
        let f = fixture();
        f.ledger.insert_subject(trade(&f, SubjectStatus::Accepted));
        let params = PrepareParams {
            validity_rounds: Some(50_000),
        };
        let PrepareOutcome::Group(group) = f
            .preparer
            .prepare(&f.buyer, ActionType::MarkPaid, "42", &params)
            .await
            .unwrap()
        else {
            panic!("expected a group");
        };
        let txn = LedgerTransaction::decode(&group.slots[1].payload).unwrap();
        assert_eq!(txn.last_valid - txn.first_valid, 1000);
    }

    #[tokio::test]
    async fn test_bridge_prepares_multi_agent_raw_transaction() {
        let f = fixture();
        f.ledger.insert_subject(SubjectState {
            subject_id: "42".into(),
            kind: SubjectKind::Bridge,
            status: SubjectStatus::Requested,
            initiator: f.seller,
            counterparty: None,
            escrow: [9u8; 32],
            amount: 1_200,
            token_amount: 0,
        });
        let PrepareOutcome::Group(group) =
            prepare(&f, f.seller, ActionType::BridgeTransfer).await.unwrap()
        else {
            panic!("expected a group");
        };
        assert_eq!(group.slots.len(), 1);
        assert_eq!(group.sponsor_address, Some(f.preparer.sponsor_address()));
        let raw = RawTransaction::from_multi_agent_bytes(&group.slots[0].payload).unwrap();
        assert_eq!(raw.sender, f.seller);
        assert_eq!(raw.payload, b"bridge_transfer:42");
        assert_eq!(raw.sequence_number, 0);
    }

    #[tokio::test]
    async fn test_malformed_subject_id_never_reaches_ledger() {
        let f = fixture();
        f.ledger.set_offline(true);
        let err = f
            .preparer
            .prepare(&f.buyer, ActionType::MarkPaid, "43/../42", &PrepareParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_round_near_limit_is_refused_not_wrapped() {
        let clock: SharedClock = Arc::new(ManualClock::new(1_700_000_000_000));
        let ledger = Arc::new(InMemoryLedger::new(
            LedgerParams {
                round: u64::MAX - 10,
                ..LedgerParams::default()
            },
            clock.clone(),
        ));
        let pending = Arc::new(PendingTransactionCache::new(
            PendingCacheConfig::default(),
            clock.clone(),
        ));
        let preparer = TransactionGroupPreparer::new(
            ledger.clone(),
            pending.clone(),
            Arc::new(SponsorSigner::generate()),
            clock,
            PreparerConfig::default(),
        );
        let seller = ed25519_address(&generate_keypair().1);
        let buyer = ed25519_address(&generate_keypair().1);
        ledger.insert_subject(SubjectState {
            subject_id: "42".into(),
            kind: SubjectKind::Trade,
            status: SubjectStatus::Accepted,
            initiator: seller,
            counterparty: Some(buyer),
            escrow: [9u8; 32],
            amount: 5_000,
            token_amount: 0,
        });

        let err = preparer
            .prepare(&buyer, ActionType::MarkPaid, "42", &PrepareParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::LedgerQuery(_)), "got {err:?}");
        assert!(pending.is_empty());
    }
}

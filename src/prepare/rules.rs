//! Per-action state rules: when an action may run, when it has already
//! happened, when it never can, and who may ask for it.

use crate::ledger::{SubjectState, SubjectStatus};
use crate::wire::Address;

use super::ActionType;
use SubjectStatus::*;

/// Which party of a subject must sign the user slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    /// Seller of a trade, owner of a withdrawal / purchase / bridge transfer
    Initiator,
    /// Buyer of a trade
    Counterparty,
}

#[derive(Debug, Clone, Copy)]
pub struct ActionRule {
    pub ready: SubjectStatus,
    pub applied: &'static [SubjectStatus],
    pub conflict: &'static [SubjectStatus],
    pub party: Party,
}

pub fn rule(action: ActionType) -> ActionRule {
    match action {
        ActionType::CreateEscrow => ActionRule {
            ready: Draft,
            applied: &[Open, Accepted, Paid, Released],
            conflict: &[Cancelled, Disputed],
            party: Party::Initiator,
        },
        ActionType::AcceptEscrow => ActionRule {
            ready: Open,
            applied: &[Accepted, Paid, Released],
            conflict: &[Cancelled, Disputed],
            party: Party::Counterparty,
        },
        ActionType::MarkPaid => ActionRule {
            ready: Accepted,
            applied: &[Paid, Released],
            conflict: &[Cancelled, Disputed],
            party: Party::Counterparty,
        },
        ActionType::ReleasePayment => ActionRule {
            ready: Paid,
            applied: &[Released],
            conflict: &[Cancelled, Disputed],
            party: Party::Initiator,
        },
        ActionType::Withdraw => ActionRule {
            ready: Requested,
            applied: &[Completed],
            conflict: &[Rejected],
            party: Party::Initiator,
        },
        ActionType::PurchaseTokens => ActionRule {
            ready: Quoted,
            applied: &[Settled],
            conflict: &[Expired],
            party: Party::Initiator,
        },
        ActionType::BridgeTransfer => ActionRule {
            ready: Requested,
            applied: &[Completed],
            conflict: &[Rejected],
            party: Party::Initiator,
        },
    }
}

/// Where a subject stands relative to an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    AlreadyApplied,
    /// Terminal state the action can never reach from
    Finalized(SubjectStatus),
    /// Earlier in the lifecycle than the action needs
    NotYet(SubjectStatus),
}

impl ActionRule {
    pub fn readiness(&self, status: SubjectStatus) -> Readiness {
        if status == self.ready {
            Readiness::Ready
        } else if self.applied.contains(&status) {
            Readiness::AlreadyApplied
        } else if self.conflict.contains(&status) {
            Readiness::Finalized(status)
        } else {
            Readiness::NotYet(status)
        }
    }

    /// Address of the party that must sign
    pub fn signer(&self, state: &SubjectState) -> Option<Address> {
        match self.party {
            Party::Initiator => Some(state.initiator),
            Party::Counterparty => state.counterparty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_status_classified_once() {
        for action in ActionType::ALL {
            let r = rule(action);
            assert!(!r.applied.contains(&r.ready));
            assert!(!r.conflict.contains(&r.ready));
            assert!(r.applied.iter().all(|s| !r.conflict.contains(s)));
        }
    }

    #[test]
    fn test_mark_paid_readiness() {
        let r = rule(ActionType::MarkPaid);
        assert_eq!(r.readiness(Accepted), Readiness::Ready);
        assert_eq!(r.readiness(Paid), Readiness::AlreadyApplied);
        assert_eq!(r.readiness(Released), Readiness::AlreadyApplied);
        assert_eq!(r.readiness(Cancelled), Readiness::Finalized(Cancelled));
        assert_eq!(r.readiness(Open), Readiness::NotYet(Open));
        assert_eq!(r.party, Party::Counterparty);
    }
}

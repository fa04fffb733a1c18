//! Single-flight guard: at most one request of each kind per action key
//! for each caller. Callers never block one another.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::prepare::ActionKey;
use crate::wire::Address;

use super::messages::RequestKind;

type FlightKey = (Address, ActionKey, RequestKind);

/// Tracks which `(caller, ActionKey, RequestKind)` triples have a request running
#[derive(Debug, Default)]
pub struct InFlightGuard {
    running: DashMap<FlightKey, ()>,
}

/// Held while a request runs; releases the slot on drop
#[derive(Debug)]
pub struct InFlightPermit {
    guard: Arc<InFlightGuard>,
    key: Option<FlightKey>,
}

impl InFlightGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot for `caller` and `key`; `None` if that caller already
    /// has the same request running
    pub fn try_acquire(
        self: &Arc<Self>,
        caller: Address,
        key: ActionKey,
        kind: RequestKind,
    ) -> Option<InFlightPermit> {
        match self.running.entry((caller, key, kind)) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let key = slot.key().clone();
                slot.insert(());
                Some(InFlightPermit {
                    guard: Arc::clone(self),
                    key: Some(key),
                })
            }
        }
    }

    pub fn is_running(&self, caller: &Address, key: &ActionKey, kind: RequestKind) -> bool {
        self.running.contains_key(&(*caller, key.clone(), kind))
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.guard.running.remove(&key);
        }
    }
}

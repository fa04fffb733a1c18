//! Prepared user transactions awaiting their signature.
//!
//! Every user slot handed out by prepare is recorded here under an opaque id.
//! Submit must `take` the entry (consuming it) and check the client's bytes
//! against it. Entries live for a fixed TTL whether or not they are taken;
//! an expired entry is unreachable even before the sweeper removes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::prepare::ActionKey;
use crate::types::{GatewayError, Result};
use crate::wire::Address;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct PendingCacheConfig {
    /// How long a prepared slot stays redeemable
    pub ttl: Duration,

    /// Upper bound on outstanding entries
    pub max_entries: usize,

    /// How often the background sweeper runs
    pub cleanup_interval: Duration,
}

impl Default for PendingCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 100_000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Entry
// =============================================================================

/// A user slot as prepared, before the user signs it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransactionEntry {
    pub id: String,
    /// Exact bytes handed to the client for signing
    pub raw_transaction: Vec<u8>,
    pub sender: Address,
    pub recipient: Address,
    pub action_key: ActionKey,
    pub slot_index: usize,
    /// Clock milliseconds at preparation
    pub created_at: u64,
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct PendingStats {
    puts: AtomicU64,
    takes: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingStatsSnapshot {
    pub entries: usize,
    pub puts: u64,
    pub takes: u64,
    pub misses: u64,
    pub evictions: u64,
}

// =============================================================================
// Cache
// =============================================================================

pub struct PendingTransactionCache {
    entries: DashMap<String, PendingTransactionEntry>,
    config: PendingCacheConfig,
    clock: SharedClock,
    stats: PendingStats,
}

impl PendingTransactionCache {
    pub fn new(config: PendingCacheConfig, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            clock,
            stats: PendingStats::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Current clock reading, for stamping `created_at`
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn is_expired(&self, entry: &PendingTransactionEntry, now: u64) -> bool {
        now.saturating_sub(entry.created_at) >= self.config.ttl.as_millis() as u64
    }

    /// Record a prepared slot under `entry.id`
    pub fn put(&self, entry: PendingTransactionEntry) {
        if self.entries.len() >= self.config.max_entries {
            self.make_room();
        }
        debug!(
            id = %entry.id,
            action = %entry.action_key,
            slot = entry.slot_index,
            "Pending slot recorded"
        );
        self.entries.insert(entry.id.clone(), entry);
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove and return the entry; fails if absent, already taken or expired
    pub fn take(&self, id: &str) -> Result<PendingTransactionEntry> {
        let now = self.clock.now_millis();
        match self.entries.remove(id) {
            Some((_, entry)) if !self.is_expired(&entry, now) => {
                self.stats.takes.fetch_add(1, Ordering::Relaxed);
                Ok(entry)
            }
            Some(_) => {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::PendingNotFound(format!("{id} expired")))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::PendingNotFound(id.to_string()))
            }
        }
    }

    /// Remove expired entries; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if self.is_expired(entry, now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> PendingStatsSnapshot {
        PendingStatsSnapshot {
            entries: self.entries.len(),
            puts: self.stats.puts.load(Ordering::Relaxed),
            takes: self.stats.takes.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// Free a slot at capacity: expired entries first, then the oldest live one
    fn make_room(&self) {
        if self.sweep() > 0 && self.entries.len() < self.config.max_entries {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.created_at)
            .map(|e| e.key().clone());
        if let Some((id, entry)) = oldest.and_then(|id| self.entries.remove(&id)) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            warn!(
                id = %id,
                action = %entry.action_key,
                max_entries = self.config.max_entries,
                "Pending cache full, evicted a live prepared slot"
            );
        }
    }
}

/// Sweep expired entries every `cleanup_interval`
pub fn spawn_cleanup_task(cache: Arc<PendingTransactionCache>) -> tokio::task::JoinHandle<()> {
    let interval = cache.config.cleanup_interval;

    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let removed = cache.sweep();
            if removed > 0 {
                debug!(removed, entries = cache.len(), "Pending cache sweep completed");
            }
        }
    });

    info!(interval_secs = interval.as_secs(), "Pending cache cleanup task started");
    handle
}

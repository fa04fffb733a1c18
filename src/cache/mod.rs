//! In-memory stores shared across sessions.

pub mod pending;

pub use pending::{
    spawn_cleanup_task, PendingCacheConfig, PendingStatsSnapshot, PendingTransactionCache,
    PendingTransactionEntry,
};

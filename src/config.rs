//! Configuration for the sponsor gateway
//!
//! CLI arguments and environment variable handling using clap.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::cache::PendingCacheConfig;
use crate::prepare::PreparerConfig;

/// Sponsor gateway - co-signs fee-sponsored ledger transaction groups
#[derive(Parser, Debug, Clone)]
#[command(name = "sponsor-gateway")]
#[command(about = "Fee-sponsoring WebSocket gateway for non-custodial ledger clients")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Development mode: in-memory ledger, generated sponsor key, dev JWT secret
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// JWT secret for session tokens (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Session token expiry in seconds
    #[arg(long, env = "JWT_EXPIRY_SECONDS", default_value = "3600")]
    pub jwt_expiry_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Ledger node HTTP API base URL (required in production)
    #[arg(long, env = "LEDGER_URL")]
    pub ledger_url: Option<String>,

    /// Ledger request timeout in milliseconds
    #[arg(long, env = "LEDGER_TIMEOUT_MS", default_value = "10000")]
    pub ledger_timeout_ms: u64,

    /// Sponsor ed25519 secret key (hex)
    #[arg(long, env = "SPONSOR_SECRET_KEY")]
    pub sponsor_secret_key: Option<String>,

    /// Encrypted sponsor key file
    #[arg(long, env = "SPONSOR_KEY_FILE")]
    pub sponsor_key_file: Option<PathBuf>,

    /// Passphrase for SPONSOR_KEY_FILE
    #[arg(long, env = "SPONSOR_KEY_PASSPHRASE")]
    pub sponsor_key_passphrase: Option<String>,

    /// Seconds a prepared user slot stays redeemable
    #[arg(long, env = "PENDING_TTL_SECS", default_value = "300")]
    pub pending_ttl_secs: u64,

    /// Maximum outstanding prepared slots
    #[arg(long, env = "PENDING_MAX_ENTRIES", default_value = "100000")]
    pub pending_max_entries: usize,

    /// Seconds between pending cache sweeps
    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value = "60")]
    pub cleanup_interval_secs: u64,

    /// Rounds a prepared group stays valid on the ledger
    #[arg(long, env = "VALIDITY_ROUNDS", default_value = "1000")]
    pub validity_rounds: u64,
}

impl Args {
    /// Effective JWT secret (uses default in dev mode)
    pub fn jwt_secret(&self) -> Option<String> {
        match (&self.jwt_secret, self.dev_mode) {
            (Some(secret), _) => Some(secret.clone()),
            (None, true) => Some("dev-mode-secret-not-for-production-use-123456".to_string()),
            (None, false) => None,
        }
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn pending_config(&self) -> PendingCacheConfig {
        PendingCacheConfig {
            ttl: Duration::from_secs(self.pending_ttl_secs),
            max_entries: self.pending_max_entries,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }

    pub fn preparer_config(&self) -> PreparerConfig {
        PreparerConfig {
            validity_rounds: self.validity_rounds,
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            if self.jwt_secret.is_none() {
                return Err("JWT_SECRET is required in production mode".to_string());
            }
            if self.ledger_url.is_none() {
                return Err("LEDGER_URL is required in production mode".to_string());
            }
            if self.sponsor_secret_key.is_none() && self.sponsor_key_file.is_none() {
                return Err(
                    "SPONSOR_SECRET_KEY or SPONSOR_KEY_FILE is required in production mode"
                        .to_string(),
                );
            }
        }

        if self.sponsor_key_file.is_some() && self.sponsor_key_passphrase.is_none() {
            return Err("SPONSOR_KEY_PASSPHRASE is required with SPONSOR_KEY_FILE".to_string());
        }

        if self.pending_ttl_secs == 0 {
            return Err("PENDING_TTL_SECS must be positive".to_string());
        }

        if self.validity_rounds == 0 {
            return Err("VALIDITY_ROUNDS must be positive".to_string());
        }

        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(format!("LOG_FORMAT must be text or json, got {}", self.log_format));
        }

        Ok(())
    }
}

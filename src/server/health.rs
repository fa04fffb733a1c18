//! Health check endpoint
//!
//! Liveness plus enough build and cache detail to tell which binary is
//! co-signing and whether prepared slots are piling up.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::cache::PendingStatsSnapshot;
use crate::wire::address_to_hex;

use super::http::{json_response, AppState};

#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub commit: &'static str,
    pub build_time: &'static str,
    pub timestamp: String,
    /// Uptime in seconds
    pub uptime: u64,
    /// "development" or "production"
    pub mode: &'static str,
    /// Hex fee-payer address
    pub sponsor_address: String,
    pub pending: PendingStatsSnapshot,
    /// Requests currently running across all sessions
    pub in_flight: usize,
}

fn build_health_response(state: &AppState) -> HealthResponse {
    HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime: state.started_at.elapsed().as_secs(),
        mode: if state.dev_mode {
            "development"
        } else {
            "production"
        },
        sponsor_address: address_to_hex(&state.sponsor_address),
        pending: state.pending.stats(),
        in_flight: state.services.inflight.len(),
    }
}

/// Liveness check: 200 whenever the process is serving
pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    match serde_json::to_string(&build_health_response(state)) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "healthy": false, "error": e.to_string() }).to_string(),
        ),
    }
}

//! Session WebSocket upgrade
//!
//! Authentication flow:
//! 1. JWT token from query string (?token=...)
//! 2. JWT token from Authorization header
//! 3. Otherwise 401; there is no anonymous session

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::{Request, Response, StatusCode};
use tracing::{error, info, warn};

use crate::auth::{extract_token_from_header, extract_token_from_query};
use crate::session::run_session;
use crate::types::{GatewayError, Result};
use crate::wire::{address_to_hex, Address};

use super::http::{error_response, AppState};

/// Resolve the caller's account from the request's session token
fn authenticate(state: &AppState, req: &Request<Incoming>) -> Result<Address> {
    let token = extract_token_from_query(req.uri().query(), "token")
        .or_else(|| {
            extract_token_from_header(
                req.headers()
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok()),
            )
        })
        .ok_or_else(|| GatewayError::Unauthorized("missing session token".into()))?;

    state.jwt.validate(token)?.account()
}

/// Handle WebSocket upgrade for `/session`
pub async fn handle_session_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return error_response(StatusCode::BAD_REQUEST, "WebSocket upgrade required");
    }

    let caller = match authenticate(&state, &req) {
        Ok(caller) => caller,
        Err(e) => {
            warn!("Session auth failed: {}", e);
            return error_response(StatusCode::UNAUTHORIZED, &e.to_string());
        }
    };

    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            error!("WebSocket upgrade error: {:?}", e);
            return error_response(StatusCode::BAD_REQUEST, "WebSocket upgrade failed");
        }
    };

    info!(caller = %address_to_hex(&caller), "Session upgrade accepted");

    let services = Arc::clone(&state.services);
    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => {
                if let Err(e) = run_session(ws, services, caller).await {
                    warn!("Session error: {}", e);
                }
            }
            Err(e) => {
                error!("WebSocket upgrade failed: {:?}", e);
            }
        }
    });

    // Convert the upgrade response
    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Full::new(Bytes::new()))
}

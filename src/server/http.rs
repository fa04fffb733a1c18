//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo; the session endpoint upgrades to a
//! WebSocket, everything else is plain JSON.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::auth::JwtValidator;
use crate::cache::{PendingCacheConfig, PendingTransactionCache};
use crate::clock::SharedClock;
use crate::crypto::SponsorSigner;
use crate::envelope::FeePayerEnvelopeAssembler;
use crate::ledger::LedgerClient;
use crate::prepare::{PreparerConfig, TransactionGroupPreparer};
use crate::session::SessionServices;
use crate::submit::TransactionSubmitter;
use crate::types::Result;
use crate::wire::Address;

use super::{health, websocket};

/// Shared application state
pub struct AppState {
    pub services: Arc<SessionServices>,
    pub pending: Arc<PendingTransactionCache>,
    pub jwt: JwtValidator,
    pub sponsor_address: Address,
    pub dev_mode: bool,
    pub started_at: Instant,
}

/// What the gateway is assembled from
pub struct GatewayParts {
    pub ledger: Arc<dyn LedgerClient>,
    pub sponsor: Arc<SponsorSigner>,
    pub jwt: JwtValidator,
    pub clock: SharedClock,
    pub pending: PendingCacheConfig,
    pub preparer: PreparerConfig,
    pub dev_mode: bool,
}

impl AppState {
    /// Wire the preparer, submitter and stores around one ledger and sponsor
    pub fn build(parts: GatewayParts) -> Arc<Self> {
        let pending = Arc::new(PendingTransactionCache::new(
            parts.pending,
            parts.clock.clone(),
        ));
        let preparer = Arc::new(TransactionGroupPreparer::new(
            parts.ledger.clone(),
            pending.clone(),
            parts.sponsor.clone(),
            parts.clock,
            parts.preparer,
        ));
        let submitter = Arc::new(TransactionSubmitter::new(
            parts.ledger,
            pending.clone(),
            FeePayerEnvelopeAssembler::new(parts.sponsor.clone()),
        ));
        let services = Arc::new(SessionServices::new(preparer, submitter));

        Arc::new(Self::new(
            services,
            pending,
            parts.jwt,
            parts.sponsor.address(),
            parts.dev_mode,
        ))
    }

    pub fn new(
        services: Arc<SessionServices>,
        pending: Arc<PendingTransactionCache>,
        jwt: JwtValidator,
        sponsor_address: Address,
        dev_mode: bool,
    ) -> Self {
        Self {
            services,
            pending,
            jwt,
            sponsor_address,
            dev_mode,
            started_at: Instant::now(),
        }
    }
}

/// Bind `listen` and serve until the process exits
pub async fn run(state: Arc<AppState>, listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("Sponsor gateway listening on {}", listen);

    if state.dev_mode {
        warn!("Development mode enabled - in-memory ledger and dev JWT secret");
    }

    serve(listener, state).await;
    Ok(())
}

/// Accept connections on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => health::health_check(&state),

        (Method::GET, "/session") => websocket::handle_session_upgrade(state, req).await,

        _ => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "Not found", "path": path }).to_string(),
        ),
    };

    Ok(response)
}

pub(crate) fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": message }).to_string())
}

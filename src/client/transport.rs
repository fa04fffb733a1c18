//! Client side of a session.
//!
//! One WebSocket carries every request. Responses come back tagged with the
//! action key they answer, so each outstanding request parks a oneshot
//! completion handle under `(ActionKey, RequestKind)` and the reader task
//! resolves it. A key has at most one waiter per kind; a waiter is removed
//! when it resolves, times out, or its caller goes away. When the socket
//! closes every remaining waiter fails with `ChannelClosed`; `open()` then
//! replaces the connection with a fresh one and its own waiter map.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::prepare::{ActionKey, ActionType, PrepareOutcome, PrepareParams};
use crate::session::{ClientMessage, RequestKind, ServerMessage};
use crate::submit::{SignedUserTransaction, SponsorTransaction};
use crate::types::{GatewayError, Result};

// ============================================================================
// Configuration
// ============================================================================

pub const PREPARE_TIMEOUT_RANGE: (Duration, Duration) =
    (Duration::from_secs(3), Duration::from_secs(15));
pub const SUBMIT_TIMEOUT_RANGE: (Duration, Duration) =
    (Duration::from_secs(10), Duration::from_secs(20));

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub prepare_timeout: Duration,
    pub submit_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(10),
            submit_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Clamped to 3-15 s
    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = timeout.clamp(PREPARE_TIMEOUT_RANGE.0, PREPARE_TIMEOUT_RANGE.1);
        self
    }

    /// Clamped to 10-20 s
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout.clamp(SUBMIT_TIMEOUT_RANGE.0, SUBMIT_TIMEOUT_RANGE.1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

// ============================================================================
// Waiters
// ============================================================================

type WaiterKey = (ActionKey, RequestKind);
type Waiter = oneshot::Sender<Result<ServerMessage>>;

#[derive(Default)]
struct Shared {
    waiters: DashMap<WaiterKey, Waiter>,
    closed: AtomicBool,
}

impl Shared {
    fn resolve(&self, msg: ServerMessage) {
        let Some((key, kind)) = msg.route() else {
            if let ServerMessage::Error { message, .. } = &msg {
                warn!(error = %message, "Gateway error without an action key");
            }
            return;
        };

        // Error frames that do not name the request go to whichever is waiting
        let candidates = match kind {
            Some(kind) => vec![kind],
            None => vec![RequestKind::Prepare, RequestKind::Submit],
        };
        for kind in candidates {
            if let Some((_, waiter)) = self.waiters.remove(&(key.clone(), kind)) {
                let _ = waiter.send(Ok(msg));
                return;
            }
        }
        debug!(action = %key, "Response with no waiter dropped");
    }

    /// Fail every outstanding request with `ChannelClosed`
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let keys: Vec<WaiterKey> = self.waiters.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, waiter)) = self.waiters.remove(&key) {
                let _ = waiter.send(Err(GatewayError::ChannelClosed));
            }
        }
    }
}

/// Removes a waiter however the request ends
struct WaiterSlot<'a> {
    shared: &'a Shared,
    key: WaiterKey,
}

impl Drop for WaiterSlot<'_> {
    fn drop(&mut self) {
        self.shared.waiters.remove(&self.key);
    }
}

// ============================================================================
// Transport
// ============================================================================

/// One established socket: its outbound queue and its waiters
struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }
}

pub struct SessionTransport {
    url: String,
    token: Option<String>,
    config: TransportConfig,
    /// Replaced on every successful `open()`
    connection: RwLock<Option<Arc<Connection>>>,
    /// Serialises `open()` so concurrent callers share one socket
    opening: Mutex<()>,
}

impl SessionTransport {
    /// `url` is the gateway's `/session` endpoint; `token` the session JWT
    pub fn new(url: impl Into<String>, token: Option<String>, config: TransportConfig) -> Self {
        Self {
            url: url.into(),
            token,
            config,
            connection: RwLock::new(None),
            opening: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some_and(|c| c.is_open())
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.current().map_or(0, |c| c.shared.waiters.len())
    }

    /// Establish the authenticated channel, reconnecting if it has closed.
    ///
    /// Requests that were outstanding on a closed channel have already
    /// failed with `ChannelClosed`; their outcome is unknown, so callers
    /// re-run prepare after reopening.
    pub async fn open(&self) -> Result<()> {
        let _opening = self.opening.lock().await;
        if self.is_open() {
            return Ok(());
        }

        let token = self
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::NotOpen("missing session token".into()))?;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::NotOpen(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| GatewayError::NotOpen("session token is not a valid header".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| GatewayError::NotOpen("handshake timed out".into()))?
        .map_err(|e| GatewayError::NotOpen(e.to_string()))?;

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(Shared::default());

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Pong) => {}
                        Ok(msg) => reader_shared.resolve(msg),
                        Err(e) => warn!(error = %e, "Unparseable gateway frame"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Session read failed");
                        break;
                    }
                }
            }
            info!("Session channel closed");
            reader_shared.close();
        });

        let writer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(json) = rx.recv().await {
                if sink.send(WsMessage::Text(json)).await.is_err() {
                    writer_shared.close();
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let connection = Arc::new(Connection {
            outbound: tx,
            shared,
        });
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection);
        info!(url = %self.url, "Session opened");
        Ok(())
    }

    /// Send `msg` and wait up to `timeout` for the response to its key
    async fn request(
        &self,
        msg: ClientMessage,
        kind: RequestKind,
        timeout: Duration,
    ) -> Result<ServerMessage> {
        let conn = self
            .current()
            .ok_or_else(|| GatewayError::NotOpen("open() was never called".into()))?;
        if !conn.is_open() {
            return Err(GatewayError::ChannelClosed);
        }

        let (key, _) = msg
            .route()
            .ok_or_else(|| GatewayError::BadRequest("request has no action key".into()))?;
        let waiter_key = (key.clone(), kind);

        let (tx, rx) = oneshot::channel();
        match conn.shared.waiters.entry(waiter_key.clone()) {
            Entry::Occupied(_) => {
                return Err(GatewayError::AlreadyInFlight(format!("{kind} {key}")));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let _slot = WaiterSlot {
            shared: &conn.shared,
            key: waiter_key,
        };

        // Closed between the check above and registering
        if !conn.is_open() {
            return Err(GatewayError::ChannelClosed);
        }

        let json = serde_json::to_string(&msg)?;
        conn.outbound
            .send(json)
            .map_err(|_| GatewayError::ChannelClosed)?;
        debug!(action = %key, request = %kind, "Request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ChannelClosed),
            Err(_) => {
                warn!(action = %key, request = %kind, "Request timed out");
                Err(GatewayError::Timeout(format!("{kind} {key}")))
            }
        }
    }

    /// Ask the gateway to prepare `action` on `subject_id`
    pub async fn prepare(
        &self,
        action: ActionType,
        subject_id: &str,
        params: PrepareParams,
    ) -> Result<PrepareOutcome> {
        let msg = ClientMessage::Prepare {
            action,
            subject_id: subject_id.to_string(),
            params,
        };
        match self
            .request(msg, RequestKind::Prepare, self.config.prepare_timeout)
            .await?
        {
            ServerMessage::PrepareReady { pack, .. } => PrepareOutcome::try_from(pack),
            other => Err(unexpected(other)),
        }
    }

    /// Hand signed transactions back; returns the ledger transaction id
    pub async fn submit(
        &self,
        action: ActionType,
        subject_id: &str,
        signed_user_txns: Vec<SignedUserTransaction>,
        sponsor_transactions: Vec<SponsorTransaction>,
        user_authenticator: Option<Vec<u8>>,
    ) -> Result<String> {
        let msg = ClientMessage::Submit {
            action,
            subject_id: subject_id.to_string(),
            signed_user_txns,
            sponsor_transactions,
            user_authenticator,
        };
        match self
            .request(msg, RequestKind::Submit, self.config.submit_timeout)
            .await?
        {
            ServerMessage::SubmitOk { txid, .. } => Ok(txid),
            other => Err(unexpected(other)),
        }
    }
}

/// Error frames become `Remote`; anything else is a protocol mismatch
fn unexpected(msg: ServerMessage) -> GatewayError {
    match msg {
        ServerMessage::Error {
            message, retryable, ..
        } => GatewayError::Remote { message, retryable },
        other => GatewayError::Internal(format!("unexpected response: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_clamped() {
        let config = TransportConfig::default()
            .with_prepare_timeout(Duration::from_secs(60))
            .with_submit_timeout(Duration::from_secs(1));
        assert_eq!(config.prepare_timeout, Duration::from_secs(15));
        assert_eq!(config.submit_timeout, Duration::from_secs(10));

        let config = TransportConfig::default().with_prepare_timeout(Duration::from_secs(5));
        assert_eq!(config.prepare_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_never_opened_is_not_open() {
        let transport =
            SessionTransport::new("ws://127.0.0.1:1/session", None, TransportConfig::default());
        let err = transport
            .prepare(ActionType::MarkPaid, "42", PrepareParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotOpen(_)));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_open_without_token_fails() {
        let transport =
            SessionTransport::new("ws://127.0.0.1:1/session", None, TransportConfig::default());
        assert!(matches!(
            transport.open().await,
            Err(GatewayError::NotOpen(_))
        ));
    }

    #[test]
    fn test_close_fails_waiters() {
        let shared = Shared::default();
        let (tx, mut rx) = oneshot::channel();
        shared.waiters.insert(
            (ActionKey::new(ActionType::MarkPaid, "42"), RequestKind::Prepare),
            tx,
        );
        shared.close();
        assert!(shared.waiters.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Err(GatewayError::ChannelClosed))));
    }

    #[test]
    fn test_untagged_error_routes_to_waiting_kind() {
        let shared = Shared::default();
        let key = ActionKey::new(ActionType::MarkPaid, "42");
        let (tx, mut rx) = oneshot::channel();
        shared.waiters.insert((key.clone(), RequestKind::Submit), tx);

        shared.resolve(ServerMessage::Error {
            action: Some(key.action),
            subject_id: Some(key.subject_id.clone()),
            request: None,
            message: "boom".into(),
            retryable: false,
        });
        assert!(matches!(rx.try_recv(), Ok(Ok(ServerMessage::Error { .. }))));
    }
}

//! Server side of a session.
//!
//! One reader loop per connection parses frames and spawns a task per
//! request; a writer task owns the sink and serialises every outgoing
//! frame. Requests are guarded by the shared [`InFlightGuard`], so a second
//! prepare (or submit) from the same caller for an action key that is still
//! running is answered with an error instead of being started.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::prepare::{validate_subject_id, ActionKey, TransactionGroupPreparer};
use crate::submit::TransactionSubmitter;
use crate::types::{GatewayError, Result};
use crate::wire::{address_to_hex, Address};

use super::inflight::InFlightGuard;
use super::messages::{ClientMessage, ServerMessage};

/// Outgoing frames buffered per connection
const OUTBOUND_BUFFER: usize = 64;

/// How long the writer may drain after the reader stops
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Everything a session needs to serve requests
pub struct SessionServices {
    pub preparer: Arc<TransactionGroupPreparer>,
    pub submitter: Arc<TransactionSubmitter>,
    pub inflight: Arc<InFlightGuard>,
}

impl SessionServices {
    pub fn new(
        preparer: Arc<TransactionGroupPreparer>,
        submitter: Arc<TransactionSubmitter>,
    ) -> Self {
        Self {
            preparer,
            submitter,
            inflight: InFlightGuard::new(),
        }
    }
}

/// Serve one authenticated connection until it closes
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    services: Arc<SessionServices>,
    caller: Address,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    info!(caller = %address_to_hex(&caller), "Session opened");

    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize session frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => dispatch(&services, caller, &tx, &text).await,
            Ok(WsMessage::Close(_)) => {
                debug!("Session closed by client");
                break;
            }
            // Pings are answered by the protocol layer
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Session read failed");
                break;
            }
        }
    }

    // Flush what is queued; responses still being computed have nowhere to go
    drop(tx);
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(caller = %address_to_hex(&caller), "Session ended");
    Ok(())
}

async fn dispatch(
    services: &Arc<SessionServices>,
    caller: Address,
    tx: &mpsc::Sender<ServerMessage>,
    text: &str,
) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            let err = GatewayError::BadRequest(format!("unparseable frame: {e}"));
            let _ = tx.send(ServerMessage::error(None, &err)).await;
            return;
        }
    };

    let Some((key, kind)) = msg.route() else {
        let _ = tx.send(ServerMessage::Pong).await;
        return;
    };

    if let Err(e) = validate_subject_id(&key.subject_id) {
        let _ = tx.send(ServerMessage::error(Some((&key, kind)), &e)).await;
        return;
    }

    let Some(permit) = services.inflight.try_acquire(caller, key.clone(), kind) else {
        warn!(action = %key, request = %kind, "Duplicate request rejected");
        let err = GatewayError::AlreadyInFlight(format!("{kind} {key}"));
        let _ = tx.send(ServerMessage::error(Some((&key, kind)), &err)).await;
        return;
    };

    let services = Arc::clone(services);
    let tx = tx.clone();
    tokio::spawn(async move {
        let reply = match handle_request(&services, &caller, msg).await {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_retryable() {
                    warn!(action = %key, request = %kind, error = %e, "Request failed");
                } else {
                    info!(action = %key, request = %kind, error = %e, "Request refused");
                }
                ServerMessage::error(Some((&key, kind)), &e)
            }
        };
        // Release before replying so an immediate follow-up is accepted
        drop(permit);
        let _ = tx.send(reply).await;
    });
}

async fn handle_request(
    services: &SessionServices,
    caller: &Address,
    msg: ClientMessage,
) -> Result<ServerMessage> {
    match msg {
        ClientMessage::Prepare {
            action,
            subject_id,
            params,
        } => {
            let outcome = services
                .preparer
                .prepare(caller, action, &subject_id, &params)
                .await?;
            Ok(ServerMessage::PrepareReady {
                action,
                subject_id,
                pack: outcome.into(),
            })
        }
        ClientMessage::Submit {
            action,
            subject_id,
            signed_user_txns,
            sponsor_transactions,
            user_authenticator,
        } => {
            let key = ActionKey::new(action, &subject_id);
            let txid = match user_authenticator {
                Some(authenticator) => {
                    let [txn] = signed_user_txns.as_slice() else {
                        return Err(GatewayError::BadRequest(
                            "fee-payer submit carries exactly one raw transaction".into(),
                        ));
                    };
                    services
                        .submitter
                        .submit_fee_payer(caller, &key, txn, &authenticator)
                        .await?
                }
                None => {
                    services
                        .submitter
                        .submit_group(caller, &key, &signed_user_txns, &sponsor_transactions)
                        .await?
                }
            };
            Ok(ServerMessage::SubmitOk {
                action,
                subject_id,
                txid,
            })
        }
        ClientMessage::Ping => Ok(ServerMessage::Pong),
    }
}


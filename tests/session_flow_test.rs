//! End-to-end session tests
//!
//! Runs the gateway on 127.0.0.1:0 over an in-memory ledger and drives it
//! with the real client transport and signing flow.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use jsonwebtoken::{encode, EncodingKey, Header};
use tokio::net::TcpListener;

use sponsor_gateway::auth::JwtValidator;
use sponsor_gateway::cache::PendingCacheConfig;
use sponsor_gateway::client::{sign_group, ClientSigningFlow, SessionTransport, TransportConfig};
use sponsor_gateway::clock::system_clock;
use sponsor_gateway::crypto::{ed25519_address, generate_keypair, SponsorSigner};
use sponsor_gateway::keyless::{
    Audience, EphemeralKeyRegistry, IdentityClaims, KeylessAccount, KeylessAccountDeriver,
    LocalPepperService, LocalProofService,
};
use sponsor_gateway::ledger::{
    InMemoryLedger, LedgerParams, SignedSlot, SubjectKind, SubjectState, SubjectStatus,
};
use sponsor_gateway::prepare::{
    ActionKey, ActionType, PrepareOutcome, PrepareParams, PreparerConfig,
};
use sponsor_gateway::server::{self, AppState, GatewayParts};
use sponsor_gateway::session::RequestKind;
use sponsor_gateway::wire::Address;
use sponsor_gateway::{GatewayError, Outcome};

// =============================================================================
// Harness
// =============================================================================

struct Gateway {
    addr: std::net::SocketAddr,
    ledger: Arc<InMemoryLedger>,
    jwt: JwtValidator,
    state: Arc<AppState>,
}

impl Gateway {
    async fn start() -> Self {
        let clock = system_clock();
        let ledger = Arc::new(InMemoryLedger::new(LedgerParams::default(), clock.clone()));
        let jwt = JwtValidator::new_dev();
        let state = AppState::build(GatewayParts {
            ledger: ledger.clone(),
            sponsor: Arc::new(SponsorSigner::generate()),
            jwt: jwt.clone(),
            clock,
            pending: PendingCacheConfig::default(),
            preparer: PreparerConfig::default(),
            dev_mode: true,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::serve(listener, state.clone()));

        Self {
            addr,
            ledger,
            jwt,
            state,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/session", self.addr)
    }

    async fn connect(&self, account: &Address) -> Arc<SessionTransport> {
        let token = self.jwt.issue("user", account).unwrap();
        let transport = Arc::new(SessionTransport::new(
            self.url(),
            Some(token),
            TransportConfig::default(),
        ));
        transport.open().await.unwrap();
        transport
    }
}

fn wallet() -> (SigningKey, Address) {
    let (key, verifying) = generate_keypair();
    (key, ed25519_address(&verifying))
}

fn trade(seller: Address, buyer: Address, status: SubjectStatus) -> SubjectState {
    SubjectState {
        subject_id: "42".into(),
        kind: SubjectKind::Trade,
        status,
        initiator: seller,
        counterparty: Some(buyer),
        escrow: [9u8; 32],
        amount: 5_000,
        token_amount: 0,
    }
}

// =============================================================================
// Sponsored groups
// =============================================================================

#[tokio::test]
async fn test_mark_paid_end_to_end() {
    let gw = Gateway::start().await;
    let (seller_key, seller) = wallet();
    let (buyer_key, buyer) = wallet();
    drop(seller_key);
    gw.ledger.insert_subject(trade(seller, buyer, SubjectStatus::Accepted));

    let transport = gw.connect(&buyer).await;
    let flow = ClientSigningFlow::new(transport.clone(), Arc::new(buyer_key));

    let outcome = flow
        .run(ActionType::MarkPaid, "42", PrepareParams::default())
        .await;
    assert!(matches!(outcome, Outcome::Success { .. }), "got {outcome:?}");
    assert_eq!(gw.ledger.subject("42").unwrap().status, SubjectStatus::Paid);
    assert_eq!(gw.ledger.submission_count(), 1);
    assert!(gw.state.pending.is_empty());
    assert_eq!(transport.pending_requests(), 0);

    // Second attempt finds the effect already applied
    let again = flow
        .run(ActionType::MarkPaid, "42", PrepareParams::default())
        .await;
    assert_eq!(again, Outcome::SuccessNoop);
    assert_eq!(gw.ledger.submission_count(), 1);
}

#[tokio::test]
async fn test_full_trade_lifecycle() {
    let gw = Gateway::start().await;
    let (seller_key, seller) = wallet();
    let (buyer_key, buyer) = wallet();
    gw.ledger.insert_subject(trade(seller, buyer, SubjectStatus::Draft));

    let seller_flow = ClientSigningFlow::new(gw.connect(&seller).await, Arc::new(seller_key));
    let buyer_flow = ClientSigningFlow::new(gw.connect(&buyer).await, Arc::new(buyer_key));

    for (flow, action, expected) in [
        (&seller_flow, ActionType::CreateEscrow, SubjectStatus::Open),
        (&buyer_flow, ActionType::AcceptEscrow, SubjectStatus::Accepted),
        (&buyer_flow, ActionType::MarkPaid, SubjectStatus::Paid),
        (&seller_flow, ActionType::ReleasePayment, SubjectStatus::Released),
    ] {
        let outcome = flow.run(action, "42", PrepareParams::default()).await;
        assert!(matches!(outcome, Outcome::Success { .. }), "{action}: {outcome:?}");
        assert_eq!(gw.ledger.subject("42").unwrap().status, expected);
    }
    assert_eq!(gw.ledger.submission_count(), 4);
}

#[tokio::test]
async fn test_wrong_party_is_fatal() {
    let gw = Gateway::start().await;
    let (seller_key, seller) = wallet();
    let (_, buyer) = wallet();
    gw.ledger.insert_subject(trade(seller, buyer, SubjectStatus::Accepted));

    let flow = ClientSigningFlow::new(gw.connect(&seller).await, Arc::new(seller_key));
    let outcome = flow
        .run(ActionType::MarkPaid, "42", PrepareParams::default())
        .await;
    assert!(matches!(outcome, Outcome::FatalError { .. }), "got {outcome:?}");
    assert!(gw.state.pending.is_empty());
}

#[tokio::test]
async fn test_ledger_outage_is_retryable() {
    let gw = Gateway::start().await;
    let (buyer_key, buyer) = wallet();
    let (_, seller) = wallet();
    gw.ledger.insert_subject(trade(seller, buyer, SubjectStatus::Accepted));
    gw.ledger.set_offline(true);

    let flow = ClientSigningFlow::new(gw.connect(&buyer).await, Arc::new(buyer_key));
    let outcome = flow
        .run(ActionType::MarkPaid, "42", PrepareParams::default())
        .await;
    assert!(matches!(outcome, Outcome::RetryableError { .. }), "got {outcome:?}");

    gw.ledger.set_offline(false);
    let outcome = flow
        .run(ActionType::MarkPaid, "42", PrepareParams::default())
        .await;
    assert!(matches!(outcome, Outcome::Success { .. }), "got {outcome:?}");
}

#[tokio::test]
async fn test_mutated_user_bytes_rejected() {
    let gw = Gateway::start().await;
    let (buyer_key, buyer) = wallet();
    let (_, seller) = wallet();
    gw.ledger.insert_subject(trade(seller, buyer, SubjectStatus::Accepted));

    let transport = gw.connect(&buyer).await;
    let PrepareOutcome::Group(group) = transport
        .prepare(ActionType::MarkPaid, "42", PrepareParams::default())
        .await
        .unwrap()
    else {
        panic!("expected a group");
    };
    let (mut user, sponsor) = sign_group(&group, &buyer_key).unwrap();

    // Validly signed, but over different bytes than were prepared
    let mut slot = SignedSlot::decode(&user[0].blob).unwrap();
    let last = slot.body.len() - 1;
    slot.body[last] ^= 0x01;
    let resigned = SignedSlot::sign_with(slot.body, slot.public_key, |m| {
        ed25519_dalek::Signer::sign(&buyer_key, m).to_bytes()
    });
    user[0].blob = resigned.encode();

    let err = transport
        .submit(ActionType::MarkPaid, "42", user.clone(), sponsor.clone(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Remote { retryable: false, .. }), "got {err:?}");
    assert_eq!(gw.ledger.submission_count(), 0);
    assert_eq!(gw.ledger.subject("42").unwrap().status, SubjectStatus::Accepted);

    // The prepared slot was consumed by the failed attempt
    let (honest, _) = sign_group(&group, &buyer_key).unwrap();
    let err = transport
        .submit(ActionType::MarkPaid, "42", honest, sponsor, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Pending transaction not found"), "got {err}");
}

#[tokio::test]
async fn test_mutated_sponsor_slot_rejected_by_ledger() {
    let gw = Gateway::start().await;
    let (buyer_key, buyer) = wallet();
    let (_, seller) = wallet();
    gw.ledger.insert_subject(trade(seller, buyer, SubjectStatus::Accepted));

    let transport = gw.connect(&buyer).await;
    let PrepareOutcome::Group(group) = transport
        .prepare(ActionType::MarkPaid, "42", PrepareParams::default())
        .await
        .unwrap()
    else {
        panic!("expected a group");
    };
    let (user, mut sponsor) = sign_group(&group, &buyer_key).unwrap();
    let last = sponsor[0].blob.len() - 1;
    sponsor[0].blob[last] ^= 0x01;

    let err = transport
        .submit(ActionType::MarkPaid, "42", user, sponsor, None)
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("Ledger rejected"), "got {err}");
    assert_eq!(gw.ledger.subject("42").unwrap().status, SubjectStatus::Accepted);
}

#[tokio::test]
async fn test_malformed_subject_id_refused() {
    let gw = Gateway::start().await;
    let (seller_key, seller) = wallet();
    let (_, buyer) = wallet();
    drop(seller_key);
    gw.ledger.insert_subject(trade(seller, buyer, SubjectStatus::Accepted));

    let transport = gw.connect(&buyer).await;
    let err = transport
        .prepare(ActionType::MarkPaid, "43/../42", PrepareParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Remote { retryable: false, .. }), "got {err:?}");
    assert!(err.to_string().contains("invalid subject id"), "got {err}");
    assert!(gw.state.pending.is_empty());
    assert_eq!(gw.state.services.inflight.len(), 0);
}

#[tokio::test]
async fn test_stranger_cannot_block_the_buyer() {
    let gw = Gateway::start().await;
    let (_, seller) = wallet();
    let (buyer_key, buyer) = wallet();
    let (_, stranger) = wallet();
    gw.ledger.insert_subject(trade(seller, buyer, SubjectStatus::Accepted));

    // A request held open by someone else under the same action key
    let _held = gw
        .state
        .services
        .inflight
        .try_acquire(stranger, ActionKey::new(ActionType::MarkPaid, "42"), RequestKind::Prepare)
        .unwrap();

    let flow = ClientSigningFlow::new(gw.connect(&buyer).await, Arc::new(buyer_key));
    let outcome = flow
        .run(ActionType::MarkPaid, "42", PrepareParams::default())
        .await;
    assert!(matches!(outcome, Outcome::Success { .. }), "got {outcome:?}");
    assert_eq!(gw.ledger.subject("42").unwrap().status, SubjectStatus::Paid);
}

// =============================================================================
// Fee-payer envelope (bridge)
// =============================================================================

async fn keyless_account() -> KeylessAccount {
    let clock = system_clock();
    let registry = EphemeralKeyRegistry::new(clock.clone());
    let deriver = KeylessAccountDeriver::new(
        registry.clone(),
        Arc::new(LocalPepperService::new(b"pepper-secret".to_vec())),
        clock,
    );
    let ephemeral = registry.create(Duration::from_secs(600));
    let claims = IdentityClaims {
        iss: "https://accounts.example.com".into(),
        aud: Audience::One("wallet-app".into()),
        sub: "user-1".into(),
        nonce: ephemeral.nonce.clone(),
        exp: Some(4_000_000_000),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"provider-key"),
    )
    .unwrap();

    deriver
        .derive(&token, &ephemeral, None)
        .await
        .unwrap()
        .prove(&LocalProofService)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_bridge_transfer_through_fee_payer_envelope() {
    let gw = Gateway::start().await;
    let account = keyless_account().await;
    gw.ledger.insert_subject(SubjectState {
        subject_id: "b-7".into(),
        kind: SubjectKind::Bridge,
        status: SubjectStatus::Requested,
        initiator: account.address(),
        counterparty: None,
        escrow: [4u8; 32],
        amount: 1_000,
        token_amount: 0,
    });

    let transport = gw.connect(&account.address()).await;
    let (unused_key, _) = wallet();
    let flow = ClientSigningFlow::new(transport, Arc::new(unused_key));

    let outcome = flow
        .run_fee_payer(ActionType::BridgeTransfer, "b-7", &account)
        .await;
    assert!(matches!(outcome, Outcome::Success { .. }), "got {outcome:?}");
    assert_eq!(
        gw.ledger.subject("b-7").unwrap().status,
        SubjectStatus::Completed
    );

    let again = flow
        .run_fee_payer(ActionType::BridgeTransfer, "b-7", &account)
        .await;
    assert_eq!(again, Outcome::SuccessNoop);
}

// =============================================================================
// HTTP surface
// =============================================================================

#[tokio::test]
async fn test_upgrade_refused_without_valid_token() {
    let gw = Gateway::start().await;

    let anonymous = SessionTransport::new(gw.url(), None, TransportConfig::default());
    assert!(matches!(anonymous.open().await, Err(GatewayError::NotOpen(_))));

    let forged = SessionTransport::new(
        gw.url(),
        Some("not-a-token".into()),
        TransportConfig::default(),
    );
    assert!(matches!(forged.open().await, Err(GatewayError::NotOpen(_))));
    assert!(!forged.is_open());
}

#[tokio::test]
async fn test_health_reports_pending_stats() {
    let gw = Gateway::start().await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", gw.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["healthy"], true);
    assert_eq!(body["mode"], "development");
    assert_eq!(body["pending"]["entries"], 0);
    let sponsor = body["sponsor_address"].as_str().unwrap();
    assert!(sponsor.starts_with("0x"), "{sponsor}");
    assert_eq!(sponsor.len(), 66);
    assert!(body["timestamp"].is_string());
}

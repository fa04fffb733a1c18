//! Short-lived signing keys bound to one identity-provider login.
//!
//! The key's nonce is committed into the identity token by the provider, so a
//! token is only usable together with the ephemeral key it was issued for.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use ed25519_dalek::SigningKey;
use tracing::debug;

use crate::clock::SharedClock;
use crate::crypto::{generate_keypair, generate_random_bytes, sha3_256, sign_payload};

/// Domain prefix of the nonce hash
pub const NONCE_DOMAIN: &[u8] = b"EPHEMERAL_NONCE";

/// Blinder width in bytes
pub const BLINDER_LEN: usize = 31;

/// Default lifetime of an ephemeral key
pub const DEFAULT_EPHEMERAL_TTL: Duration = Duration::from_secs(60 * 60);

/// Ephemeral key pair plus the nonce the identity token must carry
#[derive(Clone)]
pub struct EphemeralKeyPair {
    signing_key: SigningKey,
    pub public_key: [u8; 32],
    pub blinder: [u8; BLINDER_LEN],
    /// Unix seconds after which the key is useless
    pub expiry_secs: u64,
    pub nonce: String,
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("nonce", &self.nonce)
            .field("expiry_secs", &self.expiry_secs)
            .finish_non_exhaustive()
    }
}

impl EphemeralKeyPair {
    pub fn new(signing_key: SigningKey, blinder: [u8; BLINDER_LEN], expiry_secs: u64) -> Self {
        let public_key = signing_key.verifying_key().to_bytes();
        let nonce = compute_nonce(&public_key, expiry_secs, &blinder);
        Self {
            signing_key,
            public_key,
            blinder,
            expiry_secs,
            nonce,
        }
    }

    pub fn generate(expiry_secs: u64) -> Self {
        let (signing_key, _) = generate_keypair();
        Self::new(signing_key, generate_random_bytes(), expiry_secs)
    }

    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.expiry_secs
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        sign_payload(&self.signing_key, message).to_bytes()
    }
}

/// `base64url(sha3("EPHEMERAL_NONCE" || public_key || expiry_be || blinder))`
pub fn compute_nonce(public_key: &[u8; 32], expiry_secs: u64, blinder: &[u8]) -> String {
    let digest = sha3_256(&[NONCE_DOMAIN, public_key, &expiry_secs.to_be_bytes(), blinder]);
    URL_SAFE_NO_PAD.encode(digest)
}

/// Ephemeral keys awaiting an identity token, keyed by nonce
pub struct EphemeralKeyRegistry {
    keys: DashMap<String, EphemeralKeyPair>,
    clock: SharedClock,
}

impl EphemeralKeyRegistry {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            keys: DashMap::new(),
            clock,
        })
    }

    /// Create and remember a key valid for `ttl` from now
    pub fn create(&self, ttl: Duration) -> EphemeralKeyPair {
        let expiry_secs = self.clock.now_secs() + ttl.as_secs();
        let pair = EphemeralKeyPair::generate(expiry_secs);
        self.keys.insert(pair.nonce.clone(), pair.clone());
        debug!(nonce = %pair.nonce, expiry_secs, "Ephemeral key created");
        pair
    }

    /// Look up a live key; expired keys are ignored
    pub fn get(&self, nonce: &str) -> Option<EphemeralKeyPair> {
        let now = self.clock.now_secs();
        self.keys
            .get(nonce)
            .filter(|pair| !pair.is_expired(now))
            .map(|pair| pair.clone())
    }

    /// Remove a key, returning it if it was still live
    pub fn take(&self, nonce: &str) -> Option<EphemeralKeyPair> {
        let now = self.clock.now_secs();
        self.keys
            .remove(nonce)
            .map(|(_, pair)| pair)
            .filter(|pair| !pair.is_expired(now))
    }

    /// Drop expired keys; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.keys.len();
        self.keys.retain(|_, pair| !pair.is_expired(now));
        before - self.keys.len()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

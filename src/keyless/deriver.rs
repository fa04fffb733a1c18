//! Keyless account derivation.
//!
//! An identity token plus the ephemeral key whose nonce it carries yields a
//! ledger account. Deriving gives an [`UnprovedKeylessAccount`]; only after
//! the proving service vouches for the token/key binding does it become a
//! [`KeylessAccount`] that can sign.

use std::sync::Arc;

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ephemeral::{EphemeralKeyPair, EphemeralKeyRegistry};
use super::services::{Pepper, PepperService, ProofRequest, ProofService};
use crate::clock::SharedClock;
use crate::crypto::sha3_256;
use crate::envelope::{KeylessAuthenticator, KeylessPublicKey, KeylessSignature};
use crate::types::{GatewayError, Result};
use crate::wire::{address_to_hex, Address};

/// Domain prefix of the identity commitment
pub const IDC_DOMAIN: &[u8] = b"KEYLESS_IDC";

/// Claim the identity commitment is keyed on
pub const UID_KEY: &str = "sub";

/// `aud` may be a single string or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

/// Claims read from the identity provider's token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub iss: String,
    pub aud: Audience,
    pub sub: String,
    pub nonce: String,
    #[serde(default)]
    pub exp: Option<u64>,
}

impl IdentityClaims {
    /// Audience the account is bound to (the first one if several)
    pub fn audience(&self) -> &str {
        match &self.aud {
            Audience::One(aud) => aud,
            Audience::Many(list) => list.first().map(String::as_str).unwrap_or(""),
        }
    }
}

/// Read claims without checking the provider's signature.
///
/// Signature checking belongs to the identity layer; the prover re-checks
/// the token against the provider's keys anyway.
pub fn decode_identity_token(token: &str) -> Result<IdentityClaims> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<IdentityClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| GatewayError::IdentityToken(e.to_string()))
}

/// `sha3("KEYLESS_IDC" || pepper || aud || "sub" || sub)`
pub fn identity_commitment(pepper: &Pepper, claims: &IdentityClaims) -> [u8; 32] {
    sha3_256(&[
        IDC_DOMAIN,
        pepper,
        claims.audience().as_bytes(),
        UID_KEY.as_bytes(),
        claims.sub.as_bytes(),
    ])
}

/// Derived account that has not been proved yet and cannot sign
#[derive(Debug, Clone)]
pub struct UnprovedKeylessAccount {
    pub public_key: KeylessPublicKey,
    pub address: Address,
    pub claims: IdentityClaims,
    identity_token: String,
    ephemeral: EphemeralKeyPair,
    pepper: Pepper,
}

impl UnprovedKeylessAccount {
    /// Obtain a proof and turn this into a signing account
    pub async fn prove(self, prover: &dyn ProofService) -> Result<KeylessAccount> {
        let request = ProofRequest {
            jwt: self.identity_token.clone(),
            ephemeral_public_key: self.ephemeral.public_key,
            expiry_secs: self.ephemeral.expiry_secs,
            blinder: self.ephemeral.blinder,
            pepper: self.pepper,
            identity_commitment: self.public_key.identity_commitment,
        };
        let proof = prover.prove(&request).await?;
        if proof.is_empty() {
            return Err(GatewayError::ProofUnavailable("prover returned an empty proof".into()));
        }
        info!(address = %address_to_hex(&self.address), "Keyless account proved");
        Ok(KeylessAccount {
            public_key: self.public_key,
            address: self.address,
            ephemeral: self.ephemeral,
            proof,
        })
    }
}

/// Proved keyless account, able to produce account authenticators
#[derive(Debug, Clone)]
pub struct KeylessAccount {
    pub public_key: KeylessPublicKey,
    pub address: Address,
    ephemeral: EphemeralKeyPair,
    proof: Vec<u8>,
}

impl KeylessAccount {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn expiry_secs(&self) -> u64 {
        self.ephemeral.expiry_secs
    }

    /// Sign `message` with the ephemeral key and return the encoded
    /// single-key keyless account authenticator
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        KeylessAuthenticator {
            public_key: self.public_key.clone(),
            signature: KeylessSignature {
                proof: self.proof.clone(),
                expiry_secs: self.ephemeral.expiry_secs,
                ephemeral_public_key: self.ephemeral.public_key,
                ephemeral_signature: self.ephemeral.sign(message),
            },
        }
        .encode()
    }
}

/// Turns identity tokens into keyless accounts
pub struct KeylessAccountDeriver {
    registry: Arc<EphemeralKeyRegistry>,
    pepper_service: Arc<dyn PepperService>,
    clock: SharedClock,
}

impl KeylessAccountDeriver {
    pub fn new(
        registry: Arc<EphemeralKeyRegistry>,
        pepper_service: Arc<dyn PepperService>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            pepper_service,
            clock,
        }
    }

    /// Derive the account for `identity_token` issued against `ephemeral`.
    ///
    /// `pepper` is fetched from the pepper service when not supplied. On
    /// success the ephemeral key is removed from the registry.
    pub async fn derive(
        &self,
        identity_token: &str,
        ephemeral: &EphemeralKeyPair,
        pepper: Option<Pepper>,
    ) -> Result<UnprovedKeylessAccount> {
        let claims = decode_identity_token(identity_token)?;

        if claims.nonce != ephemeral.nonce {
            return Err(GatewayError::NonceMismatch);
        }
        let now = self.clock.now_secs();
        if ephemeral.is_expired(now) {
            return Err(GatewayError::EphemeralExpired);
        }
        if claims.exp.is_some_and(|exp| exp <= now) {
            return Err(GatewayError::IdentityToken("token expired".into()));
        }

        let pepper = match pepper {
            Some(pepper) => pepper,
            None => {
                self.pepper_service
                    .fetch_pepper(identity_token, &claims)
                    .await?
            }
        };

        let public_key = KeylessPublicKey {
            issuer: claims.iss.clone(),
            identity_commitment: identity_commitment(&pepper, &claims),
        };
        let address = public_key.address();

        self.registry.take(&ephemeral.nonce);
        debug!(iss = %claims.iss, address = %address_to_hex(&address), "Keyless account derived");

        Ok(UnprovedKeylessAccount {
            public_key,
            address,
            claims,
            identity_token: identity_token.to_string(),
            ephemeral: ephemeral.clone(),
            pepper,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::verify_signature;
    use crate::keyless::services::{LocalPepperService, LocalProofService};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::Duration;

    fn token(nonce: &str, sub: &str) -> String {
        token_expiring(nonce, sub, Some(4_000_000_000))
    }

    fn token_expiring(nonce: &str, sub: &str, exp: Option<u64>) -> String {
        let claims = IdentityClaims {
            iss: "https://accounts.example.com".into(),
            aud: Audience::One("wallet-app".into()),
            sub: sub.into(),
            nonce: nonce.into(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"provider-key"),
        )
        .unwrap()
    }

    fn setup() -> (ManualClock, Arc<EphemeralKeyRegistry>, KeylessAccountDeriver) {
        let clock = ManualClock::new(1_700_000_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let registry = EphemeralKeyRegistry::new(shared.clone());
        let deriver = KeylessAccountDeriver::new(
            registry.clone(),
            Arc::new(LocalPepperService::new(b"pepper-secret".to_vec())),
            shared,
        );
        (clock, registry, deriver)
    }

    #[test]
    fn test_decode_identity_token_ignores_signature() {
        let claims = decode_identity_token(&token("abc", "user-1")).unwrap();
        assert_eq!(claims.nonce, "abc");
        assert_eq!(claims.audience(), "wallet-app");
        assert!(decode_identity_token("not-a-jwt").is_err());
    }

    #[tokio::test]
    async fn test_derive_is_deterministic_per_identity() {
        let (_, registry, deriver) = setup();
        let first = registry.create(Duration::from_secs(600));
        let second = registry.create(Duration::from_secs(600));

        let a = deriver
            .derive(&token(&first.nonce, "user-1"), &first, None)
            .await
            .unwrap();
        let b = deriver
            .derive(&token(&second.nonce, "user-1"), &second, None)
            .await
            .unwrap();
        assert_eq!(a.address, b.address);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_nonce_mismatch() {
        let (_, registry, deriver) = setup();
        let pair = registry.create(Duration::from_secs(600));
        let err = deriver
            .derive(&token("some-other-nonce", "user-1"), &pair, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NonceMismatch));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_ephemeral_key() {
        let (clock, registry, deriver) = setup();
        let pair = registry.create(Duration::from_secs(60));
        clock.advance(Duration::from_secs(120));
        let err = deriver
            .derive(&token(&pair.nonce, "user-1"), &pair, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::EphemeralExpired));
    }

    #[tokio::test]
    async fn test_expired_identity_token() {
        let (clock, registry, deriver) = setup();
        let pair = registry.create(Duration::from_secs(600));

        // ManualClock starts at 1_700_000_000 s
        let stale = token_expiring(&pair.nonce, "user-1", Some(1_699_999_000));
        let err = deriver.derive(&stale, &pair, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::IdentityToken(_)), "got {err:?}");

        let fresh = token_expiring(&pair.nonce, "user-1", Some(1_700_000_060));
        assert!(deriver.derive(&fresh, &pair, None).await.is_ok());

        // A token without `exp` is bounded by the ephemeral key alone
        let pair = registry.create(Duration::from_secs(600));
        clock.advance(Duration::from_secs(120));
        let open_ended = token_expiring(&pair.nonce, "user-1", None);
        assert!(deriver.derive(&open_ended, &pair, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_proved_account_signs_with_ephemeral_key() {
        let (_, registry, deriver) = setup();
        let pair = registry.create(Duration::from_secs(600));
        let account = deriver
            .derive(&token(&pair.nonce, "user-1"), &pair, Some([7u8; 32]))
            .await
            .unwrap()
            .prove(&LocalProofService)
            .await
            .unwrap();

        let auth = KeylessAuthenticator::decode(&account.sign(b"message")).unwrap();
        assert_eq!(auth.public_key.address(), account.address());
        assert_eq!(auth.signature.ephemeral_public_key, pair.public_key);
        assert!(!auth.signature.proof.is_empty());
        assert!(verify_signature(
            &auth.signature.ephemeral_public_key,
            b"message",
            &auth.signature.ephemeral_signature
        ));
    }
}

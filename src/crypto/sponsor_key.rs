//! Sponsor key material.
//!
//! The sponsor key is read-only after startup and is shared by every session;
//! Ed25519 signing is a pure function of key and message, so no lock is
//! taken around it.
//!
//! On disk the key lives in a small JSON file encrypted under a passphrase
//! (Argon2id + ChaCha20-Poly1305), same scheme as the custodial key bundles.

use std::path::Path;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroize;

use super::primitives::{
    decrypt_private_key, derive_key_encryption_key, ed25519_address, encrypt_private_key,
    generate_keypair, generate_random_bytes, sign_payload, NONCE_LEN, PRIVATE_KEY_LEN,
    PUBLIC_KEY_LEN, SALT_LEN, SIGNATURE_LEN,
};
use crate::types::{GatewayError, Result};
use crate::wire::{address_to_hex, Address};

/// Fee-paying signer
pub struct SponsorSigner {
    key: SigningKey,
    address: Address,
}

impl std::fmt::Debug for SponsorSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SponsorSigner")
            .field("address", &address_to_hex(&self.address))
            .finish_non_exhaustive()
    }
}

impl SponsorSigner {
    pub fn new(key: SigningKey) -> Self {
        let address = ed25519_address(&key.verifying_key());
        Self { key, address }
    }

    /// Fresh random sponsor (dev mode and tests)
    pub fn generate() -> Self {
        let (key, _) = generate_keypair();
        Self::new(key)
    }

    /// Build from a hex-encoded 32-byte secret
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let mut bytes = hex::decode(secret_hex.trim().trim_start_matches("0x"))
            .map_err(|e| GatewayError::Config(format!("sponsor secret is not hex: {e}")))?;
        if bytes.len() != PRIVATE_KEY_LEN {
            bytes.zeroize();
            return Err(GatewayError::Config(format!(
                "sponsor secret must be {PRIVATE_KEY_LEN} bytes"
            )));
        }
        let mut secret = [0u8; PRIVATE_KEY_LEN];
        secret.copy_from_slice(&bytes);
        bytes.zeroize();
        let signer = Self::new(SigningKey::from_bytes(&secret));
        secret.zeroize();
        Ok(signer)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        sign_payload(&self.key, message).to_bytes()
    }
}

/// Encrypted sponsor key as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SponsorKeyFile {
    pub version: u32,
    /// Hex public key, for operators to check which sponsor a file holds
    pub public_key: String,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

impl SponsorKeyFile {
    /// Encrypt a signing key under `passphrase`
    pub fn seal(key: &SigningKey, passphrase: &str) -> Result<Self> {
        let salt: [u8; SALT_LEN] = generate_random_bytes();
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();
        let mut kek = derive_key_encryption_key(passphrase.as_bytes(), &salt)?;
        let mut secret = key.to_bytes();
        let ciphertext = encrypt_private_key(&secret, &kek, &nonce);
        secret.zeroize();
        kek.zeroize();

        Ok(Self {
            version: 1,
            public_key: hex::encode(key.verifying_key().as_bytes()),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext?),
        })
    }

    /// Decrypt into a signer
    pub fn open(&self, passphrase: &str) -> Result<SponsorSigner> {
        let salt = decode_hex_field(&self.salt, "salt")?;
        let nonce: [u8; NONCE_LEN] = decode_hex_field(&self.nonce, "nonce")?
            .try_into()
            .map_err(|_| GatewayError::Config("sponsor key nonce has wrong length".into()))?;
        let ciphertext = decode_hex_field(&self.ciphertext, "ciphertext")?;

        let mut kek = derive_key_encryption_key(passphrase.as_bytes(), &salt)?;
        let secret = decrypt_private_key(&ciphertext, &kek, &nonce);
        kek.zeroize();
        let mut secret = secret?;

        let signer = SponsorSigner::new(SigningKey::from_bytes(&secret));
        secret.zeroize();

        if hex::encode(signer.public_key()) != self.public_key {
            return Err(GatewayError::Config(
                "sponsor key file public key does not match decrypted key".into(),
            ));
        }
        Ok(signer)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| GatewayError::Internal(format!("serialize key file: {e}")))?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), public_key = %self.public_key, "Sponsor key file written");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read sponsor key file {}: {e}", path.display()))
        })?;
        serde_json::from_str(&json)
            .map_err(|e| GatewayError::Config(format!("invalid sponsor key file: {e}")))
    }
}

fn decode_hex_field(value: &str, field: &str) -> Result<Vec<u8>> {
    hex::decode(value)
        .map_err(|e| GatewayError::Config(format!("sponsor key file {field} is not hex: {e}")))
}

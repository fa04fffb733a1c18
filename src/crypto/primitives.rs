//! Cryptographic primitives shared by the sponsor, the ledger codec and the
//! keyless deriver.
//!
//! # Algorithms
//!
//! - **Signing**: Ed25519 (sponsor key, wallet keys, ephemeral keys)
//! - **Hashing**: SHA3-256 for everything the ledger sees
//! - **Key Derivation**: Argon2id for the sponsor key file passphrase
//! - **Encryption**: ChaCha20-Poly1305 for the sponsor key at rest

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Sha3_256};

use crate::types::{GatewayError, Result};
use crate::wire::Address;

// =============================================================================
// Constants
// =============================================================================

/// Argon2id memory cost in KiB (64 MB)
pub const ARGON2_MEMORY_KB: u32 = 65536;

/// Argon2id iteration count
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id parallelism (threads)
pub const ARGON2_PARALLELISM: u32 = 4;

/// Salt length for key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Ed25519 private key length (32 bytes)
pub const PRIVATE_KEY_LEN: usize = 32;

/// Ed25519 public key length (32 bytes)
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature length (64 bytes)
pub const SIGNATURE_LEN: usize = 64;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// Address scheme byte for plain Ed25519 accounts
pub const SCHEME_ED25519: u8 = 0x00;

/// Address scheme byte for single-key accounts (keyless)
pub const SCHEME_SINGLE_KEY: u8 = 0x02;

// =============================================================================
// Key Generation
// =============================================================================

/// Generate a new Ed25519 signing keypair from the OS RNG.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// =============================================================================
// Hashing and addresses
// =============================================================================

/// SHA3-256 over the concatenation of `parts`
pub fn sha3_256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Ledger account address for a public key under the given scheme.
pub fn account_address(public_key_bytes: &[u8], scheme: u8) -> Address {
    sha3_256(&[public_key_bytes, &[scheme]])
}

/// Address of a plain Ed25519 account
pub fn ed25519_address(verifying_key: &VerifyingKey) -> Address {
    account_address(verifying_key.as_bytes(), SCHEME_ED25519)
}

// =============================================================================
// Signing
// =============================================================================

/// Sign a payload with an Ed25519 private key.
pub fn sign_payload(signing_key: &SigningKey, payload: &[u8]) -> Signature {
    signing_key.sign(payload)
}

/// Verify an Ed25519 signature given raw key and signature bytes.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(pk): std::result::Result<[u8; PUBLIC_KEY_LEN], _> = public_key.try_into() else {
        return false;
    };
    let Ok(sig): std::result::Result<[u8; SIGNATURE_LEN], _> = signature.try_into() else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pk) else {
        return false;
    };
    verifying_key
        .verify(message, &Signature::from_bytes(&sig))
        .is_ok()
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Derive a 256-bit encryption key from a passphrase using Argon2id.
///
/// Used to unlock the sponsor key file at startup.
pub fn derive_key_encryption_key(passphrase: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let params = Params::new(
        ARGON2_MEMORY_KB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(32),
    )
    .map_err(|e| GatewayError::Internal(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|e| GatewayError::Internal(format!("Key derivation failed: {e}")))?;

    Ok(key)
}

// =============================================================================
// Encryption / Decryption
// =============================================================================

/// Encrypt a private key using ChaCha20-Poly1305.
///
/// Returns 48 bytes: the encrypted key followed by the auth tag.
pub fn encrypt_private_key(
    private_key: &[u8; PRIVATE_KEY_LEN],
    encryption_key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(encryption_key));
    cipher
        .encrypt(Nonce::from_slice(nonce), private_key.as_slice())
        .map_err(|e| GatewayError::Internal(format!("Encryption failed: {e}")))
}

/// Decrypt a private key using ChaCha20-Poly1305.
///
/// Fails if the ciphertext was tampered with or the passphrase was wrong.
pub fn decrypt_private_key(
    ciphertext: &[u8],
    encryption_key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
) -> Result<[u8; PRIVATE_KEY_LEN]> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(encryption_key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| GatewayError::Config("Failed to decrypt sponsor key (wrong passphrase?)".into()))?;

    if plaintext.len() != PRIVATE_KEY_LEN {
        return Err(GatewayError::Internal(format!(
            "Invalid decrypted key length: expected {}, got {}",
            PRIVATE_KEY_LEN,
            plaintext.len()
        )));
    }

    let mut key = [0u8; PRIVATE_KEY_LEN];
    key.copy_from_slice(&plaintext);
    Ok(key)
}

// =============================================================================
// Tests
// =============================================================================

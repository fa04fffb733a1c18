//! Key material and hashing
//!
//! The sponsor holds one Ed25519 key that co-signs every sponsored group and
//! fee-payer envelope. Wallet keys never reach the gateway; only their
//! signatures do.

pub mod primitives;
pub mod sponsor_key;

pub use primitives::{
    account_address, ed25519_address, generate_keypair, generate_random_bytes, sha3_256,
    sign_payload, verify_signature, PUBLIC_KEY_LEN, SCHEME_ED25519, SCHEME_SINGLE_KEY,
    SIGNATURE_LEN,
};
pub use sponsor_key::{SponsorKeyFile, SponsorSigner};

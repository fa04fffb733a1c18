//! Keyless (identity-token-delegated) accounts for the bridge path.

pub mod deriver;
pub mod ephemeral;
pub mod services;

pub use deriver::{
    decode_identity_token, identity_commitment, Audience, IdentityClaims, KeylessAccount,
    KeylessAccountDeriver, UnprovedKeylessAccount,
};
pub use ephemeral::{compute_nonce, EphemeralKeyPair, EphemeralKeyRegistry, DEFAULT_EPHEMERAL_TTL};
pub use services::{
    HttpPepperService, HttpProofService, LocalPepperService, LocalProofService, Pepper,
    PepperService, ProofRequest, ProofService,
};

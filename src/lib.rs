//! Sponsor gateway - fee-sponsored ledger actions for non-custodial clients
//!
//! A client holding only a user signing key performs ledger actions
//! (escrow creation and acceptance, marking a trade paid, payment release,
//! withdrawal, token purchase, bridge transfers) without paying network
//! fees. The gateway prepares each action as an ordered transaction group,
//! co-signs the sponsor's slots, and submits the group once the client has
//! signed its own slots exactly as prepared.
//!
//! ## Components
//!
//! - **prepare**: builds groups from ledger state; idempotent per action key
//! - **cache**: prepared user slots awaiting signature, consumed once
//! - **submit**: checks returned bytes and forwards groups to the ledger
//! - **envelope**: fee-payer envelope assembly for the bridge path
//! - **keyless**: identity-token-delegated accounts and ephemeral keys
//! - **session** / **server**: the WebSocket protocol and HTTP surface
//! - **client**: the wallet-side transport and signing flow

pub mod auth;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod keyless;
pub mod ledger;
pub mod prepare;
pub mod server;
pub mod session;
pub mod submit;
pub mod types;
pub mod wire;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{GatewayError, Outcome, Result};

//! Wallet-side half: the session transport and the signing flow.

pub mod flow;
pub mod transport;

pub use flow::{sign_group, ClientSigningFlow, TransactionSigner};
pub use transport::{SessionTransport, TransportConfig};

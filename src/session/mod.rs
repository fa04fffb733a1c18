//! Session protocol: wire messages, the single-flight guard and the
//! server-side connection handler.

pub mod handler;
pub mod inflight;
pub mod messages;

pub use handler::{run_session, SessionServices};
pub use inflight::{InFlightGuard, InFlightPermit};
pub use messages::{ClientMessage, Pack, RequestKind, ServerMessage, SlotMessage};

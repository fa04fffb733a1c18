//! HTTP server: `/health` and the `/session` WebSocket upgrade

pub mod health;
pub mod http;
pub mod websocket;

pub use http::{run, serve, AppState, GatewayParts};

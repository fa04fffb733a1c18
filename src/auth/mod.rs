//! Session authentication
//!
//! Provides JWT validation for WebSocket session upgrades and bearer
//! token extraction from headers and query strings.

pub mod jwt;

pub use jwt::{extract_token_from_header, extract_token_from_query, Claims, JwtValidator};

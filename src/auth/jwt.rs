//! Gateway session tokens.
//!
//! A session token names the ledger account the caller acts as. The
//! preparer checks that account against the party an action requires, so
//! the token is the only source of the caller's address.
//!
//! Tokens are HS256 with a shared secret; the login service that issues
//! them sits outside this crate (`issue` exists for it and for tests).

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::types::{GatewayError, Result};
use crate::wire::{address_from_hex, Address};

/// Payload stored in a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User identifier
    pub sub: String,
    /// Ledger account address (hex)
    pub address: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

impl Claims {
    /// Account address the caller acts as
    pub fn account(&self) -> Result<Address> {
        address_from_hex(&self.address)
            .map_err(|_| GatewayError::Unauthorized("token carries an invalid address".into()))
    }
}

#[derive(Clone)]
pub struct JwtValidator {
    secret: String,
    expiry_seconds: u64,
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("expiry_seconds", &self.expiry_seconds)
            .finish_non_exhaustive()
    }
}

impl JwtValidator {
    /// Returns an error if the secret is empty or too short
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self> {
        if secret.is_empty() {
            return Err(GatewayError::Config(
                "JWT_SECRET is required in production mode".into(),
            ));
        }
        if secret.len() < 32 {
            return Err(GatewayError::Config(
                "JWT_SECRET must be at least 32 characters".into(),
            ));
        }
        Ok(Self {
            secret,
            expiry_seconds,
        })
    }

    /// Validator for dev mode
    pub fn new_dev() -> Self {
        Self {
            secret: "dev-mode-secret-not-for-production-use-123456".into(),
            expiry_seconds: 3600,
        }
    }

    /// Issue a session token for `sub` acting as `address`
    pub fn issue(&self, sub: &str, address: &Address) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| GatewayError::Internal(format!("System time error: {e}")))?
            .as_secs();

        let claims = Claims {
            sub: sub.to_string(),
            address: hex::encode(address),
            iat: now,
            exp: now + self.expiry_seconds,
        };

        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?)
    }

    /// Verify signature and expiry, returning the claims
    pub fn validate(&self, token: &str) -> Result<Claims> {
        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        ) {
            Ok(data) => Ok(data.claims),
            Err(err) => {
                use jsonwebtoken::errors::ErrorKind;
                let msg = match err.kind() {
                    ErrorKind::ExpiredSignature => "Token expired",
                    ErrorKind::InvalidToken => "Invalid token",
                    ErrorKind::InvalidSignature => "Invalid signature",
                    _ => "Token validation failed",
                };
                Err(GatewayError::Unauthorized(msg.into()))
            }
        }
    }
}

/// Extract token from an Authorization header.
/// Supports "Bearer <token>" and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    if !header.contains(' ') {
        let token = header.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    None
}

/// Extract a parameter from a URI query string
pub fn extract_token_from_query<'a>(query: Option<&'a str>, param_name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|param| param.split_once('='))
        .find(|(key, value)| *key == param_name && !value.is_empty())
        .map(|(_, value)| value)
}

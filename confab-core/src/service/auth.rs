//! Token validation for the authenticated chat surface.
//!
//! Tokens are HS256 JWTs signed with the shared deployment secret. The
//! backend only reads identity claims; it never issues tokens.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{Error, Result};

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Stable principal id.
    pub sub: String,
    /// Wallet flavour the principal authenticated with, when present.
    #[serde(rename = "walletType", default)]
    pub wallet_type: Option<String>,
    #[serde(default)]
    pub iat: Option<i64>,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenValidator {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator").finish()
    }
}

impl TokenValidator {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Internal(
                "JWT secret cannot be empty".to_string(),
            ));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Ok(Self {
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation,
        })
    }

    /// Validate a token and return its claims.
    pub fn validate(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| Error::AuthFailed(e.to_string()))?;

        if data.claims.sub.is_empty() {
            return Err(Error::AuthFailed("Token has empty subject".to_string()));
        }

        Ok(data.claims)
    }
}

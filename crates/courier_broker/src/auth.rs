//! Token authentication
//!
//! HS256 JWTs signed with the broker's `server.auth_secret`. The broker only
//! checks the signature and expiry; the subject is logged but not authorized
//! against anything.

use jsonwebtoken::errors::Error as JwtError;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Mint a token for `subject` valid for `ttl`.
pub fn issue_token(secret: &str, subject: &str, ttl: chrono::Duration) -> Result<String, JwtError> {
    let claims = Claims {
        sub: subject.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp().max(0) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Validate a token and return its claims.
pub fn validate_token(secret: &str, token: &str) -> Result<Claims, JwtError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

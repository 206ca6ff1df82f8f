//! Client token validation.
//!
//! Tokens are issued by the account service (an external collaborator); the
//! Hub only needs to verify them and read the identity they carry.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims carried by a client access token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// User ID as issued by the account service
    #[serde(rename = "userID")]
    pub user_id: String,
    pub username: String,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Validate and decode an HS256 JWT token.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

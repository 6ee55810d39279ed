use std::collections::HashSet;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::TokenError;

/// Claims carried by a lobby bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyClaims {
    #[serde(rename = "lobbyId")]
    pub lobby_id: String,
    pub username: String,
}

/// Derives the per-lobby signing key as hex(salt ∥ id ∥ createdUnixSeconds).
/// A recycled lobby id yields a different key because the creation timestamp
/// differs, invalidating tokens from prior lifetimes.
pub fn derive_key(salt: &[u8], lobby_id: &str, created_unix: i64) -> Vec<u8> {
    let mut material = Vec::with_capacity(salt.len() + lobby_id.len() + 20);
    material.extend_from_slice(salt);
    material.extend_from_slice(lobby_id.as_bytes());
    material.extend_from_slice(created_unix.to_string().as_bytes());
    hex::encode(material).into_bytes()
}

pub fn sign(key: &[u8], claims: &LobbyClaims) -> Result<String, TokenError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(key),
    )
    .map_err(TokenError::Invalid)
}

/// Validates a token signature and claim set, then checks the lobby binding.
pub fn verify(key: &[u8], token: &str, lobby_id: &str) -> Result<LobbyClaims, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims = HashSet::new();
    validation.validate_exp = false;
    validation.validate_aud = false;

    let data = decode::<LobbyClaims>(token, &DecodingKey::from_secret(key), &validation)
        .map_err(|e| match e.kind() {
            // Missing or non-string claims fail deserialization.
            ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => {
                TokenError::InvalidClaims(e)
            }
            _ => TokenError::Invalid(e),
        })?;

    if data.claims.lobby_id != lobby_id {
        return Err(TokenError::LobbyMismatch);
    }

    Ok(data.claims)
}

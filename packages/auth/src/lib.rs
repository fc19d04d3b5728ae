#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

//! Access token verification for gateway connections.
//!
//! Tokens are verified once per connection attempt, before any room operation
//! is permitted. A connection that fails verification is never registered.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authenticated identity derived from a verified token.
///
/// Immutable for the lifetime of the connection it was verified for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub email: String,
}

/// Errors that can occur when authenticating a connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token was presented in any of the accepted locations
    #[error("unauthorized: missing token")]
    MissingToken,
    /// The token was malformed, had an invalid signature, or was expired
    #[error("unauthorized: invalid token")]
    InvalidToken,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: String,
    exp: u64,
}

/// Extract a bearer token from the connection handshake.
///
/// Locations are checked in priority order: the explicit `auth` field, the
/// `Authorization` header (with or without a "Bearer" prefix), then the
/// `token` query parameter. First non-empty wins.
///
/// # Errors
///
/// * [`AuthError::MissingToken`] if no location holds a non-empty token
pub fn extract_token<'a>(
    auth: Option<&'a str>,
    authorization_header: Option<&'a str>,
    token_param: Option<&'a str>,
) -> Result<&'a str, AuthError> {
    if let Some(auth) = auth
        && !auth.is_empty()
    {
        return Ok(auth);
    }

    if let Some(header) = authorization_header {
        let token = if header.to_lowercase().starts_with("bearer") {
            header[6..].trim_start()
        } else {
            header
        };
        if !token.is_empty() {
            return Ok(token);
        }
    }

    if let Some(token) = token_param
        && !token.is_empty()
    {
        return Ok(token);
    }

    Err(AuthError::MissingToken)
}

/// Verifies signed access tokens against a shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{TokenVerifier}}")
    }
}

impl TokenVerifier {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify the signature and expiry of a raw token and return the identity
    /// carried by its claims.
    ///
    /// # Errors
    ///
    /// * [`AuthError::InvalidToken`] on signature mismatch, malformed
    ///   structure, or expiry in the past
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            log::debug!("Failed to verify token: {e:?}");
            AuthError::InvalidToken
        })?;

        Ok(Identity {
            user_id: data.claims.sub,
            email: data.claims.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{EncodingKey, Header, encode};
    use pretty_assertions::assert_eq;

    use super::*;

    fn make_token(secret: &str, sub: &str, email: &str, exp: i64) -> String {
        let claims = serde_json::json!({
            "sub": sub,
            "email": email,
            "exp": exp,
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test_log::test]
    fn verify_returns_stable_identity_for_same_token() {
        let verifier = TokenVerifier::new("secret");
        let token = make_token("secret", "user-1", "a@example.com", future_exp());

        let first = verifier.verify(&token).unwrap();
        let second = verifier.verify(&token).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.user_id, "user-1");
        assert_eq!(first.email, "a@example.com");
    }

    #[test_log::test]
    fn verify_fails_on_tampered_signature() {
        let verifier = TokenVerifier::new("secret");
        let token = make_token("other-secret", "user-1", "a@example.com", future_exp());

        assert_eq!(verifier.verify(&token), Err(AuthError::InvalidToken));
    }

    #[test_log::test]
    fn verify_fails_on_expired_token() {
        let verifier = TokenVerifier::new("secret");
        let expired = chrono::Utc::now().timestamp() - 3600;
        let token = make_token("secret", "user-1", "a@example.com", expired);

        assert_eq!(verifier.verify(&token), Err(AuthError::InvalidToken));
    }

    #[test_log::test]
    fn verify_fails_on_malformed_token() {
        let verifier = TokenVerifier::new("secret");

        assert_eq!(verifier.verify("not-a-jwt"), Err(AuthError::InvalidToken));
    }

    #[test_log::test]
    fn verify_defaults_missing_email_claim() {
        let verifier = TokenVerifier::new("secret");
        let claims = serde_json::json!({ "sub": "user-1", "exp": future_exp() });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let identity = verifier.verify(&token).unwrap();

        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.email, "");
    }

    #[test_log::test]
    fn extract_prefers_auth_field() {
        let token = extract_token(Some("a"), Some("Bearer b"), Some("c")).unwrap();
        assert_eq!(token, "a");
    }

    #[test_log::test]
    fn extract_falls_back_to_authorization_header() {
        let token = extract_token(None, Some("Bearer b"), Some("c")).unwrap();
        assert_eq!(token, "b");

        let token = extract_token(Some(""), Some("b"), None).unwrap();
        assert_eq!(token, "b");
    }

    #[test_log::test]
    fn extract_falls_back_to_query_param() {
        let token = extract_token(None, None, Some("c")).unwrap();
        assert_eq!(token, "c");
    }

    #[test_log::test]
    fn extract_fails_when_every_location_is_empty() {
        assert_eq!(
            extract_token(None, Some("Bearer "), Some("")),
            Err(AuthError::MissingToken)
        );
        assert_eq!(extract_token(None, None, None), Err(AuthError::MissingToken));
    }
}

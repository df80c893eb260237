//! Authenticated principals and the token validation seam.
//!
//! An [`Identity`] is derived once per connection from validated token
//! claims and never changes afterwards. Re-authentication requires a new
//! connection.

use crate::error::{auth_error, AuthErrorKind, Error};
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::*;
use serde::{Deserialize, Serialize};

// Type alias for user IDs (upstream services stringify their own key types)
pub type UserId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    user_id: UserId,
    display_name: String,
    is_anonymous: bool,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>, is_anonymous: bool) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            is_anonymous,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The name other users may see, `None` for anonymous identities.
    pub fn public_name(&self) -> Option<String> {
        (!self.is_anonymous).then(|| self.display_name.clone())
    }
}

/// Turns the bearer token of an `auth` frame into an [`Identity`].
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<Identity, Error>;
}

/// Claims carried by platform access tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub anon: bool,
    pub exp: usize,
}

const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

/// Validates HS256 access tokens signed with the platform's shared secret.
pub struct JwtTokenValidator {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtTokenValidator {
    /// A validator for tokens signed with `secret`. Without a secret every
    /// token is rejected.
    pub fn new(secret: Option<&str>) -> Self {
        if secret.is_none() {
            warn!("No JWT secret configured, every WebSocket handshake will be rejected");
        }
        Self {
            key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl TokenValidator for JwtTokenValidator {
    async fn validate_token(&self, token: &str) -> Result<Identity, Error> {
        if token.trim().is_empty() {
            return Err(auth_error(AuthErrorKind::MissingToken, "Empty bearer token"));
        }

        let key = self.key.as_ref().ok_or_else(|| {
            auth_error(AuthErrorKind::InvalidToken, "Token validation is not configured")
        })?;

        let claims = decode::<AccessClaims>(token, key, &self.validation)?.claims;

        if claims.sub.is_empty() {
            return Err(auth_error(AuthErrorKind::InvalidToken, "Token has no subject"));
        }

        Ok(Identity::new(
            claims.sub,
            claims
                .name
                .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string()),
            claims.anon,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(secret: &str, sub: &str, anon: bool, exp_offset_secs: i64) -> String {
        let claims = AccessClaims {
            sub: sub.to_string(),
            name: Some("River".to_string()),
            anon,
            exp: (chrono::Utc::now().timestamp() + exp_offset_secs) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let validator = JwtTokenValidator::new(Some(SECRET));
        let identity = validator
            .validate_token(&token(SECRET, "u1", false, 3600))
            .await
            .unwrap();

        assert_eq!(identity.user_id(), "u1");
        assert_eq!(identity.public_name(), Some("River".to_string()));
    }

    #[tokio::test]
    async fn anonymous_identity_hides_public_name() {
        let validator = JwtTokenValidator::new(Some(SECRET));
        let identity = validator
            .validate_token(&token(SECRET, "u2", true, 3600))
            .await
            .unwrap();

        assert_eq!(identity.public_name(), None);
    }

    #[tokio::test]
    async fn expired_token_is_rejected_as_expired() {
        let validator = JwtTokenValidator::new(Some(SECRET));
        let err = validator
            .validate_token(&token(SECRET, "u1", false, -3600))
            .await
            .unwrap_err();

        assert_eq!(err.error_kind, ErrorKind::Auth(AuthErrorKind::Expired));
    }

    #[tokio::test]
    async fn wrong_signature_is_invalid() {
        let validator = JwtTokenValidator::new(Some(SECRET));
        let err = validator
            .validate_token(&token("other-secret", "u1", false, 3600))
            .await
            .unwrap_err();

        assert_eq!(err.error_kind, ErrorKind::Auth(AuthErrorKind::InvalidToken));
    }

    #[tokio::test]
    async fn empty_token_is_missing() {
        let validator = JwtTokenValidator::new(Some(SECRET));
        let err = validator.validate_token("  ").await.unwrap_err();

        assert_eq!(err.error_kind, ErrorKind::Auth(AuthErrorKind::MissingToken));
    }

    #[tokio::test]
    async fn unconfigured_validator_rejects_everything() {
        let validator = JwtTokenValidator::new(None);
        let err = validator
            .validate_token(&token(SECRET, "u1", false, 3600))
            .await
            .unwrap_err();

        assert_eq!(err.error_kind, ErrorKind::Auth(AuthErrorKind::InvalidToken));
    }
}

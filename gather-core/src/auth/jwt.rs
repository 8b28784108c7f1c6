use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{models::UserId, Error, Result};

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// JWT service for signing and verifying access tokens (HS256)
#[derive(Clone)]
pub struct JwtService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    access_token_duration: Duration,
}

impl std::fmt::Debug for JwtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtService")
            .field("access_token_duration", &self.access_token_duration)
            .finish()
    }
}

impl JwtService {
    #[must_use]
    pub fn new(secret: &str, access_token_duration_hours: u64) -> Self {
        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret.as_bytes())),
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            access_token_duration: Duration::hours(access_token_duration_hours as i64),
        }
    }

    /// Issue an access token for the given user
    pub fn issue_token(&self, user_id: UserId) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.0,
            iat: now.timestamp(),
            exp: (now + self.access_token_duration).timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }

    /// Verify a token and extract the user identity it carries
    pub fn verify_token(&self, token: &str) -> Result<UserId> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| Error::Authentication(format!("Invalid token: {e}")))?;

        Ok(UserId(data.claims.sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let service = JwtService::new("test-secret", 1);
        let token = service.issue_token(UserId(42)).unwrap();
        let user_id = service.verify_token(&token).unwrap();
        assert_eq!(user_id, UserId(42));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let service = JwtService::new("test-secret", 1);
        let other = JwtService::new("other-secret", 1);
        let token = service.issue_token(UserId(42)).unwrap();
        assert!(other.verify_token(&token).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let service = JwtService::new("test-secret", 1);
        assert!(service.verify_token("not-a-token").is_err());
    }
}

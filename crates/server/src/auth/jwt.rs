//! HS256 access tokens for API sessions.

use std::collections::HashSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use db::models::user::{User, UserRole};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::ErrorKind,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const AUDIENCE: &str = "feedback-hub";

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("failed to sign token: {0}")]
    Encode(jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: Uuid,
    pub org: Uuid,
    pub role: UserRole,
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct JwtService {
    secret: SecretString,
    ttl: ChronoDuration,
}

impl JwtService {
    /// `secret` is the base64 encoded signing key.
    pub fn new(secret: SecretString, ttl: ChronoDuration) -> Self {
        Self { secret, ttl }
    }

    pub fn issue(&self, user: &User) -> Result<IssuedToken, JwtError> {
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let claims = AccessTokenClaims {
            sub: user.id,
            org: user.organization_id,
            role: user.role,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            aud: AUDIENCE.to_string(),
        };

        let key = EncodingKey::from_base64_secret(self.secret.expose_secret())
            .map_err(JwtError::Encode)?;
        let access_token =
            encode(&Header::new(Algorithm::HS256), &claims, &key).map_err(JwtError::Encode)?;

        Ok(IssuedToken {
            access_token,
            token_type: "Bearer",
            expires_at,
        })
    }

    pub fn decode(&self, token: &str) -> Result<AccessTokenClaims, JwtError> {
        if token.trim().is_empty() {
            return Err(JwtError::Invalid);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.set_audience(&[AUDIENCE]);
        validation.required_spec_claims = HashSet::from([
            "sub".to_string(),
            "exp".to_string(),
            "aud".to_string(),
        ]);
        validation.leeway = 30;

        let key = DecodingKey::from_base64_secret(self.secret.expose_secret())
            .map_err(|_| JwtError::Invalid)?;
        decode::<AccessTokenClaims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTIzNDU2Nzg5MDE=";

    fn user(role: UserRole) -> User {
        User {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            email: "a@acme.test".to_string(),
            name: "A".to_string(),
            role,
            password_hash: String::new(),
            last_login_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn service(ttl: ChronoDuration) -> JwtService {
        JwtService::new(SecretString::from(SECRET.to_string()), ttl)
    }

    #[test]
    fn issued_token_decodes() {
        let jwt = service(ChronoDuration::hours(1));
        let user = user(UserRole::Admin);
        let token = jwt.issue(&user).unwrap();

        let claims = jwt.decode(&token.access_token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.org, user.organization_id);
        assert_eq!(claims.role, UserRole::Admin);
        assert_eq!(claims.exp, token.expires_at.timestamp());
    }

    #[test]
    fn expired_and_foreign_tokens_are_rejected() {
        let expired = service(ChronoDuration::hours(-1));
        let token = expired.issue(&user(UserRole::Member)).unwrap();
        assert!(matches!(
            expired.decode(&token.access_token),
            Err(JwtError::Expired)
        ));

        let other = JwtService::new(
            SecretString::from("b3RoZXItc2VjcmV0LW90aGVyLXNlY3JldC1vdGhlci0xMg==".to_string()),
            ChronoDuration::hours(1),
        );
        let token = other.issue(&user(UserRole::Member)).unwrap();
        assert!(matches!(
            service(ChronoDuration::hours(1)).decode(&token.access_token),
            Err(JwtError::Invalid)
        ));
        assert!(matches!(
            service(ChronoDuration::hours(1)).decode("  "),
            Err(JwtError::Invalid)
        ));
    }
}

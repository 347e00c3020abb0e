//! Signed session tokens.
//!
//! Tokens are HS256 JWTs keyed by the server secret. Clients treat them as
//! opaque bearer strings.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TokenError;
use crate::onboarding::model::Role;

const RANDOM_SECRET_LENGTH: usize = 48;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Account id.
    pub sub: Uuid,
    pub email: String,
    pub role: Role,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Mints and verifies session tokens with a server-side secret.
pub struct TokenIssuer {
    secret: SecretString,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: SecretString, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    /// Issuer with a random secret, for tests and throwaway deployments.
    pub fn with_random_secret(ttl: Duration) -> Self {
        use rand::Rng;
        use rand::distributions::Alphanumeric;
        let secret: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_SECRET_LENGTH)
            .map(char::from)
            .collect();
        Self::new(SecretString::from(secret), ttl)
    }

    /// Mint a token for `account_id` valid for the configured lifetime.
    pub fn issue(&self, account_id: Uuid, email: &str, role: Role) -> Result<String, TokenError> {
        self.issue_at(account_id, email, role, Utc::now())
    }

    fn issue_at(
        &self,
        account_id: Uuid,
        email: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = SessionClaims {
            sub: account_id,
            email: email.to_string(),
            role,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        let key = EncodingKey::from_secret(self.secret.expose_secret().as_bytes());
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|error| TokenError::Signing(error.to_string()))
    }

    /// Check signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        jsonwebtoken::decode::<SessionClaims>(token.trim(), &key, &validation)
            .map(|data| data.claims)
            .map_err(|error| match error.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(
            SecretString::from("test-secret-test-secret-test-secret"),
            Duration::hours(1),
        )
    }

    #[test]
    fn issue_and_verify() {
        let issuer = issuer();
        let id = Uuid::new_v4();
        let token = issuer.issue(id, "a@a.com", Role::Member).unwrap();

        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.sub, id);
        assert_eq!(claims.email, "a@a.com");
        assert_eq!(claims.role, Role::Member);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn token_is_a_standard_jwt() {
        let token = issuer().issue(Uuid::new_v4(), "a@a.com", Role::Member).unwrap();
        assert_eq!(token.split('.').count(), 3);
        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::HS256);
    }

    #[test]
    fn other_secret_rejected() {
        let token = issuer().issue(Uuid::new_v4(), "a@a.com", Role::Admin).unwrap();
        let other = TokenIssuer::with_random_secret(Duration::hours(1));
        assert_eq!(other.verify(&token), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn swapped_payload_rejected() {
        let issuer = issuer();
        let member = issuer.issue(Uuid::new_v4(), "a@a.com", Role::Member).unwrap();
        let admin = issuer.issue(Uuid::new_v4(), "b@b.com", Role::Admin).unwrap();

        // Admin claims under the member token's signature
        let member_parts: Vec<&str> = member.split('.').collect();
        let admin_parts: Vec<&str> = admin.split('.').collect();
        let forged = format!("{}.{}.{}", member_parts[0], admin_parts[1], member_parts[2]);
        assert_eq!(issuer.verify(&forged), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn expired_rejected() {
        let issuer = issuer();
        let issued = Utc::now() - Duration::hours(2);
        let token = issuer
            .issue_at(Uuid::new_v4(), "a@a.com", Role::Member, issued)
            .unwrap();
        assert_eq!(issuer.verify(&token), Err(TokenError::Expired));
    }

    #[test]
    fn garbage_is_malformed() {
        let issuer = issuer();
        assert_eq!(issuer.verify("nodot"), Err(TokenError::Malformed));
        assert_eq!(issuer.verify("!!.??.##"), Err(TokenError::Malformed));
    }
}

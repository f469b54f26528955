//! Credential primitives: bcrypt password hashes and HS256 access tokens.
//!
//! Tokens are stateless. The subject claim carries the user id; expiry is
//! enforced with a small leeway for clock skew. Anything that fails to verify
//! becomes [`Error::Unauthenticated`] so callers never leak the reason.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Credentials, User};

pub const MIN_TOKEN_TTL_DAYS: i64 = 1;
pub const MAX_TOKEN_TTL_DAYS: i64 = 7;
pub const TOKEN_LEEWAY_SECS: u64 = 60;

/// bcrypt work factor for production hashes.
pub const DEFAULT_HASH_COST: u32 = bcrypt::DEFAULT_COST;
/// Cheapest accepted work factor; only for tests.
pub const MIN_HASH_COST: u32 = 4;

/// The caller a request was authenticated as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity(i64);

impl Identity {
    #[must_use]
    pub const fn new(user_id: i64) -> Self {
        Self(user_id)
    }

    #[must_use]
    pub const fn user_id(self) -> i64 {
        self.0
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly signed access token.
#[derive(Debug, Clone, Serialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    /// `ttl_days` is clamped into `1..=7`.
    #[must_use]
    pub fn new(secret: &[u8], ttl_days: i64) -> Self {
        let days = ttl_days.clamp(MIN_TOKEN_TTL_DAYS, MAX_TOKEN_TTL_DAYS);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::days(days),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, identity: Identity, now: DateTime<Utc>) -> Result<AccessToken> {
        let claims = Claims {
            sub: identity.user_id().to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        let access_token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(AccessToken {
            access_token,
            token_type: "Bearer",
            expires_in: self.ttl.num_seconds(),
        })
    }

    /// Verify signature and expiry and return the subject. Does not check that
    /// the user still exists.
    pub fn verify(&self, token: &str) -> Result<Identity> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = TOKEN_LEEWAY_SECS;
        validation.validate_exp = true;

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            tracing::debug!("token rejected: {e}");
            Error::Unauthenticated
        })?;

        data.claims
            .sub
            .parse::<i64>()
            .map(Identity::new)
            .map_err(|_| Error::Unauthenticated)
    }
}

pub fn hash_password(password: &str, cost: u32) -> Result<String> {
    Ok(bcrypt::hash(password, cost)?)
}

/// A malformed stored hash counts as a mismatch.
#[must_use]
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Check a login attempt against the stored credentials. An unknown email and
/// a wrong password are indistinguishable to the caller, in result and in
/// time: the unknown-email path still pays for one hash at `cost`.
pub fn check_credentials(
    credentials: Option<Credentials>,
    password: &str,
    cost: u32,
) -> Result<User> {
    match credentials {
        Some(c) if verify_password(password, &c.password_hash) => Ok(c.user),
        Some(c) => {
            tracing::info!(user_id = c.user.id, "login rejected: wrong password");
            Err(Error::InvalidCredentials)
        }
        None => {
            let _ = hash_password(password, cost);
            Err(Error::InvalidCredentials)
        }
    }
}

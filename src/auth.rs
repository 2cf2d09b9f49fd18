//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs signed with the shared secret from configuration.
//! Signature and structure are checked by `jsonwebtoken`; the semantic checks
//! on the decoded claim (expiry, subject) are done by [`validate`] so that
//! every violation is reported, not just the first one the decoder trips on.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Scheme expected in the `authorization` metadata entry.
pub const BEARER: &str = "Bearer";

/// The decoded identity claim carried by a token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "uid", default)]
    pub subject_id: String,
    /// Unix seconds. Zero means unset.
    #[serde(rename = "exp", default)]
    pub expires_at: i64,
}

impl Identity {
    pub fn new(subject_id: impl Into<String>, expires_at: i64) -> Self {
        Self { subject_id: subject_id.into(), expires_at }
    }

    /// Signs this claim as an HS256 token.
    pub fn sign(&self, secret: &[u8]) -> Result<String, jsonwebtoken::errors::Error> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), self, &EncodingKey::from_secret(secret))
    }
}

/// A single claim violation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("exp is required")]
    MissingExpiry,

    #[error("token is expired by {}s", overage.as_secs())]
    Expired { overage: Duration },

    #[error("uid is required")]
    MissingSubject,
}

/// Every violation found in one claim. Never empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimErrors(Vec<ClaimError>);

impl ClaimErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ClaimError> {
        self.0.iter()
    }

    pub fn contains(&self, err: &ClaimError) -> bool {
        self.0.contains(err)
    }

    /// How long ago the claim expired, if expiry is among the violations.
    pub fn expired_by(&self) -> Option<Duration> {
        self.0.iter().find_map(|e| match e {
            ClaimError::Expired { overage } => Some(*overage),
            _ => None,
        })
    }
}

impl fmt::Display for ClaimErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ClaimErrors {}

/// Why a bearer credential was rejected.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authorization header is not `Bearer <token>`")]
    MalformedHeader,

    #[error("invalid token: {0}")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),

    #[error("invalid claims: {0}")]
    Claims(#[from] ClaimErrors),
}

/// Checks a decoded claim against `now`. Pure.
pub fn validate(claim: &Identity, now: SystemTime) -> Result<(), ClaimErrors> {
    let now = unix_seconds(now);
    let mut errors = Vec::new();

    if claim.expires_at == 0 {
        errors.push(ClaimError::MissingExpiry);
    } else if claim.expires_at < now {
        let overage = Duration::from_secs(now.abs_diff(claim.expires_at));
        errors.push(ClaimError::Expired { overage });
    }
    if claim.subject_id.is_empty() {
        errors.push(ClaimError::MissingSubject);
    }

    if errors.is_empty() { Ok(()) } else { Err(ClaimErrors(errors)) }
}

fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

/// Verifies bearer tokens against the shared secret.
///
/// Holds only read-only key material, so one instance is shared by every call.
#[derive(Clone)]
pub struct TokenAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry and subject are checked by `validate`, which reports the overage.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        Self { key: DecodingKey::from_secret(secret), validation }
    }

    /// Authenticates a raw `authorization` value against the current time.
    pub fn authenticate(&self, header: &str) -> Result<Identity, AuthError> {
        self.authenticate_at(header, SystemTime::now())
    }

    pub fn authenticate_at(&self, header: &str, now: SystemTime) -> Result<Identity, AuthError> {
        let token = match header.split_once(' ') {
            Some((BEARER, token)) if !token.is_empty() => token,
            _ => return Err(AuthError::MalformedHeader),
        };
        let data = jsonwebtoken::decode::<Identity>(token, &self.key, &self.validation)
            .map_err(AuthError::InvalidToken)?;
        validate(&data.claims, now)?;
        Ok(data.claims)
    }
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator").field("key", &"<redacted>").finish()
    }
}

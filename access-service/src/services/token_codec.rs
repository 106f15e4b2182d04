//! Signed access tokens backing a hold.
//!
//! Tokens are HS256 JWTs. Nothing about a token is stored: its validity is
//! derived from the signature, its `exp` claim and the hold it names.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

use crate::error::AccessError;
use crate::models::Hold;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    /// User id.
    pub sub: String,
    pub door_id: String,
    pub site_id: String,
    pub permissions: BTreeSet<String>,
    pub hold_id: String,
    pub iat: i64,
    pub exp: i64,
    pub nonce: String,
}

impl TokenClaims {
    pub fn for_hold(hold: &Hold, now: DateTime<Utc>) -> Self {
        Self {
            sub: hold.user_id.clone(),
            door_id: hold.resource_id.clone(),
            site_id: hold.site_id.clone(),
            permissions: hold.permissions.clone(),
            hold_id: hold.hold_id.clone(),
            iat: now.timestamp(),
            exp: hold.expires_at.timestamp(),
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Clone, Copy, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TokenRejection {
    #[error("token is malformed")]
    Malformed,

    #[error("token signature does not verify")]
    BadSignature,

    #[error("token has expired")]
    Expired,

    #[error("hold backing the token is no longer active")]
    HoldInactive,
}

/// Outcome of checking a presented token. Serializes with a boolean `valid`
/// discriminant: `{"valid": false, "reason": ..}` or `{"valid": true, ..claims}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(into = "ValidationBody")]
pub enum TokenValidation {
    Valid {
        user_id: String,
        door_id: String,
        site_id: String,
        permissions: BTreeSet<String>,
        hold_id: String,
        expires_at: DateTime<Utc>,
    },
    Invalid {
        reason: TokenRejection,
    },
}

impl TokenValidation {
    pub fn valid(claims: TokenClaims) -> Self {
        let expires_at = claims.expires_at();
        TokenValidation::Valid {
            user_id: claims.sub,
            door_id: claims.door_id,
            site_id: claims.site_id,
            permissions: claims.permissions,
            hold_id: claims.hold_id,
            expires_at,
        }
    }

    pub fn invalid(reason: TokenRejection) -> Self {
        TokenValidation::Invalid { reason }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, TokenValidation::Valid { .. })
    }
}

#[derive(Serialize)]
struct ValidationBody {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<TokenRejection>,
    #[serde(flatten)]
    grant: Option<GrantBody>,
}

#[derive(Serialize)]
struct GrantBody {
    user_id: String,
    door_id: String,
    site_id: String,
    permissions: BTreeSet<String>,
    hold_id: String,
    expires_at: DateTime<Utc>,
}

impl From<TokenValidation> for ValidationBody {
    fn from(validation: TokenValidation) -> Self {
        match validation {
            TokenValidation::Valid {
                user_id,
                door_id,
                site_id,
                permissions,
                hold_id,
                expires_at,
            } => ValidationBody {
                valid: true,
                reason: None,
                grant: Some(GrantBody {
                    user_id,
                    door_id,
                    site_id,
                    permissions,
                    hold_id,
                    expires_at,
                }),
            },
            TokenValidation::Invalid { reason } => ValidationBody {
                valid: false,
                reason: Some(reason),
                grant: None,
            },
        }
    }
}

#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenCodec {
    pub fn new(secret: &Secret<String>) -> Self {
        let bytes = secret.expose_secret().as_bytes();

        // Expiry is checked against the caller's clock in `decode_at`.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::new();

        Self {
            encoding_key: EncodingKey::from_secret(bytes),
            decoding_key: DecodingKey::from_secret(bytes),
            validation,
        }
    }

    pub fn issue(&self, claims: &TokenClaims) -> Result<String, AccessError> {
        Ok(encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)?)
    }

    /// Fresh token for the hold's current expiry.
    pub fn issue_for_hold(&self, hold: &Hold, now: DateTime<Utc>) -> Result<String, AccessError> {
        self.issue(&TokenClaims::for_hold(hold, now))
    }

    pub fn decode_at(&self, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, TokenRejection> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::InvalidSignature => TokenRejection::BadSignature,
                _ => TokenRejection::Malformed,
            },
        )?;

        if now > data.claims.expires_at() {
            return Err(TokenRejection::Expired);
        }

        Ok(data.claims)
    }
}

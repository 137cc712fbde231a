//! Compact signed tokens.
//!
//! Access and challenge tokens are stateless: signature, type tag and expiry are the
//! whole check. Refresh tokens additionally carry a `jti` that names a persisted
//! session node, so they can be rotated and revoked.

use anyhow::{anyhow, Context, Result};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{debug, instrument};
use ulid::Ulid;
use uuid::Uuid;

use super::{clock::Clock, config::AuthConfig};
use crate::store::{NewSessionNode, SessionNode, SessionRegistry};

pub const MIN_SECRET_BYTES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
    Challenge,
}

impl TokenKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::Challenge => "challenge",
        }
    }
}

/// Wire claims. Access and challenge tokens omit `jti` and `device_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

impl Claims {
    /// The subject parsed as a principal id.
    ///
    /// # Errors
    /// Returns an error if `sub` is not a UUID.
    pub fn principal_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).context("token subject is not a principal id")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenRejection {
    #[error("malformed or badly signed token")]
    Malformed,
    #[error("unexpected token type")]
    WrongKind,
    #[error("token expired")]
    Expired,
}

/// HS256 signer/verifier bound to one issuer.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// # Errors
    /// Returns an error if the secret is shorter than [`MIN_SECRET_BYTES`].
    pub fn new(secret: &[u8], issuer: &str) -> Result<Self> {
        if secret.len() < MIN_SECRET_BYTES {
            return Err(anyhow!(
                "token secret must be at least {MIN_SECRET_BYTES} bytes, got {}",
                secret.len()
            ));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.to_string(),
        })
    }

    /// Build a signer from a base64-encoded secret.
    ///
    /// # Errors
    /// Returns an error if the value is not valid base64 or decodes to too few bytes.
    pub fn from_base64(secret: &SecretString, issuer: &str) -> Result<Self> {
        let bytes = Base64::decode_vec(secret.expose_secret().trim())
            .map_err(|err| anyhow!("token secret is not valid base64: {err}"))?;
        Self::new(&bytes, issuer)
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// # Errors
    /// Returns an error if encoding fails.
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .context("failed to sign token")
    }

    /// Check signature, issuer, type tag and expiry against `now`.
    ///
    /// # Errors
    /// Returns the first check that failed.
    pub fn verify(
        &self,
        token: &str,
        expected: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<Claims, TokenRejection> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock below.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);
        validation.set_issuer(&[self.issuer.as_str()]);

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|err| {
            debug!("token rejected: {err}");
            TokenRejection::Malformed
        })?;
        let claims = data.claims;

        if claims.kind != expected {
            return Err(TokenRejection::WrongKind);
        }
        if claims.exp <= now.timestamp() {
            return Err(TokenRejection::Expired);
        }
        Ok(claims)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

/// A signed refresh token whose session node has not been written yet.
#[derive(Clone, Debug)]
pub struct MintedRefresh {
    pub token: String,
    pub node: NewSessionNode,
}

/// `now` plus `seconds`, failing instead of overflowing chrono's range.
///
/// # Errors
/// Returns an error if the TTL is not representable or the sum leaves the range.
pub fn expiry_after(now: DateTime<Utc>, seconds: i64) -> Result<DateTime<Utc>> {
    Duration::try_seconds(seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| anyhow!("lifetime of {seconds}s overflows the representable time range"))
}

fn unix_to_utc(seconds: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| anyhow!("timestamp out of range: {seconds}"))
}

/// Mints access and refresh tokens and persists refresh-token session nodes.
#[derive(Clone)]
pub struct TokenIssuer {
    signer: TokenSigner,
    sessions: Arc<dyn SessionRegistry>,
    clock: Arc<dyn Clock>,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(
        signer: TokenSigner,
        sessions: Arc<dyn SessionRegistry>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            signer,
            sessions,
            clock,
            access_ttl_seconds: config.access_ttl_seconds(),
            refresh_ttl_seconds: config.refresh_ttl_seconds(),
        }
    }

    #[must_use]
    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// # Errors
    /// Returns an error if the expiry overflows or signing fails.
    pub fn issue_access_token(&self, principal_id: Uuid) -> Result<(String, DateTime<Utc>)> {
        let now = self.clock.now();
        let exp = expiry_after(now, self.access_ttl_seconds)?.timestamp();
        let claims = Claims {
            sub: principal_id.to_string(),
            kind: TokenKind::Access,
            jti: None,
            device_id: None,
            exp,
            iat: now.timestamp(),
            iss: self.signer.issuer().to_string(),
        };
        Ok((self.signer.sign(&claims)?, unix_to_utc(exp)?))
    }

    /// Sign a refresh token under a fresh `jti` without persisting it.
    ///
    /// # Errors
    /// Returns an error if the expiry overflows or signing fails.
    pub fn mint_refresh_token(&self, principal_id: Uuid, device_id: &str) -> Result<MintedRefresh> {
        let now = self.clock.now();
        let exp = expiry_after(now, self.refresh_ttl_seconds)?.timestamp();
        let jti = Ulid::new().to_string();
        let claims = Claims {
            sub: principal_id.to_string(),
            kind: TokenKind::Refresh,
            jti: Some(jti.clone()),
            device_id: Some(device_id.to_string()),
            exp,
            iat: now.timestamp(),
            iss: self.signer.issuer().to_string(),
        };
        let token = self.signer.sign(&claims)?;
        Ok(MintedRefresh {
            token,
            node: NewSessionNode {
                jti,
                principal_id,
                device_id: device_id.to_string(),
                expires_at: unix_to_utc(exp)?,
                created_at: now,
            },
        })
    }

    /// Sign a refresh token and persist its active session node.
    ///
    /// # Errors
    /// Returns an error if signing or the registry write fails.
    #[instrument(skip(self))]
    pub async fn issue_refresh_token(
        &self,
        principal_id: Uuid,
        device_id: &str,
    ) -> Result<(String, SessionNode)> {
        let minted = self.mint_refresh_token(principal_id, device_id)?;
        let node = self.sessions.create(minted.node).await?;
        Ok((minted.token, node))
    }

    /// The only way to obtain a usable pair for a fresh session.
    ///
    /// # Errors
    /// Returns an error if signing or the registry write fails.
    pub async fn issue_pair(&self, principal_id: Uuid, device_id: &str) -> Result<TokenPair> {
        let (access_token, access_expires_at) = self.issue_access_token(principal_id)?;
        let (refresh_token, node) = self.issue_refresh_token(principal_id, device_id).await?;
        Ok(TokenPair {
            access_token,
            access_expires_at,
            refresh_token,
            refresh_expires_at: node.expires_at,
        })
    }

    /// A pair whose refresh node is returned for the caller to persist (rotation).
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub fn mint_pair(&self, principal_id: Uuid, device_id: &str) -> Result<(TokenPair, NewSessionNode)> {
        let (access_token, access_expires_at) = self.issue_access_token(principal_id)?;
        let minted = self.mint_refresh_token(principal_id, device_id)?;
        let pair = TokenPair {
            access_token,
            access_expires_at,
            refresh_token: minted.token,
            refresh_expires_at: minted.node.expires_at,
        };
        Ok((pair, minted.node))
    }

    /// # Errors
    /// See [`TokenSigner::verify`].
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims, TokenRejection> {
        self.signer.verify(token, expected, self.clock.now())
    }
}

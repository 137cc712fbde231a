//! Stateless bridge between password verification and the second factor.
//!
//! A challenge stays valid for its whole TTL; a wrong code does not use it up.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::{
    clock::Clock,
    config::AuthConfig,
    error::{AuthError, AuthResult, SecondFactorFailure},
    tokens::{expiry_after, Claims, TokenKind, TokenSigner},
    totp,
};
use crate::store::{Principal, PrincipalStore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ChallengeIssuer {
    signer: TokenSigner,
    principals: Arc<dyn PrincipalStore>,
    clock: Arc<dyn Clock>,
    ttl_seconds: i64,
}

impl ChallengeIssuer {
    #[must_use]
    pub fn new(
        signer: TokenSigner,
        principals: Arc<dyn PrincipalStore>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            signer,
            principals,
            clock,
            ttl_seconds: config.challenge_ttl_seconds(),
        }
    }

    /// # Errors
    /// Returns an error if the expiry overflows or signing fails.
    pub fn issue(&self, principal_id: Uuid) -> Result<ChallengeToken> {
        let now = self.clock.now();
        let expires_at = expiry_after(now, self.ttl_seconds)?;
        let claims = Claims {
            sub: principal_id.to_string(),
            kind: TokenKind::Challenge,
            jti: None,
            device_id: None,
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            iss: self.signer.issuer().to_string(),
        };
        Ok(ChallengeToken {
            token: self.signer.sign(&claims)?,
            expires_at,
        })
    }

    /// # Errors
    /// `InvalidSecondFactor` with the failing step; `Internal` on storage failure.
    #[instrument(skip(self, challenge, code))]
    pub async fn verify_and_consume(&self, challenge: &str, code: &str) -> AuthResult<Principal> {
        let now = self.clock.now();
        let invalid_challenge =
            || AuthError::InvalidSecondFactor(SecondFactorFailure::ExpiredOrInvalidChallenge);

        let claims = self
            .signer
            .verify(challenge, TokenKind::Challenge, now)
            .map_err(|_| invalid_challenge())?;
        let principal_id = claims.principal_id().map_err(|_| invalid_challenge())?;
        let principal = self
            .principals
            .find_principal(principal_id)
            .await?
            .ok_or_else(invalid_challenge)?;

        let secret = match (&principal.totp_secret, principal.totp_enabled) {
            (Some(secret), true) => secret,
            _ => {
                return Err(AuthError::InvalidSecondFactor(
                    SecondFactorFailure::NotEnrolled,
                ))
            }
        };

        if totp::check(secret, code, now)? {
            Ok(principal)
        } else {
            Err(AuthError::InvalidSecondFactor(
                SecondFactorFailure::InvalidCode,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::clock::ManualClock,
        store::{MemoryStore, NewPrincipal, InsertPrincipal},
    };
    use anyhow::bail;
    use chrono::{Duration, NaiveDate};

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    async fn setup(enrolled: bool) -> Result<(ChallengeIssuer, Arc<ManualClock>, Principal)> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new());
        let InsertPrincipal::Created(principal) = store
            .insert_principal(NewPrincipal {
                email: "alice@example.com".to_string(),
                password_hash: "unused".to_string(),
                display_name: "Alice".to_string(),
                birth_date: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default(),
                created_at: clock.now(),
            })
            .await?
        else {
            bail!("insert conflicted");
        };
        if enrolled {
            let enrollment = totp::generate("tessera", &principal.email)?;
            store
                .set_second_factor(principal.id, Some(&enrollment.secret_base32), true)
                .await?;
        }
        let principal = store
            .find_principal(principal.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("principal vanished"))?;
        let issuer = ChallengeIssuer::new(
            TokenSigner::new(SECRET, "tessera")?,
            store,
            clock.clone(),
            &AuthConfig::default(),
        );
        Ok((issuer, clock, principal))
    }

    fn current_code(principal: &Principal, clock: &ManualClock) -> Result<String> {
        let secret = principal
            .totp_secret
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("not enrolled"))?;
        totp::code_at(secret, clock.now())
    }

    #[tokio::test]
    async fn wrong_code_does_not_burn_the_challenge() -> Result<()> {
        let (issuer, clock, principal) = setup(true).await?;
        let challenge = issuer.issue(principal.id)?;
        let code = current_code(&principal, &clock)?;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        let denied = issuer.verify_and_consume(&challenge.token, wrong).await;
        assert!(matches!(
            denied,
            Err(AuthError::InvalidSecondFactor(SecondFactorFailure::InvalidCode))
        ));

        let verified = issuer.verify_and_consume(&challenge.token, &code).await?;
        assert_eq!(verified.id, principal.id);
        Ok(())
    }

    #[tokio::test]
    async fn expired_challenge_is_rejected() -> Result<()> {
        let (issuer, clock, principal) = setup(true).await?;
        let challenge = issuer.issue(principal.id)?;

        clock.advance(Duration::seconds(301));
        let code = current_code(&principal, &clock)?;
        assert!(matches!(
            issuer.verify_and_consume(&challenge.token, &code).await,
            Err(AuthError::InvalidSecondFactor(
                SecondFactorFailure::ExpiredOrInvalidChallenge
            ))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn access_token_is_not_a_challenge() -> Result<()> {
        let (issuer, clock, principal) = setup(true).await?;
        let claims = Claims {
            sub: principal.id.to_string(),
            kind: TokenKind::Access,
            jti: None,
            device_id: None,
            exp: (clock.now() + Duration::minutes(5)).timestamp(),
            iat: clock.now().timestamp(),
            iss: "tessera".to_string(),
        };
        let token = TokenSigner::new(SECRET, "tessera")?.sign(&claims)?;
        let code = current_code(&principal, &clock)?;
        assert!(matches!(
            issuer.verify_and_consume(&token, &code).await,
            Err(AuthError::InvalidSecondFactor(
                SecondFactorFailure::ExpiredOrInvalidChallenge
            ))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn overflowing_ttl_fails_instead_of_panicking() -> Result<()> {
        let (_, clock, principal) = setup(true).await?;
        let issuer = ChallengeIssuer::new(
            TokenSigner::new(SECRET, "tessera")?,
            Arc::new(MemoryStore::new()),
            clock,
            &AuthConfig::new().with_challenge_ttl_seconds(i64::MAX),
        );
        assert!(issuer.issue(principal.id).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn unenrolled_principal_is_refused() -> Result<()> {
        let (issuer, _, principal) = setup(false).await?;
        let challenge = issuer.issue(principal.id)?;
        assert!(matches!(
            issuer.verify_and_consume(&challenge.token, "123456").await,
            Err(AuthError::InvalidSecondFactor(SecondFactorFailure::NotEnrolled))
        ));
        Ok(())
    }
}

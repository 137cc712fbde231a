//! Credential and session lifecycle engine.
//!
//! `AuthService` is the surface the HTTP layer talks to. Internally:
//!
//! - [`CredentialStore`] checks passwords and enforces registration policy.
//! - [`ChallengeIssuer`] bridges password and second-factor verification.
//! - [`TokenIssuer`] mints access tokens (stateless) and refresh tokens (one
//!   persisted session node each).
//! - [`RotationProtocol`] exchanges refresh tokens and cascades revocation when a
//!   consumed token is replayed.
//!
//! Access-token verification never touches storage.

pub mod challenge;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod rotation;
pub mod sweep;
pub mod tokens;
pub mod totp;

use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{info, instrument};
use ulid::Ulid;
use uuid::Uuid;

pub use challenge::{ChallengeIssuer, ChallengeToken};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AuthConfig;
pub use credentials::{CredentialStore, Registration};
pub use error::{AuthError, AuthResult, SecondFactorFailure};
pub use rotation::RotationProtocol;
pub use tokens::{TokenIssuer, TokenKind, TokenPair, TokenSigner};
pub use totp::Enrollment;

use crate::store::{Device, Principal, SessionNode, Stores};

const MAX_DEVICE_ID_LENGTH: usize = 128;

/// Client-supplied device details. A missing id is replaced by a fresh ULID.
#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    pub device_id: Option<String>,
    pub platform: Option<String>,
}

/// A token pair bound to the device it was issued for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedSession {
    pub principal_id: Uuid,
    pub device_id: String,
    pub tokens: TokenPair,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginOutcome {
    Tokens(IssuedSession),
    SecondFactorRequired(ChallengeToken),
}

#[derive(Clone)]
pub struct AuthService {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
    stores: Stores,
    credentials: CredentialStore,
    challenges: ChallengeIssuer,
    tokens: TokenIssuer,
    rotation: RotationProtocol,
}

impl AuthService {
    #[must_use]
    pub fn new(config: AuthConfig, signer: TokenSigner, stores: Stores, clock: Arc<dyn Clock>) -> Self {
        let credentials = CredentialStore::new(stores.principals.clone(), clock.clone(), &config);
        let challenges =
            ChallengeIssuer::new(signer.clone(), stores.principals.clone(), clock.clone(), &config);
        let tokens = TokenIssuer::new(signer, stores.sessions.clone(), clock.clone(), &config);
        let rotation = RotationProtocol::new(
            tokens.clone(),
            stores.sessions.clone(),
            clock.clone(),
            config.max_chain_hops(),
        );
        Self {
            config,
            clock,
            stores,
            credentials,
            challenges,
            tokens,
            rotation,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// # Errors
    /// `Validation` or `AlreadyExists`.
    pub async fn register(&self, registration: Registration) -> AuthResult<Principal> {
        self.credentials.register(registration).await
    }

    /// Verify a password. Principals with an enabled second factor get a
    /// challenge instead of tokens.
    ///
    /// # Errors
    /// `InvalidCredentials` on a bad email/password pair.
    #[instrument(skip(self, password, device))]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        device: DeviceInfo,
    ) -> AuthResult<LoginOutcome> {
        let principal = match self.credentials.verify(email, password).await {
            Ok(principal) => principal,
            Err(err) => {
                info!(
                    target: "audit",
                    event = "login_failed",
                    kind = err.audit_kind(),
                );
                return Err(err);
            }
        };

        if principal.totp_enabled {
            let challenge = self.challenges.issue(principal.id)?;
            info!(
                target: "audit",
                event = "second_factor_challenge",
                principal_id = %principal.id,
            );
            return Ok(LoginOutcome::SecondFactorRequired(challenge));
        }

        Ok(LoginOutcome::Tokens(self.start_session(&principal, device).await?))
    }

    /// Complete a login paused on a second-factor challenge.
    ///
    /// # Errors
    /// `InvalidSecondFactor` if the challenge or code is not accepted.
    #[instrument(skip(self, challenge, code, device))]
    pub async fn verify_second_factor(
        &self,
        challenge: &str,
        code: &str,
        device: DeviceInfo,
    ) -> AuthResult<IssuedSession> {
        let principal = match self.challenges.verify_and_consume(challenge, code).await {
            Ok(principal) => principal,
            Err(err) => {
                info!(
                    target: "audit",
                    event = "second_factor_failed",
                    kind = err.audit_kind(),
                );
                return Err(err);
            }
        };
        self.start_session(&principal, device).await
    }

    async fn start_session(
        &self,
        principal: &Principal,
        device: DeviceInfo,
    ) -> AuthResult<IssuedSession> {
        let device_id = device
            .device_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Ulid::new().to_string());
        if device_id.chars().count() > MAX_DEVICE_ID_LENGTH {
            return Err(AuthError::Validation("device id is too long".to_string()));
        }
        let platform = device
            .platform
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        self.stores
            .devices
            .touch_device(principal.id, &device_id, platform.as_deref(), self.clock.now())
            .await?;
        let tokens = self.tokens.issue_pair(principal.id, &device_id).await?;

        info!(
            target: "audit",
            event = "login",
            principal_id = %principal.id,
            device_id = %device_id,
        );
        Ok(IssuedSession {
            principal_id: principal.id,
            device_id,
            tokens,
        })
    }

    /// # Errors
    /// `InvalidRefreshToken` or `TokenReuseDetected`.
    pub async fn rotate(&self, refresh_token: &str) -> AuthResult<TokenPair> {
        self.rotation.rotate(refresh_token).await
    }

    /// # Errors
    /// `Internal` on storage failure only.
    pub async fn logout(&self, refresh_token: &str) -> AuthResult<()> {
        self.rotation.logout(refresh_token).await
    }

    /// # Errors
    /// `Internal` on storage failure only.
    pub async fn logout_all(&self, principal_id: Uuid) -> AuthResult<u64> {
        self.rotation.logout_all(principal_id).await
    }

    /// Resolve an access token to its principal without consulting storage.
    ///
    /// # Errors
    /// `InvalidAccessToken` if the signature, type or expiry check fails.
    pub fn verify_access_token(&self, access_token: &str) -> AuthResult<Uuid> {
        self.tokens
            .verify(access_token, TokenKind::Access)
            .ok()
            .and_then(|claims| claims.principal_id().ok())
            .ok_or(AuthError::InvalidAccessToken)
    }

    /// Change the password and sign out every session; returns how many were revoked.
    ///
    /// # Errors
    /// `InvalidCredentials` if `current` is wrong, `Validation` if `new` is out of policy.
    pub async fn change_password(
        &self,
        principal_id: Uuid,
        current: &str,
        new: &str,
    ) -> AuthResult<u64> {
        self.credentials
            .change_password(principal_id, current, new)
            .await?;
        info!(
            target: "audit",
            event = "password_changed",
            principal_id = %principal_id,
        );
        self.logout_all(principal_id).await
    }

    async fn require_principal(&self, principal_id: Uuid) -> AuthResult<Principal> {
        self.stores
            .principals
            .find_principal(principal_id)
            .await?
            .ok_or(AuthError::InvalidAccessToken)
    }

    /// Store a pending second-factor secret; it takes effect once confirmed.
    ///
    /// # Errors
    /// `Validation` if a second factor is already enabled.
    #[instrument(skip(self))]
    pub async fn begin_second_factor_enrollment(&self, principal_id: Uuid) -> AuthResult<Enrollment> {
        let principal = self.require_principal(principal_id).await?;
        if principal.totp_enabled {
            return Err(AuthError::Validation(
                "second factor is already enabled".to_string(),
            ));
        }
        let enrollment = totp::generate(self.config.totp_issuer(), &principal.email)?;
        self.stores
            .principals
            .set_second_factor(principal_id, Some(&enrollment.secret_base32), false)
            .await?;
        Ok(enrollment)
    }

    /// Enable the pending secret if `code` verifies against it.
    ///
    /// # Errors
    /// `InvalidSecondFactor` when nothing is pending or the code is wrong.
    #[instrument(skip(self, code))]
    pub async fn confirm_second_factor_enrollment(
        &self,
        principal_id: Uuid,
        code: &str,
    ) -> AuthResult<()> {
        let principal = self.require_principal(principal_id).await?;
        let secret = match (&principal.totp_secret, principal.totp_enabled) {
            (Some(secret), false) => secret,
            (_, true) => {
                return Err(AuthError::Validation(
                    "second factor is already enabled".to_string(),
                ))
            }
            (None, false) => {
                return Err(AuthError::InvalidSecondFactor(
                    SecondFactorFailure::NotEnrolled,
                ))
            }
        };
        if !totp::check(secret, code, self.clock.now())? {
            return Err(AuthError::InvalidSecondFactor(
                SecondFactorFailure::InvalidCode,
            ));
        }
        self.stores
            .principals
            .set_second_factor(principal_id, Some(secret), true)
            .await?;
        info!(
            target: "audit",
            event = "second_factor_enabled",
            principal_id = %principal_id,
        );
        Ok(())
    }

    /// # Errors
    /// `InvalidSecondFactor` if not enabled or the code is wrong.
    #[instrument(skip(self, code))]
    pub async fn disable_second_factor(&self, principal_id: Uuid, code: &str) -> AuthResult<()> {
        let principal = self.require_principal(principal_id).await?;
        let secret = match (&principal.totp_secret, principal.totp_enabled) {
            (Some(secret), true) => secret,
            _ => {
                return Err(AuthError::InvalidSecondFactor(
                    SecondFactorFailure::NotEnrolled,
                ))
            }
        };
        if !totp::check(secret, code, self.clock.now())? {
            return Err(AuthError::InvalidSecondFactor(
                SecondFactorFailure::InvalidCode,
            ));
        }
        self.stores
            .principals
            .set_second_factor(principal_id, None, false)
            .await?;
        info!(
            target: "audit",
            event = "second_factor_disabled",
            principal_id = %principal_id,
        );
        Ok(())
    }

    /// Active, unexpired session nodes, newest first.
    ///
    /// # Errors
    /// `Internal` on storage failure.
    pub async fn list_sessions(&self, principal_id: Uuid) -> AuthResult<Vec<SessionNode>> {
        Ok(self
            .stores
            .sessions
            .list_active(principal_id, self.clock.now())
            .await?)
    }

    /// # Errors
    /// `Internal` on storage failure.
    pub async fn list_devices(&self, principal_id: Uuid) -> AuthResult<Vec<Device>> {
        Ok(self.stores.devices.list_devices(principal_id).await?)
    }

    /// # Errors
    /// `InvalidAccessToken` if the principal no longer exists.
    pub async fn principal(&self, principal_id: Uuid) -> AuthResult<Principal> {
        self.require_principal(principal_id).await
    }

    /// # Errors
    /// Returns an error if the session store cannot be reached.
    pub async fn check_storage(&self) -> anyhow::Result<()> {
        self.stores.sessions.ping().await
    }

    /// Start the background expiry sweeper.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration, batch_size: usize) -> JoinHandle<()> {
        sweep::spawn(
            self.stores.sessions.clone(),
            self.clock.clone(),
            interval,
            batch_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Context, Result};
    use chrono::{NaiveDate, TimeZone, Utc};

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn service() -> Result<(AuthService, Arc<ManualClock>)> {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .context("valid time")?;
        let clock = Arc::new(ManualClock::new(now));
        let service = AuthService::new(
            AuthConfig::default(),
            TokenSigner::new(SECRET, "tessera")?,
            Stores::memory(),
            clock.clone(),
        );
        Ok((service, clock))
    }

    async fn alice(service: &AuthService) -> Result<Principal> {
        let birth = NaiveDate::from_ymd_opt(1990, 5, 17).context("date")?;
        Ok(service
            .register(Registration {
                email: "alice@example.com".to_string(),
                password: "correct horse".to_string(),
                display_name: "Alice".to_string(),
                birth_date: birth,
            })
            .await?)
    }

    fn phone() -> DeviceInfo {
        DeviceInfo {
            device_id: Some("phone".to_string()),
            platform: Some("ios".to_string()),
        }
    }

    #[tokio::test]
    async fn login_without_second_factor_returns_tokens() -> Result<()> {
        let (service, _) = service()?;
        let principal = alice(&service).await?;

        let LoginOutcome::Tokens(session) = service
            .login("alice@example.com", "correct horse", phone())
            .await?
        else {
            bail!("expected tokens");
        };
        assert_eq!(session.device_id, "phone");
        assert_eq!(
            service.verify_access_token(&session.tokens.access_token)?,
            principal.id
        );
        assert_eq!(service.list_devices(principal.id).await?.len(), 1);
        assert_eq!(service.list_sessions(principal.id).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_device_id_gets_a_ulid() -> Result<()> {
        let (service, _) = service()?;
        alice(&service).await?;

        let LoginOutcome::Tokens(session) = service
            .login("alice@example.com", "correct horse", DeviceInfo::default())
            .await?
        else {
            bail!("expected tokens");
        };
        assert!(Ulid::from_string(&session.device_id).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn refresh_token_is_not_an_access_token() -> Result<()> {
        let (service, clock) = service()?;
        alice(&service).await?;
        let LoginOutcome::Tokens(session) = service
            .login("alice@example.com", "correct horse", phone())
            .await?
        else {
            bail!("expected tokens");
        };

        assert!(matches!(
            service.verify_access_token(&session.tokens.refresh_token),
            Err(AuthError::InvalidAccessToken)
        ));
        clock.advance(chrono::Duration::minutes(16));
        assert!(matches!(
            service.verify_access_token(&session.tokens.access_token),
            Err(AuthError::InvalidAccessToken)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn enrollment_then_login_requires_code() -> Result<()> {
        let (service, clock) = service()?;
        let principal = alice(&service).await?;

        let enrollment = service.begin_second_factor_enrollment(principal.id).await?;
        // Pending secrets do not gate login yet.
        assert!(matches!(
            service
                .login("alice@example.com", "correct horse", phone())
                .await?,
            LoginOutcome::Tokens(_)
        ));

        let code = totp::code_at(&enrollment.secret_base32, clock.now())?;
        service
            .confirm_second_factor_enrollment(principal.id, &code)
            .await?;

        let LoginOutcome::SecondFactorRequired(challenge) = service
            .login("alice@example.com", "correct horse", phone())
            .await?
        else {
            bail!("expected a challenge");
        };
        let session = service
            .verify_second_factor(&challenge.token, &code, phone())
            .await?;
        assert_eq!(session.principal_id, principal.id);
        Ok(())
    }

    #[tokio::test]
    async fn confirm_with_wrong_code_keeps_second_factor_off() -> Result<()> {
        let (service, clock) = service()?;
        let principal = alice(&service).await?;
        let enrollment = service.begin_second_factor_enrollment(principal.id).await?;
        let code = totp::code_at(&enrollment.secret_base32, clock.now())?;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        assert!(matches!(
            service
                .confirm_second_factor_enrollment(principal.id, wrong)
                .await,
            Err(AuthError::InvalidSecondFactor(SecondFactorFailure::InvalidCode))
        ));
        assert!(!service.principal(principal.id).await?.totp_enabled);
        Ok(())
    }

    #[tokio::test]
    async fn disable_second_factor_restores_plain_login() -> Result<()> {
        let (service, clock) = service()?;
        let principal = alice(&service).await?;
        let enrollment = service.begin_second_factor_enrollment(principal.id).await?;
        let code = totp::code_at(&enrollment.secret_base32, clock.now())?;
        service
            .confirm_second_factor_enrollment(principal.id, &code)
            .await?;

        service.disable_second_factor(principal.id, &code).await?;
        assert!(matches!(
            service
                .login("alice@example.com", "correct horse", phone())
                .await?,
            LoginOutcome::Tokens(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn change_password_signs_out_everywhere() -> Result<()> {
        let (service, _) = service()?;
        let principal = alice(&service).await?;
        let LoginOutcome::Tokens(session) = service
            .login("alice@example.com", "correct horse", phone())
            .await?
        else {
            bail!("expected tokens");
        };

        let revoked = service
            .change_password(principal.id, "correct horse", "battery staple")
            .await?;
        assert_eq!(revoked, 1);
        assert!(matches!(
            service.rotate(&session.tokens.refresh_token).await,
            Err(AuthError::InvalidRefreshToken)
        ));
        Ok(())
    }
}

//! Password verification and registration policy.

use anyhow::{anyhow, Context, Result};
use argon2::{
    password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use chrono::{Datelike, NaiveDate};
use rand::rngs::OsRng;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    clock::Clock,
    config::AuthConfig,
    error::{AuthError, AuthResult},
};
use crate::store::{InsertPrincipal, NewPrincipal, Principal, PrincipalStore};

const MAX_PASSWORD_LENGTH: usize = 1024;
const MAX_DISPLAY_NAME_LENGTH: usize = 128;

// Verified when the email is unknown so both failure paths cost one Argon2 run.
static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();

#[derive(Clone, Debug)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub birth_date: NaiveDate,
}

#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[must_use]
pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s:]+@[^@\s:]+\.[^@\s:]+$").is_ok_and(|re| re.is_match(email))
}

/// Whole years between `birth_date` and `today`.
#[must_use]
pub fn age_in_years(birth_date: NaiveDate, today: NaiveDate) -> i32 {
    let mut years = today.year() - birth_date.year();
    if (today.month(), today.day()) < (birth_date.month(), birth_date.day()) {
        years -= 1;
    }
    years
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("failed to hash password: {e}"))
}

fn verify_hash(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

fn dummy_hash() -> Option<&'static str> {
    DUMMY_HASH
        .get_or_init(|| hash_password("tessera-timing-equalizer").ok())
        .as_deref()
}

async fn hash_blocking(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .context("password hashing task failed")?
}

async fn verify_blocking(password: String, stored_hash: Option<String>) -> Result<bool> {
    tokio::task::spawn_blocking(move || match stored_hash {
        Some(hash) => verify_hash(&password, &hash),
        None => {
            if let Some(dummy) = dummy_hash() {
                let _ = verify_hash(&password, dummy);
            }
            false
        }
    })
    .await
    .context("password verification task failed")
}

/// Owns no session state; only principals and their password hashes.
#[derive(Clone)]
pub struct CredentialStore {
    principals: Arc<dyn PrincipalStore>,
    clock: Arc<dyn Clock>,
    password_min_length: usize,
    minimum_age_years: u32,
}

impl CredentialStore {
    #[must_use]
    pub fn new(
        principals: Arc<dyn PrincipalStore>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            principals,
            clock,
            password_min_length: config.password_min_length(),
            minimum_age_years: config.minimum_age_years(),
        }
    }

    fn check_password_policy(&self, password: &str) -> AuthResult<()> {
        let length = password.chars().count();
        if length < self.password_min_length {
            return Err(AuthError::Validation(format!(
                "password must be at least {} characters",
                self.password_min_length
            )));
        }
        if length > MAX_PASSWORD_LENGTH {
            return Err(AuthError::Validation("password is too long".to_string()));
        }
        Ok(())
    }

    fn check_age_policy(&self, birth_date: NaiveDate) -> AuthResult<()> {
        let today = self.clock.now().date_naive();
        if birth_date > today {
            return Err(AuthError::Validation(
                "birth date is in the future".to_string(),
            ));
        }
        let minimum = i32::try_from(self.minimum_age_years).unwrap_or(i32::MAX);
        if age_in_years(birth_date, today) < minimum {
            return Err(AuthError::Validation(format!(
                "principal must be at least {} years old",
                self.minimum_age_years
            )));
        }
        Ok(())
    }

    /// Look up by case-folded email and check the password.
    ///
    /// Unknown email and wrong password fail identically and run one hash
    /// verification each.
    ///
    /// # Errors
    /// `InvalidCredentials` on any mismatch, `Internal` on storage failure.
    #[instrument(skip(self, password))]
    pub async fn verify(&self, email: &str, password: &str) -> AuthResult<Principal> {
        let email = normalize_email(email);
        let principal = self.principals.find_principal_by_email(&email).await?;

        let stored_hash = principal.as_ref().map(|p| p.password_hash.clone());
        let matched = verify_blocking(password.to_string(), stored_hash).await?;

        match principal {
            Some(principal) if matched => Ok(principal),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    /// Check a password for an already-identified principal.
    ///
    /// # Errors
    /// `InvalidCredentials` if the principal is unknown or the password is wrong.
    pub async fn verify_principal(&self, id: Uuid, password: &str) -> AuthResult<Principal> {
        let principal = self.principals.find_principal(id).await?;
        let stored_hash = principal.as_ref().map(|p| p.password_hash.clone());
        let matched = verify_blocking(password.to_string(), stored_hash).await?;

        match principal {
            Some(principal) if matched => Ok(principal),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    /// # Errors
    /// `Validation` for malformed input or policy violations, `AlreadyExists`
    /// when the case-folded email is taken.
    #[instrument(skip(self, registration), fields(email = %normalize_email(&registration.email)))]
    pub async fn register(&self, registration: Registration) -> AuthResult<Principal> {
        let email = normalize_email(&registration.email);
        if !valid_email(&email) {
            return Err(AuthError::Validation("invalid email".to_string()));
        }
        let display_name = registration.display_name.trim().to_string();
        if display_name.is_empty() || display_name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
            return Err(AuthError::Validation("invalid display name".to_string()));
        }
        self.check_password_policy(&registration.password)?;
        self.check_age_policy(registration.birth_date)?;

        let password_hash = hash_blocking(registration.password).await?;
        let new_principal = NewPrincipal {
            email,
            password_hash,
            display_name,
            birth_date: registration.birth_date,
            created_at: self.clock.now(),
        };

        match self.principals.insert_principal(new_principal).await? {
            InsertPrincipal::Created(principal) => {
                info!(principal_id = %principal.id, "principal registered");
                Ok(principal)
            }
            InsertPrincipal::Conflict => Err(AuthError::AlreadyExists),
        }
    }

    /// Re-verify `current`, apply the password policy to `new`, store its hash.
    ///
    /// # Errors
    /// `InvalidCredentials` if `current` is wrong, `Validation` if `new` is out of policy.
    #[instrument(skip(self, current, new))]
    pub async fn change_password(&self, id: Uuid, current: &str, new: &str) -> AuthResult<()> {
        self.verify_principal(id, current).await?;
        self.check_password_policy(new)?;

        let password_hash = hash_blocking(new.to_string()).await?;
        if !self.principals.update_password_hash(id, &password_hash).await? {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(())
    }
}

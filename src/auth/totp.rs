//! RFC 6238 one-time codes: SHA1, 6 digits, 30 second steps, one step of skew.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use totp_rs::{Algorithm, Secret, TOTP};

const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP_SECONDS: u64 = 30;

#[derive(Clone, Debug)]
pub struct Enrollment {
    pub secret_base32: String,
    pub otpauth_url: String,
}

fn build(secret_base32: &str, issuer: &str, account: &str) -> Result<TOTP> {
    let bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| anyhow!("invalid second-factor secret: {e:?}"))?;
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        STEP_SECONDS,
        bytes,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| anyhow!("TOTP init error: {e}"))
}

/// Generate a new secret and its provisioning URL.
///
/// # Errors
/// Returns an error if the generated secret cannot be turned into a TOTP.
pub fn generate(issuer: &str, account: &str) -> Result<Enrollment> {
    let Secret::Encoded(secret) = Secret::generate_secret().to_encoded() else {
        return Err(anyhow!("generated second-factor secret is not base32"));
    };
    let totp = build(&secret, issuer, account)?;
    Ok(Enrollment {
        secret_base32: totp.get_secret_base32(),
        otpauth_url: totp.get_url(),
    })
}

/// Accepts the code for the step containing `at` and the steps on either side.
///
/// # Errors
/// Returns an error if the stored secret is unusable.
pub fn check(secret_base32: &str, code: &str, at: DateTime<Utc>) -> Result<bool> {
    let code = code.trim();
    if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(false);
    }
    let Ok(time) = u64::try_from(at.timestamp()) else {
        return Ok(false);
    };
    // The account label does not take part in code generation.
    let totp = build(secret_base32, "tessera", "check")?;
    Ok(totp.check(code, time))
}

/// The code valid at `at`; used by tests and tooling.
///
/// # Errors
/// Returns an error if the secret is unusable or `at` precedes the epoch.
pub fn code_at(secret_base32: &str, at: DateTime<Utc>) -> Result<String> {
    let time = u64::try_from(at.timestamp()).map_err(|_| anyhow!("time before unix epoch"))?;
    Ok(build(secret_base32, "tessera", "check")?.generate(time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn generated_secret_round_trips_through_check() -> Result<()> {
        let enrollment = generate("tessera", "alice@example.com")?;
        assert!(enrollment.otpauth_url.starts_with("otpauth://totp/"));

        let now = Utc::now();
        let code = code_at(&enrollment.secret_base32, now)?;
        assert!(check(&enrollment.secret_base32, &code, now)?);
        Ok(())
    }

    #[test]
    fn adjacent_steps_are_tolerated_but_not_further() -> Result<()> {
        let enrollment = generate("tessera", "alice@example.com")?;
        let now = Utc::now();
        let code = code_at(&enrollment.secret_base32, now)?;

        assert!(check(
            &enrollment.secret_base32,
            &code,
            now + Duration::seconds(30)
        )?);
        assert!(!check(
            &enrollment.secret_base32,
            &code,
            now + Duration::seconds(120)
        )?);
        Ok(())
    }

    #[test]
    fn malformed_codes_fail_without_error() -> Result<()> {
        let enrollment = generate("tessera", "alice@example.com")?;
        let now = Utc::now();
        assert!(!check(&enrollment.secret_base32, "12345", now)?);
        assert!(!check(&enrollment.secret_base32, "abcdef", now)?);
        Ok(())
    }
}

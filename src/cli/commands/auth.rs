use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_TOKEN_SECRET: &str = "token-secret";
pub const ARG_TOKEN_ISSUER: &str = "token-issuer";
pub const ARG_ACCESS_TTL_SECONDS: &str = "access-ttl-seconds";
pub const ARG_REFRESH_TTL_SECONDS: &str = "refresh-ttl-seconds";
pub const ARG_CHALLENGE_TTL_SECONDS: &str = "challenge-ttl-seconds";
pub const ARG_PASSWORD_MIN_LENGTH: &str = "password-min-length";
pub const ARG_MINIMUM_AGE_YEARS: &str = "minimum-age-years";
pub const ARG_TOTP_ISSUER: &str = "totp-issuer";
pub const ARG_SWEEP_INTERVAL_SECONDS: &str = "sweep-interval-seconds";
pub const ARG_SWEEP_BATCH_SIZE: &str = "sweep-batch-size";

pub const MAX_ACCESS_TTL_SECONDS: i64 = 24 * 60 * 60;
pub const MAX_REFRESH_TTL_SECONDS: i64 = 365 * 24 * 60 * 60;
pub const MAX_CHALLENGE_TTL_SECONDS: i64 = 60 * 60;

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    let command = with_policy_args(command);
    with_sweep_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOKEN_SECRET)
                .long(ARG_TOKEN_SECRET)
                .help("Base64-encoded signing secret, at least 32 bytes once decoded")
                .env("TESSERA_TOKEN_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_TOKEN_ISSUER)
                .long(ARG_TOKEN_ISSUER)
                .help("Issuer claim placed in and required on every token")
                .env("TESSERA_TOKEN_ISSUER")
                .default_value("tessera"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TTL_SECONDS)
                .long(ARG_ACCESS_TTL_SECONDS)
                .help("Access token TTL in seconds")
                .env("TESSERA_ACCESS_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_ACCESS_TTL_SECONDS)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL_SECONDS)
                .long(ARG_REFRESH_TTL_SECONDS)
                .help("Refresh token TTL in seconds")
                .env("TESSERA_REFRESH_TTL_SECONDS")
                .default_value("1209600")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_REFRESH_TTL_SECONDS)),
        )
        .arg(
            Arg::new(ARG_CHALLENGE_TTL_SECONDS)
                .long(ARG_CHALLENGE_TTL_SECONDS)
                .help("Second-factor challenge TTL in seconds")
                .env("TESSERA_CHALLENGE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_CHALLENGE_TTL_SECONDS)),
        )
}

fn with_policy_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PASSWORD_MIN_LENGTH)
                .long(ARG_PASSWORD_MIN_LENGTH)
                .help("Minimum password length in characters")
                .env("TESSERA_PASSWORD_MIN_LENGTH")
                .default_value("8")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_MINIMUM_AGE_YEARS)
                .long(ARG_MINIMUM_AGE_YEARS)
                .help("Minimum age in years at registration")
                .env("TESSERA_MINIMUM_AGE_YEARS")
                .default_value("18")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_TOTP_ISSUER)
                .long(ARG_TOTP_ISSUER)
                .help("Issuer shown in authenticator apps")
                .env("TESSERA_TOTP_ISSUER")
                .default_value("tessera"),
        )
}

fn with_sweep_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SWEEP_INTERVAL_SECONDS)
                .long(ARG_SWEEP_INTERVAL_SECONDS)
                .help("Seconds between expired-session sweeps")
                .env("TESSERA_SWEEP_INTERVAL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SWEEP_BATCH_SIZE)
                .long(ARG_SWEEP_BATCH_SIZE)
                .help("Maximum expired sessions deleted per sweep")
                .env("TESSERA_SWEEP_BATCH_SIZE")
                .default_value("500")
                .value_parser(clap::value_parser!(usize)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub token_secret: SecretString,
    pub token_issuer: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub challenge_ttl_seconds: i64,
    pub password_min_length: usize,
    pub minimum_age_years: u32,
    pub totp_issuer: String,
    pub sweep_interval_seconds: u64,
    pub sweep_batch_size: usize,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let token_secret = matches
            .get_one::<String>(ARG_TOKEN_SECRET)
            .cloned()
            .context("missing required argument: --token-secret")?;

        Ok(Self {
            token_secret: SecretString::from(token_secret),
            token_issuer: matches
                .get_one::<String>(ARG_TOKEN_ISSUER)
                .cloned()
                .unwrap_or_else(|| "tessera".to_string()),
            access_ttl_seconds: matches
                .get_one::<i64>(ARG_ACCESS_TTL_SECONDS)
                .copied()
                .unwrap_or(900),
            refresh_ttl_seconds: matches
                .get_one::<i64>(ARG_REFRESH_TTL_SECONDS)
                .copied()
                .unwrap_or(1_209_600),
            challenge_ttl_seconds: matches
                .get_one::<i64>(ARG_CHALLENGE_TTL_SECONDS)
                .copied()
                .unwrap_or(300),
            password_min_length: matches
                .get_one::<usize>(ARG_PASSWORD_MIN_LENGTH)
                .copied()
                .unwrap_or(8),
            minimum_age_years: matches
                .get_one::<u32>(ARG_MINIMUM_AGE_YEARS)
                .copied()
                .unwrap_or(18),
            totp_issuer: matches
                .get_one::<String>(ARG_TOTP_ISSUER)
                .cloned()
                .unwrap_or_else(|| "tessera".to_string()),
            sweep_interval_seconds: matches
                .get_one::<u64>(ARG_SWEEP_INTERVAL_SECONDS)
                .copied()
                .unwrap_or(3600),
            sweep_batch_size: matches
                .get_one::<usize>(ARG_SWEEP_BATCH_SIZE)
                .copied()
                .unwrap_or(500),
        })
    }
}

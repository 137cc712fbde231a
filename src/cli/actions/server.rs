use crate::{
    api,
    auth::{AuthConfig, AuthService, SystemClock, TokenSigner},
    cli::telemetry,
    store::{postgres::PgStore, Stores},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use std::{fmt, sync::Arc, time::Duration};
use tracing::info;
use url::Url;

pub struct Args {
    pub port: u16,
    pub dsn: String,
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

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field("port", &self.port)
            .field("dsn", &redact_dsn(&self.dsn))
            .field("token_secret", &"[REDACTED]")
            .field("token_issuer", &self.token_issuer)
            .field("access_ttl_seconds", &self.access_ttl_seconds)
            .field("refresh_ttl_seconds", &self.refresh_ttl_seconds)
            .field("challenge_ttl_seconds", &self.challenge_ttl_seconds)
            .field("password_min_length", &self.password_min_length)
            .field("minimum_age_years", &self.minimum_age_years)
            .field("totp_issuer", &self.totp_issuer)
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .field("sweep_batch_size", &self.sweep_batch_size)
            .finish()
    }
}

impl Args {
    fn auth_config(&self) -> AuthConfig {
        AuthConfig::new()
            .with_token_issuer(self.token_issuer.clone())
            .with_access_ttl_seconds(self.access_ttl_seconds)
            .with_refresh_ttl_seconds(self.refresh_ttl_seconds)
            .with_challenge_ttl_seconds(self.challenge_ttl_seconds)
            .with_password_min_length(self.password_min_length)
            .with_minimum_age_years(self.minimum_age_years)
            .with_totp_issuer(self.totp_issuer.clone())
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the signing secret is unusable, the database is
/// unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let config = args.auth_config();
    let signer = TokenSigner::from_base64(&args.token_secret, config.token_issuer())
        .context("Invalid token signing secret")?;

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&args.dsn)
        .await
        .context("Failed to connect to database")?;

    PgStore::apply_schema(&pool)
        .await
        .context("Failed to apply database schema")?;

    let service = Arc::new(AuthService::new(
        config,
        signer,
        Stores::postgres(pool),
        Arc::new(SystemClock),
    ));

    let sweeper = service.spawn_sweeper(
        Duration::from_secs(args.sweep_interval_seconds),
        args.sweep_batch_size,
    );

    let result = api::serve(args.port, api::router(service)).await;

    sweeper.abort();
    telemetry::shutdown_tracer();

    result
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(&args.dsn)),
        ("token_issuer", args.token_issuer.clone()),
        ("access_ttl_seconds", args.access_ttl_seconds.to_string()),
        ("refresh_ttl_seconds", args.refresh_ttl_seconds.to_string()),
        (
            "challenge_ttl_seconds",
            args.challenge_ttl_seconds.to_string(),
        ),
        ("password_min_length", args.password_min_length.to_string()),
        ("minimum_age_years", args.minimum_age_years.to_string()),
        (
            "sweep_interval_seconds",
            args.sweep_interval_seconds.to_string(),
        ),
        ("sweep_batch_size", args.sweep_batch_size.to_string()),
    ];

    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "tessera {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}

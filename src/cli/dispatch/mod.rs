//! Maps validated CLI arguments to the action to run.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{auth, ARG_DSN, ARG_PORT};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        token_secret: auth_opts.token_secret,
        token_issuer: auth_opts.token_issuer,
        access_ttl_seconds: auth_opts.access_ttl_seconds,
        refresh_ttl_seconds: auth_opts.refresh_ttl_seconds,
        challenge_ttl_seconds: auth_opts.challenge_ttl_seconds,
        password_min_length: auth_opts.password_min_length,
        minimum_age_years: auth_opts.minimum_age_years,
        totp_issuer: auth_opts.totp_issuer,
        sweep_interval_seconds: auth_opts.sweep_interval_seconds,
        sweep_batch_size: auth_opts.sweep_batch_size,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn builds_server_action_from_env() {
        temp_env::with_vars(
            [
                ("TESSERA_DSN", Some("postgres://tessera@localhost:5432/tessera")),
                ("TESSERA_TOKEN_SECRET", Some("c2VjcmV0")),
                ("TESSERA_PORT", Some("9443")),
                ("TESSERA_REFRESH_TTL_SECONDS", Some("3600")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["tessera"]);
                let action = handler(&matches);
                assert!(action.is_ok());
                if let Ok(Action::Server(args)) = action {
                    assert_eq!(args.port, 9443);
                    assert_eq!(args.dsn, "postgres://tessera@localhost:5432/tessera");
                    assert_eq!(args.token_secret.expose_secret(), "c2VjcmV0");
                    assert_eq!(args.refresh_ttl_seconds, 3600);
                    assert_eq!(args.access_ttl_seconds, 900);
                }
            },
        );
    }

    #[test]
    fn token_secret_required() {
        temp_env::with_vars(
            [
                ("TESSERA_DSN", Some("postgres://tessera@localhost:5432/tessera")),
                ("TESSERA_TOKEN_SECRET", None::<&str>),
            ],
            || {
                let result = crate::cli::commands::new().try_get_matches_from(vec!["tessera"]);
                assert!(result.is_err());
            },
        );
    }
}

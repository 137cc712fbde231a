//! Engine settings.

const DEFAULT_TOKEN_ISSUER: &str = "tessera";
const DEFAULT_ACCESS_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 14 * 24 * 60 * 60;
const DEFAULT_CHALLENGE_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_PASSWORD_MIN_LENGTH: usize = 8;
const DEFAULT_MINIMUM_AGE_YEARS: u32 = 18;
const DEFAULT_TOTP_ISSUER: &str = "tessera";
const DEFAULT_MAX_CHAIN_HOPS: usize = 10_000;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    token_issuer: String,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    challenge_ttl_seconds: i64,
    password_min_length: usize,
    minimum_age_years: u32,
    totp_issuer: String,
    max_chain_hops: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_issuer: DEFAULT_TOKEN_ISSUER.to_string(),
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            challenge_ttl_seconds: DEFAULT_CHALLENGE_TTL_SECONDS,
            password_min_length: DEFAULT_PASSWORD_MIN_LENGTH,
            minimum_age_years: DEFAULT_MINIMUM_AGE_YEARS,
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
            max_chain_hops: DEFAULT_MAX_CHAIN_HOPS,
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token_issuer(mut self, issuer: String) -> Self {
        self.token_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_challenge_ttl_seconds(mut self, seconds: i64) -> Self {
        self.challenge_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_password_min_length(mut self, length: usize) -> Self {
        self.password_min_length = length;
        self
    }

    #[must_use]
    pub fn with_minimum_age_years(mut self, years: u32) -> Self {
        self.minimum_age_years = years;
        self
    }

    #[must_use]
    pub fn with_totp_issuer(mut self, issuer: String) -> Self {
        self.totp_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_max_chain_hops(mut self, hops: usize) -> Self {
        self.max_chain_hops = hops;
        self
    }

    #[must_use]
    pub fn token_issuer(&self) -> &str {
        &self.token_issuer
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    #[must_use]
    pub fn challenge_ttl_seconds(&self) -> i64 {
        self.challenge_ttl_seconds
    }

    #[must_use]
    pub fn password_min_length(&self) -> usize {
        self.password_min_length
    }

    #[must_use]
    pub fn minimum_age_years(&self) -> u32 {
        self.minimum_age_years
    }

    #[must_use]
    pub fn totp_issuer(&self) -> &str {
        &self.totp_issuer
    }

    #[must_use]
    pub fn max_chain_hops(&self) -> usize {
        self.max_chain_hops
    }
}

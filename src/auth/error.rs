use thiserror::Error;

/// Why a second-factor step was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecondFactorFailure {
    ExpiredOrInvalidChallenge,
    InvalidCode,
    NotEnrolled,
}

impl SecondFactorFailure {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExpiredOrInvalidChallenge => "expired_or_invalid_challenge",
            Self::InvalidCode => "invalid_code",
            Self::NotEnrolled => "not_enrolled",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("principal already exists")]
    AlreadyExists,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid refresh token")]
    InvalidRefreshToken,

    #[error("refresh token reuse detected")]
    TokenReuseDetected,

    #[error("invalid second factor: {}", .0.as_str())]
    InvalidSecondFactor(SecondFactorFailure),

    #[error("invalid access token")]
    InvalidAccessToken,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Failures that callers must see as a plain "re-authenticate".
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::InvalidRefreshToken
                | Self::TokenReuseDetected
                | Self::InvalidSecondFactor(_)
                | Self::InvalidAccessToken
        )
    }

    /// Stable, fine-grained kind for audit logs only.
    #[must_use]
    pub fn audit_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AlreadyExists => "already_exists",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidRefreshToken => "invalid_refresh_token",
            Self::TokenReuseDetected => "token_reuse_detected",
            Self::InvalidSecondFactor(reason) => reason.as_str(),
            Self::InvalidAccessToken => "invalid_access_token",
            Self::Internal(_) => "internal",
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

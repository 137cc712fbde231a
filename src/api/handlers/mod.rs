pub mod auth;
pub mod health;
pub mod me;
pub mod second_factor;
pub mod types;

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::{debug, error};
use uuid::Uuid;

use crate::auth::{AuthError, AuthService};

/// Maps engine errors onto HTTP. Every auth failure gets the same 401 body; the
/// fine-grained kind only reaches the debug log.
#[derive(Debug)]
pub struct ApiError(pub AuthError);

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub(crate) fn missing_payload() -> Self {
        Self(AuthError::Validation("missing or malformed payload".to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if err.is_unauthorized() {
            debug!(kind = err.audit_kind(), "request unauthorized");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized" })),
            )
                .into_response();
        }
        match err {
            AuthError::Validation(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            AuthError::AlreadyExists => (
                StatusCode::CONFLICT,
                Json(json!({ "error": "already_exists" })),
            )
                .into_response(),
            other => {
                error!("request failed: {other:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal_error" })),
                )
                    .into_response()
            }
        }
    }
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Resolve the caller from its access token.
pub(crate) fn authenticate(headers: &HeaderMap, service: &AuthService) -> Result<Uuid, ApiError> {
    let token = extract_bearer_token(headers).ok_or(AuthError::InvalidAccessToken)?;
    Ok(service.verify_access_token(&token)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::to_bytes, http::HeaderValue};

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9v"));
        assert!(extract_bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert!(extract_bearer_token(&headers).is_none());
    }

    #[tokio::test]
    async fn reuse_and_invalid_token_render_identically() -> anyhow::Result<()> {
        let reuse = ApiError(AuthError::TokenReuseDetected).into_response();
        let invalid = ApiError(AuthError::InvalidRefreshToken).into_response();
        assert_eq!(reuse.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);

        let reuse = to_bytes(reuse.into_body(), usize::MAX).await?;
        let invalid = to_bytes(invalid.into_body(), usize::MAX).await?;
        assert_eq!(reuse, invalid);
        Ok(())
    }

    #[test]
    fn non_auth_errors_keep_their_status() {
        assert_eq!(
            ApiError(AuthError::AlreadyExists).into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(AuthError::Validation("bad".to_string()))
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(AuthError::Internal(anyhow::anyhow!("db down")))
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

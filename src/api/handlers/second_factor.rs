//! TOTP enrollment and removal for the authenticated principal.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;
use tracing::instrument;

use super::{
    authenticate,
    types::{CodeRequest, EnrollmentResponse},
    ApiError,
};
use crate::auth::AuthService;

#[utoipa::path(
    post,
    path = "/v1/auth/second-factor/enroll/start",
    responses(
        (status = 200, description = "Pending secret generated", body = EnrollmentResponse),
        (status = 400, description = "Second factor already enabled"),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "second-factor"
)]
#[instrument(skip(service, headers))]
pub async fn enroll_start(
    service: Extension<Arc<AuthService>>,
    headers: HeaderMap,
) -> Result<Json<EnrollmentResponse>, ApiError> {
    let principal_id = authenticate(&headers, &service)?;
    let enrollment = service.begin_second_factor_enrollment(principal_id).await?;
    Ok(Json(enrollment.into()))
}

#[utoipa::path(
    post,
    path = "/v1/auth/second-factor/enroll/finish",
    request_body = CodeRequest,
    responses(
        (status = 204, description = "Second factor enabled"),
        (status = 401, description = "Unauthorized or wrong code"),
    ),
    security(("bearer" = [])),
    tag = "second-factor"
)]
#[instrument(skip(service, headers, payload))]
pub async fn enroll_finish(
    service: Extension<Arc<AuthService>>,
    headers: HeaderMap,
    payload: Option<Json<CodeRequest>>,
) -> Result<StatusCode, ApiError> {
    let principal_id = authenticate(&headers, &service)?;
    let Some(Json(request)) = payload else {
        return Err(ApiError::missing_payload());
    };

    service
        .confirm_second_factor_enrollment(principal_id, &request.code)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/auth/second-factor/disable",
    request_body = CodeRequest,
    responses(
        (status = 204, description = "Second factor removed"),
        (status = 401, description = "Unauthorized or wrong code"),
    ),
    security(("bearer" = [])),
    tag = "second-factor"
)]
#[instrument(skip(service, headers, payload))]
pub async fn disable(
    service: Extension<Arc<AuthService>>,
    headers: HeaderMap,
    payload: Option<Json<CodeRequest>>,
) -> Result<StatusCode, ApiError> {
    let principal_id = authenticate(&headers, &service)?;
    let Some(Json(request)) = payload else {
        return Err(ApiError::missing_payload());
    };

    service
        .disable_second_factor(principal_id, &request.code)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

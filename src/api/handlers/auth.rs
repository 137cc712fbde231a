//! Registration, login, refresh and logout.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;
use tracing::instrument;

use super::{
    authenticate,
    types::{
        device_info, ChangePasswordRequest, LoginRequest, LoginResponse, RefreshRequest,
        RegisterRequest, RegisterResponse, RevokedResponse, SecondFactorLoginRequest,
        TokenResponse,
    },
    ApiError,
};
use crate::auth::{AuthService, LoginOutcome, Registration};

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Principal registered", body = RegisterResponse),
        (status = 400, description = "Invalid email, password, display name or age"),
        (status = 409, description = "Email already registered"),
    ),
    tag = "auth"
)]
#[instrument(skip(service, payload))]
pub async fn register(
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<RegisterRequest>>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::missing_payload());
    };

    let principal = service
        .register(Registration {
            email: request.email,
            password: request.password,
            display_name: request.display_name,
            birth_date: request.birth_date,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            principal_id: principal.id,
            email: principal.email,
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Tokens issued or second factor required", body = LoginResponse),
        (status = 401, description = "Unauthorized"),
    ),
    tag = "auth"
)]
#[instrument(skip(service, payload))]
pub async fn login(
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<LoginRequest>>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::missing_payload());
    };

    let outcome = service
        .login(
            &request.email,
            &request.password,
            device_info(request.device_id, request.platform),
        )
        .await?;

    let response = match outcome {
        LoginOutcome::Tokens(session) => LoginResponse::Authenticated {
            tokens: TokenResponse::new(session.tokens, Some(session.device_id)),
        },
        LoginOutcome::SecondFactorRequired(challenge) => LoginResponse::SecondFactorRequired {
            challenge: challenge.token,
            expires_at: challenge.expires_at,
        },
    };
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/auth/login/second-factor",
    request_body = SecondFactorLoginRequest,
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 401, description = "Unauthorized"),
    ),
    tag = "auth"
)]
#[instrument(skip(service, payload))]
pub async fn login_second_factor(
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<SecondFactorLoginRequest>>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::missing_payload());
    };

    let session = service
        .verify_second_factor(
            &request.challenge,
            &request.code,
            device_info(request.device_id, request.platform),
        )
        .await?;

    Ok(Json(TokenResponse::new(
        session.tokens,
        Some(session.device_id),
    )))
}

#[utoipa::path(
    post,
    path = "/v1/auth/token/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated token pair", body = TokenResponse),
        (status = 401, description = "Unauthorized, log in again"),
    ),
    tag = "auth"
)]
#[instrument(skip(service, payload))]
pub async fn refresh(
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<RefreshRequest>>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::missing_payload());
    };

    let pair = service.rotate(&request.refresh_token).await?;
    Ok(Json(TokenResponse::new(pair, None)))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = RefreshRequest,
    responses(
        (status = 204, description = "Session revoked (or token already unusable)"),
    ),
    tag = "auth"
)]
#[instrument(skip(service, payload))]
pub async fn logout(
    service: Extension<Arc<AuthService>>,
    payload: Option<Json<RefreshRequest>>,
) -> Result<StatusCode, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::missing_payload());
    };

    service.logout(&request.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout-all",
    responses(
        (status = 200, description = "Every session revoked", body = RevokedResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip(service, headers))]
pub async fn logout_all(
    service: Extension<Arc<AuthService>>,
    headers: HeaderMap,
) -> Result<Json<RevokedResponse>, ApiError> {
    let principal_id = authenticate(&headers, &service)?;
    let revoked = service.logout_all(principal_id).await?;
    Ok(Json(RevokedResponse { revoked }))
}

#[utoipa::path(
    post,
    path = "/v1/auth/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed and every session revoked", body = RevokedResponse),
        (status = 400, description = "New password out of policy"),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip(service, headers, payload))]
pub async fn change_password(
    service: Extension<Arc<AuthService>>,
    headers: HeaderMap,
    payload: Option<Json<ChangePasswordRequest>>,
) -> Result<Json<RevokedResponse>, ApiError> {
    let principal_id = authenticate(&headers, &service)?;
    let Some(Json(request)) = payload else {
        return Err(ApiError::missing_payload());
    };

    let revoked = service
        .change_password(
            principal_id,
            &request.current_password,
            &request.new_password,
        )
        .await?;
    Ok(Json(RevokedResponse { revoked }))
}

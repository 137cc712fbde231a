use axum::{extract::Extension, http::HeaderMap, Json};
use std::sync::Arc;
use tracing::instrument;

use super::{
    authenticate,
    types::{DeviceView, MeResponse, SessionView},
    ApiError,
};
use crate::auth::AuthService;

#[utoipa::path(
    get,
    path = "/v1/me",
    responses(
        (status = 200, description = "The authenticated principal", body = MeResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "me"
)]
#[instrument(skip(service, headers))]
pub async fn me(
    service: Extension<Arc<AuthService>>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiError> {
    let principal_id = authenticate(&headers, &service)?;
    let principal = service.principal(principal_id).await?;
    Ok(Json(principal.into()))
}

#[utoipa::path(
    get,
    path = "/v1/auth/sessions",
    responses(
        (status = 200, description = "Active sessions, newest first", body = [SessionView]),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "me"
)]
#[instrument(skip(service, headers))]
pub async fn sessions(
    service: Extension<Arc<AuthService>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    let principal_id = authenticate(&headers, &service)?;
    let sessions = service.list_sessions(principal_id).await?;
    Ok(Json(sessions.into_iter().map(SessionView::from).collect()))
}

#[utoipa::path(
    get,
    path = "/v1/auth/devices",
    responses(
        (status = 200, description = "Known devices by last use", body = [DeviceView]),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "me"
)]
#[instrument(skip(service, headers))]
pub async fn devices(
    service: Extension<Arc<AuthService>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeviceView>>, ApiError> {
    let principal_id = authenticate(&headers, &service)?;
    let devices = service.list_devices(principal_id).await?;
    Ok(Json(devices.into_iter().map(DeviceView::from).collect()))
}

//! HTTP adapter over [`AuthService`].

pub mod handlers;
pub mod openapi;

use anyhow::Result;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderName, HeaderValue, Request},
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

use crate::auth::AuthService;
use handlers::{auth, health, me, second_factor};

const REQUEST_ID: &str = "x-request-id";

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(openapi::openapi())
}

/// Every route plus request-id and tracing layers.
#[must_use]
pub fn router(service: Arc<AuthService>) -> Router {
    Router::new()
        .route("/health", get(health::health).options(health::health))
        .route("/openapi.json", get(openapi_json))
        .route("/v1/auth/register", post(auth::register))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/login/second-factor", post(auth::login_second_factor))
        .route("/v1/auth/token/refresh", post(auth::refresh))
        .route("/v1/auth/logout", post(auth::logout))
        .route("/v1/auth/logout-all", post(auth::logout_all))
        .route("/v1/auth/password", post(auth::change_password))
        .route(
            "/v1/auth/second-factor/enroll/start",
            post(second_factor::enroll_start),
        )
        .route(
            "/v1/auth/second-factor/enroll/finish",
            post(second_factor::enroll_finish),
        )
        .route("/v1/auth/second-factor/disable", post(second_factor::disable))
        .route("/v1/auth/sessions", get(me::sessions))
        .route("/v1/auth/devices", get(me::devices))
        .route("/v1/me", get(me::me))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static(REQUEST_ID),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    REQUEST_ID,
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(service)),
        )
}

/// Listen on `[::]:port` until ctrl-c.
///
/// # Errors
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(port: u16, app: Router) -> Result<()> {
    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

// Headers are left out: they carry bearer tokens.
fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    info_span!(
        "http.request",
        method = %request.method(),
        path = request.uri().path(),
        request_id
    )
}

use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use super::handlers::{auth, health, me, second_factor, types};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        auth::register,
        auth::login,
        auth::login_second_factor,
        auth::refresh,
        auth::logout,
        auth::logout_all,
        auth::change_password,
        second_factor::enroll_start,
        second_factor::enroll_finish,
        second_factor::disable,
        me::me,
        me::sessions,
        me::devices,
    ),
    components(schemas(
        health::Health,
        types::RegisterRequest,
        types::RegisterResponse,
        types::LoginRequest,
        types::LoginResponse,
        types::SecondFactorLoginRequest,
        types::TokenResponse,
        types::RefreshRequest,
        types::RevokedResponse,
        types::ChangePasswordRequest,
        types::EnrollmentResponse,
        types::CodeRequest,
        types::SessionView,
        types::DeviceView,
        types::MeResponse,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "auth", description = "Credentials, tokens and sessions"),
        (name = "second-factor", description = "TOTP enrollment"),
        (name = "me", description = "The authenticated principal"),
        (name = "health", description = "Liveness"),
    )
)]
struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi
            .components
            .get_or_insert_with(utoipa::openapi::Components::new);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

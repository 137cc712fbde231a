//! Request and response bodies.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::{DeviceInfo, Enrollment, TokenPair},
    store::{Device, Principal, SessionNode},
};

#[derive(ToSchema, Deserialize, Debug)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub birth_date: NaiveDate,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterResponse {
    pub principal_id: Uuid,
    pub email: String,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct SecondFactorLoginRequest {
    pub challenge: String,
    pub code: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

pub(crate) fn device_info(device_id: Option<String>, platform: Option<String>) -> DeviceInfo {
    DeviceInfo {
        device_id,
        platform,
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub token_type: String,
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl TokenResponse {
    pub(crate) fn new(pair: TokenPair, device_id: Option<String>) -> Self {
        Self {
            token_type: "Bearer".to_string(),
            access_token: pair.access_token,
            access_expires_at: pair.access_expires_at,
            refresh_token: pair.refresh_token,
            refresh_expires_at: pair.refresh_expires_at,
            device_id,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginResponse {
    Authenticated {
        tokens: TokenResponse,
    },
    SecondFactorRequired {
        challenge: String,
        expires_at: DateTime<Utc>,
    },
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RevokedResponse {
    pub revoked: u64,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct EnrollmentResponse {
    pub secret: String,
    pub otpauth_url: String,
}

impl From<Enrollment> for EnrollmentResponse {
    fn from(enrollment: Enrollment) -> Self {
        Self {
            secret: enrollment.secret_base32,
            otpauth_url: enrollment.otpauth_url,
        }
    }
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct CodeRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionView {
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<SessionNode> for SessionView {
    fn from(node: SessionNode) -> Self {
        Self {
            device_id: node.device_id,
            created_at: node.created_at,
            expires_at: node.expires_at,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DeviceView {
    pub device_id: String,
    pub platform: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl From<Device> for DeviceView {
    fn from(device: Device) -> Self {
        Self {
            device_id: device.device_id,
            platform: device.platform,
            first_seen_at: device.first_seen_at,
            last_seen_at: device.last_seen_at,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MeResponse {
    pub principal_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub birth_date: NaiveDate,
    pub second_factor_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Principal> for MeResponse {
    fn from(principal: Principal) -> Self {
        Self {
            principal_id: principal.id,
            email: principal.email,
            display_name: principal.display_name,
            birth_date: principal.birth_date,
            second_factor_enabled: principal.totp_enabled,
            created_at: principal.created_at,
        }
    }
}

//! Persistence contracts for principals, devices and refresh-token session nodes.
//!
//! Session nodes form an arena keyed by `jti`. Each node carries at most one
//! forward pointer (`successor`), set in the same conditional update that retires
//! it during rotation. Chains are walked iteratively with a hop bound.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::{fmt, sync::Arc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A registered identity.
#[derive(Clone)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub display_name: String,
    pub birth_date: NaiveDate,
    pub totp_secret: Option<String>,
    pub totp_enabled: bool,
    pub created_at: DateTime<Utc>,
}

// Hashes and second-factor secrets never reach logs.
impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .field("totp_enabled", &self.totp_enabled)
            .finish_non_exhaustive()
    }
}

/// Fields required to insert a principal; the email is already case-folded.
#[derive(Clone)]
pub struct NewPrincipal {
    pub email: String,
    pub password_hash: String,
    pub display_name: String,
    pub birth_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum InsertPrincipal {
    Created(Principal),
    Conflict,
}

/// A (principal, device) pair. Informational only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Device {
    pub principal_id: Uuid,
    pub device_id: String,
    pub platform: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Why a session node stopped being usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Rotated,
    Logout,
    LogoutAll,
    ReuseCascade,
}

impl RevocationReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rotated => "rotated",
            Self::Logout => "logout",
            Self::LogoutAll => "logout_all",
            Self::ReuseCascade => "reuse_cascade",
        }
    }

    #[must_use]
    pub fn from_db(value: &str) -> Option<Self> {
        match value.trim() {
            "rotated" => Some(Self::Rotated),
            "logout" => Some(Self::Logout),
            "logout_all" => Some(Self::LogoutAll),
            "reuse_cascade" => Some(Self::ReuseCascade),
            _ => None,
        }
    }
}

/// One refresh token's persisted state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionNode {
    pub jti: String,
    pub principal_id: Uuid,
    pub device_id: String,
    pub revoked: bool,
    pub successor: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<RevocationReason>,
}

impl SessionNode {
    /// Retired by rotation: revoked and linked forward.
    #[must_use]
    pub fn is_rotated(&self) -> bool {
        self.revoked && self.successor.is_some()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.revoked
    }
}

#[derive(Clone, Debug)]
pub struct NewSessionNode {
    pub jti: String,
    pub principal_id: Uuid,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewSessionNode {
    pub(crate) fn into_node(self) -> SessionNode {
        SessionNode {
            jti: self.jti,
            principal_id: self.principal_id,
            device_id: self.device_id,
            revoked: false,
            successor: None,
            expires_at: self.expires_at,
            created_at: self.created_at,
            revoked_at: None,
            revoked_reason: None,
        }
    }
}

/// Result of the conditional "retire with successor" update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkRotated {
    Rotated,
    /// The node was no longer active: another rotation (or a logout) got there first.
    AlreadyRotated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuccessorOutcome {
    Linked(SessionNode),
    /// Nothing was written; the parent had already been retired.
    AlreadyRotated,
}

#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn insert_principal(&self, principal: NewPrincipal) -> Result<InsertPrincipal>;

    async fn find_principal_by_email(&self, email: &str) -> Result<Option<Principal>>;

    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>>;

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> Result<bool>;

    /// Replace the second-factor secret and enabled flag in one write.
    async fn set_second_factor(&self, id: Uuid, secret: Option<&str>, enabled: bool)
        -> Result<bool>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert the device or bump its `last_seen_at`.
    async fn touch_device(
        &self,
        principal_id: Uuid,
        device_id: &str,
        platform: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<Device>;

    async fn list_devices(&self, principal_id: Uuid) -> Result<Vec<Device>>;
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn create(&self, node: NewSessionNode) -> Result<SessionNode>;

    async fn find(&self, jti: &str) -> Result<Option<SessionNode>>;

    /// Atomically set `revoked = true, successor = successor_jti` where the node is
    /// still active. Exactly one concurrent caller observes `Rotated`.
    async fn mark_rotated(
        &self,
        jti: &str,
        successor_jti: &str,
        at: DateTime<Utc>,
    ) -> Result<MarkRotated>;

    /// Insert `node` and retire `parent_jti` in favour of it, in one transaction.
    /// When the parent is no longer active nothing is persisted.
    async fn create_successor(
        &self,
        parent_jti: &str,
        node: NewSessionNode,
    ) -> Result<SuccessorOutcome>;

    /// Revoke without a successor. Returns `false` if the node was missing or already revoked.
    async fn mark_revoked(
        &self,
        jti: &str,
        reason: RevocationReason,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Revoke every active node of a principal; returns how many changed.
    async fn revoke_all(&self, principal_id: Uuid, at: DateTime<Utc>) -> Result<u64>;

    /// The node for `jti` followed by each successor up to the chain tip.
    async fn walk_successors(&self, jti: &str, max_hops: usize) -> Result<Vec<SessionNode>>;

    /// Walk forward from `jti` and revoke every still-active node, in one transaction.
    async fn revoke_chain(&self, jti: &str, max_hops: usize, at: DateTime<Utc>) -> Result<u64>;

    async fn list_active(&self, principal_id: Uuid, now: DateTime<Utc>)
        -> Result<Vec<SessionNode>>;

    /// Up to `limit` node ids whose `expires_at` is at or before `cutoff`.
    async fn expired_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>>;

    async fn delete(&self, jti: &str) -> Result<bool>;

    /// Fails when the backing storage cannot be reached.
    async fn ping(&self) -> Result<()>;
}

/// The three storage seams the engine needs, usually backed by one store.
#[derive(Clone)]
pub struct Stores {
    pub principals: Arc<dyn PrincipalStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub sessions: Arc<dyn SessionRegistry>,
}

impl Stores {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: PrincipalStore + DeviceStore + SessionRegistry + 'static,
    {
        Self {
            principals: backend.clone(),
            devices: backend.clone(),
            sessions: backend,
        }
    }

    #[must_use]
    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }

    #[must_use]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self::from_backend(Arc::new(PgStore::new(pool)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revocation_reason_round_trips_db_text() {
        for reason in [
            RevocationReason::Rotated,
            RevocationReason::Logout,
            RevocationReason::LogoutAll,
            RevocationReason::ReuseCascade,
        ] {
            assert_eq!(RevocationReason::from_db(reason.as_str()), Some(reason));
        }
        assert_eq!(RevocationReason::from_db("expired"), None);
    }

    #[test]
    fn principal_debug_redacts_secrets() {
        let principal = Principal {
            id: Uuid::nil(),
            email: "a@example.com".to_string(),
            password_hash: "$argon2id$secret".to_string(),
            display_name: "A".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default(),
            totp_secret: Some("JBSWY3DPEHPK3PXP".to_string()),
            totp_enabled: true,
            created_at: Utc::now(),
        };
        let rendered = format!("{principal:?}");
        assert!(!rendered.contains("argon2id"));
        assert!(!rendered.contains("JBSWY3DP"));
        assert!(rendered.contains("a@example.com"));
    }
}

//! PostgreSQL backend.
//!
//! Rotation relies on a single conditional `UPDATE ... WHERE revoked = FALSE`:
//! under READ COMMITTED a second writer blocks on the row lock, re-evaluates the
//! predicate after the first commits, and affects zero rows.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Connection, FromRow, PgConnection, PgPool, Row};
use std::collections::HashSet;
use tracing::{warn, Instrument, Span};
use uuid::Uuid;

use super::{
    Device, DeviceStore, InsertPrincipal, MarkRotated, NewPrincipal, NewSessionNode, Principal,
    PrincipalStore, RevocationReason, SessionNode, SessionRegistry, SuccessorOutcome,
};

pub const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

const PRINCIPAL_COLUMNS: &str =
    "id, email, password_hash, display_name, birth_date, totp_secret, totp_enabled, created_at";

const SESSION_COLUMNS: &str = "jti, principal_id, device_id, revoked, successor, expires_at, created_at, revoked_at, revoked_reason";

fn db_span(operation: &'static str, statement: &str) -> Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

impl<'r> FromRow<'r, PgRow> for Principal {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            display_name: row.try_get("display_name")?,
            birth_date: row.try_get("birth_date")?,
            totp_secret: row.try_get("totp_secret")?,
            totp_enabled: row.try_get("totp_enabled")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Device {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            principal_id: row.try_get("principal_id")?,
            device_id: row.try_get("device_id")?,
            platform: row.try_get("platform")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for SessionNode {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let reason: Option<String> = row.try_get("revoked_reason")?;
        let revoked_reason = match reason {
            None => None,
            Some(value) => Some(RevocationReason::from_db(&value).ok_or_else(|| {
                sqlx::Error::Decode(Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid session_nodes.revoked_reason value: {value}"),
                )))
            })?),
        };
        Ok(Self {
            jti: row.try_get("jti")?,
            principal_id: row.try_get("principal_id")?,
            device_id: row.try_get("device_id")?,
            revoked: row.try_get("revoked")?,
            successor: row.try_get("successor")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            revoked_at: row.try_get("revoked_at")?,
            revoked_reason,
        })
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet.
    ///
    /// # Errors
    /// Returns an error if any schema statement fails.
    pub async fn apply_schema(pool: &PgPool) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(pool)
            .instrument(db_span("DDL", "sql/schema.sql"))
            .await
            .context("failed to apply schema")?;
        Ok(())
    }
}

/// Follow `successor` links from `jti`, optionally locking each row.
async fn walk_chain(
    conn: &mut PgConnection,
    jti: &str,
    max_hops: usize,
    lock: bool,
) -> Result<Vec<SessionNode>> {
    let query = if lock {
        format!("SELECT {SESSION_COLUMNS} FROM session_nodes WHERE jti = $1 FOR UPDATE")
    } else {
        format!("SELECT {SESSION_COLUMNS} FROM session_nodes WHERE jti = $1")
    };
    let span = db_span("SELECT", &query);

    let mut chain: Vec<SessionNode> = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = Some(jti.to_string());

    while let Some(current) = cursor.take() {
        if chain.len() > max_hops {
            warn!(jti, max_hops, "session chain exceeded hop bound");
            break;
        }
        if !seen.insert(current.clone()) {
            warn!(jti, at = %current, "session chain revisits a node");
            break;
        }
        let node = sqlx::query_as::<_, SessionNode>(&query)
            .bind(&current)
            .fetch_optional(&mut *conn)
            .instrument(span.clone())
            .await
            .context("failed to load session node")?;
        let Some(node) = node else {
            break;
        };
        cursor.clone_from(&node.successor);
        chain.push(node);
    }

    Ok(chain)
}

#[async_trait]
impl PrincipalStore for PgStore {
    async fn insert_principal(&self, principal: NewPrincipal) -> Result<InsertPrincipal> {
        let query = format!(
            r"
            INSERT INTO principals
                (id, email, password_hash, display_name, birth_date, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {PRINCIPAL_COLUMNS}
            "
        );
        let result = sqlx::query_as::<_, Principal>(&query)
            .bind(Uuid::now_v7())
            .bind(&principal.email)
            .bind(&principal.password_hash)
            .bind(&principal.display_name)
            .bind(principal.birth_date)
            .bind(principal.created_at)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", &query))
            .await;

        match result {
            Ok(record) => Ok(InsertPrincipal::Created(record)),
            Err(err) if is_unique_violation(&err) => Ok(InsertPrincipal::Conflict),
            Err(err) => Err(err).context("failed to insert principal"),
        }
    }

    async fn find_principal_by_email(&self, email: &str) -> Result<Option<Principal>> {
        let query = format!("SELECT {PRINCIPAL_COLUMNS} FROM principals WHERE email = $1");
        sqlx::query_as::<_, Principal>(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup principal by email")
    }

    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>> {
        let query = format!("SELECT {PRINCIPAL_COLUMNS} FROM principals WHERE id = $1");
        sqlx::query_as::<_, Principal>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup principal")
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> Result<bool> {
        let query = "UPDATE principals SET password_hash = $2 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update password hash")?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_second_factor(
        &self,
        id: Uuid,
        secret: Option<&str>,
        enabled: bool,
    ) -> Result<bool> {
        let query = "UPDATE principals SET totp_secret = $2, totp_enabled = $3 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(secret)
            .bind(enabled)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update second factor")?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn touch_device(
        &self,
        principal_id: Uuid,
        device_id: &str,
        platform: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<Device> {
        let query = r"
            INSERT INTO devices (principal_id, device_id, platform, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (principal_id, device_id) DO UPDATE
            SET last_seen_at = EXCLUDED.last_seen_at,
                platform = COALESCE(EXCLUDED.platform, devices.platform)
            RETURNING principal_id, device_id, platform, first_seen_at, last_seen_at
        ";
        sqlx::query_as::<_, Device>(query)
            .bind(principal_id)
            .bind(device_id)
            .bind(platform)
            .bind(seen_at)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to touch device")
    }

    async fn list_devices(&self, principal_id: Uuid) -> Result<Vec<Device>> {
        let query = r"
            SELECT principal_id, device_id, platform, first_seen_at, last_seen_at
            FROM devices
            WHERE principal_id = $1
            ORDER BY last_seen_at DESC
        ";
        sqlx::query_as::<_, Device>(query)
            .bind(principal_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to list devices")
    }
}

#[async_trait]
impl SessionRegistry for PgStore {
    async fn create(&self, node: NewSessionNode) -> Result<SessionNode> {
        let query = format!(
            r"
            INSERT INTO session_nodes (jti, principal_id, device_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SESSION_COLUMNS}
            "
        );
        sqlx::query_as::<_, SessionNode>(&query)
            .bind(&node.jti)
            .bind(node.principal_id)
            .bind(&node.device_id)
            .bind(node.expires_at)
            .bind(node.created_at)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", &query))
            .await
            .context("failed to insert session node")
    }

    async fn find(&self, jti: &str) -> Result<Option<SessionNode>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM session_nodes WHERE jti = $1");
        sqlx::query_as::<_, SessionNode>(&query)
            .bind(jti)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup session node")
    }

    async fn mark_rotated(
        &self,
        jti: &str,
        successor_jti: &str,
        at: DateTime<Utc>,
    ) -> Result<MarkRotated> {
        let query = r"
            UPDATE session_nodes
            SET revoked = TRUE, successor = $2, revoked_at = $3, revoked_reason = 'rotated'
            WHERE jti = $1
              AND revoked = FALSE
        ";
        let result = sqlx::query(query)
            .bind(jti)
            .bind(successor_jti)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to mark session node rotated")?;

        Ok(if result.rows_affected() == 1 {
            MarkRotated::Rotated
        } else {
            MarkRotated::AlreadyRotated
        })
    }

    async fn create_successor(
        &self,
        parent_jti: &str,
        node: NewSessionNode,
    ) -> Result<SuccessorOutcome> {
        let mut tx = self.pool.begin().await.context("begin rotation transaction")?;

        let retire = r"
            UPDATE session_nodes
            SET revoked = TRUE, successor = $2, revoked_at = $3, revoked_reason = 'rotated'
            WHERE jti = $1
              AND revoked = FALSE
        ";
        let retired = sqlx::query(retire)
            .bind(parent_jti)
            .bind(&node.jti)
            .bind(node.created_at)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", retire))
            .await
            .context("failed to retire parent session node")?;

        if retired.rows_affected() != 1 {
            tx.rollback().await.context("rollback rotation transaction")?;
            return Ok(SuccessorOutcome::AlreadyRotated);
        }

        let insert = format!(
            r"
            INSERT INTO session_nodes (jti, principal_id, device_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SESSION_COLUMNS}
            "
        );
        let child = sqlx::query_as::<_, SessionNode>(&insert)
            .bind(&node.jti)
            .bind(node.principal_id)
            .bind(&node.device_id)
            .bind(node.expires_at)
            .bind(node.created_at)
            .fetch_one(&mut *tx)
            .instrument(db_span("INSERT", &insert))
            .await
            .context("failed to insert successor session node")?;

        tx.commit().await.context("commit rotation transaction")?;

        Ok(SuccessorOutcome::Linked(child))
    }

    async fn mark_revoked(
        &self,
        jti: &str,
        reason: RevocationReason,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = r"
            UPDATE session_nodes
            SET revoked = TRUE, revoked_at = $2, revoked_reason = $3
            WHERE jti = $1
              AND revoked = FALSE
        ";
        let result = sqlx::query(query)
            .bind(jti)
            .bind(at)
            .bind(reason.as_str())
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to revoke session node")?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_all(&self, principal_id: Uuid, at: DateTime<Utc>) -> Result<u64> {
        let query = r"
            UPDATE session_nodes
            SET revoked = TRUE, revoked_at = $2, revoked_reason = 'logout_all'
            WHERE principal_id = $1
              AND revoked = FALSE
        ";
        let result = sqlx::query(query)
            .bind(principal_id)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to revoke principal sessions")?;
        Ok(result.rows_affected())
    }

    async fn walk_successors(&self, jti: &str, max_hops: usize) -> Result<Vec<SessionNode>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection")?;
        walk_chain(&mut *conn, jti, max_hops, false).await
    }

    async fn revoke_chain(&self, jti: &str, max_hops: usize, at: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("begin cascade transaction")?;

        let chain = walk_chain(&mut *tx, jti, max_hops, true).await?;
        let active: Vec<String> = chain
            .into_iter()
            .filter(SessionNode::is_active)
            .map(|node| node.jti)
            .collect();

        let query = r"
            UPDATE session_nodes
            SET revoked = TRUE, revoked_at = $2, revoked_reason = 'reuse_cascade'
            WHERE jti = ANY($1)
              AND revoked = FALSE
        ";
        let result = sqlx::query(query)
            .bind(&active)
            .bind(at)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to revoke session chain")?;

        tx.commit().await.context("commit cascade transaction")?;

        Ok(result.rows_affected())
    }

    async fn list_active(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionNode>> {
        let query = format!(
            r"
            SELECT {SESSION_COLUMNS}
            FROM session_nodes
            WHERE principal_id = $1
              AND revoked = FALSE
              AND expires_at > $2
            ORDER BY created_at DESC
            "
        );
        sqlx::query_as::<_, SessionNode>(&query)
            .bind(principal_id)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to list active sessions")
    }

    async fn expired_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let query = r"
            SELECT jti
            FROM session_nodes
            WHERE expires_at <= $1
            ORDER BY expires_at
            LIMIT $2
        ";
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(query)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to list expired session nodes")?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("jti"))
            .collect())
    }

    async fn delete(&self, jti: &str) -> Result<bool> {
        let query = "DELETE FROM session_nodes WHERE jti = $1";
        let result = sqlx::query(query)
            .bind(jti)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to delete session node")?;
        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<()> {
        let acquire_span = tracing::info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let mut conn = self
            .pool
            .acquire()
            .instrument(acquire_span)
            .await
            .context("failed to acquire database connection")?;

        let ping_span = tracing::info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        conn.ping()
            .instrument(ping_span)
            .await
            .context("failed to ping database")
    }
}

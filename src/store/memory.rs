//! In-process backend with the same conditional-update semantics as Postgres.
//!
//! A single mutex guards all maps, so every trait call is one critical section;
//! that is what makes `mark_rotated` and `revoke_chain` atomic here.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{
    Device, DeviceStore, InsertPrincipal, MarkRotated, NewPrincipal, NewSessionNode, Principal,
    PrincipalStore, RevocationReason, SessionNode, SessionRegistry, SuccessorOutcome,
};

#[derive(Default)]
struct State {
    principals: HashMap<Uuid, Principal>,
    emails: HashMap<String, Uuid>,
    devices: HashMap<(Uuid, String), Device>,
    sessions: HashMap<String, SessionNode>,
}

impl State {
    fn retire(&mut self, jti: &str, successor_jti: &str, at: DateTime<Utc>) -> MarkRotated {
        match self.sessions.get_mut(jti) {
            Some(node) if !node.revoked => {
                node.revoked = true;
                node.successor = Some(successor_jti.to_string());
                node.revoked_at = Some(at);
                node.revoked_reason = Some(RevocationReason::Rotated);
                MarkRotated::Rotated
            }
            _ => MarkRotated::AlreadyRotated,
        }
    }

    fn walk(&self, jti: &str, max_hops: usize) -> Vec<SessionNode> {
        let mut chain = Vec::new();
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
            let Some(node) = self.sessions.get(&current) else {
                break;
            };
            cursor.clone_from(&node.successor);
            chain.push(node.clone());
        }

        chain
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PrincipalStore for MemoryStore {
    async fn insert_principal(&self, principal: NewPrincipal) -> Result<InsertPrincipal> {
        let mut state = self.state.lock().await;
        if state.emails.contains_key(&principal.email) {
            return Ok(InsertPrincipal::Conflict);
        }

        let record = Principal {
            id: Uuid::now_v7(),
            email: principal.email,
            password_hash: principal.password_hash,
            display_name: principal.display_name,
            birth_date: principal.birth_date,
            totp_secret: None,
            totp_enabled: false,
            created_at: principal.created_at,
        };
        state.emails.insert(record.email.clone(), record.id);
        state.principals.insert(record.id, record.clone());

        Ok(InsertPrincipal::Created(record))
    }

    async fn find_principal_by_email(&self, email: &str) -> Result<Option<Principal>> {
        let state = self.state.lock().await;
        Ok(state
            .emails
            .get(email)
            .and_then(|id| state.principals.get(id))
            .cloned())
    }

    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>> {
        Ok(self.state.lock().await.principals.get(&id).cloned())
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.principals.get_mut(&id).map_or(false, |principal| {
            principal.password_hash = password_hash.to_string();
            true
        }))
    }

    async fn set_second_factor(
        &self,
        id: Uuid,
        secret: Option<&str>,
        enabled: bool,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.principals.get_mut(&id).map_or(false, |principal| {
            principal.totp_secret = secret.map(str::to_string);
            principal.totp_enabled = enabled;
            true
        }))
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn touch_device(
        &self,
        principal_id: Uuid,
        device_id: &str,
        platform: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<Device> {
        let mut state = self.state.lock().await;
        let device = state
            .devices
            .entry((principal_id, device_id.to_string()))
            .or_insert_with(|| Device {
                principal_id,
                device_id: device_id.to_string(),
                platform: None,
                first_seen_at: seen_at,
                last_seen_at: seen_at,
            });
        device.last_seen_at = seen_at;
        if let Some(platform) = platform {
            device.platform = Some(platform.to_string());
        }
        Ok(device.clone())
    }

    async fn list_devices(&self, principal_id: Uuid) -> Result<Vec<Device>> {
        let state = self.state.lock().await;
        let mut devices: Vec<Device> = state
            .devices
            .values()
            .filter(|device| device.principal_id == principal_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(devices)
    }
}

#[async_trait]
impl SessionRegistry for MemoryStore {
    async fn create(&self, node: NewSessionNode) -> Result<SessionNode> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&node.jti) {
            anyhow::bail!("session node {} already exists", node.jti);
        }
        let node = node.into_node();
        state.sessions.insert(node.jti.clone(), node.clone());
        Ok(node)
    }

    async fn find(&self, jti: &str) -> Result<Option<SessionNode>> {
        Ok(self.state.lock().await.sessions.get(jti).cloned())
    }

    async fn mark_rotated(
        &self,
        jti: &str,
        successor_jti: &str,
        at: DateTime<Utc>,
    ) -> Result<MarkRotated> {
        Ok(self.state.lock().await.retire(jti, successor_jti, at))
    }

    async fn create_successor(
        &self,
        parent_jti: &str,
        node: NewSessionNode,
    ) -> Result<SuccessorOutcome> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&node.jti) {
            anyhow::bail!("session node {} already exists", node.jti);
        }
        let at = node.created_at;
        match state.retire(parent_jti, &node.jti, at) {
            MarkRotated::Rotated => {
                let node = node.into_node();
                state.sessions.insert(node.jti.clone(), node.clone());
                Ok(SuccessorOutcome::Linked(node))
            }
            MarkRotated::AlreadyRotated => Ok(SuccessorOutcome::AlreadyRotated),
        }
    }

    async fn mark_revoked(
        &self,
        jti: &str,
        reason: RevocationReason,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(jti) {
            Some(node) if !node.revoked => {
                node.revoked = true;
                node.revoked_at = Some(at);
                node.revoked_reason = Some(reason);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all(&self, principal_id: Uuid, at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for node in state
            .sessions
            .values_mut()
            .filter(|node| node.principal_id == principal_id && !node.revoked)
        {
            node.revoked = true;
            node.revoked_at = Some(at);
            node.revoked_reason = Some(RevocationReason::LogoutAll);
            count += 1;
        }
        Ok(count)
    }

    async fn walk_successors(&self, jti: &str, max_hops: usize) -> Result<Vec<SessionNode>> {
        Ok(self.state.lock().await.walk(jti, max_hops))
    }

    async fn revoke_chain(&self, jti: &str, max_hops: usize, at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let chain = state.walk(jti, max_hops);
        let mut count = 0;
        for link in chain {
            if let Some(node) = state.sessions.get_mut(&link.jti) {
                if !node.revoked {
                    node.revoked = true;
                    node.revoked_at = Some(at);
                    node.revoked_reason = Some(RevocationReason::ReuseCascade);
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn list_active(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionNode>> {
        let state = self.state.lock().await;
        let mut nodes: Vec<SessionNode> = state
            .sessions
            .values()
            .filter(|node| {
                node.principal_id == principal_id && !node.revoked && node.expires_at > now
            })
            .cloned()
            .collect();
        nodes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(nodes)
    }

    async fn expired_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .values()
            .filter(|node| node.expires_at <= cutoff)
            .take(limit)
            .map(|node| node.jti.clone())
            .collect())
    }

    async fn delete(&self, jti: &str) -> Result<bool> {
        Ok(self.state.lock().await.sessions.remove(jti).is_some())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use chrono::Duration;
    use std::sync::Arc;

    fn new_node(jti: &str, principal_id: Uuid, now: DateTime<Utc>) -> NewSessionNode {
        NewSessionNode {
            jti: jti.to_string(),
            principal_id,
            device_id: "device-1".to_string(),
            expires_at: now + Duration::days(14),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn mark_rotated_only_succeeds_once() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let principal = Uuid::new_v4();
        store.create(new_node("a", principal, now)).await?;

        assert_eq!(store.mark_rotated("a", "b", now).await?, MarkRotated::Rotated);
        assert_eq!(
            store.mark_rotated("a", "c", now).await?,
            MarkRotated::AlreadyRotated
        );

        let node = store.find("a").await?.context("node a")?;
        assert!(node.is_rotated());
        assert_eq!(node.successor.as_deref(), Some("b"));
        assert_eq!(node.revoked_reason, Some(RevocationReason::Rotated));
        Ok(())
    }

    #[tokio::test]
    async fn mark_rotated_refuses_logged_out_node() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.create(new_node("a", Uuid::new_v4(), now)).await?;
        assert!(store.mark_revoked("a", RevocationReason::Logout, now).await?);

        assert_eq!(
            store.mark_rotated("a", "b", now).await?,
            MarkRotated::AlreadyRotated
        );
        let node = store.find("a").await?.context("node a")?;
        assert!(node.successor.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_successors_install_exactly_one_child() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let principal = Uuid::new_v4();
        store.create(new_node("root", principal, now)).await?;

        let mut handles = Vec::new();
        for index in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .create_successor("root", new_node(&format!("child-{index}"), principal, now))
                    .await
            }));
        }

        let mut linked = 0;
        for handle in handles {
            if let SuccessorOutcome::Linked(_) = handle.await?? {
                linked += 1;
            }
        }
        assert_eq!(linked, 1);
        // Losers leave no orphan nodes behind.
        assert_eq!(store.list_active(principal, now).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn walk_and_revoke_chain_follow_successors() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let principal = Uuid::new_v4();
        store.create(new_node("n1", principal, now)).await?;
        store.create_successor("n1", new_node("n2", principal, now)).await?;
        store.create_successor("n2", new_node("n3", principal, now)).await?;
        store.create(new_node("other", principal, now)).await?;

        let chain = store.walk_successors("n1", 100).await?;
        let ids: Vec<&str> = chain.iter().map(|node| node.jti.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2", "n3"]);

        assert_eq!(store.revoke_chain("n1", 100, now).await?, 1);
        let tip = store.find("n3").await?.context("node n3")?;
        assert!(tip.revoked);
        assert_eq!(tip.revoked_reason, Some(RevocationReason::ReuseCascade));
        assert!(store.find("other").await?.is_some_and(|node| node.is_active()));
        Ok(())
    }

    #[tokio::test]
    async fn walk_stops_on_cycles_and_hop_bound() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let principal = Uuid::new_v4();
        store.create(new_node("x", principal, now)).await?;
        store.create(new_node("y", principal, now)).await?;
        store.mark_rotated("x", "y", now).await?;
        store.mark_rotated("y", "x", now).await?;

        assert_eq!(store.walk_successors("x", 100).await?.len(), 2);
        assert_eq!(store.walk_successors("x", 0).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn revoke_all_is_scoped_to_principal() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store.create(new_node("a1", alice, now)).await?;
        store.create(new_node("a2", alice, now)).await?;
        store.create(new_node("b1", bob, now)).await?;

        assert_eq!(store.revoke_all(alice, now).await?, 2);
        assert_eq!(store.revoke_all(alice, now).await?, 0);
        assert!(store.list_active(alice, now).await?.is_empty());
        assert_eq!(store.list_active(bob, now).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() -> Result<()> {
        let store = MemoryStore::new();
        let principal = NewPrincipal {
            email: "a@example.com".to_string(),
            password_hash: "hash".to_string(),
            display_name: "A".to_string(),
            birth_date: chrono::NaiveDate::from_ymd_opt(1990, 1, 1).context("date")?,
            created_at: Utc::now(),
        };
        assert!(matches!(
            store.insert_principal(principal.clone()).await?,
            InsertPrincipal::Created(_)
        ));
        assert!(matches!(
            store.insert_principal(principal).await?,
            InsertPrincipal::Conflict
        ));
        Ok(())
    }

    #[tokio::test]
    async fn touch_device_keeps_first_seen() -> Result<()> {
        let store = MemoryStore::new();
        let principal = Uuid::new_v4();
        let first = Utc::now();
        let later = first + Duration::minutes(5);

        store.touch_device(principal, "d1", Some("ios"), first).await?;
        let device = store.touch_device(principal, "d1", None, later).await?;

        assert_eq!(device.first_seen_at, first);
        assert_eq!(device.last_seen_at, later);
        assert_eq!(device.platform.as_deref(), Some("ios"));
        assert_eq!(store.list_devices(principal).await?.len(), 1);
        Ok(())
    }
}

//! Refresh-token rotation, reuse detection and logout.
//!
//! A presented refresh token resolves to one of:
//!
//! - `Active`: rotate. The new node is written in the same transaction that
//!   retires the old one, so a parent never gains two children.
//! - `Rotated` (revoked with a successor): replay of a consumed token. Every
//!   still-active descendant is revoked and the caller gets `TokenReuseDetected`.
//! - `Terminal` (revoked without a successor): ordinary dead session, no cascade.
//! - unknown `jti` or bad signature/expiry: `InvalidRefreshToken`.
//!
//! A caller that loses a concurrent rotation re-reads the parent and lands in
//! `Rotated`, so both racers' sessions end up revoked.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    clock::Clock,
    error::{AuthError, AuthResult},
    tokens::{TokenIssuer, TokenKind, TokenPair},
};
use crate::store::{RevocationReason, SessionNode, SessionRegistry, SuccessorOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshState {
    Active,
    Rotated,
    Terminal,
}

impl RefreshState {
    #[must_use]
    pub fn of(node: &SessionNode) -> Self {
        if !node.revoked {
            Self::Active
        } else if node.successor.is_some() {
            Self::Rotated
        } else {
            Self::Terminal
        }
    }
}

#[derive(Clone)]
pub struct RotationProtocol {
    issuer: TokenIssuer,
    sessions: Arc<dyn SessionRegistry>,
    clock: Arc<dyn Clock>,
    max_hops: usize,
}

impl RotationProtocol {
    #[must_use]
    pub fn new(
        issuer: TokenIssuer,
        sessions: Arc<dyn SessionRegistry>,
        clock: Arc<dyn Clock>,
        max_hops: usize,
    ) -> Self {
        Self {
            issuer,
            sessions,
            clock,
            max_hops,
        }
    }

    /// Exchange a refresh token for a new pair, retiring the presented one.
    ///
    /// # Errors
    /// `InvalidRefreshToken` or `TokenReuseDetected`; `Internal` on storage failure.
    #[instrument(skip(self, refresh_token))]
    pub async fn rotate(&self, refresh_token: &str) -> AuthResult<TokenPair> {
        let claims = self
            .issuer
            .verify(refresh_token, TokenKind::Refresh)
            .map_err(|rejection| {
                debug!("refresh token rejected: {rejection}");
                AuthError::InvalidRefreshToken
            })?;
        let jti = claims.jti.clone().ok_or(AuthError::InvalidRefreshToken)?;
        let principal_id = claims
            .principal_id()
            .map_err(|_| AuthError::InvalidRefreshToken)?;

        let Some(node) = self.sessions.find(&jti).await? else {
            audit_refusal(&AuthError::InvalidRefreshToken, principal_id, &jti, "unknown");
            return Err(AuthError::InvalidRefreshToken);
        };
        if node.principal_id != principal_id {
            audit_refusal(&AuthError::InvalidRefreshToken, principal_id, &jti, "owner_mismatch");
            return Err(AuthError::InvalidRefreshToken);
        }

        match RefreshState::of(&node) {
            RefreshState::Active => self.rotate_active(&node).await,
            RefreshState::Rotated => Err(self.cascade(&node).await?),
            RefreshState::Terminal => {
                audit_refusal(&AuthError::InvalidRefreshToken, principal_id, &jti, "revoked");
                Err(AuthError::InvalidRefreshToken)
            }
        }
    }

    async fn rotate_active(&self, node: &SessionNode) -> AuthResult<TokenPair> {
        let (pair, successor) = self.issuer.mint_pair(node.principal_id, &node.device_id)?;
        let successor_jti = successor.jti.clone();

        match self.sessions.create_successor(&node.jti, successor).await? {
            SuccessorOutcome::Linked(_) => {
                info!(
                    target: "audit",
                    event = "refresh_rotated",
                    principal_id = %node.principal_id,
                    jti = %node.jti,
                    successor = %successor_jti,
                );
                Ok(pair)
            }
            SuccessorOutcome::AlreadyRotated => {
                // Lost the race: the minted pair is dropped unused.
                drop(pair);
                let current = self.sessions.find(&node.jti).await?;
                match current.as_ref().map(RefreshState::of) {
                    Some(RefreshState::Rotated) => {
                        let current = current.ok_or(AuthError::InvalidRefreshToken)?;
                        Err(self.cascade(&current).await?)
                    }
                    _ => {
                        audit_refusal(
                            &AuthError::InvalidRefreshToken,
                            node.principal_id,
                            &node.jti,
                            "revoked_during_rotation",
                        );
                        Err(AuthError::InvalidRefreshToken)
                    }
                }
            }
        }
    }

    /// Revoke every active node downstream of a replayed one.
    async fn cascade(&self, node: &SessionNode) -> AuthResult<AuthError> {
        let revoked = self
            .sessions
            .revoke_chain(&node.jti, self.max_hops, self.clock.now())
            .await?;
        warn!(
            target: "audit",
            event = "refresh_reuse_detected",
            principal_id = %node.principal_id,
            jti = %node.jti,
            device_id = %node.device_id,
            revoked,
            kind = AuthError::TokenReuseDetected.audit_kind(),
        );
        Ok(AuthError::TokenReuseDetected)
    }

    /// Revoke the session behind a refresh token. Tokens that fail verification
    /// are ignored and the call still succeeds.
    ///
    /// # Errors
    /// `Internal` on storage failure.
    #[instrument(skip(self, refresh_token))]
    pub async fn logout(&self, refresh_token: &str) -> AuthResult<()> {
        let claims = match self.issuer.verify(refresh_token, TokenKind::Refresh) {
            Ok(claims) => claims,
            Err(rejection) => {
                debug!("logout with unusable refresh token: {rejection}");
                return Ok(());
            }
        };
        let Some(jti) = claims.jti else {
            return Ok(());
        };

        let revoked = self
            .sessions
            .mark_revoked(&jti, RevocationReason::Logout, self.clock.now())
            .await?;
        info!(
            target: "audit",
            event = "logout",
            principal_id = %claims.sub,
            jti = %jti,
            revoked,
        );
        Ok(())
    }

    /// Revoke every active session of a principal; returns how many were revoked.
    ///
    /// # Errors
    /// `Internal` on storage failure.
    #[instrument(skip(self))]
    pub async fn logout_all(&self, principal_id: Uuid) -> AuthResult<u64> {
        let revoked = self
            .sessions
            .revoke_all(principal_id, self.clock.now())
            .await?;
        info!(
            target: "audit",
            event = "logout_all",
            principal_id = %principal_id,
            revoked,
        );
        Ok(revoked)
    }
}

fn audit_refusal(err: &AuthError, principal_id: Uuid, jti: &str, detail: &'static str) {
    info!(
        target: "audit",
        event = "refresh_refused",
        principal_id = %principal_id,
        jti,
        kind = err.audit_kind(),
        detail,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{clock::ManualClock, config::AuthConfig, tokens::TokenSigner},
        store::{MemoryStore, MarkRotated, NewSessionNode},
    };
    use anyhow::{Context, Result};
    use chrono::{Duration, Utc};

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    struct Fixture {
        protocol: RotationProtocol,
        issuer: TokenIssuer,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Result<Fixture> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new());
        let issuer = TokenIssuer::new(
            TokenSigner::new(SECRET, "tessera")?,
            store.clone(),
            clock.clone(),
            &AuthConfig::default(),
        );
        let protocol = RotationProtocol::new(issuer.clone(), store.clone(), clock.clone(), 100);
        Ok(Fixture {
            protocol,
            issuer,
            store,
            clock,
        })
    }

    fn jti_of(issuer: &TokenIssuer, token: &str) -> Result<String> {
        issuer
            .verify(token, TokenKind::Refresh)?
            .jti
            .context("refresh token without jti")
    }

    #[test]
    fn classifies_node_states() {
        let now = Utc::now();
        let mut node = NewSessionNode {
            jti: "a".to_string(),
            principal_id: Uuid::new_v4(),
            device_id: "d".to_string(),
            expires_at: now,
            created_at: now,
        }
        .into_node();
        assert_eq!(RefreshState::of(&node), RefreshState::Active);

        node.revoked = true;
        assert_eq!(RefreshState::of(&node), RefreshState::Terminal);

        node.successor = Some("b".to_string());
        assert_eq!(RefreshState::of(&node), RefreshState::Rotated);
    }

    #[tokio::test]
    async fn rotation_links_old_node_to_new() -> Result<()> {
        let f = fixture()?;
        let pair = f.issuer.issue_pair(Uuid::new_v4(), "d1").await?;
        let old_jti = jti_of(&f.issuer, &pair.refresh_token)?;

        let next = f.protocol.rotate(&pair.refresh_token).await?;
        let new_jti = jti_of(&f.issuer, &next.refresh_token)?;
        assert_ne!(old_jti, new_jti);

        let old = f.store.find(&old_jti).await?.context("old node")?;
        assert_eq!(old.successor.as_deref(), Some(new_jti.as_str()));
        assert_eq!(old.revoked_reason, Some(RevocationReason::Rotated));
        let new = f.store.find(&new_jti).await?.context("new node")?;
        assert!(new.is_active());
        assert_eq!(new.device_id, "d1");
        Ok(())
    }

    #[tokio::test]
    async fn replay_cascades_to_the_tip() -> Result<()> {
        let f = fixture()?;
        let first = f.issuer.issue_pair(Uuid::new_v4(), "d1").await?;
        let second = f.protocol.rotate(&first.refresh_token).await?;
        let third = f.protocol.rotate(&second.refresh_token).await?;

        assert!(matches!(
            f.protocol.rotate(&first.refresh_token).await,
            Err(AuthError::TokenReuseDetected)
        ));
        let tip = f.store.find(&jti_of(&f.issuer, &third.refresh_token)?).await?;
        assert_eq!(
            tip.and_then(|node| node.revoked_reason),
            Some(RevocationReason::ReuseCascade)
        );
        assert!(f.protocol.rotate(&third.refresh_token).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn logged_out_token_fails_without_cascade() -> Result<()> {
        let f = fixture()?;
        let principal = Uuid::new_v4();
        let phone = f.issuer.issue_pair(principal, "phone").await?;
        let laptop = f.issuer.issue_pair(principal, "laptop").await?;

        f.protocol.logout(&phone.refresh_token).await?;
        assert!(matches!(
            f.protocol.rotate(&phone.refresh_token).await,
            Err(AuthError::InvalidRefreshToken)
        ));
        assert!(f.protocol.rotate(&laptop.refresh_token).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn logout_ignores_garbage() -> Result<()> {
        let f = fixture()?;
        f.protocol.logout("definitely-not-a-token").await?;
        Ok(())
    }

    #[tokio::test]
    async fn expired_and_unknown_tokens_are_invalid() -> Result<()> {
        let f = fixture()?;
        let pair = f.issuer.issue_pair(Uuid::new_v4(), "d1").await?;
        let jti = jti_of(&f.issuer, &pair.refresh_token)?;

        f.store.delete(&jti).await?;
        assert!(matches!(
            f.protocol.rotate(&pair.refresh_token).await,
            Err(AuthError::InvalidRefreshToken)
        ));

        let pair = f.issuer.issue_pair(Uuid::new_v4(), "d1").await?;
        f.clock.advance(Duration::days(15));
        assert!(matches!(
            f.protocol.rotate(&pair.refresh_token).await,
            Err(AuthError::InvalidRefreshToken)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn race_loser_seeing_logout_gets_invalid_token() -> Result<()> {
        let f = fixture()?;
        let pair = f.issuer.issue_pair(Uuid::new_v4(), "d1").await?;
        let jti = jti_of(&f.issuer, &pair.refresh_token)?;
        let node = f.store.find(&jti).await?.context("node")?;

        // Simulate a logout landing between the read and the conditional write.
        f.store
            .mark_revoked(&jti, RevocationReason::Logout, f.clock.now())
            .await?;
        assert!(matches!(
            f.protocol.rotate_active(&node).await,
            Err(AuthError::InvalidRefreshToken)
        ));
        assert_eq!(
            f.store.mark_rotated(&jti, "x", f.clock.now()).await?,
            MarkRotated::AlreadyRotated
        );
        Ok(())
    }

    #[tokio::test]
    async fn race_loser_cascades_through_the_winners_child() -> Result<()> {
        let f = fixture()?;
        let pair = f.issuer.issue_pair(Uuid::new_v4(), "d1").await?;
        let jti = jti_of(&f.issuer, &pair.refresh_token)?;
        // Both callers read the node while it is still active.
        let stale = f.store.find(&jti).await?.context("node")?;
        assert_eq!(RefreshState::of(&stale), RefreshState::Active);

        let winner = f.protocol.rotate(&pair.refresh_token).await?;
        let child_jti = jti_of(&f.issuer, &winner.refresh_token)?;

        assert!(matches!(
            f.protocol.rotate_active(&stale).await,
            Err(AuthError::TokenReuseDetected)
        ));

        let child = f.store.find(&child_jti).await?.context("winner's child")?;
        assert!(!child.is_active());
        assert_eq!(child.revoked_reason, Some(RevocationReason::ReuseCascade));
        assert!(matches!(
            f.protocol.rotate(&winner.refresh_token).await,
            Err(AuthError::InvalidRefreshToken)
        ));

        let parent = f.store.find(&jti).await?.context("parent")?;
        assert_eq!(parent.successor.as_deref(), Some(child_jti.as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn logout_all_reports_count() -> Result<()> {
        let f = fixture()?;
        let principal = Uuid::new_v4();
        f.issuer.issue_pair(principal, "a").await?;
        f.issuer.issue_pair(principal, "b").await?;
        assert_eq!(f.protocol.logout_all(principal).await?, 2);
        assert_eq!(f.protocol.logout_all(principal).await?, 0);
        Ok(())
    }
}

// Session service business rules
// Enforces per-user session cardinality, handles the trusted-caller bypass,
// and translates backend failures into a uniform error type. Callers never
// see backend-specific errors.

use super::policy::ExpirationPolicy;
use super::store::{SessionStore, StorageError};
use super::types::{SessionRecord, POST_AUTHENTICATION_STATE};
use crate::config::ServiceConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors surfaced by the session service.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Blank or malformed input; the caller's fault, never retried.
    Validation(String),
    /// The user already holds the maximum permitted concurrent sessions.
    LimitExceeded(String),
    /// Any backend failure, wrapped so callers stay backend-agnostic.
    Storage(StorageError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Validation(msg) => write!(f, "Validation error: {}", msg),
            SessionError::LimitExceeded(msg) => write!(f, "Session limit exceeded: {}", msg),
            SessionError::Storage(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StorageError> for SessionError {
    fn from(e: StorageError) -> Self {
        SessionError::Storage(e)
    }
}

/// The session store's public surface.
///
/// Some internal callers must operate before any session exists (components
/// fetching their own startup configuration, for instance) and so cannot
/// present a normally issued session. The trusted-caller table maps those
/// caller identities to pre-provisioned identifiers that short-circuit
/// validation; it is injected at construction and never mutated.
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    policy: ExpirationPolicy,
    trusted_callers: HashMap<String, String>,
    inactivity_timeout_secs: i64,
    removal_grace_secs: i64,
    allow_multiple_sessions: bool,
    max_session_count: usize,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>, config: &ServiceConfig) -> Self {
        Self {
            policy: ExpirationPolicy::new(store.clone()),
            store,
            trusted_callers: config.trusted_callers.clone(),
            inactivity_timeout_secs: config.inactivity_timeout_secs,
            removal_grace_secs: config.removal_grace_secs,
            allow_multiple_sessions: config.allow_multiple_sessions,
            max_session_count: config.max_session_count,
        }
    }

    /// Issue a new session for an already-authenticated user.
    ///
    /// The cardinality check runs before a new identifier is generated, and
    /// counts only live sessions; the purge pass inside the count keeps
    /// stale entries from blocking a legitimate registration.
    pub async fn register(&self, user_id: &str) -> Result<SessionRecord, SessionError> {
        require_non_blank("userId", user_id)?;

        info!("Registering session for user {}", user_id);

        let existing = self.policy.existing_valid_session_count(user_id).await?;
        if !self.allow_multiple_sessions && existing > 0 {
            return Err(SessionError::LimitExceeded(format!(
                "User {} already has an active session",
                user_id
            )));
        }
        if self.allow_multiple_sessions && existing >= self.max_session_count {
            return Err(SessionError::LimitExceeded(format!(
                "User {} has reached the maximum of {} active sessions",
                user_id, self.max_session_count
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let record = SessionRecord::new(
            user_id,
            &session_id,
            POST_AUTHENTICATION_STATE,
            self.inactivity_timeout_secs,
        );
        self.store.store(&record).await?;

        info!("Registered session {} for user {}", session_id, user_id);
        Ok(record)
    }

    /// Whether the pair names a live session. Trusted callers presenting
    /// their provisioned identifier validate without touching storage; a
    /// trusted caller with the wrong identifier falls through to normal
    /// validation like anyone else.
    pub async fn is_valid(&self, user_id: &str, session_id: &str) -> Result<bool, SessionError> {
        require_non_blank("userId", user_id)?;
        require_non_blank("sessionId", session_id)?;

        if let Some(provisioned) = self.trusted_callers.get(user_id) {
            if provisioned == session_id {
                return Ok(true);
            }
        }

        Ok(self.policy.is_valid(user_id, session_id).await?)
    }

    /// Hard delete. Idempotent: unregistering a session that is already
    /// gone is not an error.
    pub async fn unregister(&self, user_id: &str, session_id: &str) -> Result<(), SessionError> {
        require_non_blank("userId", user_id)?;
        require_non_blank("sessionId", session_id)?;

        info!("Unregistering session {} for user {}", session_id, user_id);
        self.store.remove_record(user_id, session_id).await?;
        Ok(())
    }

    /// Soft delete: the session keeps validating for the configured grace
    /// window (in-flight requests still pass), then disappears via the
    /// backend's native expiry.
    pub async fn mark_for_unregister(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), SessionError> {
        require_non_blank("userId", user_id)?;
        require_non_blank("sessionId", session_id)?;

        info!(
            "Marking session {} for user {} for removal in {}s",
            session_id, user_id, self.removal_grace_secs
        );
        self.store
            .mark_for_removal(user_id, session_id, self.removal_grace_secs)
            .await?;
        Ok(())
    }

    /// Refresh the session's last accessed timestamp if it is still live;
    /// silently a no-op if the session is already gone.
    pub async fn make_last_accessed_current(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), SessionError> {
        require_non_blank("userId", user_id)?;
        require_non_blank("sessionId", session_id)?;

        if let Some(record) = self.policy.get_if_live(user_id, session_id).await? {
            self.store.touch(&record).await?;
        }
        Ok(())
    }

    /// Replace the session's authentication state label; no-op if the
    /// session is not currently live.
    pub async fn update_authentication_state(
        &self,
        user_id: &str,
        session_id: &str,
        new_state: &str,
    ) -> Result<(), SessionError> {
        require_non_blank("userId", user_id)?;
        require_non_blank("sessionId", session_id)?;

        info!(
            "Updating authentication state for session {} of user {} to {}",
            session_id, user_id, new_state
        );
        if self.policy.get_if_live(user_id, session_id).await?.is_some() {
            self.store
                .set_authentication_state(user_id, session_id, new_state)
                .await?;
        }
        Ok(())
    }

    /// Record that the session was strengthened by a second factor; no-op
    /// if the session is not currently live.
    pub async fn mark_authenticated_by_multi_factor(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), SessionError> {
        require_non_blank("userId", user_id)?;
        require_non_blank("sessionId", session_id)?;

        if self.policy.get_if_live(user_id, session_id).await?.is_some() {
            self.store
                .set_authenticated_by_multi_factor(user_id, session_id)
                .await?;
        }
        Ok(())
    }

    /// Record that the session was established from a token; no-op if the
    /// session is not currently live.
    pub async fn mark_authenticated_by_token(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), SessionError> {
        require_non_blank("userId", user_id)?;
        require_non_blank("sessionId", session_id)?;

        if self.policy.get_if_live(user_id, session_id).await?.is_some() {
            self.store
                .set_authenticated_by_token(user_id, session_id)
                .await?;
        }
        Ok(())
    }

    /// All live sessions for the user, after a purge pass over the index.
    pub async fn get_all_sessions(
        &self,
        user_id: &str,
    ) -> Result<Vec<SessionRecord>, SessionError> {
        require_non_blank("userId", user_id)?;

        self.policy.remove_all_expired_sessions(user_id).await?;

        let mut sessions = Vec::new();
        for session_id in self.store.get_all_session_ids(user_id).await? {
            if let Some(record) = self.policy.get_if_live(user_id, &session_id).await? {
                sessions.push(record);
            }
        }
        Ok(sessions)
    }

    /// Remove every session the index knows about for the user. One entry
    /// that is already gone, or that fails to delete, never fails the batch.
    pub async fn invalidate_all_sessions(&self, user_id: &str) -> Result<(), SessionError> {
        require_non_blank("userId", user_id)?;

        info!("Invalidating all sessions for user {}", user_id);
        for session_id in self.store.get_all_session_ids(user_id).await? {
            if let Err(e) = self.store.remove_record(user_id, &session_id).await {
                warn!(
                    "Failed to remove session {} for user {}: {}",
                    session_id, user_id, e
                );
            }
        }
        Ok(())
    }
}

fn require_non_blank(name: &str, value: &str) -> Result<(), SessionError> {
    if value.trim().is_empty() {
        return Err(SessionError::Validation(format!(
            "{} cannot be empty or blank",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::session::store::memory::MemorySessionStore;

    fn config(allow_multiple: bool, max_session_count: usize) -> ServiceConfig {
        ServiceConfig {
            inactivity_timeout_secs: 1800,
            removal_grace_secs: 60,
            allow_multiple_sessions: allow_multiple,
            max_session_count,
            trusted_callers: HashMap::from([(
                "GatewayService".to_string(),
                "gateway-provisioned-id".to_string(),
            )]),
            store: StoreConfig::Memory,
        }
    }

    fn service(allow_multiple: bool, max_session_count: usize) -> SessionService {
        SessionService::new(
            Arc::new(MemorySessionStore::new()),
            &config(allow_multiple, max_session_count),
        )
    }

    #[tokio::test]
    async fn test_register_and_validate() {
        let service = service(false, 1);

        let record = service.register("alice").await.unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.authentication_state, "PostAuthentication");

        assert!(service.is_valid("alice", &record.session_id).await.unwrap());
        assert!(!service.is_valid("alice", "no-such-session").await.unwrap());
        assert!(!service.is_valid("bob", &record.session_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unregister_invalidates_and_is_idempotent() {
        let service = service(false, 1);

        let record = service.register("alice").await.unwrap();
        service.unregister("alice", &record.session_id).await.unwrap();

        assert!(!service.is_valid("alice", &record.session_id).await.unwrap());

        // Second unregister is a no-op, never an error.
        service.unregister("alice", &record.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_session_mode_rejects_second_registration() {
        let service = service(false, 1);

        service.register("alice").await.unwrap();
        let second = service.register("alice").await;

        assert!(matches!(second, Err(SessionError::LimitExceeded(_))));
    }

    #[tokio::test]
    async fn test_registration_allowed_again_after_unregister() {
        let service = service(false, 1);

        let record = service.register("alice").await.unwrap();
        service.unregister("alice", &record.session_id).await.unwrap();

        assert!(service.register("alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_multiple_sessions_up_to_the_cap() {
        let service = service(true, 3);

        for _ in 0..3 {
            service.register("alice").await.unwrap();
        }

        let fourth = service.register("alice").await;
        assert!(matches!(fourth, Err(SessionError::LimitExceeded(_))));

        // A different user is unaffected.
        assert!(service.register("bob").await.is_ok());
    }

    #[tokio::test]
    async fn test_trusted_caller_bypass() {
        let service = service(false, 1);

        // No session was ever registered for the gateway.
        assert!(service
            .is_valid("GatewayService", "gateway-provisioned-id")
            .await
            .unwrap());
        assert!(!service
            .is_valid("GatewayService", "wrong-id")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_blank_input_fails_before_storage() {
        let service = service(false, 1);

        assert!(matches!(
            service.register("").await,
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            service.register("   ").await,
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            service.is_valid("alice", "").await,
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            service.unregister("", "s-1").await,
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            service.make_last_accessed_current("alice", " ").await,
            Err(SessionError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_operations_on_live_session() {
        let service = service(false, 1);
        let record = service.register("alice").await.unwrap();

        service
            .update_authentication_state("alice", &record.session_id, "MultiFactorVerified")
            .await
            .unwrap();
        service
            .mark_authenticated_by_multi_factor("alice", &record.session_id)
            .await
            .unwrap();
        service
            .mark_authenticated_by_token("alice", &record.session_id)
            .await
            .unwrap();

        let sessions = service.get_all_sessions("alice").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].authentication_state, "MultiFactorVerified");
        assert!(sessions[0].authenticated_by_multi_factor);
        assert!(sessions[0].authenticated_by_token);
    }

    #[tokio::test]
    async fn test_update_operations_are_noops_on_missing_session() {
        let service = service(false, 1);

        service
            .update_authentication_state("alice", "no-such-session", "Whatever")
            .await
            .unwrap();
        service
            .mark_authenticated_by_multi_factor("alice", "no-such-session")
            .await
            .unwrap();
        service
            .make_last_accessed_current("alice", "no-such-session")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_all_sessions() {
        let service = service(true, 5);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(service.register("alice").await.unwrap().session_id);
        }

        service.invalidate_all_sessions("alice").await.unwrap();

        for session_id in &ids {
            assert!(!service.is_valid("alice", session_id).await.unwrap());
        }
        assert!(service.get_all_sessions("alice").await.unwrap().is_empty());

        // Running it again over an empty index is fine.
        service.invalidate_all_sessions("alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_all_sessions_lists_only_the_owner() {
        let service = service(true, 5);

        service.register("alice").await.unwrap();
        service.register("alice").await.unwrap();
        service.register("bob").await.unwrap();

        assert_eq!(service.get_all_sessions("alice").await.unwrap().len(), 2);
        assert_eq!(service.get_all_sessions("bob").await.unwrap().len(), 1);
    }
}

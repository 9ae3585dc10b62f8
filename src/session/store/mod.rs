// Session storage backends
// Two variants implement the same contract: an in-process map store and a
// distributed cache store. Absence of a record is a normal outcome, never
// an error; only transport and data failures surface as StorageError.

pub mod memory;
pub mod redis;

use super::types::SessionRecord;
use crate::config::{ServiceConfig, StoreConfig};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Upper bound on a per-user index scan. The index may carry stale entries,
/// so reads are capped rather than trusted to stay small.
pub const SESSION_ID_SCAN_LIMIT: isize = 100;

/// Contract implemented by both storage variants.
///
/// Callers guarantee session-id freshness before `store`; the two writes
/// behind it (index append + record write) are not transactional in the
/// distributed variant, and every read path tolerates either half missing.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert the record and append its id to the owner's index.
    async fn store(&self, record: &SessionRecord) -> Result<(), StorageError>;

    /// Delete the record and drop its index entry. Idempotent: removing a
    /// session that is already gone is not an error.
    async fn remove_record(&self, user_id: &str, session_id: &str) -> Result<(), StorageError>;

    /// The record, if present and owned by `user_id`.
    async fn get_record(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StorageError>;

    /// The (possibly stale) session ids recorded for the user, capped at
    /// `SESSION_ID_SCAN_LIMIT`.
    async fn get_all_session_ids(&self, user_id: &str) -> Result<Vec<String>, StorageError>;

    /// Set the stored record's last accessed timestamp to now and clear any
    /// pending removal mark.
    async fn touch(&self, record: &SessionRecord) -> Result<(), StorageError>;

    /// Schedule the record to disappear after the grace window instead of
    /// deleting it immediately. The index entry is left for lazy cleanup.
    async fn mark_for_removal(
        &self,
        user_id: &str,
        session_id: &str,
        grace_secs: i64,
    ) -> Result<(), StorageError>;

    async fn set_authentication_state(
        &self,
        user_id: &str,
        session_id: &str,
        state: &str,
    ) -> Result<(), StorageError>;

    async fn set_authenticated_by_multi_factor(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), StorageError>;

    async fn set_authenticated_by_token(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), StorageError>;
}

/// Storage failures surfaced by either backend.
#[derive(Debug, Clone)]
pub enum StorageError {
    ConnectionError(String),
    MalformedRecord(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            StorageError::MalformedRecord(msg) => write!(f, "Malformed record: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Create the storage backend selected by configuration.
///
/// The distributed variant connects eagerly, so a bad cache URL fails here
/// at startup rather than on the first request.
pub async fn create_session_store(
    config: &ServiceConfig,
) -> Result<Arc<dyn SessionStore>, StorageError> {
    match &config.store {
        StoreConfig::Memory => {
            info!("Starting session store with in-memory backend");
            Ok(Arc::new(memory::MemorySessionStore::new()))
        }
        StoreConfig::DistributedCache { url } => {
            info!("Starting session store with distributed cache backend");
            let store = redis::RedisSessionStore::new(url, config.inactivity_timeout_secs)
                .await
                .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
            Ok(Arc::new(store))
        }
    }
}

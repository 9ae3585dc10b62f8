// Expiration and validation rules shared by both storage backends
//
// The backend supplies raw storage primitives; this layer supplies the
// liveness and cleanup algorithms on top of them. Expiration is entirely
// lazy: there is no background sweep, stale entries are reconciled as a
// side effect of the access paths below.

use super::store::{SessionStore, StorageError};
use super::types::SessionRecord;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ExpirationPolicy {
    store: Arc<dyn SessionStore>,
}

impl ExpirationPolicy {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// True only if the record exists, belongs to the user, and is live.
    /// A successful validation counts as an access and refreshes the
    /// record's last accessed timestamp.
    pub async fn is_valid(&self, user_id: &str, session_id: &str) -> Result<bool, StorageError> {
        match self.get_if_live(user_id, session_id).await? {
            Some(record) => {
                self.store.touch(&record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The record if it exists, belongs to the user, and is live. Does not
    /// touch; cardinality checks and read-modify-write paths must not
    /// refresh sessions as a side effect.
    pub async fn get_if_live(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self
            .store
            .get_record(user_id, session_id)
            .await?
            .filter(|record| record.is_live()))
    }

    /// How many of the user's sessions are currently live. Runs the purge
    /// pass first so stale index entries never inflate cardinality checks.
    /// An O(sessions-for-user) scan; acceptable because the configured
    /// session cap is small.
    pub async fn existing_valid_session_count(
        &self,
        user_id: &str,
    ) -> Result<usize, StorageError> {
        self.remove_all_expired_sessions(user_id).await?;

        let mut count = 0;
        for session_id in self.store.get_all_session_ids(user_id).await? {
            if self.get_if_live(user_id, &session_id).await?.is_some() {
                count += 1;
            }
        }

        Ok(count)
    }

    /// Drop every indexed session of the user that is expired or dangling
    /// (an index entry whose record was never written, already deleted, or
    /// expired out of the cache). A failure on one id is logged and the
    /// remaining ids are still processed.
    pub async fn remove_all_expired_sessions(&self, user_id: &str) -> Result<(), StorageError> {
        let session_ids = self.store.get_all_session_ids(user_id).await?;
        let mut removed = 0;

        for session_id in session_ids {
            match self.store.get_record(user_id, &session_id).await {
                Ok(Some(record)) if record.is_live() => {}
                Ok(_) => {
                    // Expired record or dangling index entry; remove_record
                    // drops whichever halves still exist.
                    match self.store.remove_record(user_id, &session_id).await {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(
                            "Failed to remove expired session {} for user {}: {}",
                            session_id, user_id, e
                        ),
                    }
                }
                Err(e) => warn!(
                    "Skipping session {} for user {} during cleanup: {}",
                    session_id, user_id, e
                ),
            }
        }

        if removed > 0 {
            debug!("Removed {} expired sessions for user {}", removed, user_id);
        }

        Ok(())
    }
}

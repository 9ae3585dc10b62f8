// In-process session storage
// Both maps sit behind a single Mutex so index and record mutations appear
// atomic to other local callers.

use super::{SessionStore, StorageError, SESSION_ID_SCAN_LIMIT};
use crate::session::types::SessionRecord;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

struct StoredRecord {
    record: SessionRecord,
    /// Deadline set by `mark_for_removal`; the entry is treated as gone once
    /// the deadline passes. Cleared by touch and the field setters.
    purge_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Maps {
    records: HashMap<String, StoredRecord>,
    user_index: HashMap<String, Vec<String>>,
}

impl Maps {
    /// The entry for `(user_id, session_id)`, evicting it first if its
    /// removal deadline has passed. The index entry is left behind for the
    /// lazy cleanup pass, mirroring the distributed backend's key expiry.
    fn entry_mut(&mut self, user_id: &str, session_id: &str) -> Option<&mut StoredRecord> {
        let purge_due = match self.records.get(session_id) {
            Some(entry) => entry
                .purge_at
                .is_some_and(|deadline| Utc::now() >= deadline),
            None => return None,
        };

        if purge_due {
            self.records.remove(session_id);
            return None;
        }

        self.records
            .get_mut(session_id)
            .filter(|entry| entry.record.user_id == user_id)
    }
}

/// In-process session storage backed by two associative maps.
pub struct MemorySessionStore {
    inner: Mutex<Maps>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Maps::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Maps>, StorageError> {
        self.inner
            .lock()
            .map_err(|e| StorageError::ConnectionError(format!("Lock poisoned: {}", e)))
    }

    /// Delete a record while leaving its index entry in place, simulating
    /// the dangling index entry a crashed distributed write leaves behind.
    #[cfg(test)]
    pub fn drop_record_keeping_index(&self, session_id: &str) {
        self.inner.lock().unwrap().records.remove(session_id);
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn store(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let mut maps = self.lock()?;

        maps.user_index
            .entry(record.user_id.clone())
            .or_default()
            .push(record.session_id.clone());
        maps.records.insert(
            record.session_id.clone(),
            StoredRecord {
                record: record.clone(),
                purge_at: None,
            },
        );

        Ok(())
    }

    async fn remove_record(&self, user_id: &str, session_id: &str) -> Result<(), StorageError> {
        let mut maps = self.lock()?;

        maps.records.remove(session_id);
        if let Some(session_ids) = maps.user_index.get_mut(user_id) {
            session_ids.retain(|id| id != session_id);
            if session_ids.is_empty() {
                maps.user_index.remove(user_id);
            }
        }

        Ok(())
    }

    async fn get_record(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StorageError> {
        let mut maps = self.lock()?;
        Ok(maps
            .entry_mut(user_id, session_id)
            .map(|entry| entry.record.clone()))
    }

    async fn get_all_session_ids(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let maps = self.lock()?;
        Ok(maps
            .user_index
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .take(SESSION_ID_SCAN_LIMIT as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn touch(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let mut maps = self.lock()?;

        if let Some(entry) = maps.entry_mut(&record.user_id, &record.session_id) {
            entry.record.touch();
            entry.purge_at = None;
        }

        Ok(())
    }

    async fn mark_for_removal(
        &self,
        user_id: &str,
        session_id: &str,
        grace_secs: i64,
    ) -> Result<(), StorageError> {
        let mut maps = self.lock()?;

        if let Some(entry) = maps.entry_mut(user_id, session_id) {
            entry.purge_at = Some(Utc::now() + Duration::seconds(grace_secs));
            debug!(
                "Session {} for user {} scheduled for removal in {}s",
                session_id, user_id, grace_secs
            );
        }

        Ok(())
    }

    async fn set_authentication_state(
        &self,
        user_id: &str,
        session_id: &str,
        state: &str,
    ) -> Result<(), StorageError> {
        let mut maps = self.lock()?;

        if let Some(entry) = maps.entry_mut(user_id, session_id) {
            entry.record.authentication_state = state.to_string();
            entry.purge_at = None;
        }

        Ok(())
    }

    async fn set_authenticated_by_multi_factor(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), StorageError> {
        let mut maps = self.lock()?;

        if let Some(entry) = maps.entry_mut(user_id, session_id) {
            entry.record.authenticated_by_multi_factor = true;
            entry.purge_at = None;
        }

        Ok(())
    }

    async fn set_authenticated_by_token(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), StorageError> {
        let mut maps = self.lock()?;

        if let Some(entry) = maps.entry_mut(user_id, session_id) {
            entry.record.authenticated_by_token = true;
            entry.purge_at = None;
        }

        Ok(())
    }
}

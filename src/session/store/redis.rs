// Distributed session storage backed by an external cache
//
// The per-user index is a list keyed by the user id; each session's fields
// live in a hash under a composite key. Storing fields individually lets
// touch update one timestamp without rewriting the whole record. The two
// writes in `store` are sequential and not transactional; read paths never
// trust the index as proof a record exists, and the lazy cleanup pass
// prunes whatever a partial write leaves behind.

use super::{SessionStore, StorageError, SESSION_ID_SCAN_LIMIT};
use crate::session::types::{SessionRecord, POST_AUTHENTICATION_STATE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::MultiplexedConnection, AsyncCommands, RedisError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const USER_ID_FIELD: &str = "UserId";
const SESSION_ID_FIELD: &str = "SessionId";
const AUTH_STATE_FIELD: &str = "AuthenticationState";
const AUTH_BY_MFA_FIELD: &str = "authenticatedByMultiFactor";
const AUTH_BY_TOKEN_FIELD: &str = "authenticatedByToken";
const CREATED_TS_FIELD: &str = "CreatedTS";
const LAST_ACCESSED_TS_FIELD: &str = "LastAccessedTS";

/// Distributed cache session storage.
pub struct RedisSessionStore {
    conn: Arc<Mutex<MultiplexedConnection>>,
    /// The hash does not persist the inactivity window, so it is re-attached
    /// to every record read back from the cache.
    inactivity_timeout_secs: i64,
}

impl RedisSessionStore {
    pub async fn new(redis_url: &str, inactivity_timeout_secs: i64) -> Result<Self, RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            inactivity_timeout_secs,
        })
    }

    fn session_ids_key(&self, user_id: &str) -> String {
        format!("user:{}:session:id", user_id)
    }

    fn session_details_key(&self, user_id: &str, session_id: &str) -> String {
        format!("user:{}:session:details:{}", user_id, session_id)
    }

    fn record_fields(record: &SessionRecord) -> Vec<(&'static str, String)> {
        vec![
            (USER_ID_FIELD, record.user_id.clone()),
            (SESSION_ID_FIELD, record.session_id.clone()),
            (AUTH_STATE_FIELD, record.authentication_state.clone()),
            (
                AUTH_BY_MFA_FIELD,
                record.authenticated_by_multi_factor.to_string(),
            ),
            (
                AUTH_BY_TOKEN_FIELD,
                record.authenticated_by_token.to_string(),
            ),
            (
                CREATED_TS_FIELD,
                record.created_at.timestamp_millis().to_string(),
            ),
            (
                LAST_ACCESSED_TS_FIELD,
                record.last_accessed_at.timestamp_millis().to_string(),
            ),
        ]
    }

    fn record_from_fields(
        fields: HashMap<String, String>,
        inactivity_timeout_secs: i64,
    ) -> Result<Option<SessionRecord>, StorageError> {
        if fields.is_empty() {
            return Ok(None);
        }

        let user_id = require_field(&fields, USER_ID_FIELD)?;
        let session_id = require_field(&fields, SESSION_ID_FIELD)?;
        let created_at = parse_epoch_millis(require_field(&fields, CREATED_TS_FIELD)?)?;
        let last_accessed_at = parse_epoch_millis(require_field(&fields, LAST_ACCESSED_TS_FIELD)?)?;

        // Optional fields default for records written before they existed.
        let authentication_state = fields
            .get(AUTH_STATE_FIELD)
            .cloned()
            .unwrap_or_else(|| POST_AUTHENTICATION_STATE.to_string());
        let authenticated_by_multi_factor = fields
            .get(AUTH_BY_MFA_FIELD)
            .is_some_and(|v| v == "true");
        let authenticated_by_token = fields
            .get(AUTH_BY_TOKEN_FIELD)
            .is_some_and(|v| v == "true");

        Ok(Some(SessionRecord {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            authentication_state,
            authenticated_by_multi_factor,
            authenticated_by_token,
            created_at,
            last_accessed_at,
            inactivity_timeout_secs,
        }))
    }

    /// Write one hash field and clear any pending key expiry set by
    /// `mark_for_removal`.
    async fn set_field_and_persist(
        &self,
        user_id: &str,
        session_id: &str,
        field: &str,
        value: String,
    ) -> Result<(), StorageError> {
        let details_key = self.session_details_key(user_id, session_id);
        let mut conn = self.conn.lock().await;

        let _: () = conn
            .hset(&details_key, field, value)
            .await
            .map_err(redis_err)?;
        let _: () = conn.persist(&details_key).await.map_err(redis_err)?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn store(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let ids_key = self.session_ids_key(&record.user_id);
        let details_key = self.session_details_key(&record.user_id, &record.session_id);
        let fields = Self::record_fields(record);
        let mut conn = self.conn.lock().await;

        let _: () = conn
            .lpush(&ids_key, &record.session_id)
            .await
            .map_err(redis_err)?;
        let _: () = conn
            .hset_multiple(&details_key, &fields)
            .await
            .map_err(redis_err)?;

        Ok(())
    }

    async fn remove_record(&self, user_id: &str, session_id: &str) -> Result<(), StorageError> {
        let ids_key = self.session_ids_key(user_id);
        let details_key = self.session_details_key(user_id, session_id);
        let mut conn = self.conn.lock().await;

        let _: () = conn.lrem(&ids_key, 1, session_id).await.map_err(redis_err)?;
        let _: () = conn.del(&details_key).await.map_err(redis_err)?;

        Ok(())
    }

    async fn get_record(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StorageError> {
        let details_key = self.session_details_key(user_id, session_id);
        let fields: HashMap<String, String> = {
            let mut conn = self.conn.lock().await;
            conn.hgetall(&details_key).await.map_err(redis_err)?
        };

        Ok(
            Self::record_from_fields(fields, self.inactivity_timeout_secs)?
                .filter(|record| record.user_id == user_id),
        )
    }

    async fn get_all_session_ids(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let ids_key = self.session_ids_key(user_id);
        let mut conn = self.conn.lock().await;

        conn.lrange(&ids_key, 0, SESSION_ID_SCAN_LIMIT - 1)
            .await
            .map_err(redis_err)
    }

    async fn touch(&self, record: &SessionRecord) -> Result<(), StorageError> {
        self.set_field_and_persist(
            &record.user_id,
            &record.session_id,
            LAST_ACCESSED_TS_FIELD,
            Utc::now().timestamp_millis().to_string(),
        )
        .await
    }

    async fn mark_for_removal(
        &self,
        user_id: &str,
        session_id: &str,
        grace_secs: i64,
    ) -> Result<(), StorageError> {
        let details_key = self.session_details_key(user_id, session_id);
        let mut conn = self.conn.lock().await;

        let _: () = conn
            .expire(&details_key, grace_secs)
            .await
            .map_err(redis_err)?;

        Ok(())
    }

    async fn set_authentication_state(
        &self,
        user_id: &str,
        session_id: &str,
        state: &str,
    ) -> Result<(), StorageError> {
        self.set_field_and_persist(user_id, session_id, AUTH_STATE_FIELD, state.to_string())
            .await
    }

    async fn set_authenticated_by_multi_factor(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), StorageError> {
        self.set_field_and_persist(user_id, session_id, AUTH_BY_MFA_FIELD, true.to_string())
            .await
    }

    async fn set_authenticated_by_token(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), StorageError> {
        self.set_field_and_persist(user_id, session_id, AUTH_BY_TOKEN_FIELD, true.to_string())
            .await
    }
}

fn redis_err(e: RedisError) -> StorageError {
    StorageError::ConnectionError(e.to_string())
}

fn require_field<'a>(
    fields: &'a HashMap<String, String>,
    name: &str,
) -> Result<&'a String, StorageError> {
    fields
        .get(name)
        .ok_or_else(|| StorageError::MalformedRecord(format!("missing field {}", name)))
}

fn parse_epoch_millis(value: &str) -> Result<DateTime<Utc>, StorageError> {
    let millis = value
        .parse::<i64>()
        .map_err(|e| StorageError::MalformedRecord(format!("bad timestamp '{}': {}", value, e)))?;

    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::MalformedRecord(format!("timestamp out of range: {}", millis)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // The round-trip tests require a Redis instance on localhost; the field
    // mapping tests run everywhere.

    #[test]
    fn test_record_fields_round_trip() {
        let record = SessionRecord::new("user-123", "s-1", POST_AUTHENTICATION_STATE, 1800);
        let fields: HashMap<String, String> = RedisSessionStore::record_fields(&record)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(fields.get(USER_ID_FIELD).unwrap(), "user-123");
        assert_eq!(fields.get(SESSION_ID_FIELD).unwrap(), "s-1");
        assert_eq!(
            fields.get(CREATED_TS_FIELD).unwrap(),
            &record.created_at.timestamp_millis().to_string()
        );
        assert_eq!(fields.get(AUTH_BY_MFA_FIELD).unwrap(), "false");
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let record = SessionRecord::new("user-123", "s-1", "MultiFactorPending", 1800);
        let mut fields: HashMap<String, String> = RedisSessionStore::record_fields(&record)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        // Records written by older revisions carry only the core fields.
        fields.remove(AUTH_STATE_FIELD);
        fields.remove(AUTH_BY_TOKEN_FIELD);

        let parsed = RedisSessionStore::record_from_fields(fields, 1800)
            .unwrap()
            .unwrap();

        assert_eq!(parsed.authentication_state, POST_AUTHENTICATION_STATE);
        assert!(!parsed.authenticated_by_token);
        assert_eq!(parsed.inactivity_timeout_secs, 1800);
    }

    #[test]
    fn test_partial_hash_is_malformed() {
        let mut fields = HashMap::new();
        fields.insert(
            LAST_ACCESSED_TS_FIELD.to_string(),
            "1700000000000".to_string(),
        );

        assert!(RedisSessionStore::record_from_fields(fields, 1800).is_err());
    }

    #[test]
    fn test_empty_hash_is_absence_not_error() {
        assert!(RedisSessionStore::record_from_fields(HashMap::new(), 1800)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    #[ignore] // Remove this to run with a local Redis instance
    async fn test_store_and_get_record_round_trip() {
        let store = RedisSessionStore::new("redis://127.0.0.1/", 1800)
            .await
            .expect("Failed to connect to Redis");

        let record = SessionRecord::new("it-user", "it-session-1", POST_AUTHENTICATION_STATE, 1800);
        store.store(&record).await.unwrap();

        let found = store.get_record("it-user", "it-session-1").await.unwrap();
        assert!(found.is_some());
        let found = found.unwrap();
        assert_eq!(found.session_id, "it-session-1");
        assert_eq!(
            found.created_at.timestamp_millis(),
            record.created_at.timestamp_millis()
        );

        store.remove_record("it-user", "it-session-1").await.unwrap();
        assert!(store
            .get_record("it-user", "it-session-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    #[ignore] // Remove this to run with a local Redis instance
    async fn test_mark_for_removal_expires_record() {
        let store = RedisSessionStore::new("redis://127.0.0.1/", 1800)
            .await
            .expect("Failed to connect to Redis");

        let record = SessionRecord::new("it-user", "it-session-2", POST_AUTHENTICATION_STATE, 1800);
        store.store(&record).await.unwrap();

        store.mark_for_removal("it-user", "it-session-2", 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

        assert!(store
            .get_record("it-user", "it-session-2")
            .await
            .unwrap()
            .is_none());
        // The index entry lingers for lazy cleanup.
        assert!(store
            .get_all_session_ids("it-user")
            .await
            .unwrap()
            .contains(&"it-session-2".to_string()));

        store.remove_record("it-user", "it-session-2").await.unwrap();
    }
}

// Session record value object

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Authentication state assigned to sessions issued through `register`.
pub const POST_AUTHENTICATION_STATE: &str = "PostAuthentication";

/// One authenticated session for one user.
///
/// The inactivity timeout travels with the record, so liveness can be
/// evaluated anywhere without consulting external configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Owning identity. Not unique; a user may hold several sessions.
    pub user_id: String,
    /// Globally unique identifier; the record's primary key.
    pub session_id: String,
    /// Free-form label describing how authentication was established.
    pub authentication_state: String,
    pub authenticated_by_multi_factor: bool,
    pub authenticated_by_token: bool,
    /// Set at creation, immutable thereafter.
    pub created_at: DateTime<Utc>,
    /// Refreshed on every touch; drives the liveness check.
    pub last_accessed_at: DateTime<Utc>,
    pub inactivity_timeout_secs: i64,
}

impl SessionRecord {
    pub fn new(
        user_id: &str,
        session_id: &str,
        authentication_state: &str,
        inactivity_timeout_secs: i64,
    ) -> Self {
        let now = Utc::now();

        Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            authentication_state: authentication_state.to_string(),
            authenticated_by_multi_factor: false,
            authenticated_by_token: false,
            created_at: now,
            last_accessed_at: now,
            inactivity_timeout_secs,
        }
    }

    /// A record is live while the last access is within the inactivity window.
    pub fn is_live(&self) -> bool {
        Utc::now() - self.last_accessed_at < Duration::seconds(self.inactivity_timeout_secs)
    }

    /// Update the last accessed timestamp to now.
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }
}

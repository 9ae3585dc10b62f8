// Session storage and lifecycle engine
// Issues, validates and retires per-user session identifiers with
// concurrent-session limits, lazy expiration and trusted-caller bypass

pub mod policy;
pub mod service;
pub mod store;
pub mod types;

pub use policy::ExpirationPolicy;
pub use service::{SessionError, SessionService};
pub use store::{
    create_session_store, memory::MemorySessionStore, redis::RedisSessionStore, SessionStore,
    StorageError,
};
pub use types::SessionRecord;

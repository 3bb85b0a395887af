//! Persistence layer: libSQL-backed storage for profiles, conversation
//! contexts, the referral ledger and tags.

pub mod libsql_backend;
pub mod lock;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use lock::KeyedMutex;
pub use traits::{Database, ProfileLock};

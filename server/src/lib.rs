//! A revisioned key-value store served over gRPC.
//!
//! Every mutation is appended to an event log in SQLite and stamped with a
//! store-wide revision. Range reads report the revision they reflect, and
//! watches replay the log from any revision that has not been compacted,
//! which is what clients need to seed a view and then follow it without gaps.

pub mod auth;
pub mod db;
pub mod grpc;
pub mod models;
pub mod storage;

pub use auth::Authenticator;
pub use storage::{Storage, StorageError};

//! # jobq persistence
//!
//! Durable storage for jobq queues.
//!
//! Supports:
//! - SQLite (single node, WAL mode), schema managed by embedded migrations

pub mod queue;
pub mod sqlite;

pub use queue::SqliteQueueBackend;
pub use sqlite::{PersistError, SqliteConfig};

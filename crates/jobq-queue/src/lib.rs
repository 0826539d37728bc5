//! # jobq queue
//!
//! Named job queues with FIFO pending sets, bounded retries and dead-letter
//! sets.
//!
//! Features:
//! - Queue registry with per-owner unique names and notification settings
//! - Job intake preserving submission order
//! - Single-attempt execution engine with leased claims and retry/dead-letter policy
//! - Cursor-paginated listings of jobs, dead jobs and results
//! - Best-effort HTTP and in-game push notifications
//! - Pluggable backend (Memory, SQLite via `jobq-persist`)

pub mod access;
pub mod backend;
pub mod config;
pub mod engine;
pub mod executor;
pub mod job;
pub mod memory;
pub mod notify;
pub mod page;
pub mod queue;
pub mod service;
pub mod telemetry;
pub mod worker;

pub use access::{AccessTokenVerifier, StaticTokenVerifier};
pub use backend::{JobFilter, QueueBackend, QueueError};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Attempt, Engine};
pub use executor::{ExecutionError, ScriptExecutor, ScriptOutput, ScriptRegistry};
pub use job::{Job, JobId, JobOutcome, JobResult, NewJob, PushRequest};
pub use memory::MemoryQueue;
pub use notify::{NotificationDispatcher, NotificationEvent, Notifier, NotifyError};
pub use page::{Page, PageRequest, PageToken};
pub use queue::{NewQueue, NotificationSettings, NotificationType, Queue, QueueId, QueueUpdate};
pub use service::JobQueueService;
pub use worker::{QueueWorker, WorkerConfig};

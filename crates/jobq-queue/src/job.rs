//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::QueueId;

/// Job Identifier
pub type JobId = Uuid;

/// A unit of deferred work waiting in (or dead-lettered from) a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    pub queue_id: QueueId,
    pub user_id: String,
    pub script_name: String,
    pub args: String,
    pub current_retry: u32,
    pub max_retry: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub create_at: DateTime<Utc>,
}

/// A job as submitted by `push`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub script_name: String,
    pub args: String,
    pub max_retry: u32,
}

impl NewJob {
    pub fn new(script_name: impl Into<String>, args: impl Into<String>, max_retry: u32) -> Self {
        Self {
            script_name: script_name.into(),
            args: args.into(),
            max_retry,
        }
    }
}

/// Push request body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub jobs: Vec<NewJob>,
}

/// Immutable record of one execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: JobId,
    pub queue_id: QueueId,
    pub status_code: i32,
    pub result: String,
    /// True when the pending set was empty right after this attempt
    pub end_of_job: bool,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub create_at: DateTime<Utc>,
}

/// How an attempt was classified by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobOutcome {
    /// Script succeeded; job left the pending set
    Succeeded,
    /// Script failed; job went back to the end of the pending set
    Retrying,
    /// Script failed with no retries left; job moved to the dead-job set
    DeadLettered,
}

/// What the backend should do with a claimed job when settling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Drop from the pending set
    Complete,
    /// Append to the back of the pending set with the new retry count
    Requeue { current_retry: u32 },
    /// Move to the dead-job set as is
    DeadLetter,
}

impl Transition {
    /// Retry policy: a failure bumps `current_retry`; the job stays pending
    /// while the count is within `max_retry`, otherwise it is dead-lettered
    /// without touching the count again.
    pub fn after_failure(job: &Job) -> Self {
        let current_retry = job.current_retry.saturating_add(1);
        if current_retry <= job.max_retry {
            Self::Requeue { current_retry }
        } else {
            Self::DeadLetter
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        match self {
            Self::Complete => JobOutcome::Succeeded,
            Self::Requeue { .. } => JobOutcome::Retrying,
            Self::DeadLetter => JobOutcome::DeadLettered,
        }
    }
}

/// A job claimed for execution under a lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub job: Job,
    pub lease_id: Uuid,
    /// User scope the claim was made under, if any
    pub user_scope: Option<String>,
}

/// Status code and payload of one attempt, handed to the backend on settle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub status_code: i32,
    pub result: String,
}

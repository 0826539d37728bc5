//! Queue Backend Trait

use async_trait::async_trait;
use std::time::Duration;

use crate::job::{AttemptRecord, ClaimedJob, Job, JobId, JobResult, NewJob, Transition};
use crate::page::{Page, PageRequest};
use crate::queue::{NewQueue, Queue, QueueId, QueueUpdate};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Queue name already in use: {0}")]
    DuplicateName(String),
    #[error("Invalid notification config: {0}")]
    InvalidNotificationConfig(String),
    #[error("Access denied")]
    AccessDenied,
    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("Backend error: {0}")]
    Backend(String),
}

impl QueueError {
    pub fn queue_not_found(queue_id: QueueId) -> Self {
        Self::NotFound(format!("queue {}", queue_id))
    }

    pub fn job_not_found(job_id: JobId) -> Self {
        Self::NotFound(format!("job {}", job_id))
    }
}

/// Which jobs a listing selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    All,
    ByUser(String),
    ByScript(String),
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        match self {
            Self::All => true,
            Self::ByUser(user_id) => &job.user_id == user_id,
            Self::ByScript(script_name) => &job.script_name == script_name,
        }
    }
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Create a queue; names are unique per owner
    async fn create_queue(&self, owner_id: &str, queue: NewQueue) -> Result<Queue, QueueError>;

    async fn get_queue(&self, owner_id: &str, queue_id: QueueId) -> Result<Queue, QueueError>;

    /// Apply a partial update; notification fields are merged then validated
    async fn update_queue(
        &self,
        owner_id: &str,
        queue_id: QueueId,
        update: QueueUpdate,
    ) -> Result<Queue, QueueError>;

    /// Remove a queue along with its pending jobs, dead jobs and results
    async fn delete_queue(&self, owner_id: &str, queue_id: QueueId) -> Result<(), QueueError>;

    /// Queues of one owner in creation order
    async fn list_queues(&self, owner_id: &str, page: PageRequest)
        -> Result<Page<Queue>, QueueError>;

    /// Append jobs to the back of the pending set, in the given order
    async fn push_jobs(
        &self,
        queue_id: QueueId,
        user_id: &str,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<Job>, QueueError>;

    /// Claim the oldest pending job that is not leased, optionally only
    /// among one user's jobs. Returns `None` when nothing is claimable.
    async fn claim_next(
        &self,
        queue_id: QueueId,
        user_id: Option<&str>,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError>;

    /// Apply `transition` to a claimed job and append its `JobResult`.
    /// Fails with `LeaseLost` if the claim is no longer held.
    async fn settle(
        &self,
        claim: &ClaimedJob,
        transition: Transition,
        record: AttemptRecord,
    ) -> Result<JobResult, QueueError>;

    /// Pending jobs, front of the queue first
    async fn list_jobs(
        &self,
        queue_id: QueueId,
        filter: JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>, QueueError>;

    /// Dead jobs in the order they were dead-lettered
    async fn list_dead_jobs(
        &self,
        queue_id: QueueId,
        filter: JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>, QueueError>;

    async fn delete_dead_job(
        &self,
        queue_id: QueueId,
        job_id: JobId,
        user_id: &str,
    ) -> Result<(), QueueError>;

    /// Result history, oldest first, optionally for one job only
    async fn list_results(
        &self,
        queue_id: QueueId,
        job_id: Option<JobId>,
        page: PageRequest,
    ) -> Result<Page<JobResult>, QueueError>;
}

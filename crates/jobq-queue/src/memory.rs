//! In-memory queue implementation with leased FIFO claiming

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{JobFilter, QueueBackend, QueueError};
use crate::job::{AttemptRecord, ClaimedJob, Job, JobId, JobResult, NewJob, Transition};
use crate::page::{Page, PageRequest};
use crate::queue::{NewQueue, Queue, QueueId, QueueUpdate};

#[derive(Debug, Clone)]
struct Lease {
    id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    seq: u64,
    job: Job,
    lease: Option<Lease>,
}

impl PendingEntry {
    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().map_or(true, |lease| lease.expires_at <= now)
    }
}

#[derive(Debug)]
struct QueueRecord {
    seq: u64,
    queue: Queue,
    pending: VecDeque<PendingEntry>,
    dead: Vec<(u64, Job)>,
    results: Vec<(u64, JobResult)>,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    queues: HashMap<QueueId, QueueRecord>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn owned(&self, owner_id: &str, queue_id: QueueId) -> Result<&QueueRecord, QueueError> {
        self.queues
            .get(&queue_id)
            .filter(|r| r.queue.owner_id == owner_id)
            .ok_or_else(|| QueueError::queue_not_found(queue_id))
    }

    fn record(&self, queue_id: QueueId) -> Result<&QueueRecord, QueueError> {
        self.queues
            .get(&queue_id)
            .ok_or_else(|| QueueError::queue_not_found(queue_id))
    }
}

/// All state sits behind one lock so that a claim, and later the settle of
/// that claim, each happen as a single step.
#[derive(Debug, Default, Clone)]
pub struct MemoryQueue {
    state: Arc<RwLock<State>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn create_queue(&self, owner_id: &str, new: NewQueue) -> Result<Queue, QueueError> {
        let mut state = self.state.write().await;

        let taken = state
            .queues
            .values()
            .any(|r| r.queue.owner_id == owner_id && r.queue.name == new.name);
        if taken {
            return Err(QueueError::DuplicateName(new.name));
        }

        let now = Utc::now();
        let queue = Queue {
            queue_id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            name: new.name,
            description: new.description,
            notification: new.notification,
            create_at: now,
            update_at: now,
        };

        let seq = state.bump();
        state.queues.insert(
            queue.queue_id,
            QueueRecord {
                seq,
                queue: queue.clone(),
                pending: VecDeque::new(),
                dead: Vec::new(),
                results: Vec::new(),
            },
        );

        Ok(queue)
    }

    async fn get_queue(&self, owner_id: &str, queue_id: QueueId) -> Result<Queue, QueueError> {
        let state = self.state.read().await;
        Ok(state.owned(owner_id, queue_id)?.queue.clone())
    }

    async fn update_queue(
        &self,
        owner_id: &str,
        queue_id: QueueId,
        update: QueueUpdate,
    ) -> Result<Queue, QueueError> {
        let mut state = self.state.write().await;
        state.owned(owner_id, queue_id)?;

        let record = state
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| QueueError::queue_not_found(queue_id))?;

        let notification = record.queue.notification.merge(&update.notification)?;
        if let Some(description) = update.description {
            record.queue.description = Some(description);
        }
        record.queue.notification = notification;
        record.queue.update_at = Utc::now();

        Ok(record.queue.clone())
    }

    async fn delete_queue(&self, owner_id: &str, queue_id: QueueId) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        state.owned(owner_id, queue_id)?;

        if let Some(record) = state.queues.remove(&queue_id) {
            tracing::debug!(
                queue_id = %queue_id,
                pending = record.pending.len(),
                dead = record.dead.len(),
                results = record.results.len(),
                "Dropped queue contents"
            );
        }
        Ok(())
    }

    async fn list_queues(
        &self,
        owner_id: &str,
        page: PageRequest,
    ) -> Result<Page<Queue>, QueueError> {
        let state = self.state.read().await;
        let mut owned: Vec<(u64, Queue)> = state
            .queues
            .values()
            .filter(|r| r.queue.owner_id == owner_id)
            .map(|r| (r.seq, r.queue.clone()))
            .collect();
        owned.sort_by_key(|(seq, _)| *seq);

        Ok(page.paginate(owned))
    }

    async fn push_jobs(
        &self,
        queue_id: QueueId,
        user_id: &str,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<Job>, QueueError> {
        let mut state = self.state.write().await;
        state.record(queue_id)?;

        let now = Utc::now();
        let mut entries = Vec::with_capacity(jobs.len());
        for new in jobs {
            let seq = state.bump();
            entries.push(PendingEntry {
                seq,
                job: Job {
                    job_id: Uuid::new_v4(),
                    queue_id,
                    user_id: user_id.to_string(),
                    script_name: new.script_name,
                    args: new.args,
                    current_retry: 0,
                    max_retry: new.max_retry,
                    create_at: now,
                },
                lease: None,
            });
        }

        let record = state
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| QueueError::queue_not_found(queue_id))?;
        let pushed = entries.iter().map(|e| e.job.clone()).collect();
        record.pending.extend(entries);

        Ok(pushed)
    }

    async fn claim_next(
        &self,
        queue_id: QueueId,
        user_id: Option<&str>,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let mut state = self.state.write().await;
        let record = state
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| QueueError::queue_not_found(queue_id))?;

        let now = Utc::now();
        let lease_len = chrono::Duration::from_std(lease)
            .map_err(|e| QueueError::Backend(format!("lease duration out of range: {}", e)))?;

        let entry = record.pending.iter_mut().find(|e| {
            user_id.map_or(true, |u| e.job.user_id == u) && e.is_claimable(now)
        });

        let Some(entry) = entry else {
            return Ok(None);
        };

        if entry.lease.is_some() {
            tracing::warn!(job_id = %entry.job.job_id, "Reclaiming job with expired lease");
        }

        let granted = Lease {
            id: Uuid::new_v4(),
            expires_at: now + lease_len,
        };
        entry.lease = Some(granted.clone());

        Ok(Some(ClaimedJob {
            job: entry.job.clone(),
            lease_id: granted.id,
            user_scope: user_id.map(str::to_string),
        }))
    }

    async fn settle(
        &self,
        claim: &ClaimedJob,
        transition: Transition,
        record: AttemptRecord,
    ) -> Result<JobResult, QueueError> {
        let mut state = self.state.write().await;
        let queue_id = claim.job.queue_id;
        let requeue_seq = state.bump();
        let result_seq = state.bump();

        let queue = state
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| QueueError::queue_not_found(queue_id))?;

        let position = queue
            .pending
            .iter()
            .position(|e| {
                e.job.job_id == claim.job.job_id
                    && e.lease.as_ref().is_some_and(|l| l.id == claim.lease_id)
            })
            .ok_or(QueueError::LeaseLost(claim.job.job_id))?;

        let Some(mut entry) = queue.pending.remove(position) else {
            return Err(QueueError::LeaseLost(claim.job.job_id));
        };

        match transition {
            Transition::Complete => {}
            Transition::Requeue { current_retry } => {
                entry.job.current_retry = current_retry;
                queue.pending.push_back(PendingEntry {
                    seq: requeue_seq,
                    job: entry.job,
                    lease: None,
                });
            }
            Transition::DeadLetter => {
                queue.dead.push((requeue_seq, entry.job));
            }
        }

        let end_of_job = match claim.user_scope.as_deref() {
            Some(user) => !queue.pending.iter().any(|e| e.job.user_id == user),
            None => queue.pending.is_empty(),
        };

        let result = JobResult {
            job_id: claim.job.job_id,
            queue_id,
            status_code: record.status_code,
            result: record.result,
            end_of_job,
            create_at: Utc::now(),
        };
        queue.results.push((result_seq, result.clone()));

        Ok(result)
    }

    async fn list_jobs(
        &self,
        queue_id: QueueId,
        filter: JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>, QueueError> {
        let state = self.state.read().await;
        let record = state.record(queue_id)?;

        // Requeued jobs carry a fresh seq, so pending order is seq order.
        Ok(page.paginate(
            record
                .pending
                .iter()
                .filter(|e| filter.matches(&e.job))
                .map(|e| (e.seq, e.job.clone())),
        ))
    }

    async fn list_dead_jobs(
        &self,
        queue_id: QueueId,
        filter: JobFilter,
        page: PageRequest,
    ) -> Result<Page<Job>, QueueError> {
        let state = self.state.read().await;
        let record = state.record(queue_id)?;

        Ok(page.paginate(
            record
                .dead
                .iter()
                .filter(|(_, job)| filter.matches(job))
                .map(|(seq, job)| (*seq, job.clone())),
        ))
    }

    async fn delete_dead_job(
        &self,
        queue_id: QueueId,
        job_id: JobId,
        user_id: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let record = state
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| QueueError::queue_not_found(queue_id))?;

        let before = record.dead.len();
        record
            .dead
            .retain(|(_, job)| !(job.job_id == job_id && job.user_id == user_id));

        if record.dead.len() == before {
            return Err(QueueError::job_not_found(job_id));
        }
        Ok(())
    }

    async fn list_results(
        &self,
        queue_id: QueueId,
        job_id: Option<JobId>,
        page: PageRequest,
    ) -> Result<Page<JobResult>, QueueError> {
        let state = self.state.read().await;
        let record = state.record(queue_id)?;

        Ok(page.paginate(
            record
                .results
                .iter()
                .filter(|(_, r)| job_id.map_or(true, |id| r.job_id == id))
                .map(|(seq, r)| (*seq, r.clone())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "owner-1";
    const LEASE: Duration = Duration::from_secs(30);

    fn ok_record() -> AttemptRecord {
        AttemptRecord {
            status_code: 200,
            result: "ok".into(),
        }
    }

    async fn queue_with(backend: &MemoryQueue, scripts: &[&str]) -> QueueId {
        let queue = backend
            .create_queue(OWNER, NewQueue::named("q"))
            .await
            .unwrap();
        let jobs = scripts.iter().map(|s| NewJob::new(*s, "{}", 1)).collect();
        backend
            .push_jobs(queue.queue_id, "user-1", jobs)
            .await
            .unwrap();
        queue.queue_id
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_exclusive() {
        let backend = MemoryQueue::new();
        let queue_id = queue_with(&backend, &["a", "b"]).await;

        let first = backend.claim_next(queue_id, None, LEASE).await.unwrap().unwrap();
        let second = backend.claim_next(queue_id, None, LEASE).await.unwrap().unwrap();
        assert_eq!(first.job.script_name, "a");
        assert_eq!(second.job.script_name, "b");

        // Both jobs are in flight; nothing else is claimable.
        assert!(backend.claim_next(queue_id, None, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let backend = MemoryQueue::new();
        let queue_id = queue_with(&backend, &["a"]).await;

        let stale = backend
            .claim_next(queue_id, None, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let fresh = backend.claim_next(queue_id, None, LEASE).await.unwrap().unwrap();
        assert_eq!(stale.job.job_id, fresh.job.job_id);
        assert_ne!(stale.lease_id, fresh.lease_id);

        let err = backend
            .settle(&stale, Transition::Complete, ok_record())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(_)));

        let result = backend
            .settle(&fresh, Transition::Complete, ok_record())
            .await
            .unwrap();
        assert!(result.end_of_job);
    }

    #[tokio::test]
    async fn test_settle_after_queue_deleted_is_not_found() {
        let backend = MemoryQueue::new();
        let queue_id = queue_with(&backend, &["a"]).await;

        let claim = backend.claim_next(queue_id, None, LEASE).await.unwrap().unwrap();
        backend.delete_queue(OWNER, queue_id).await.unwrap();

        let err = backend
            .settle(&claim, Transition::Complete, ok_record())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_requeue_goes_to_back() {
        let backend = MemoryQueue::new();
        let queue_id = queue_with(&backend, &["a", "b"]).await;

        let claim = backend.claim_next(queue_id, None, LEASE).await.unwrap().unwrap();
        let result = backend
            .settle(
                &claim,
                Transition::Requeue { current_retry: 1 },
                AttemptRecord {
                    status_code: 500,
                    result: "boom".into(),
                },
            )
            .await
            .unwrap();
        assert!(!result.end_of_job);

        let page = backend
            .list_jobs(queue_id, JobFilter::All, PageRequest::first(10))
            .await
            .unwrap();
        let order: Vec<_> = page.items.iter().map(|j| j.script_name.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(page.items[1].current_retry, 1);
    }

    #[tokio::test]
    async fn test_user_scoped_claim_and_end_of_job() {
        let backend = MemoryQueue::new();
        let queue = backend
            .create_queue(OWNER, NewQueue::named("q"))
            .await
            .unwrap();
        backend
            .push_jobs(queue.queue_id, "alice", vec![NewJob::new("a", "", 0)])
            .await
            .unwrap();
        backend
            .push_jobs(queue.queue_id, "bob", vec![NewJob::new("b", "", 0)])
            .await
            .unwrap();

        let claim = backend
            .claim_next(queue.queue_id, Some("bob"), LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.job.user_id, "bob");

        let result = backend
            .settle(&claim, Transition::Complete, ok_record())
            .await
            .unwrap();
        // Bob's subqueue is drained even though Alice still has work.
        assert!(result.end_of_job);
    }

    #[tokio::test]
    async fn test_duplicate_name_per_owner() {
        let backend = MemoryQueue::new();
        backend
            .create_queue(OWNER, NewQueue::named("daily"))
            .await
            .unwrap();
        let err = backend
            .create_queue(OWNER, NewQueue::named("daily"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateName(_)));

        // Another owner may reuse the name.
        assert!(backend
            .create_queue("owner-2", NewQueue::named("daily"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_other_owner_cannot_see_queue() {
        let backend = MemoryQueue::new();
        let queue = backend
            .create_queue(OWNER, NewQueue::named("private"))
            .await
            .unwrap();
        let err = backend
            .get_queue("intruder", queue.queue_id)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }
}

//! Execution engine: one attempt per call
//!
//! Claims the front pending job, runs its script, applies the retry policy
//! and records the attempt. A failing script is never an error of the call;
//! it only moves the job back in line or into the dead-job set.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backend::{QueueBackend, QueueError};
use crate::config::{ConfigError, EngineConfig};
use crate::executor::{ExecutionError, ScriptExecutor};
use crate::job::{AttemptRecord, ClaimedJob, Job, JobOutcome, JobResult, Transition};
use crate::notify::{NotificationDispatcher, NotificationEvent};
use crate::queue::Queue;

/// Everything known about one finished attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    /// The job as it was when claimed
    pub job: Job,
    pub result: JobResult,
    pub outcome: JobOutcome,
}

pub struct Engine<B: QueueBackend + ?Sized> {
    backend: Arc<B>,
    executor: Arc<dyn ScriptExecutor>,
    dispatcher: NotificationDispatcher,
    config: EngineConfig,
}

impl<B: QueueBackend + ?Sized> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            executor: self.executor.clone(),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B: QueueBackend + ?Sized> Engine<B> {
    /// Engine with the default configuration
    pub fn new(
        backend: Arc<B>,
        executor: Arc<dyn ScriptExecutor>,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            backend,
            executor,
            dispatcher,
            config: EngineConfig::default(),
        }
    }

    /// Replace the configuration. Rejects settings under which a lease could
    /// expire while its attempt is still running.
    pub fn with_config(mut self, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn with_dispatcher(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    /// Run the front job of `queue` (or of one user's jobs in it).
    ///
    /// `Ok(None)` means nothing was claimable. Backend errors and lost leases
    /// are returned as errors; script failures are not.
    pub async fn run_next(
        &self,
        queue: &Queue,
        user_id: Option<&str>,
    ) -> Result<Option<Attempt>, QueueError> {
        let Some(claim) = self
            .backend
            .claim_next(queue.queue_id, user_id, self.config.lease_duration)
            .await?
        else {
            return Ok(None);
        };

        let (transition, record) = self.execute(&claim).await;
        let outcome = transition.outcome();

        let result = self.backend.settle(&claim, transition, record).await?;

        match outcome {
            JobOutcome::Succeeded => info!(
                job_id = %claim.job.job_id,
                queue_id = %queue.queue_id,
                end_of_job = result.end_of_job,
                "Job completed"
            ),
            JobOutcome::Retrying => warn!(
                job_id = %claim.job.job_id,
                queue_id = %queue.queue_id,
                attempt = claim.job.current_retry + 1,
                max_retry = claim.job.max_retry,
                "Job failed, re-queued at the back"
            ),
            JobOutcome::DeadLettered => error!(
                job_id = %claim.job.job_id,
                queue_id = %queue.queue_id,
                script = %claim.job.script_name,
                "Job exhausted its retries, moved to dead jobs"
            ),
        }

        self.dispatcher
            .dispatch(
                queue,
                NotificationEvent::JobAttempted {
                    job: claim.job.clone(),
                    result: result.clone(),
                    outcome,
                },
            )
            .await;

        Ok(Some(Attempt {
            job: claim.job,
            result,
            outcome,
        }))
    }

    async fn execute(&self, claim: &ClaimedJob) -> (Transition, AttemptRecord) {
        let job = &claim.job;
        let timeout = self.config.execution_timeout;

        let executed = match tokio::time::timeout(
            timeout,
            self.executor.execute(&job.script_name, &job.args),
        )
        .await
        {
            Ok(executed) => executed,
            Err(_) => Err(ExecutionError::Timeout(timeout)),
        };

        match executed {
            Ok(output) if output.is_success() => (
                Transition::Complete,
                AttemptRecord {
                    status_code: output.status_code,
                    result: output.result,
                },
            ),
            Ok(output) => (
                Transition::after_failure(job),
                AttemptRecord {
                    status_code: output.status_code,
                    result: output.result,
                },
            ),
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Script execution error");
                (
                    Transition::after_failure(job),
                    AttemptRecord {
                        status_code: self.config.failure_status_code,
                        result: e.to_string(),
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ScriptRegistry;
    use crate::memory::MemoryQueue;
    use std::time::Duration;

    fn engine() -> Engine<MemoryQueue> {
        Engine::new(
            Arc::new(MemoryQueue::new()),
            Arc::new(ScriptRegistry::new()),
            NotificationDispatcher::disabled(),
        )
    }

    #[test]
    fn test_lease_shorter_than_execution_rejected() {
        let config = EngineConfig {
            lease_duration: Duration::from_millis(20),
            ..Default::default()
        };
        assert!(matches!(
            engine().with_config(config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_valid_config_installed() {
        let config = EngineConfig {
            execution_timeout: Duration::from_secs(1),
            lease_duration: Duration::from_secs(2),
            ..Default::default()
        };
        let engine = engine().with_config(config.clone()).unwrap();
        assert_eq!(engine.config(), &config);
    }
}

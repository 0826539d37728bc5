//! Concurrent queue draining

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::backend::{QueueBackend, QueueError};
use crate::engine::{Attempt, Engine};
use crate::queue::Queue;

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { max_concurrency: 5 }
    }
}

/// Drains queues by issuing `run` attempts in parallel lanes.
///
/// Each drain opens `max_concurrency` lanes. All lanes of a worker take a
/// permit from one semaphore per attempt, so drains running at the same
/// time on this worker (see [`drain_all`](Self::drain_all)) together keep
/// at most `max_concurrency` attempts in flight.
pub struct QueueWorker<B: QueueBackend + ?Sized> {
    engine: Engine<B>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
}

impl<B: QueueBackend + ?Sized + 'static> QueueWorker<B> {
    pub fn new(engine: Engine<B>, config: WorkerConfig) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        Self {
            engine,
            config: WorkerConfig { max_concurrency },
            permits: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    /// Run attempts until the queue reports nothing claimable.
    ///
    /// Returns every attempt made, grouped by lane. A backend error stops
    /// its lane and is returned once all lanes have stopped.
    pub async fn drain(&self, queue: &Queue) -> Result<Vec<Attempt>, QueueError> {
        info!(
            queue_id = %queue.queue_id,
            lanes = self.config.max_concurrency,
            "Draining queue"
        );

        let mut lanes = JoinSet::new();
        for _ in 0..self.config.max_concurrency {
            let engine = self.engine.clone();
            let permits = self.permits.clone();
            let queue = queue.clone();

            lanes.spawn(async move {
                let mut attempts = Vec::new();
                loop {
                    let Ok(_permit) = permits.clone().acquire_owned().await else {
                        return Ok::<_, QueueError>(attempts);
                    };
                    match engine.run_next(&queue, None).await? {
                        Some(attempt) => attempts.push(attempt),
                        None => return Ok(attempts),
                    }
                }
            });
        }

        let mut all = Vec::new();
        let mut first_error = None;
        while let Some(joined) = lanes.join_next().await {
            match joined {
                Ok(Ok(attempts)) => all.extend(attempts),
                Ok(Err(e)) => {
                    error!(queue_id = %queue.queue_id, error = %e, "Drain lane failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(queue_id = %queue.queue_id, error = %e, "Drain lane panicked");
                    first_error.get_or_insert(QueueError::Backend(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(all),
        }
    }

    /// Drain several queues at once under the shared concurrency bound.
    ///
    /// Every queue is drained to the end even when another fails; the first
    /// error in queue order is returned.
    pub async fn drain_all(&self, queues: &[Queue]) -> Result<Vec<Attempt>, QueueError> {
        let drains = queues.iter().map(|queue| self.drain(queue));
        let mut all = Vec::new();
        for drained in join_all(drains).await {
            all.extend(drained?);
        }
        Ok(all)
    }
}

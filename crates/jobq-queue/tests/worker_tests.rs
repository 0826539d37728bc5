//! Concurrent drain tests
//!
//! Several lanes compete for the same queue; every job must be executed
//! exactly once per attempt and every result recorded.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobq_queue::{
    JobOutcome, JobQueueService, MemoryQueue, NewJob, NewQueue, QueueWorker, ScriptOutput,
    ScriptRegistry, WorkerConfig,
};

#[tokio::test]
async fn test_drain_runs_every_job_once() {
    let registry = ScriptRegistry::new();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        registry.register("work", move |args| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(ScriptOutput::ok(args))
            }
        });
    }

    let svc = JobQueueService::new(MemoryQueue::new(), "owner-1", Arc::new(registry));
    let queue = svc.create_queue(NewQueue::named("bulk")).await.unwrap();
    for batch in 0..4 {
        let jobs = (0..10)
            .map(|i| NewJob::new("work", format!("{}", batch * 10 + i), 0))
            .collect();
        svc.push(queue.queue_id, "u", jobs).await.unwrap();
    }

    let worker = QueueWorker::new(svc.engine().clone(), WorkerConfig { max_concurrency: 3 });
    let attempts = worker.drain(&queue).await.unwrap();

    assert_eq!(attempts.len(), 40);
    assert!(attempts.iter().all(|a| a.outcome == JobOutcome::Succeeded));
    let unique: HashSet<_> = attempts.iter().map(|a| a.job.job_id).collect();
    assert_eq!(unique.len(), 40);
    assert!(peak.load(Ordering::SeqCst) <= 3);

    assert!(svc.describe_job(queue.queue_id, None, None).await.unwrap().items.is_empty());
    let results = svc
        .describe_job_result(queue.queue_id, None, None, Some(100))
        .await
        .unwrap();
    assert_eq!(results.items.len(), 40);
    assert_eq!(results.items.iter().filter(|r| r.end_of_job).count(), 1);
}

#[tokio::test]
async fn test_drain_dead_letters_failures() {
    let registry = ScriptRegistry::new();
    registry.register("broken", |_args| async move {
        Ok(ScriptOutput::with_status(503, "unavailable"))
    });

    let svc = JobQueueService::new(MemoryQueue::new(), "owner-1", Arc::new(registry));
    let queue = svc.create_queue(NewQueue::named("failing")).await.unwrap();
    let jobs = (0..5).map(|_| NewJob::new("broken", "", 2)).collect();
    svc.push(queue.queue_id, "u", jobs).await.unwrap();

    let worker = QueueWorker::new(svc.engine().clone(), WorkerConfig::default());
    let attempts = worker.drain(&queue).await.unwrap();

    // Three attempts per job at maxRetry = 2.
    assert_eq!(attempts.len(), 15);
    assert_eq!(
        attempts
            .iter()
            .filter(|a| a.outcome == JobOutcome::DeadLettered)
            .count(),
        5
    );
    let dead = svc.describe_dead_job(queue.queue_id, None, None).await.unwrap();
    assert_eq!(dead.items.len(), 5);
    assert!(dead.items.iter().all(|j| j.current_retry == 2));
}

#[tokio::test]
async fn test_drain_empty_queue() {
    let svc = JobQueueService::new(
        MemoryQueue::new(),
        "owner-1",
        Arc::new(ScriptRegistry::new()),
    );
    let queue = svc.create_queue(NewQueue::named("empty")).await.unwrap();
    let worker = QueueWorker::new(svc.engine().clone(), WorkerConfig::default());
    assert!(worker.drain(&queue).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_drain_all_shares_concurrency_bound() {
    let registry = ScriptRegistry::new();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        registry.register("work", move |args| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(ScriptOutput::ok(args))
            }
        });
    }

    let svc = JobQueueService::new(MemoryQueue::new(), "owner-1", Arc::new(registry));
    let mut queues = Vec::new();
    for name in ["left", "right"] {
        let queue = svc.create_queue(NewQueue::named(name)).await.unwrap();
        let jobs = (0..10).map(|i| NewJob::new("work", format!("{}", i), 0)).collect();
        svc.push(queue.queue_id, "u", jobs).await.unwrap();
        queues.push(queue);
    }

    let worker = QueueWorker::new(svc.engine().clone(), WorkerConfig { max_concurrency: 2 });
    let attempts = worker.drain_all(&queues).await.unwrap();

    assert_eq!(attempts.len(), 20);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    for queue in &queues {
        let per_queue = attempts
            .iter()
            .filter(|a| a.job.queue_id == queue.queue_id)
            .count();
        assert_eq!(per_queue, 10);
    }
}

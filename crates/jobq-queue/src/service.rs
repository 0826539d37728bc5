//! Caller-facing job queue operations, scoped to one owner account

use std::sync::Arc;
use tracing::{debug, info};

use crate::access::{AccessTokenVerifier, StaticTokenVerifier};
use crate::backend::{JobFilter, QueueBackend, QueueError};
use crate::config::{ConfigError, EngineConfig};
use crate::engine::{Attempt, Engine};
use crate::executor::ScriptExecutor;
use crate::job::{Job, JobId, JobResult, NewJob};
use crate::notify::{NotificationDispatcher, NotificationEvent, Notifier};
use crate::page::{Page, PageRequest};
use crate::queue::{NewQueue, Queue, QueueId, QueueUpdate};

const MAX_NAME_LEN: usize = 128;
const MAX_DESCRIPTION_LEN: usize = 1024;
const MAX_SCRIPT_NAME_LEN: usize = 1024;

fn validate_name(name: &str) -> Result<(), QueueError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(QueueError::InvalidRequest(format!(
            "queue name must be 1..={} characters",
            MAX_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(QueueError::InvalidRequest(format!(
            "queue name '{}' may only contain letters, digits, '-' and '_'",
            name
        )));
    }
    Ok(())
}

fn validate_description(description: Option<&str>) -> Result<(), QueueError> {
    match description {
        Some(d) if d.len() > MAX_DESCRIPTION_LEN => Err(QueueError::InvalidRequest(format!(
            "description exceeds {} characters",
            MAX_DESCRIPTION_LEN
        ))),
        _ => Ok(()),
    }
}

pub struct JobQueueService<B: QueueBackend + ?Sized> {
    owner_id: String,
    backend: Arc<B>,
    engine: Engine<B>,
    tokens: Arc<dyn AccessTokenVerifier>,
}

impl<B: QueueBackend + ?Sized> Clone for JobQueueService<B> {
    fn clone(&self) -> Self {
        Self {
            owner_id: self.owner_id.clone(),
            backend: self.backend.clone(),
            engine: self.engine.clone(),
            tokens: self.tokens.clone(),
        }
    }
}

impl<B: QueueBackend + 'static> JobQueueService<B> {
    pub fn new(backend: B, owner_id: impl Into<String>, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self::new_with_arc(Arc::new(backend), owner_id, executor)
    }
}

impl<B: QueueBackend + ?Sized + 'static> JobQueueService<B> {
    /// Create from an existing Arc backend (supports dyn dispatch)
    pub fn new_with_arc(
        backend: Arc<B>,
        owner_id: impl Into<String>,
        executor: Arc<dyn ScriptExecutor>,
    ) -> Self {
        let engine = Engine::new(backend.clone(), executor, NotificationDispatcher::disabled());
        Self {
            owner_id: owner_id.into(),
            backend,
            engine,
            tokens: Arc::new(StaticTokenVerifier::new()),
        }
    }

    /// Replace the engine settings. Keeps any notifier already installed
    /// but applies the new notify timeout to it. Invalid settings are
    /// rejected and leave nothing changed.
    pub fn with_config(mut self, config: EngineConfig) -> Result<Self, ConfigError> {
        let dispatcher = self.engine.dispatcher().with_timeout(config.notify_timeout);
        self.engine = self
            .engine
            .clone()
            .with_config(config)?
            .with_dispatcher(dispatcher);
        Ok(self)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        let dispatcher = NotificationDispatcher::new(notifier, self.engine.config().notify_timeout);
        self.engine = self.engine.clone().with_dispatcher(dispatcher);
        self
    }

    pub fn with_token_verifier(mut self, tokens: Arc<dyn AccessTokenVerifier>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn engine(&self) -> &Engine<B> {
        &self.engine
    }

    fn page(&self, page_token: Option<&str>, limit: Option<u32>) -> Result<PageRequest, QueueError> {
        let config = self.engine.config();
        PageRequest::parse(
            page_token,
            limit,
            config.default_page_limit,
            config.max_page_limit,
        )
    }

    // ---- queue registry ----

    pub async fn create_queue(&self, new: NewQueue) -> Result<Queue, QueueError> {
        validate_name(&new.name)?;
        validate_description(new.description.as_deref())?;
        new.notification.validate()?;

        let queue = self.backend.create_queue(&self.owner_id, new).await?;
        info!(queue_id = %queue.queue_id, name = %queue.name, "Queue created");
        Ok(queue)
    }

    pub async fn update_queue(
        &self,
        queue_id: QueueId,
        update: QueueUpdate,
    ) -> Result<Queue, QueueError> {
        validate_description(update.description.as_deref())?;
        let queue = self
            .backend
            .update_queue(&self.owner_id, queue_id, update)
            .await?;
        debug!(queue_id = %queue_id, "Queue updated");
        Ok(queue)
    }

    pub async fn delete_queue(&self, queue_id: QueueId) -> Result<(), QueueError> {
        self.backend.delete_queue(&self.owner_id, queue_id).await?;
        info!(queue_id = %queue_id, "Queue deleted");
        Ok(())
    }

    pub async fn get_queue(&self, queue_id: QueueId) -> Result<Queue, QueueError> {
        self.backend.get_queue(&self.owner_id, queue_id).await
    }

    pub async fn describe_queue(
        &self,
        page_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<Queue>, QueueError> {
        let page = self.page(page_token, limit)?;
        self.backend.list_queues(&self.owner_id, page).await
    }

    // ---- job intake ----

    /// Append jobs for `user_id`, in order. Does not run anything.
    pub async fn push(
        &self,
        queue_id: QueueId,
        user_id: &str,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<Job>, QueueError> {
        if jobs.is_empty() {
            return Err(QueueError::InvalidRequest("push requires at least one job".into()));
        }
        let max_batch = self.engine.config().max_push_batch;
        if jobs.len() > max_batch {
            return Err(QueueError::InvalidRequest(format!(
                "push accepts at most {} jobs",
                max_batch
            )));
        }
        if user_id.is_empty() {
            return Err(QueueError::InvalidRequest("user id is required".into()));
        }
        if let Some(bad) = jobs
            .iter()
            .find(|j| j.script_name.is_empty() || j.script_name.len() > MAX_SCRIPT_NAME_LEN)
        {
            return Err(QueueError::InvalidRequest(format!(
                "invalid script name '{}'",
                bad.script_name
            )));
        }

        let queue = self.get_queue(queue_id).await?;
        let pushed = self.backend.push_jobs(queue_id, user_id, jobs).await?;
        info!(queue_id = %queue_id, user_id = %user_id, count = pushed.len(), "Jobs pushed");

        self.engine
            .dispatcher()
            .dispatch(
                &queue,
                NotificationEvent::JobsPushed {
                    queue_id,
                    jobs: pushed.clone(),
                },
            )
            .await;

        Ok(pushed)
    }

    // ---- execution ----

    /// Execute the front job of the queue. `Ok(None)` when the queue is empty.
    pub async fn run(&self, queue_id: QueueId) -> Result<Option<JobResult>, QueueError> {
        Ok(self.run_attempt(queue_id).await?.map(|a| a.result))
    }

    /// Like [`run`](Self::run) but also reports the job and its outcome
    pub async fn run_attempt(&self, queue_id: QueueId) -> Result<Option<Attempt>, QueueError> {
        let queue = self.get_queue(queue_id).await?;
        self.engine.run_next(&queue, None).await
    }

    /// Execute the front job among `user_id`'s jobs. The access token must
    /// belong to that user.
    pub async fn run_by_user_id(
        &self,
        queue_id: QueueId,
        user_id: &str,
        access_token: &str,
    ) -> Result<Option<JobResult>, QueueError> {
        match self.tokens.resolve(access_token).await {
            Some(owner) if owner == user_id => {}
            _ => {
                debug!(queue_id = %queue_id, user_id = %user_id, "Access token rejected");
                return Err(QueueError::AccessDenied);
            }
        }

        let queue = self.get_queue(queue_id).await?;
        Ok(self
            .engine
            .run_next(&queue, Some(user_id))
            .await?
            .map(|a| a.result))
    }

    // ---- listings ----

    pub async fn describe_job(
        &self,
        queue_id: QueueId,
        page_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<Job>, QueueError> {
        self.list_jobs(queue_id, JobFilter::All, page_token, limit).await
    }

    pub async fn describe_job_by_user_id(
        &self,
        queue_id: QueueId,
        user_id: &str,
        page_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<Job>, QueueError> {
        self.list_jobs(queue_id, JobFilter::ByUser(user_id.to_string()), page_token, limit)
            .await
    }

    async fn list_jobs(
        &self,
        queue_id: QueueId,
        filter: JobFilter,
        page_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<Job>, QueueError> {
        let page = self.page(page_token, limit)?;
        self.get_queue(queue_id).await?;
        self.backend.list_jobs(queue_id, filter, page).await
    }

    pub async fn describe_dead_job(
        &self,
        queue_id: QueueId,
        page_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<Job>, QueueError> {
        self.list_dead_jobs(queue_id, JobFilter::All, page_token, limit)
            .await
    }

    pub async fn describe_dead_job_by_script_name(
        &self,
        queue_id: QueueId,
        script_name: &str,
        page_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<Job>, QueueError> {
        self.list_dead_jobs(
            queue_id,
            JobFilter::ByScript(script_name.to_string()),
            page_token,
            limit,
        )
        .await
    }

    pub async fn describe_dead_job_by_user_id(
        &self,
        queue_id: QueueId,
        user_id: &str,
        page_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<Job>, QueueError> {
        self.list_dead_jobs(queue_id, JobFilter::ByUser(user_id.to_string()), page_token, limit)
            .await
    }

    async fn list_dead_jobs(
        &self,
        queue_id: QueueId,
        filter: JobFilter,
        page_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<Job>, QueueError> {
        let page = self.page(page_token, limit)?;
        self.get_queue(queue_id).await?;
        self.backend.list_dead_jobs(queue_id, filter, page).await
    }

    pub async fn delete_dead_job(
        &self,
        queue_id: QueueId,
        job_id: JobId,
        user_id: &str,
    ) -> Result<(), QueueError> {
        self.get_queue(queue_id).await?;
        self.backend.delete_dead_job(queue_id, job_id, user_id).await?;
        info!(queue_id = %queue_id, job_id = %job_id, "Dead job deleted");
        Ok(())
    }

    /// Result history, oldest first; `job_id` narrows it to one job
    pub async fn describe_job_result(
        &self,
        queue_id: QueueId,
        job_id: Option<JobId>,
        page_token: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Page<JobResult>, QueueError> {
        let page = self.page(page_token, limit)?;
        self.get_queue(queue_id).await?;
        self.backend.list_results(queue_id, job_id, page).await
    }
}

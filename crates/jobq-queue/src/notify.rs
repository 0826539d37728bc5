//! Queue notifications
//!
//! Queues with a notification type announce pushed jobs and every recorded
//! attempt. Delivery is best effort: the dispatcher logs failures and never
//! lets them affect the job or its result.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::job::{Job, JobOutcome, JobResult};
use crate::queue::{NotificationChannel, Queue, QueueId};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Receiver rejected notification with status {0}")]
    Rejected(u16),
    #[error("Channel not supported: {0}")]
    Unsupported(String),
}

/// Payload delivered to a notification channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum NotificationEvent {
    /// Jobs were added to the queue
    #[serde(rename_all = "camelCase")]
    JobsPushed { queue_id: QueueId, jobs: Vec<Job> },
    /// An attempt finished and its result was recorded. `job` is the job
    /// as it was claimed for the attempt.
    #[serde(rename_all = "camelCase")]
    JobAttempted {
        job: Job,
        result: JobResult,
        outcome: JobOutcome,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        channel: &NotificationChannel,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError>;
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, NotifyError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("jobq/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| NotifyError::Delivery(e.to_string()))
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    event: &NotificationEvent,
) -> Result<(), NotifyError> {
    let response = client
        .post(url)
        .json(event)
        .send()
        .await
        .map_err(|e| NotifyError::Delivery(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(NotifyError::Rejected(status.as_u16()));
    }
    Ok(())
}

/// Delivers to HTTP/HTTPS callback URLs
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        Ok(Self::with_client(build_client(timeout)?))
    }

    /// Deliver through a caller-built client (proxy, TLS or pool settings)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(
        &self,
        channel: &NotificationChannel,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError> {
        match channel {
            NotificationChannel::Http { url } => post_json(&self.client, url, event).await,
            other => Err(NotifyError::Unsupported(format!("{:?}", other))),
        }
    }
}

/// Delivers to an in-game push gateway, one endpoint per game
#[derive(Debug, Clone)]
pub struct InGamePushNotifier {
    gateway_url: String,
    client: reqwest::Client,
}

impl InGamePushNotifier {
    pub fn new(gateway_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        Ok(Self::with_client(gateway_url, build_client(timeout)?))
    }

    pub fn with_client(gateway_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            gateway_url: gateway_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn endpoint(&self, game_name: &str) -> String {
        format!("{}/game/{}/push", self.gateway_url, game_name)
    }
}

#[async_trait]
impl Notifier for InGamePushNotifier {
    async fn notify(
        &self,
        channel: &NotificationChannel,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError> {
        match channel {
            NotificationChannel::InGamePush { game_name } => {
                post_json(&self.client, &self.endpoint(game_name), event).await
            }
            other => Err(NotifyError::Unsupported(format!("{:?}", other))),
        }
    }
}

/// Routes each channel kind to its notifier
#[derive(Clone, Default)]
pub struct ChannelNotifier {
    http: Option<Arc<dyn Notifier>>,
    in_game_push: Option<Arc<dyn Notifier>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.http = Some(notifier);
        self
    }

    pub fn with_in_game_push(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.in_game_push = Some(notifier);
        self
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(
        &self,
        channel: &NotificationChannel,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError> {
        let target = match channel {
            NotificationChannel::Http { .. } => self.http.as_ref(),
            NotificationChannel::InGamePush { .. } => self.in_game_push.as_ref(),
        };
        match target {
            Some(notifier) => notifier.notify(channel, event).await,
            None => Err(NotifyError::Unsupported(format!(
                "no notifier configured for {:?}",
                channel
            ))),
        }
    }
}

/// Fires notifications for queues that have a channel configured
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Option<Arc<dyn Notifier>>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self {
            notifier: Some(notifier),
            timeout,
        }
    }

    /// Dispatcher that drops every notification
    pub fn disabled() -> Self {
        Self {
            notifier: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            notifier: self.notifier.clone(),
            timeout,
        }
    }

    /// Deliver `event` for `queue`. Never fails; problems are logged.
    pub async fn dispatch(&self, queue: &Queue, event: NotificationEvent) {
        let (Some(notifier), Some(channel)) = (self.notifier.as_ref(), queue.channel()) else {
            return;
        };

        match tokio::time::timeout(self.timeout, notifier.notify(&channel, &event)).await {
            Ok(Ok(())) => {
                debug!(queue_id = %queue.queue_id, "Notification delivered");
            }
            Ok(Err(e)) => {
                warn!(queue_id = %queue.queue_id, error = %e, "Notification failed");
            }
            Err(_) => {
                warn!(
                    queue_id = %queue.queue_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Notification timed out"
                );
            }
        }
    }
}

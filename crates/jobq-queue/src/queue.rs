//! Queue definitions and notification settings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::backend::QueueError;

/// Queue Identifier
pub type QueueId = Uuid;

/// How a queue announces pushed jobs and attempt outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "https")]
    Https,
    #[serde(rename = "in-game-push")]
    InGamePush,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Http => "http",
            Self::Https => "https",
            Self::InGamePush => "in-game-push",
        }
    }

    fn is_url_based(&self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "in-game-push" => Ok(Self::InGamePush),
            other => Err(QueueError::InvalidNotificationConfig(format!(
                "unknown notification type '{}'",
                other
            ))),
        }
    }
}

/// Resolved delivery channel for a queue with notifications enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationChannel {
    /// HTTP or HTTPS callback
    Http { url: String },
    /// In-game push, keyed by game name
    InGamePush { game_name: String },
}

/// Notification fields as they travel on create/update.
///
/// Every field is optional; on update an absent field keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<NotificationType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_game_name: Option<String>,
}

impl NotificationSettings {
    pub fn none() -> Self {
        Self {
            notification_type: Some(NotificationType::None),
            ..Default::default()
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        let url = url.into();
        let notification_type = if url.starts_with("https://") {
            NotificationType::Https
        } else {
            NotificationType::Http
        };
        Self {
            notification_type: Some(notification_type),
            notification_url: Some(url),
            notification_game_name: None,
        }
    }

    pub fn in_game_push(game_name: impl Into<String>) -> Self {
        Self {
            notification_type: Some(NotificationType::InGamePush),
            notification_url: None,
            notification_game_name: Some(game_name.into()),
        }
    }

    /// Check that the fields agree with the notification type.
    pub fn validate(&self) -> Result<(), QueueError> {
        let kind = self.notification_type.unwrap_or(NotificationType::None);

        match kind {
            NotificationType::None => {
                if self.notification_url.is_some() || self.notification_game_name.is_some() {
                    return Err(QueueError::InvalidNotificationConfig(
                        "notification type 'none' takes no url or game name".into(),
                    ));
                }
            }
            NotificationType::Http | NotificationType::Https => {
                let scheme = if kind == NotificationType::Http {
                    "http://"
                } else {
                    "https://"
                };
                match self.notification_url.as_deref() {
                    Some(url) if url.starts_with(scheme) && url.len() > scheme.len() => {}
                    Some(url) => {
                        return Err(QueueError::InvalidNotificationConfig(format!(
                            "notification url '{}' does not match type '{}'",
                            url, kind
                        )))
                    }
                    None => {
                        return Err(QueueError::InvalidNotificationConfig(format!(
                            "notification type '{}' requires a notification url",
                            kind
                        )))
                    }
                }
                if self.notification_game_name.is_some() {
                    return Err(QueueError::InvalidNotificationConfig(
                        "game name is only valid for in-game push".into(),
                    ));
                }
            }
            NotificationType::InGamePush => {
                match self.notification_game_name.as_deref() {
                    Some(name) if !name.trim().is_empty() => {}
                    _ => {
                        return Err(QueueError::InvalidNotificationConfig(
                            "in-game push requires a notification game name".into(),
                        ))
                    }
                }
                if self.notification_url.is_some() {
                    return Err(QueueError::InvalidNotificationConfig(
                        "notification url is only valid for http/https".into(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Overlay `patch` on top of `self` and validate the merged result.
    ///
    /// Stored fields the merged type no longer uses are dropped; fields the
    /// patch sets explicitly are kept and must agree with the type.
    pub fn merge(&self, patch: &NotificationSettings) -> Result<Self, QueueError> {
        let notification_type = patch.notification_type.or(self.notification_type);
        let kind = notification_type.unwrap_or(NotificationType::None);

        let notification_url = match &patch.notification_url {
            Some(url) => Some(url.clone()),
            None if kind.is_url_based() => self.notification_url.clone(),
            None => None,
        };
        let notification_game_name = match &patch.notification_game_name {
            Some(name) => Some(name.clone()),
            None if kind == NotificationType::InGamePush => self.notification_game_name.clone(),
            None => None,
        };

        let merged = Self {
            notification_type,
            notification_url,
            notification_game_name,
        };
        merged.validate()?;
        Ok(merged)
    }

    pub fn channel(&self) -> Option<NotificationChannel> {
        match self.notification_type? {
            NotificationType::None => None,
            NotificationType::Http | NotificationType::Https => self
                .notification_url
                .clone()
                .map(|url| NotificationChannel::Http { url }),
            NotificationType::InGamePush => self
                .notification_game_name
                .clone()
                .map(|game_name| NotificationChannel::InGamePush { game_name }),
        }
    }
}

/// A named job queue owned by an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub queue_id: QueueId,
    pub owner_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub notification: NotificationSettings,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub create_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub update_at: DateTime<Utc>,
}

impl Queue {
    pub fn channel(&self) -> Option<NotificationChannel> {
        self.notification.channel()
    }
}

/// Input for queue creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQueue {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub notification: NotificationSettings,
}

impl NewQueue {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_notification(mut self, notification: NotificationSettings) -> Self {
        self.notification = notification;
        self
    }
}

/// Partial update of a queue; absent fields stay unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub notification: NotificationSettings,
}

//! Lifecycle notifications.
//!
//! The coordinator hands every lifecycle event to a
//! [`NotificationDispatcher`], which fans it out to the channels configured
//! for that event. Deliveries are concurrent and independent: a failed or
//! slow channel is logged and never changes the execution's outcome.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    Channel, ExecutionRecord, ExecutionStatus, ExecutionSummary, NotificationEvent,
    NotificationRules,
};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http delivery failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint rejected notification with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("channel '{0}' has no deliverable destination")]
    NoDestination(String),

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// What gets delivered for one lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub event: NotificationEvent,
    pub workflow_name: String,
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub message: String,
    pub summary: ExecutionSummary,
}

impl NotificationPayload {
    pub fn new(event: NotificationEvent, record: &ExecutionRecord) -> Self {
        let summary = record.summary();
        let message = match (event, record.status) {
            (NotificationEvent::OnStart, _) => {
                format!("workflow '{}' started ({})", record.workflow_name, record.trigger_type)
            }
            (_, ExecutionStatus::Succeeded) => {
                format!("workflow '{}' succeeded", record.workflow_name)
            }
            (_, status) => {
                let mut msg = format!("workflow '{}' {}", record.workflow_name, status);
                if let Some(step) = &summary.failed_step {
                    msg.push_str(&format!(" at step '{step}'"));
                }
                if summary.rollback_failures > 0 {
                    msg.push_str(&format!(
                        " ({} rollback step(s) failed)",
                        summary.rollback_failures
                    ));
                }
                msg
            }
        };

        Self {
            event,
            workflow_name: record.workflow_name.clone(),
            execution_id: record.id,
            status: record.status,
            message,
            summary,
        }
    }
}

/// Delivers one payload to one channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, channel: &Channel, payload: &NotificationPayload) -> Result<(), NotifyError>;
}

// ---------------------------------------------------------------------------
// Built-in notifiers
// ---------------------------------------------------------------------------

/// Writes notifications to the log. Used for channel types without a
/// network integration (e.g. `email`, or `slack` without a webhook URL).
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, channel: &Channel, payload: &NotificationPayload) -> Result<(), NotifyError> {
        info!(
            channel = %channel.kind,
            targets = ?channel.targets(),
            event = %payload.event,
            execution_id = %payload.execution_id,
            "{}",
            payload.message
        );
        Ok(())
    }
}

/// Body format for [`WebhookNotifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFormat {
    /// The full [`NotificationPayload`] as JSON.
    Json,
    /// `{"text": message}`, as accepted by Slack incoming webhooks.
    SlackText,
}

/// POSTs the notification to the channel's destination URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    format: WebhookFormat,
}

impl WebhookNotifier {
    pub fn new(format: WebhookFormat) -> Self {
        Self {
            client: reqwest::Client::new(),
            format,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, channel: &Channel, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let url = channel
            .destination
            .as_deref()
            .filter(|d| is_url(d))
            .ok_or_else(|| NotifyError::NoDestination(channel.kind.clone()))?;

        let request = self.client.post(url);
        let request = match self.format {
            WebhookFormat::Json => request.json(payload),
            WebhookFormat::SlackText => request.json(&serde_json::json!({ "text": payload.message })),
        };

        let resp = request.send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(NotifyError::Rejected { status, body })
        }
    }
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Routes each channel to a notifier by channel type.
///
/// A route is used only when the channel's destination is an http(s) URL;
/// everything else goes to the fallback.
#[derive(Clone)]
pub struct ChannelRouter {
    routes: HashMap<String, Arc<dyn Notifier>>,
    fallback: Arc<dyn Notifier>,
}

impl ChannelRouter {
    pub fn new(fallback: Arc<dyn Notifier>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    /// `webhook` and `slack` go over HTTP, everything else is logged.
    pub fn with_defaults() -> Self {
        let mut router = Self::new(Arc::new(LogNotifier));
        router
            .route("webhook", Arc::new(WebhookNotifier::new(WebhookFormat::Json)))
            .route("slack", Arc::new(WebhookNotifier::new(WebhookFormat::SlackText)));
        router
    }

    pub fn route(&mut self, kind: impl Into<String>, notifier: Arc<dyn Notifier>) -> &mut Self {
        self.routes.insert(kind.into(), notifier);
        self
    }

    fn pick(&self, channel: &Channel) -> &Arc<dyn Notifier> {
        match self.routes.get(&channel.kind) {
            Some(notifier) if channel.destination.as_deref().is_some_and(is_url) => notifier,
            _ => &self.fallback,
        }
    }
}

#[async_trait]
impl Notifier for ChannelRouter {
    async fn deliver(&self, channel: &Channel, payload: &NotificationPayload) -> Result<(), NotifyError> {
        self.pick(channel).deliver(channel, payload).await
    }
}

/// One delivery seen by [`RecordingNotifier`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: Channel,
    pub payload: NotificationPayload,
}

/// Test double that records deliveries and can be told to fail some
/// channel types.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    failing: Arc<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries to channels of type `kind` fail.
    pub fn failing_on(kinds: &[&str]) -> Self {
        Self {
            deliveries: Arc::default(),
            failing: Arc::new(kinds.iter().map(|k| k.to_string()).collect()),
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.deliveries.lock().iter().map(|d| d.payload.event).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, channel: &Channel, payload: &NotificationPayload) -> Result<(), NotifyError> {
        self.deliveries.lock().push(Delivery {
            channel: channel.clone(),
            payload: payload.clone(),
        });
        if self.failing.contains(&channel.kind) {
            return Err(NotifyError::Other(format!("{} is down", channel.kind)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fans lifecycle events out to the configured channels.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    delivery_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Deliver `event` for `record` to every channel configured for it.
    /// Returns the number of failed deliveries.
    pub async fn dispatch(
        &self,
        event: NotificationEvent,
        record: &ExecutionRecord,
        rules: &NotificationRules,
    ) -> usize {
        let channels = rules.channels_for(event);
        if channels.is_empty() {
            return 0;
        }

        let payload = NotificationPayload::new(event, record);
        let deliveries = channels.iter().map(|channel| {
            let payload = &payload;
            async move {
                let outcome = tokio::time::timeout(
                    self.delivery_timeout,
                    self.notifier.deliver(channel, payload),
                )
                .await
                .unwrap_or(Err(NotifyError::Timeout(self.delivery_timeout)));

                if let Err(err) = &outcome {
                    warn!(
                        workflow = %record.workflow_name,
                        execution_id = %record.id,
                        channel = %channel.kind,
                        event = %event,
                        "notification delivery failed: {err}"
                    );
                }
                outcome.is_err()
            }
        });

        join_all(deliveries).await.into_iter().filter(|failed| *failed).count()
    }
}

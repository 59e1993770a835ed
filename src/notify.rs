//! Pub/sub notifications
//!
//! Compliance transitions, remediation progress, and operator alerts are
//! published by topic through a `Notifier`. The in-memory notifier backs
//! tests and single-process deployments; `NatsNotifier` maps topics onto
//! core NATS subjects.

use crate::error::{PipelineError, Result};
use crate::types::{ComplianceStatus, Envelope, RemediationAttempt, SequenceState};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Compliance status changes
pub const COMPLIANCE_TOPIC: &str = "compliance.changes";

/// Remediation attempt progress
pub const REMEDIATION_TOPIC: &str = "remediation.attempts";

/// Terminal failures that need a human (dead letters, exhausted retries)
pub const OPERATOR_TOPIC: &str = "operator.alerts";

/// A message published on a notification topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
    /// A target's compliance status changed
    #[serde(rename_all = "camelCase")]
    ComplianceChanged {
        target_id: String,
        from: ComplianceStatus,
        to: ComplianceStatus,
        at: DateTime<Utc>,
    },

    /// A remediation attempt was started or finished
    RemediationAttempt(RemediationAttempt),

    /// A remediation sequence reached a terminal state
    #[serde(rename_all = "camelCase")]
    RemediationFinished {
        target_id: String,
        sequence_id: String,
        state: SequenceState,
        attempts: u32,
        at: DateTime<Utc>,
    },

    /// A remediation sequence used every attempt without success
    #[serde(rename_all = "camelCase")]
    RemediationExhausted {
        target_id: String,
        sequence_id: String,
        attempts: u32,
        last_error: Option<String>,
        at: DateTime<Utc>,
    },

    /// A buffered message was moved to its stage's dead-letter sink
    #[serde(rename_all = "camelCase")]
    DeadLettered {
        stage: String,
        event_id: String,
        receive_count: u32,
        reason: String,
        at: DateTime<Utc>,
    },

    /// A pipeline event forwarded to a topic sink
    Event(Envelope),
}

impl Notification {
    /// Target id this notification concerns, if any
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Notification::ComplianceChanged { target_id, .. }
            | Notification::RemediationFinished { target_id, .. }
            | Notification::RemediationExhausted { target_id, .. } => Some(target_id),
            Notification::RemediationAttempt(attempt) => Some(&attempt.target_id),
            Notification::DeadLettered { .. } | Notification::Event(_) => None,
        }
    }
}

/// Stream of notifications for one topic subscription
///
/// Yields `PipelineError::Lagged` when the subscriber fell behind and
/// notifications were skipped; the stream stays usable afterwards.
pub type NotificationStream = BoxStream<'static, Result<Notification>>;

/// Generic publish-by-topic / subscribe-by-topic transport
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish a notification to every current subscriber of `topic`
    async fn publish(&self, topic: &str, notification: &Notification) -> Result<()>;

    /// Subscribe to notifications published on `topic` from now on
    async fn subscribe(&self, topic: &str) -> Result<NotificationStream>;

    /// Transport name (e.g., "memory", "nats")
    fn name(&self) -> &str;
}

/// In-memory notifier built on tokio broadcast channels
///
/// Also keeps a bounded per-topic history so published notifications can be
/// inspected after the fact.
pub struct MemoryNotifier {
    channels: Mutex<HashMap<String, broadcast::Sender<Notification>>>,
    history: Mutex<HashMap<String, VecDeque<Notification>>>,
    capacity: usize,
    max_history: usize,
}

impl MemoryNotifier {
    /// Create a notifier with the given per-topic channel capacity and history size
    pub fn new(capacity: usize, max_history: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            max_history,
        }
    }

    /// Notifications published on `topic`, oldest first
    pub fn published(&self, topic: &str) -> Vec<Notification> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .get(topic)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Notification> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryNotifier {
    fn default() -> Self {
        Self::new(1024, 10_000)
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn publish(&self, topic: &str, notification: &Notification) -> Result<()> {
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            let entries = history.entry(topic.to_string()).or_default();
            entries.push_back(notification.clone());
            if self.max_history > 0 && entries.len() > self.max_history {
                entries.pop_front();
            }
        }

        // No subscribers is not an error for pub/sub
        let receivers = self.sender(topic).send(notification.clone()).unwrap_or(0);
        tracing::debug!(topic, receivers, "Notification published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<NotificationStream> {
        let rx = self.sender(topic).subscribe();
        let topic = topic.to_string();
        let stream = BroadcastStream::new(rx).map(move |item| match item {
            Ok(n) => Ok(n),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(topic = %topic, skipped, "Notification subscriber lagged");
                Err(PipelineError::Lagged {
                    topic: topic.clone(),
                    skipped,
                })
            }
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Notifier publishing JSON notifications on core NATS subjects
///
/// Topic `t` maps to subject `<prefix>.t`.
pub struct NatsNotifier {
    client: async_nats::Client,
    subject_prefix: String,
}

impl NatsNotifier {
    /// Connect to a NATS server
    pub async fn connect(url: &str, subject_prefix: impl Into<String>) -> Result<Self> {
        let client = async_nats::connect(url).await.map_err(|e| PipelineError::Notify {
            topic: url.to_string(),
            reason: format!("connect failed: {}", e),
        })?;

        tracing::info!(url, "Connected to NATS");
        Ok(Self::with_client(client, subject_prefix))
    }

    /// Wrap an existing client
    pub fn with_client(client: async_nats::Client, subject_prefix: impl Into<String>) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.into(),
        }
    }

    /// Full subject for a topic
    pub fn subject(&self, topic: &str) -> String {
        if self.subject_prefix.is_empty() {
            topic.to_string()
        } else {
            format!("{}.{}", self.subject_prefix, topic)
        }
    }
}

#[async_trait]
impl Notifier for NatsNotifier {
    async fn publish(&self, topic: &str, notification: &Notification) -> Result<()> {
        let payload = serde_json::to_vec(notification)?;
        let subject = self.subject(topic);

        self.client
            .publish(subject.clone(), Bytes::from(payload))
            .await
            .map_err(|e| PipelineError::Notify {
                topic: subject.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(subject = %subject, "Notification published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<NotificationStream> {
        let subject = self.subject(topic);
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| PipelineError::Notify {
                topic: subject.clone(),
                reason: e.to_string(),
            })?;

        let stream = subscriber.filter_map(move |msg| {
            let subject = subject.clone();
            async move {
                match serde_json::from_slice::<Notification>(&msg.payload) {
                    Ok(n) => Some(Ok(n)),
                    Err(e) => {
                        tracing::warn!(subject = %subject, error = %e, "Dropping undecodable notification");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        "nats"
    }
}

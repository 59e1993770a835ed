//! NATS JetStream-backed durable queue
//!
//! Each stage owns a work-queue stream with one durable pull consumer:
//!
//! - the consumer's `ack_wait` is the visibility timeout
//! - the stream's duplicate window, keyed by the `Nats-Msg-Id` header, is
//!   the enqueue dedup window
//! - the server's delivery count is the receive count
//!
//! The receive ceiling is enforced here rather than with `max_deliver`, so a
//! message whose dead-letter write failed keeps being redelivered until one
//! succeeds.

use super::{DurableQueue, EnqueueOutcome, QueueStats};
use crate::clock::SharedClock;
use crate::dlq::should_dead_letter;
use crate::error::{PipelineError, Result};
use crate::types::{BufferedMessage, Envelope, MessageHandle};
use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// JetStream storage backend for a stage stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JetStreamStorage {
    #[default]
    File,
    Memory,
}

/// Stream and consumer layout for one stage
#[derive(Debug, Clone)]
pub struct JetStreamSettings {
    pub stream_name: String,
    pub subject: String,
    pub consumer_name: String,
    /// Redelivery delay for unacknowledged messages
    pub ack_wait: std::time::Duration,
    /// How long a `Nats-Msg-Id` suppresses repeats
    pub dedup_window: std::time::Duration,
    pub max_receive_count: u32,
    pub storage: JetStreamStorage,
}

impl JetStreamSettings {
    /// Conventional names for stage `stage` under `subject_prefix`
    pub fn for_stage(stage: &str, subject_prefix: &str) -> Self {
        let token: String = stage
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self {
            stream_name: format!("PIPELINE_{}", token.to_uppercase()),
            subject: format!("{}.stage.{}", subject_prefix, token),
            consumer_name: format!("{}-consumer", token),
            ack_wait: std::time::Duration::from_secs(30),
            dedup_window: std::time::Duration::from_secs(300),
            max_receive_count: 5,
            storage: JetStreamStorage::File,
        }
    }
}

/// Payload stored in the stream
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedRecord {
    envelope: Envelope,
    dedup_key: String,
    enqueued_at: DateTime<Utc>,
}

struct Claimed {
    message: jetstream::Message,
    buffered: BufferedMessage,
    deadline: DateTime<Utc>,
}

/// Durable queue over a JetStream work-queue stream
pub struct JetStreamQueue {
    name: String,
    settings: JetStreamSettings,
    jetstream: jetstream::Context,
    consumer: tokio::sync::Mutex<PullConsumer>,
    claimed: Mutex<HashMap<MessageHandle, Claimed>>,
    /// Claimed deliveries past the ceiling, waiting to be dead-lettered
    overdue: Mutex<Vec<MessageHandle>>,
    clock: SharedClock,
}

impl JetStreamQueue {
    /// Create (or attach to) the stage's stream and durable consumer
    pub async fn connect(
        client: async_nats::Client,
        name: impl Into<String>,
        settings: JetStreamSettings,
        clock: SharedClock,
    ) -> Result<Self> {
        let name = name.into();
        let jetstream = jetstream::new(client);

        let storage = match settings.storage {
            JetStreamStorage::File => jetstream::stream::StorageType::File,
            JetStreamStorage::Memory => jetstream::stream::StorageType::Memory,
        };
        let stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: settings.stream_name.clone(),
                subjects: vec![settings.subject.clone()],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                storage,
                duplicate_window: settings.dedup_window,
                ..Default::default()
            })
            .await
            .map_err(|e| queue_error(&name, format!("stream '{}': {}", settings.stream_name, e)))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &settings.consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(settings.consumer_name.clone()),
                    filter_subject: settings.subject.clone(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: settings.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                queue_error(&name, format!("consumer '{}': {}", settings.consumer_name, e))
            })?;

        tracing::info!(
            queue = %name,
            stream = %settings.stream_name,
            subject = %settings.subject,
            consumer = %settings.consumer_name,
            "JetStream queue ready"
        );

        Ok(Self {
            name,
            settings,
            jetstream,
            consumer: tokio::sync::Mutex::new(consumer),
            claimed: Mutex::new(HashMap::new()),
            overdue: Mutex::new(Vec::new()),
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &JetStreamSettings {
        &self.settings
    }

    fn visibility(&self) -> Duration {
        Duration::from_std(self.settings.ack_wait).unwrap_or(Duration::MAX)
    }

    fn claims(&self) -> std::sync::MutexGuard<'_, HashMap<MessageHandle, Claimed>> {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fetch_one(&self) -> Result<Option<jetstream::Message>> {
        let consumer = self.consumer.lock().await;
        let batch = consumer
            .fetch()
            .max_messages(1)
            .messages()
            .await
            .map_err(|e| queue_error(&self.name, format!("fetch failed: {}", e)))?;
        let mut batch = std::pin::pin!(batch);

        match batch.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(queue_error(&self.name, format!("fetch failed: {}", e))),
            None => Ok(None),
        }
    }
}

fn queue_error(queue: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::Queue {
        queue: queue.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl DurableQueue for JetStreamQueue {
    async fn enqueue(&self, envelope: Envelope, dedup_key: String) -> Result<EnqueueOutcome> {
        let record = QueuedRecord {
            envelope,
            dedup_key,
            enqueued_at: self.clock.now(),
        };
        let payload = serde_json::to_vec(&record)?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", record.dedup_key.as_str());

        let ack = self
            .jetstream
            .publish_with_headers(self.settings.subject.clone(), headers, payload.into())
            .await
            .map_err(|e| queue_error(&self.name, e.to_string()))?
            .await
            .map_err(|e| queue_error(&self.name, format!("ack failed: {}", e)))?;

        if ack.duplicate {
            tracing::debug!(
                queue = %self.name,
                event_id = %record.envelope.id(),
                dedup_key = %record.dedup_key,
                "Duplicate enqueue collapsed"
            );
            return Ok(EnqueueOutcome::Duplicate);
        }

        tracing::debug!(
            queue = %self.name,
            event_id = %record.envelope.id(),
            sequence = ack.sequence,
            "Message enqueued"
        );
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Claim the next message; the claim lasts for the consumer's `ack_wait`
    async fn receive(&self, _visibility: Duration) -> Result<Option<BufferedMessage>> {
        loop {
            let Some(message) = self.fetch_one().await? else {
                return Ok(None);
            };

            let record = match serde_json::from_slice::<QueuedRecord>(&message.payload) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(queue = %self.name, error = %e, "Dropping undecodable message");
                    if let Err(e) = message.ack_with(AckKind::Term).await {
                        tracing::warn!(queue = %self.name, error = %e, "Failed to terminate message");
                    }
                    continue;
                }
            };

            let delivered = message
                .info()
                .map(|info| u32::try_from(info.delivered.max(1)).unwrap_or(u32::MAX))
                .unwrap_or(1);
            let max = self.settings.max_receive_count;
            let handle = MessageHandle::generate();
            let buffered = BufferedMessage {
                handle: handle.clone(),
                envelope: record.envelope,
                receive_count: if max > 0 { delivered.min(max) } else { delivered },
                first_enqueued_at: record.enqueued_at,
                dedup_key: record.dedup_key,
                stage: self.name.clone(),
            };
            let claim = Claimed {
                message,
                buffered: buffered.clone(),
                deadline: self.clock.now() + self.visibility(),
            };
            self.claims().insert(handle.clone(), claim);

            // Already delivered `max` times; hand it over for dead-lettering
            if max > 0 && delivered > max {
                tracing::warn!(
                    queue = %self.name,
                    event_id = %buffered.envelope.id(),
                    delivered,
                    "Redelivered message past its receive ceiling"
                );
                self.overdue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(handle);
                continue;
            }

            return Ok(Some(buffered));
        }
    }

    async fn ack(&self, handle: &MessageHandle) -> Result<()> {
        let claim = self
            .claims()
            .remove(handle)
            .ok_or_else(|| PipelineError::UnknownHandle(handle.to_string()))?;

        claim
            .message
            .ack()
            .await
            .map_err(|e| queue_error(&self.name, format!("ack failed: {}", e)))
    }

    async fn release(&self, handle: &MessageHandle) -> Result<Option<BufferedMessage>> {
        let claim = {
            let mut claims = self.claims();
            let at_ceiling = match claims.get(handle) {
                Some(claim) => should_dead_letter(
                    claim.buffered.receive_count,
                    self.settings.max_receive_count,
                ),
                None => return Err(PipelineError::UnknownHandle(handle.to_string())),
            };
            if at_ceiling {
                // Stays claimed until the caller stores the dead letter and acks
                if let Some(claim) = claims.get_mut(handle) {
                    claim.deadline = self.clock.now() + self.visibility();
                    return Ok(Some(claim.buffered.clone()));
                }
            }
            claims.remove(handle)
        };

        if let Some(claim) = claim {
            claim
                .message
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(|e| queue_error(&self.name, format!("nak failed: {}", e)))?;
        }
        Ok(None)
    }

    /// Forget lapsed claims and hand over messages redelivered past the ceiling
    ///
    /// The server redelivers a lapsed claim on its own once `ack_wait` passes.
    async fn reclaim_expired(&self) -> Result<Vec<BufferedMessage>> {
        let now = self.clock.now();
        let overdue: Vec<MessageHandle> = std::mem::take(
            &mut *self.overdue.lock().unwrap_or_else(|e| e.into_inner()),
        );

        let mut claims = self.claims();
        let lapsed: Vec<MessageHandle> = claims
            .iter()
            .filter(|&(handle, claim)| claim.deadline <= now && !overdue.contains(handle))
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in &lapsed {
            claims.remove(handle);
        }
        if !lapsed.is_empty() {
            tracing::debug!(queue = %self.name, count = lapsed.len(), "Lapsed claims released");
        }

        Ok(overdue
            .iter()
            .filter_map(|handle| claims.get(handle).map(|claim| claim.buffered.clone()))
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut consumer = self.consumer.lock().await;
        let info = consumer
            .info()
            .await
            .map_err(|e| queue_error(&self.name, format!("consumer info: {}", e)))?;

        Ok(QueueStats {
            visible: usize::try_from(info.num_pending).unwrap_or(usize::MAX),
            in_flight: info.num_ack_pending,
        })
    }

    async fn wait_for_messages(&self, timeout: std::time::Duration) {
        // Pull consumers have no push signal; poll at a short interval
        tokio::time::sleep(timeout.min(std::time::Duration::from_millis(250))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_are_subject_safe() {
        let settings = JetStreamSettings::for_stage("api.insertion", "a3s.pipeline");
        assert_eq!(settings.stream_name, "PIPELINE_API_INSERTION");
        assert_eq!(settings.subject, "a3s.pipeline.stage.api_insertion");
        assert_eq!(settings.consumer_name, "api_insertion-consumer");
    }

    #[test]
    fn test_record_wire_format() {
        let record = QueuedRecord {
            envelope: Envelope::new("api.rest.public", "request", "{}"),
            dedup_key: "evt-1".into(),
            enqueued_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["dedupKey"], "evt-1");
        assert!(json.get("enqueuedAt").is_some());
    }
}

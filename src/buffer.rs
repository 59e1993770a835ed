//! Buffer stages
//!
//! Named, dead-lettering wrappers around a durable queue
//!
//! A `BufferStage` owns one queue, its dead-letter sink, and the operator
//! alert channel for messages that exhaust their receive ceiling. Stages are
//! chained by giving one stage's consumer a handler that enqueues into the
//! next stage (see `consumer::ForwardToStage`).

use crate::clock::SharedClock;
use crate::dlq::{DeadLetter, DlqHandler};
use crate::error::{PipelineError, Result};
use crate::notify::{Notification, Notifier, OPERATOR_TOPIC};
use crate::queue::{DurableQueue, EnqueueOutcome, QueueStats};
use crate::types::{BufferedMessage, Envelope, MessageHandle};
use chrono::Duration;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

const DEAD_LETTER_REASON: &str = "receive count ceiling exceeded";

/// Point-in-time stage depth, including dead letters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub visible: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

impl StageStats {
    /// Every accepted message has been acknowledged or dead-lettered
    pub fn is_drained(&self) -> bool {
        self.visible == 0 && self.in_flight == 0
    }
}

/// A durable intermediate queue hop
pub struct BufferStage {
    name: String,
    queue: Arc<dyn DurableQueue>,
    dlq: Arc<dyn DlqHandler>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: SharedClock,
}

impl BufferStage {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn DurableQueue>,
        dlq: Arc<dyn DlqHandler>,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            dlq,
            notifier: None,
            clock,
        }
    }

    /// Publish an operator alert for every dead letter
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dlq(&self) -> &Arc<dyn DlqHandler> {
        &self.dlq
    }

    /// Queue an envelope, deduplicated by its id
    pub async fn enqueue(&self, envelope: &Envelope) -> Result<EnqueueOutcome> {
        self.enqueue_with_key(envelope, envelope.id()).await
    }

    /// Queue an envelope under an explicit dedup key
    pub async fn enqueue_with_key(
        &self,
        envelope: &Envelope,
        dedup_key: &str,
    ) -> Result<EnqueueOutcome> {
        let outcome = self
            .queue
            .enqueue(envelope.clone(), dedup_key.to_string())
            .await?;

        tracing::debug!(
            stage = %self.name,
            event_id = %envelope.id(),
            outcome = ?outcome,
            "Envelope enqueued"
        );
        Ok(outcome)
    }

    /// Hand out up to `batch_size` messages, each hidden for `visibility`
    ///
    /// The returned stream is lazy: a message is only claimed when the
    /// consumer polls for it, so a consumer that stops early leaves the rest
    /// visible. Expired deliveries are reclaimed (and dead-lettered past the
    /// ceiling) before the batch starts. Call again for the next batch.
    pub fn dequeue(
        &self,
        batch_size: usize,
        visibility: Duration,
    ) -> BoxStream<'_, Result<BufferedMessage>> {
        let reclaim = stream::once(async move { self.reclaim_expired().await })
            .filter_map(|res| async move { res.err().map(Err::<BufferedMessage, PipelineError>) });

        let batch = stream::unfold(batch_size, move |remaining| async move {
            if remaining == 0 {
                return None;
            }
            match self.queue.receive(visibility).await {
                Ok(Some(message)) => Some((Ok(message), remaining - 1)),
                Ok(None) => None,
                Err(e) => Some((Err(e), 0)),
            }
        });

        reclaim.chain(batch).boxed()
    }

    /// Delete a message after successful processing
    pub async fn acknowledge(&self, handle: &MessageHandle) -> Result<()> {
        self.queue.ack(handle).await?;
        tracing::debug!(stage = %self.name, handle = %handle, "Message acknowledged");
        Ok(())
    }

    /// Return a message to the queue early (processing failed or was abandoned)
    pub async fn release(&self, handle: &MessageHandle) -> Result<()> {
        if let Some(message) = self.queue.release(handle).await? {
            self.dead_letter(message).await?;
        }
        Ok(())
    }

    /// Requeue lapsed deliveries; returns how many were dead-lettered
    pub async fn reclaim_expired(&self) -> Result<usize> {
        let at_ceiling = self.queue.reclaim_expired().await?;
        let count = at_ceiling.len();

        let mut first_err = None;
        for message in at_ceiling {
            if let Err(e) = self.dead_letter(message).await {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Current depth of the stage and its dead-letter sink
    pub async fn stats(&self) -> Result<StageStats> {
        let QueueStats { visible, in_flight } = self.queue.stats().await?;
        Ok(StageStats {
            visible,
            in_flight,
            dead_lettered: self.dlq.count().await?,
        })
    }

    /// Suspend until a message may be visible or `timeout` elapses
    pub async fn wait_for_messages(&self, timeout: std::time::Duration) {
        self.queue.wait_for_messages(timeout).await;
    }

    /// Store a message held at its ceiling, then remove it from the queue
    ///
    /// On failure the message stays claimed in the queue and is offered again
    /// once its visibility lapses.
    async fn dead_letter(&self, message: BufferedMessage) -> Result<()> {
        let event_id = message.envelope.id().to_string();
        let receive_count = message.receive_count;
        let handle = message.handle.clone();
        let now = self.clock.now();

        if let Err(e) = self
            .dlq
            .handle(DeadLetter::new(message, DEAD_LETTER_REASON, now))
            .await
        {
            tracing::error!(
                stage = %self.name,
                event_id = %event_id,
                error = %e,
                "Failed to store dead letter; message kept in queue"
            );
            return Err(PipelineError::DeadLetter {
                stage: self.name.clone(),
                event_id,
                receive_count,
            });
        }

        if let Err(e) = self.queue.ack(&handle).await {
            // Stored twice at worst; the copy in the DLQ is authoritative
            tracing::warn!(
                stage = %self.name,
                event_id = %event_id,
                error = %e,
                "Dead letter stored but queue entry not removed"
            );
        }

        if let Some(notifier) = &self.notifier {
            let alert = Notification::DeadLettered {
                stage: self.name.clone(),
                event_id: event_id.clone(),
                receive_count,
                reason: DEAD_LETTER_REASON.to_string(),
                at: now,
            };
            if let Err(e) = notifier.publish(OPERATOR_TOPIC, &alert).await {
                // The message itself is safe in the DLQ
                tracing::error!(
                    stage = %self.name,
                    event_id = %event_id,
                    error = %e,
                    "Failed to publish dead-letter alert"
                );
            }
        }

        Ok(())
    }
}

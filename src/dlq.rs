//! Dead Letter Queue
//!
//! Hold messages that exceed their receive ceiling
//!
//! A buffer stage moves a message here instead of redelivering it forever.
//! Dead letters are kept for manual inspection; nothing in the pipeline
//! deletes them.

use crate::error::Result;
use crate::types::BufferedMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// A message moved aside, with context about why
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The message as it was last delivered
    pub message: BufferedMessage,

    /// Reason the message was dead-lettered
    pub reason: String,

    /// When the message was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Create a new dead letter
    pub fn new(message: BufferedMessage, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            message,
            reason: reason.into(),
            dead_lettered_at: at,
        }
    }
}

/// Trait for dead letter sinks
///
/// Implementations decide where dead letters live. They may store,
/// forward, or alert on the message, but must not discard it.
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Accept a dead-lettered message
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()>;

    /// Number of messages currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters, newest first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory dead letter sink
///
/// `max_events = 0` (the default) means unbounded. A bounded handler evicts
/// its oldest entries with an error log, so only opt into a bound when the
/// dead letters are mirrored somewhere else.
pub struct MemoryDlqHandler {
    events: RwLock<VecDeque<DeadLetter>>,
    max_events: usize,
}

impl MemoryDlqHandler {
    /// Create a new in-memory DLQ handler
    pub fn new(max_events: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            max_events,
        }
    }
}

impl Default for MemoryDlqHandler {
    /// Unbounded; dead letters are only removed by an operator
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            event_id = %dead_letter.message.envelope.id(),
            stage = %dead_letter.message.stage,
            receive_count = dead_letter.message.receive_count,
            reason = %dead_letter.reason,
            "Message dead-lettered"
        );

        let mut events = self.events.write().await;
        events.push_back(dead_letter);

        if self.max_events > 0 {
            while events.len() > self.max_events {
                if let Some(evicted) = events.pop_front() {
                    tracing::error!(
                        event_id = %evicted.message.envelope.id(),
                        stage = %evicted.message.stage,
                        "Dead letter evicted from full in-memory DLQ"
                    );
                }
            }
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.events.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

/// Whether a message delivered `receive_count` times has reached the ceiling
///
/// `max_receive_count = 0` means unlimited redelivery.
pub fn should_dead_letter(receive_count: u32, max_receive_count: u32) -> bool {
    max_receive_count > 0 && receive_count >= max_receive_count
}

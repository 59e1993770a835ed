//! Terminal destinations for routed and buffered events
//!
//! A sink is the end of a flow: a pub/sub topic, a key-value table, the
//! structured log, or an in-memory collector.

use crate::error::{PipelineError, Result};
use crate::notify::{Notification, Notifier};
use crate::store::KvStore;
use crate::types::Envelope;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A destination that accepts envelopes
#[async_trait]
pub trait Sink: Send + Sync {
    /// Write one envelope. Must tolerate the same envelope twice.
    async fn write(&self, envelope: &Envelope) -> Result<()>;

    /// Sink name used in routing tables and logs
    fn name(&self) -> &str;
}

/// Writes one structured log record per event
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Sink for LogSink {
    async fn write(&self, envelope: &Envelope) -> Result<()> {
        tracing::info!(
            sink = %self.name,
            event_id = %envelope.id(),
            source = %envelope.source(),
            event_type = %envelope.event_type(),
            occurred_at = %envelope.occurred_at(),
            detail = %envelope.detail(),
            "Event"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Collects envelopes in memory
#[derive(Default)]
pub struct MemorySink {
    name: String,
    received: RwLock<Vec<Envelope>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received: RwLock::new(Vec::new()),
        }
    }

    /// Everything written so far, oldest first
    pub async fn received(&self) -> Vec<Envelope> {
        self.received.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.received.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.received.read().await.is_empty()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&self, envelope: &Envelope) -> Result<()> {
        self.received.write().await.push(envelope.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Publishes envelopes to a pub/sub topic
pub struct TopicSink {
    name: String,
    topic: String,
    notifier: Arc<dyn Notifier>,
}

impl TopicSink {
    pub fn new(name: impl Into<String>, topic: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            notifier,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Sink for TopicSink {
    async fn write(&self, envelope: &Envelope) -> Result<()> {
        self.notifier
            .publish(&self.topic, &Notification::Event(envelope.clone()))
            .await
            .map_err(|e| PipelineError::Sink {
                sink: self.name.clone(),
                reason: e.to_string(),
            })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Persists each envelope into a key-value table under `<prefix><event id>`
///
/// Keyed by event id, so a redelivered envelope finds its row already
/// present and is treated as written.
pub struct StoreSink {
    name: String,
    key_prefix: String,
    store: Arc<dyn KvStore>,
}

impl StoreSink {
    pub fn new(name: impl Into<String>, key_prefix: impl Into<String>, store: Arc<dyn KvStore>) -> Self {
        Self {
            name: name.into(),
            key_prefix: key_prefix.into(),
            store,
        }
    }

    pub fn key_for(&self, envelope: &Envelope) -> String {
        format!("{}{}", self.key_prefix, envelope.id())
    }
}

#[async_trait]
impl Sink for StoreSink {
    async fn write(&self, envelope: &Envelope) -> Result<()> {
        let key = self.key_for(envelope);
        let row = serde_json::to_value(envelope)?;

        match self.store.put_if_version(&key, row, None).await {
            Ok(_) => Ok(()),
            Err(PipelineError::VersionConflict { .. }) => {
                tracing::debug!(sink = %self.name, key = %key, "Row already stored");
                Ok(())
            }
            Err(e) => Err(PipelineError::Sink {
                sink: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use crate::store::MemoryKvStore;

    #[tokio::test]
    async fn test_memory_sink_collects() {
        let sink = MemorySink::new("audit");
        assert!(sink.is_empty().await);
        let env = Envelope::new("s", "t", "{}");
        sink.write(&env).await.unwrap();
        assert_eq!(sink.received().await, vec![env]);
        assert_eq!(sink.name(), "audit");
    }

    #[tokio::test]
    async fn test_log_sink_accepts() {
        let sink = LogSink::new("all-events");
        sink.write(&Envelope::new("s", "t", "{}")).await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_sink_publishes_event() {
        let notifier = Arc::new(MemoryNotifier::default());
        let sink = TopicSink::new("target", "pipeline.target", notifier.clone());
        let env = Envelope::new("s", "t", "{}");

        sink.write(&env).await.unwrap();

        let published = notifier.published("pipeline.target");
        assert_eq!(published, vec![Notification::Event(env)]);
    }

    #[tokio::test]
    async fn test_store_sink_idempotent() {
        let store = Arc::new(MemoryKvStore::new());
        let sink = StoreSink::new("table", "events/", store.clone());
        let env = Envelope::new("s", "t", r#"{"x":1}"#);

        sink.write(&env).await.unwrap();
        sink.write(&env).await.unwrap();

        let row = store.get(&sink.key_for(&env)).await.unwrap().unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.value["detail"], r#"{"x":1}"#);
        assert_eq!(store.scan_prefix("events/").await.unwrap().len(), 1);
    }
}

//! Stage consumers
//!
//! Worker pools that drain a buffer stage
//!
//! Each message is handled on its own: success acknowledges it, failure
//! releases it for redelivery (and eventually the dead-letter sink). One bad
//! message never holds up the rest of its batch.

use crate::buffer::BufferStage;
use crate::error::Result;
use crate::router::EventRouter;
use crate::sink::Sink;
use crate::types::{derived_event_id, BufferedMessage, Envelope};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Processes one buffered message
///
/// Returning `Ok` acknowledges the message; `Err` releases it. Handlers run
/// under at-least-once delivery and must tolerate seeing a message twice.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BufferedMessage) -> Result<()>;
}

/// Forward into the next stage of a chain
///
/// The upstream message is acknowledged only after this enqueue returns, so
/// a crash in between redelivers upstream; the downstream stage collapses the
/// repeat because it deduplicates on the envelope id.
pub struct ForwardToStage {
    next: Arc<BufferStage>,
}

impl ForwardToStage {
    pub fn new(next: Arc<BufferStage>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl MessageHandler for ForwardToStage {
    async fn handle(&self, message: &BufferedMessage) -> Result<()> {
        self.next.enqueue(&message.envelope).await?;
        tracing::debug!(
            from = %message.stage,
            to = %self.next.name(),
            event_id = %message.envelope.id(),
            "Message forwarded"
        );
        Ok(())
    }
}

/// Write to a terminal sink
pub struct DeliverToSink {
    sink: Arc<dyn Sink>,
}

impl DeliverToSink {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageHandler for DeliverToSink {
    async fn handle(&self, message: &BufferedMessage) -> Result<()> {
        self.sink.write(&message.envelope).await
    }
}

/// Publish back through the router (re-fan-out after buffering)
pub struct PublishToRouter {
    router: Arc<EventRouter>,
}

impl PublishToRouter {
    pub fn new(router: Arc<EventRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl MessageHandler for PublishToRouter {
    async fn handle(&self, message: &BufferedMessage) -> Result<()> {
        self.router.publish(&message.envelope).await.map(|_| ())
    }
}

/// Type given to an event the first time it is transformed
pub const TRANSFORMED_TYPE: &str = "transformed";

/// Type given to an event that was already transformed once
pub const FINISHED_TYPE: &str = "finish";

/// Source stamped on an event whose source already equals the transform's
pub const EXHAUSTED_SOURCE: &str = "none";

/// Rewrites source and type of an event, keeping its detail
///
/// An event from any other source is re-sourced to `source`; one that already
/// carries `source` gets `"none"`, so a transformed event cannot loop back
/// through the same transform indefinitely. The type moves from anything to
/// `"transformed"` and from `"transformed"` to `"finish"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTransform {
    source: String,
}

impl EventTransform {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The transformed copy of `envelope`
    ///
    /// Its id is derived from the input id, so transforming a redelivered
    /// message again yields the same event.
    pub fn apply(&self, envelope: &Envelope) -> Envelope {
        let source = if envelope.source() == self.source {
            EXHAUSTED_SOURCE
        } else {
            self.source.as_str()
        };
        let event_type = if envelope.event_type() == TRANSFORMED_TYPE {
            FINISHED_TYPE
        } else {
            TRANSFORMED_TYPE
        };

        let id = derived_event_id(&format!("{}:{}:{}", envelope.id(), source, event_type));
        envelope
            .trace_context()
            .iter()
            .fold(
                Envelope::new(source, event_type, envelope.detail()).with_id(id),
                |transformed, (key, value)| transformed.with_trace(key.clone(), value.clone()),
            )
    }
}

/// Store the event, then publish its transformed copy through the router
///
/// Both steps happen before the message is acknowledged; a failure in either
/// releases it, and the repeat store write and republish are absorbed by the
/// sink key and the derived event id.
pub struct TransformAndPublish {
    transform: EventTransform,
    store: Option<Arc<dyn Sink>>,
    router: Arc<EventRouter>,
}

impl TransformAndPublish {
    pub fn new(
        transform: EventTransform,
        store: Option<Arc<dyn Sink>>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            transform,
            store,
            router,
        }
    }
}

#[async_trait]
impl MessageHandler for TransformAndPublish {
    async fn handle(&self, message: &BufferedMessage) -> Result<()> {
        if let Some(store) = &self.store {
            store.write(&message.envelope).await?;
        }

        let transformed = self.transform.apply(&message.envelope);
        self.router.publish(&transformed).await?;
        tracing::debug!(
            stage = %message.stage,
            event_id = %message.envelope.id(),
            transformed_id = %transformed.id(),
            source = %transformed.source(),
            event_type = %transformed.event_type(),
            "Event transformed and republished"
        );
        Ok(())
    }
}

/// Worker pool sizing and timing
#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub visibility_timeout: chrono::Duration,
    /// Longest idle wait before polling the stage again
    pub poll_interval: std::time::Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: 10,
            visibility_timeout: chrono::Duration::seconds(30),
            poll_interval: std::time::Duration::from_millis(500),
        }
    }
}

/// Counts from one dequeue pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub acknowledged: usize,
    pub released: usize,
}

impl BatchOutcome {
    pub fn processed(&self) -> usize {
        self.acknowledged + self.released
    }
}

/// Drains one buffer stage with a handler
pub struct StageConsumer {
    stage: Arc<BufferStage>,
    handler: Arc<dyn MessageHandler>,
    settings: ConsumerSettings,
}

impl StageConsumer {
    pub fn new(
        stage: Arc<BufferStage>,
        handler: Arc<dyn MessageHandler>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            stage,
            handler,
            settings,
        }
    }

    pub fn stage(&self) -> &Arc<BufferStage> {
        &self.stage
    }

    /// Run one dequeue pass, stopping early if `cancel` fires
    ///
    /// Cancellation is checked before each message is claimed; a message
    /// already claimed is always handled and acknowledged or released.
    pub async fn process_batch(&self, cancel: &CancellationToken) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut batch = self
            .stage
            .dequeue(self.settings.batch_size, self.settings.visibility_timeout);

        while !cancel.is_cancelled() {
            let Some(next) = batch.next().await else {
                break;
            };
            let message = next?;

            match self.handler.handle(&message).await {
                Ok(()) => {
                    if let Err(e) = self.stage.acknowledge(&message.handle).await {
                        // Visibility lapsed mid-processing; the message will be redelivered
                        tracing::warn!(
                            stage = %self.stage.name(),
                            event_id = %message.envelope.id(),
                            error = %e,
                            "Acknowledge failed"
                        );
                    }
                    outcome.acknowledged += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        stage = %self.stage.name(),
                        event_id = %message.envelope.id(),
                        receive_count = message.receive_count,
                        error = %e,
                        "Handler failed; releasing message"
                    );
                    if let Err(e) = self.stage.release(&message.handle).await {
                        tracing::warn!(
                            stage = %self.stage.name(),
                            event_id = %message.envelope.id(),
                            error = %e,
                            "Release failed"
                        );
                    }
                    outcome.released += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Spawn the worker pool; workers exit when `cancel` fires
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.settings.workers.max(1))
            .map(|worker| {
                let consumer = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { consumer.run_worker(worker, cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, cancel: CancellationToken) {
        tracing::debug!(stage = %self.stage.name(), worker, "Consumer worker started");

        while !cancel.is_cancelled() {
            let processed = match self.process_batch(&cancel).await {
                Ok(outcome) => outcome.processed(),
                Err(e) => {
                    tracing::warn!(stage = %self.stage.name(), worker, error = %e, "Dequeue failed");
                    0
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.stage.wait_for_messages(self.settings.poll_interval) => {}
                }
            }
        }

        tracing::debug!(stage = %self.stage.name(), worker, "Consumer worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::dlq::MemoryDlqHandler;
    use crate::error::PipelineError;
    use crate::queue::{MemoryQueue, QueueConfig};
    use crate::sink::MemorySink;
    use crate::types::Envelope;
    use chrono::Duration;

    fn stage(name: &str, clock: &ManualClock, max_receive_count: u32) -> Arc<BufferStage> {
        let shared: SharedClock = Arc::new(clock.clone());
        let queue = MemoryQueue::new(
            name,
            QueueConfig {
                max_receive_count,
                dedup_window: Duration::minutes(5),
            },
            shared.clone(),
        );
        Arc::new(BufferStage::new(
            name,
            Arc::new(queue),
            Arc::new(MemoryDlqHandler::new(0)),
            shared,
        ))
    }

    struct RejectDetail(&'static str);

    #[async_trait]
    impl MessageHandler for RejectDetail {
        async fn handle(&self, message: &BufferedMessage) -> Result<()> {
            if message.envelope.detail() == self.0 {
                Err(PipelineError::Validation("rejected".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_deliver_to_sink_acks() {
        let clock = ManualClock::default();
        let s = stage("debuffering", &clock, 5);
        let sink = Arc::new(MemorySink::new("target"));
        let consumer = StageConsumer::new(
            s.clone(),
            Arc::new(DeliverToSink::new(sink.clone())),
            ConsumerSettings::default(),
        );

        let env = Envelope::new("s", "t", "{}");
        s.enqueue(&env).await.unwrap();

        let outcome = consumer.process_batch(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BatchOutcome { acknowledged: 1, released: 0 });
        assert_eq!(sink.received().await, vec![env]);
        assert!(s.stats().await.unwrap().is_drained());
    }

    #[tokio::test]
    async fn test_failed_handler_releases_and_isolates() {
        let clock = ManualClock::default();
        let s = stage("insertion", &clock, 3);
        let consumer = StageConsumer::new(
            s.clone(),
            Arc::new(RejectDetail("bad")),
            ConsumerSettings::default(),
        );

        s.enqueue(&Envelope::new("s", "t", "bad")).await.unwrap();
        s.enqueue(&Envelope::new("s", "t", "good")).await.unwrap();

        let cancel = CancellationToken::new();
        let first = consumer.process_batch(&cancel).await.unwrap();
        assert_eq!(first, BatchOutcome { acknowledged: 1, released: 1 });

        // The bad message cycles until it hits the ceiling
        for _ in 0..3 {
            consumer.process_batch(&cancel).await.unwrap();
        }
        let stats = s.stats().await.unwrap();
        assert!(stats.is_drained());
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_cancelled_batch_claims_nothing() {
        let clock = ManualClock::default();
        let s = stage("insertion", &clock, 5);
        let consumer = StageConsumer::new(
            s.clone(),
            Arc::new(RejectDetail("never")),
            ConsumerSettings::default(),
        );
        s.enqueue(&Envelope::new("s", "t", "{}")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = consumer.process_batch(&cancel).await.unwrap();
        assert_eq!(outcome.processed(), 0);
        assert_eq!(s.stats().await.unwrap().visible, 1);
    }

    #[tokio::test]
    async fn test_spawned_workers_drain_and_stop() {
        let clock = ManualClock::default();
        let s = stage("insertion", &clock, 5);
        let sink = Arc::new(MemorySink::new("target"));
        let consumer = Arc::new(StageConsumer::new(
            s.clone(),
            Arc::new(DeliverToSink::new(sink.clone())),
            ConsumerSettings {
                workers: 3,
                poll_interval: std::time::Duration::from_millis(10),
                ..Default::default()
            },
        ));

        let cancel = CancellationToken::new();
        let handles = consumer.spawn(cancel.clone());
        assert_eq!(handles.len(), 3);

        for i in 0..20 {
            s.enqueue(&Envelope::new("s", "t", format!("{}", i))).await.unwrap();
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while sink.len().await < 20 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(s.stats().await.unwrap().is_drained());
    }

    #[test]
    fn test_transform_rules() {
        let transform = EventTransform::new("application.lambda");

        let first = transform.apply(
            &Envelope::new("api.rest.lambda", "invoke", r#"{"n":1}"#).with_trace("traceparent", "00-abc"),
        );
        assert_eq!(first.source(), "application.lambda");
        assert_eq!(first.event_type(), TRANSFORMED_TYPE);
        assert_eq!(first.detail(), r#"{"n":1}"#);
        assert_eq!(first.trace_context()["traceparent"], "00-abc");

        let second = transform.apply(&first);
        assert_eq!(second.source(), EXHAUSTED_SOURCE);
        assert_eq!(second.event_type(), FINISHED_TYPE);
        assert_eq!(second.detail(), first.detail());

        // Any other type becomes "transformed" again
        let third = transform.apply(&second);
        assert_eq!(third.source(), "application.lambda");
        assert_eq!(third.event_type(), TRANSFORMED_TYPE);
    }

    #[test]
    fn test_transform_id_is_stable_per_input() {
        let transform = EventTransform::new("application.lambda");
        let env = Envelope::new("api.rest.lambda", "invoke", "{}");
        assert_eq!(transform.apply(&env).id(), transform.apply(&env).id());
        assert_ne!(transform.apply(&env).id(), env.id());
    }

    #[tokio::test]
    async fn test_transform_stores_then_republishes() {
        use crate::router::{EventRouter, Pattern, RoutingTable, Subscription, Target, UnmatchedPolicy};
        use std::collections::HashMap;

        let clock = ManualClock::default();
        let s = stage("processing", &clock, 5);
        let table_sink = Arc::new(MemorySink::new("table"));
        let finished = Arc::new(MemorySink::new("finished"));

        let mut sinks: HashMap<String, Arc<dyn Sink>> = HashMap::new();
        sinks.insert("finished".into(), finished.clone());
        let router = Arc::new(
            EventRouter::new(
                RoutingTable::new(
                    vec![Subscription {
                        name: "transformed".into(),
                        source: Pattern::exact("application.lambda"),
                        event_type: Some(Pattern::exact(TRANSFORMED_TYPE)),
                        target: Target::Sink("finished".into()),
                    }],
                    UnmatchedPolicy::Discard,
                ),
                HashMap::new(),
                sinks,
            )
            .unwrap(),
        );

        let consumer = StageConsumer::new(
            s.clone(),
            Arc::new(TransformAndPublish::new(
                EventTransform::new("application.lambda"),
                Some(table_sink.clone() as Arc<dyn Sink>),
                router,
            )),
            ConsumerSettings::default(),
        );

        let env = Envelope::new("api.rest.lambda", "invoke", r#"{"order":7}"#);
        s.enqueue(&env).await.unwrap();
        let outcome = consumer.process_batch(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, BatchOutcome { acknowledged: 1, released: 0 });

        assert_eq!(table_sink.received().await, vec![env.clone()]);
        let republished = finished.received().await;
        assert_eq!(republished.len(), 1);
        assert_eq!(republished[0].source(), "application.lambda");
        assert_eq!(republished[0].event_type(), TRANSFORMED_TYPE);
        assert_eq!(republished[0].detail(), env.detail());
        assert!(s.stats().await.unwrap().is_drained());
    }
}

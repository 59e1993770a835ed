//! Pipeline coordinator
//!
//! Builds the graph from configuration and runs it
//!
//! `build` turns a `PipelineConfig` into sinks, buffer stages, the router,
//! the ingress gateway and one consumer pool per stage. `start` spawns the
//! workers; `shutdown` closes ingress, drains for a bounded time, cancels
//! the workers and reports what was left behind.

use crate::buffer::{BufferStage, StageStats};
use crate::clock::{self, SharedClock};
use crate::compliance::{ComplianceCheck, ComplianceMonitor};
use crate::config::{
    DeliverTo, NotifierConfig, PipelineConfig, QueueBackend, SinkKind, StoreConfig,
};
use crate::consumer::{
    DeliverToSink, EventTransform, ForwardToStage, MessageHandler, PublishToRouter, StageConsumer,
    TransformAndPublish,
};
use crate::dlq::MemoryDlqHandler;
use crate::error::{PipelineError, Result};
use crate::ingress::IngressGateway;
use crate::notify::{MemoryNotifier, NatsNotifier, Notifier};
use crate::queue::{DurableQueue, JetStreamQueue, MemoryQueue};
use crate::remediation::{ActionExecutor, RemediationAction};
use crate::router::EventRouter;
use crate::sink::{LogSink, MemorySink, Sink, StoreSink, TopicSink};
use crate::store::{FileKvStore, KvStore, MemoryKvStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Shared services injected into the pipeline
pub struct PipelineDeps {
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn KvStore>,
    pub clock: SharedClock,
    /// Pre-built sinks; a name here replaces the configured sink of that name
    pub sinks: HashMap<String, Arc<dyn Sink>>,
    /// Pre-built stage queues; stages without one get an in-memory queue
    pub queues: HashMap<String, Arc<dyn DurableQueue>>,
    /// Compliance check and corrective action for the remediation loop
    pub remediation: Option<(Arc<dyn ComplianceCheck>, Arc<dyn RemediationAction>)>,
}

impl PipelineDeps {
    /// In-memory store and notifier with the system clock
    pub fn in_memory() -> Self {
        Self {
            notifier: Arc::new(MemoryNotifier::default()),
            store: Arc::new(MemoryKvStore::new()),
            clock: clock::system(),
            sinks: HashMap::new(),
            queues: HashMap::new(),
            remediation: None,
        }
    }

    /// Store and notifier as described by the configuration
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let store: Arc<dyn KvStore> = match &config.store {
            StoreConfig::Memory => Arc::new(MemoryKvStore::new()),
            StoreConfig::File { path } => Arc::new(FileKvStore::open(path.clone()).await?),
        };
        let notifier: Arc<dyn Notifier> = match &config.notifier {
            NotifierConfig::Memory => Arc::new(MemoryNotifier::default()),
            NotifierConfig::Nats {
                url,
                subject_prefix,
            } => Arc::new(NatsNotifier::connect(url, subject_prefix.clone()).await?),
        };

        let clock = clock::system();
        let mut clients: HashMap<String, async_nats::Client> = HashMap::new();
        let mut queues: HashMap<String, Arc<dyn DurableQueue>> = HashMap::new();
        for stage in &config.stages {
            let (QueueBackend::Jetstream { url, .. }, Some(settings)) =
                (&stage.queue, stage.jetstream_settings())
            else {
                continue;
            };
            let client = match clients.get(url) {
                Some(client) => client.clone(),
                None => {
                    let client = async_nats::connect(url.as_str()).await.map_err(|e| {
                        PipelineError::Queue {
                            queue: stage.name.clone(),
                            reason: format!("connect to {} failed: {}", url, e),
                        }
                    })?;
                    tracing::info!(url = %url, "Connected to NATS for stage queues");
                    clients.insert(url.clone(), client.clone());
                    client
                }
            };
            let queue = JetStreamQueue::connect(client, &stage.name, settings, clock.clone()).await?;
            queues.insert(stage.name.clone(), Arc::new(queue));
        }

        Ok(Self {
            notifier,
            store,
            clock,
            queues,
            ..Self::in_memory()
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, name: impl Into<String>, sink: Arc<dyn Sink>) -> Self {
        self.sinks.insert(name.into(), sink);
        self
    }

    pub fn with_queue(mut self, stage: impl Into<String>, queue: Arc<dyn DurableQueue>) -> Self {
        self.queues.insert(stage.into(), queue);
        self
    }

    pub fn with_remediation(
        mut self,
        check: Arc<dyn ComplianceCheck>,
        action: Arc<dyn RemediationAction>,
    ) -> Self {
        self.remediation = Some((check, action));
        self
    }
}

/// What `shutdown` left behind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every stage was empty when consumers were cancelled
    pub drained: bool,
    pub elapsed: Duration,
    /// Final depth per stage; undrained messages stay queued
    pub stages: BTreeMap<String, StageStats>,
}

impl ShutdownReport {
    /// Messages still visible or in flight across all stages
    pub fn undrained(&self) -> usize {
        self.stages
            .values()
            .map(|s| s.visible + s.in_flight)
            .sum()
    }
}

/// Owns every component of a running pipeline
pub struct PipelineCoordinator {
    config: PipelineConfig,
    router: Arc<EventRouter>,
    gateway: Arc<IngressGateway>,
    stages: BTreeMap<String, Arc<BufferStage>>,
    sinks: HashMap<String, Arc<dyn Sink>>,
    consumers: Vec<Arc<StageConsumer>>,
    executor: Option<Arc<ActionExecutor>>,
    monitor: Option<Arc<ComplianceMonitor>>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineCoordinator {
    /// Build the whole pipeline graph; nothing runs until `start`
    pub fn build(config: PipelineConfig, deps: PipelineDeps) -> Result<Self> {
        config.validate()?;
        let PipelineDeps {
            notifier,
            store,
            clock,
            sinks: mut prebuilt,
            queues: mut prebuilt_queues,
            remediation,
        } = deps;

        let mut sinks: HashMap<String, Arc<dyn Sink>> = HashMap::new();
        for sink in &config.sinks {
            let built: Arc<dyn Sink> = match prebuilt.remove(&sink.name) {
                Some(sink) => sink,
                None => match &sink.kind {
                    SinkKind::Log => Arc::new(LogSink::new(&sink.name)),
                    SinkKind::Memory => Arc::new(MemorySink::new(&sink.name)),
                    SinkKind::Topic { topic } => {
                        Arc::new(TopicSink::new(&sink.name, topic, notifier.clone()))
                    }
                    SinkKind::Store { key_prefix } => {
                        Arc::new(StoreSink::new(&sink.name, key_prefix, store.clone()))
                    }
                },
            };
            sinks.insert(sink.name.clone(), built);
        }

        let mut stages = BTreeMap::new();
        for stage in &config.stages {
            let queue: Arc<dyn DurableQueue> = match (prebuilt_queues.remove(&stage.name), &stage.queue) {
                (Some(queue), _) => queue,
                (None, QueueBackend::Memory) => Arc::new(MemoryQueue::new(
                    &stage.name,
                    stage.queue_config(),
                    clock.clone(),
                )),
                (None, QueueBackend::Jetstream { .. }) => {
                    return Err(PipelineError::Config(format!(
                        "Stage '{}' needs a connected JetStream queue (see PipelineDeps::from_config)",
                        stage.name
                    )));
                }
            };
            let buffer = BufferStage::new(
                &stage.name,
                queue,
                Arc::new(MemoryDlqHandler::new(0)),
                clock.clone(),
            )
            .with_notifier(notifier.clone());
            stages.insert(stage.name.clone(), Arc::new(buffer));
        }

        let router = Arc::new(EventRouter::new(
            config.routing_table(),
            stages.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            sinks.clone(),
        )?);

        let mut consumers = Vec::new();
        for stage in &config.stages {
            let handler: Arc<dyn MessageHandler> = match &stage.deliver_to {
                DeliverTo::Stage(next) => Arc::new(ForwardToStage::new(lookup(&stages, next)?)),
                DeliverTo::Sink(name) => Arc::new(DeliverToSink::new(lookup_sink(&sinks, name)?)),
                DeliverTo::Router => Arc::new(PublishToRouter::new(router.clone())),
                DeliverTo::Transform(transform) => {
                    let store = match &transform.store {
                        Some(name) => Some(lookup_sink(&sinks, name)?),
                        None => None,
                    };
                    Arc::new(TransformAndPublish::new(
                        EventTransform::new(&transform.source),
                        store,
                        router.clone(),
                    ))
                }
            };
            consumers.push(Arc::new(StageConsumer::new(
                lookup(&stages, &stage.name)?,
                handler,
                stage.consumer_settings(),
            )));
        }

        let gateway = Arc::new(IngressGateway::new(
            router.clone(),
            config.ingress.routes.clone(),
            config.ingress.max_body_bytes,
        ));

        let (executor, monitor) = match remediation {
            Some((check, action)) => {
                let executor = Arc::new(ActionExecutor::new(
                    store.clone(),
                    notifier.clone(),
                    action,
                    clock.clone(),
                ));
                let mut monitor = ComplianceMonitor::new(store, notifier.clone(), check, clock)
                    .with_executor(executor.clone())
                    .with_default_policy(config.remediation.policy);
                for (target, policy) in &config.remediation.policies {
                    monitor = monitor.with_policy(target, *policy);
                }
                (Some(executor), Some(Arc::new(monitor)))
            }
            None => (None, None),
        };

        tracing::info!(
            stages = stages.len(),
            sinks = sinks.len(),
            subscriptions = config.subscriptions.len(),
            routes = config.ingress.routes.len(),
            notifier = notifier.name(),
            remediation = executor.is_some(),
            "Pipeline built"
        );

        Ok(Self {
            config,
            router,
            gateway,
            stages,
            sinks,
            consumers,
            executor,
            monitor,
            notifier,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn every stage's worker pool (and the remediation loop if enabled)
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        for consumer in &self.consumers {
            tasks.extend(consumer.spawn(self.cancel.clone()));
        }

        if self.config.remediation.enabled {
            if let (Some(executor), Some(monitor)) = (&self.executor, &self.monitor) {
                let executor = executor.clone();
                let cancel = self.cancel.clone();
                let poll = self.config.remediation.poll_interval();
                tasks.push(tokio::spawn(async move { executor.run(poll, cancel).await }));

                let monitor = monitor.clone();
                let cancel = self.cancel.clone();
                let targets = self.config.remediation.targets.clone();
                let interval = self.config.remediation.evaluation_interval();
                tasks.push(tokio::spawn(async move {
                    monitor.run(targets, interval, cancel).await
                }));
            } else {
                tracing::warn!("Remediation enabled but no check or action was provided");
            }
        }

        tracing::info!(tasks = tasks.len(), "Pipeline started");
        Ok(())
    }

    /// Close ingress, drain for up to `drain_timeout`, then stop every worker
    ///
    /// Messages a consumer already claimed are finished (acknowledged or
    /// released) before its worker exits. Anything still queued afterwards is
    /// reported and left in place.
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<ShutdownReport> {
        let started = Instant::now();
        self.gateway.close();
        tracing::info!(drain_timeout_ms = drain_timeout.as_millis() as u64, "Draining pipeline");

        let mut drained = self.is_drained().await?;
        while !drained && started.elapsed() < drain_timeout {
            tokio::time::sleep(DRAIN_POLL).await;
            drained = self.is_drained().await?;
        }

        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Pipeline task panicked");
            }
        }

        let mut stages = BTreeMap::new();
        for (name, stage) in &self.stages {
            stages.insert(name.clone(), stage.stats().await?);
        }
        let report = ShutdownReport {
            drained: stages.values().all(StageStats::is_drained),
            elapsed: started.elapsed(),
            stages,
        };

        if report.drained {
            tracing::info!(elapsed_ms = report.elapsed.as_millis() as u64, "Pipeline stopped");
        } else {
            tracing::warn!(
                undrained = report.undrained(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Pipeline stopped with undrained messages"
            );
        }
        Ok(report)
    }

    async fn is_drained(&self) -> Result<bool> {
        for stage in self.stages.values() {
            if !stage.stats().await?.is_drained() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<IngressGateway> {
        &self.gateway
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn stage(&self, name: &str) -> Option<&Arc<BufferStage>> {
        self.stages.get(name)
    }

    pub fn sink(&self, name: &str) -> Option<&Arc<dyn Sink>> {
        self.sinks.get(name)
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn executor(&self) -> Option<&Arc<ActionExecutor>> {
        self.executor.as_ref()
    }

    pub fn monitor(&self) -> Option<&Arc<ComplianceMonitor>> {
        self.monitor.as_ref()
    }

    /// Token cancelled when shutdown stops the workers
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// HTTP ingress routes, ready to serve
    pub fn http_routes(&self) -> axum::Router {
        self.gateway.routes()
    }
}

fn lookup(stages: &BTreeMap<String, Arc<BufferStage>>, name: &str) -> Result<Arc<BufferStage>> {
    stages
        .get(name)
        .cloned()
        .ok_or_else(|| PipelineError::NotFound(format!("stage {}", name)))
}

fn lookup_sink(sinks: &HashMap<String, Arc<dyn Sink>>, name: &str) -> Result<Arc<dyn Sink>> {
    sinks
        .get(name)
        .cloned()
        .ok_or_else(|| PipelineError::NotFound(format!("sink {}", name)))
}

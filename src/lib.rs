//! # a3s-pipeline
//!
//! Event ingestion, buffering and compliance remediation for the A3S ecosystem.
//!
//! ## Overview
//!
//! Events enter over HTTP, are wrapped in an immutable envelope, and are
//! routed by pattern to durable buffer stages and sinks. Stage consumers
//! process each message at least once and dead-letter messages that keep
//! failing. Independently, a compliance monitor evaluates targets and hands
//! violations to an action executor that retries a corrective action under a
//! bounded retry policy.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_pipeline::{PipelineConfig, PipelineCoordinator, PipelineDeps};
//!
//! # async fn example() -> a3s_pipeline::Result<()> {
//! let config = PipelineConfig::from_toml_str(r#"
//!     [[ingress.routes]]
//!     path = "/events"
//!     source = "api.rest.public"
//!
//!     [[sinks]]
//!     name = "all-events"
//!     kind = "log"
//!
//!     [[subscriptions]]
//!     name = "log-all"
//!     source = "any"
//!     target = { sink = "all-events" }
//! "#)?;
//!
//! let pipeline = PipelineCoordinator::build(config, PipelineDeps::in_memory())?;
//! pipeline.start().await?;
//!
//! let receipt = pipeline.gateway().submit("/events", br#"{"x":1}"#).await?;
//! println!("Accepted: {}", receipt.event_id);
//!
//! pipeline.shutdown(std::time::Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **IngressGateway**: validates bodies and publishes envelopes
//! - **EventRouter**: immutable routing table, concurrent fan-out
//! - **BufferStage**: visibility timeouts, dedup, dead-lettering over an
//!   in-memory or JetStream-backed queue
//! - **StageConsumer**: worker pools that acknowledge or release
//! - **ComplianceMonitor** / **ActionExecutor**: evaluation and retried remediation
//! - **PipelineCoordinator**: builds the graph and drains it on shutdown

pub mod buffer;
pub mod cli;
pub mod clock;
pub mod compliance;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod dlq;
pub mod error;
pub mod ingress;
pub mod lock;
pub mod notify;
pub mod queue;
pub mod remediation;
pub mod router;
pub mod sink;
pub mod store;
pub mod types;

// Re-export core types
pub use buffer::{BufferStage, StageStats};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use compliance::{ComplianceCheck, ComplianceMonitor, MemoryCheck};
pub use config::PipelineConfig;
pub use consumer::{
    ConsumerSettings, EventTransform, MessageHandler, StageConsumer, TransformAndPublish,
};
pub use coordinator::{PipelineCoordinator, PipelineDeps, ShutdownReport};
pub use error::{PipelineError, Result};
pub use ingress::{IngressGateway, IngressRoute, Receipt};
pub use notify::{MemoryNotifier, NatsNotifier, Notification, Notifier};
pub use queue::{
    DurableQueue, JetStreamQueue, JetStreamSettings, JetStreamStorage, MemoryQueue, QueueConfig,
};
pub use remediation::{ActionExecutor, RemediationAction, TriggerOutcome};
pub use router::{EventRouter, Pattern, RouteReport, RoutingTable, Subscription, Target, UnmatchedPolicy};
pub use sink::{LogSink, MemorySink, Sink, StoreSink, TopicSink};
pub use store::{FileKvStore, KvStore, MemoryKvStore};
pub use types::{
    AttemptOutcome, BufferedMessage, ComplianceRecord, ComplianceStatus, Envelope, MessageHandle,
    RemediationAttempt, RemediationSequence, RetryPolicy, SequenceState,
};

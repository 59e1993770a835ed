//! Pipeline configuration
//!
//! Loaded from TOML. Every section has defaults so a minimal file only needs
//! its stages, sinks and subscriptions.

use crate::consumer::ConsumerSettings;
use crate::error::{PipelineError, Result};
use crate::ingress::{IngressRoute, DEFAULT_MAX_BODY_BYTES};
use crate::queue::{JetStreamSettings, JetStreamStorage, QueueConfig};
use crate::router::{RoutingTable, Subscription, Target, UnmatchedPolicy};
use crate::types::{seconds_clamped, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default)]
    pub stages: Vec<StageConfig>,

    #[serde(default)]
    pub sinks: Vec<SinkConfig>,

    #[serde(default)]
    pub subscriptions: Vec<Subscription>,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub remediation: RemediationConfig,
}

/// HTTP listener and routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Host address for the HTTP server (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the HTTP server (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted request body (default: 256 KiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default)]
    pub routes: Vec<IngressRoute>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            routes: Vec::new(),
        }
    }
}

impl IngressConfig {
    /// Returns the server bind address string (e.g., "127.0.0.1:8080").
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Key-value backend for compliance records, remediation sequences and store sinks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    File { path: PathBuf },
}

/// Notification transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifierConfig {
    #[default]
    Memory,
    Nats {
        url: String,
        #[serde(default = "default_subject_prefix")]
        subject_prefix: String,
    },
}

fn default_subject_prefix() -> String {
    "a3s.pipeline".to_string()
}

/// Longest accepted stage visibility timeout (12 hours)
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 12 * 60 * 60;

/// Longest accepted stage dedup window (1 day)
pub const MAX_DEDUP_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Where a stage's consumer sends each message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverTo {
    /// Forward into another stage (ack-after)
    Stage(String),
    /// Write to a sink
    Sink(String),
    /// Publish back through the router
    Router,
    /// Store the event, then publish a transformed copy through the router
    Transform(TransformConfig),
}

/// Persist-and-transform step of a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Source stamped on the transformed event
    pub source: String,

    /// Sink that records each event before it is transformed
    #[serde(default)]
    pub store: Option<String>,
}

/// Transport a stage's messages are buffered in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-process queue; contents are lost on restart
    #[default]
    Memory,
    /// NATS JetStream work-queue stream
    Jetstream {
        url: String,
        /// Stream name (default: derived from the stage name)
        #[serde(default)]
        stream: Option<String>,
        #[serde(default = "default_subject_prefix")]
        subject_prefix: String,
        #[serde(default)]
        storage: JetStreamStorage,
    },
}

/// One buffer stage and its consumer pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    pub deliver_to: DeliverTo,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Deliveries before a message is dead-lettered
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    /// Idle consumer re-poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub queue: QueueBackend,
}

fn default_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    10
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_receive_count() -> u32 {
    5
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl StageConfig {
    pub fn new(name: impl Into<String>, deliver_to: DeliverTo) -> Self {
        Self {
            name: name.into(),
            deliver_to,
            workers: default_workers(),
            batch_size: default_batch_size(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receive_count: default_max_receive_count(),
            dedup_window_secs: default_dedup_window_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            queue: QueueBackend::default(),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_receive_count: self.max_receive_count,
            dedup_window: seconds_clamped(self.dedup_window_secs, MAX_DEDUP_WINDOW_SECS),
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            workers: self.workers,
            batch_size: self.batch_size,
            visibility_timeout: seconds_clamped(
                self.visibility_timeout_secs,
                MAX_VISIBILITY_TIMEOUT_SECS,
            ),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Stream layout when the stage is backed by JetStream
    pub fn jetstream_settings(&self) -> Option<JetStreamSettings> {
        let QueueBackend::Jetstream {
            stream,
            subject_prefix,
            storage,
            ..
        } = &self.queue
        else {
            return None;
        };

        let mut settings = JetStreamSettings::for_stage(&self.name, subject_prefix);
        if let Some(stream) = stream {
            settings.stream_name = stream.clone();
        }
        settings.ack_wait =
            Duration::from_secs(self.visibility_timeout_secs.min(MAX_VISIBILITY_TIMEOUT_SECS));
        settings.dedup_window =
            Duration::from_secs(self.dedup_window_secs.min(MAX_DEDUP_WINDOW_SECS));
        settings.max_receive_count = self.max_receive_count;
        settings.storage = *storage;
        Some(settings)
    }
}

/// A named sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: SinkKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkKind {
    /// One structured log record per event
    Log,
    /// Kept in memory (tests, dry runs)
    Memory,
    /// Published to a notifier topic
    Topic { topic: String },
    /// Persisted into the key-value store
    Store {
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    "events/".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub unmatched: UnmatchedPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long consumers may keep draining after ingress closes
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Compliance monitoring and remediation scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    /// Run the compliance monitor and remediation scheduler
    #[serde(default)]
    pub enabled: bool,

    /// Targets evaluated by the compliance monitor
    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,

    /// Longest wait between scheduler scans
    #[serde(default = "default_scheduler_poll_ms")]
    pub poll_interval_ms: u64,

    /// Policy for targets without an override
    #[serde(default)]
    pub policy: RetryPolicy,

    /// Per-target policy overrides
    #[serde(default)]
    pub policies: HashMap<String, RetryPolicy>,
}

fn default_evaluation_interval_secs() -> u64 {
    60
}

fn default_scheduler_poll_ms() -> u64 {
    1000
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            targets: Vec::new(),
            evaluation_interval_secs: default_evaluation_interval_secs(),
            poll_interval_ms: default_scheduler_poll_ms(),
            policy: RetryPolicy::default(),
            policies: HashMap::new(),
        }
    }
}

impl RemediationConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn config_err(msg: impl Into<String>) -> PipelineError {
    PipelineError::Config(msg.into())
}

fn check_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(config_err(format!("{} name must not be empty", kind)));
        }
        if !seen.insert(name) {
            return Err(config_err(format!("Duplicate {} name '{}'", kind, name)));
        }
    }
    Ok(seen)
}

impl PipelineConfig {
    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            config_err(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable::new(self.subscriptions.clone(), self.router.unmatched.clone())
    }

    /// Check names, references and numeric bounds
    pub fn validate(&self) -> Result<()> {
        let stages = check_unique("stage", self.stages.iter().map(|s| s.name.as_str()))?;
        let sinks = check_unique("sink", self.sinks.iter().map(|s| s.name.as_str()))?;
        check_unique(
            "subscription",
            self.subscriptions.iter().map(|s| s.name.as_str()),
        )?;

        let known = |target: &Target| match target {
            Target::Stage(name) => stages.contains(name.as_str()),
            Target::Sink(name) => sinks.contains(name.as_str()),
        };

        for sub in &self.subscriptions {
            if !known(&sub.target) {
                return Err(config_err(format!(
                    "Subscription '{}' targets undefined {}",
                    sub.name, sub.target
                )));
            }
        }
        if let UnmatchedPolicy::Route(target) = &self.router.unmatched {
            if !known(target) {
                return Err(config_err(format!(
                    "Unmatched policy targets undefined {}",
                    target
                )));
            }
        }

        for stage in &self.stages {
            if stage.workers == 0 || stage.batch_size == 0 {
                return Err(config_err(format!(
                    "Stage '{}' needs at least one worker and a non-zero batch size",
                    stage.name
                )));
            }
            if stage.max_receive_count == 0 {
                return Err(config_err(format!(
                    "Stage '{}' max_receive_count must be at least 1",
                    stage.name
                )));
            }
            if stage.visibility_timeout_secs == 0
                || stage.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS
            {
                return Err(config_err(format!(
                    "Stage '{}' visibility_timeout_secs must be between 1 and {}",
                    stage.name, MAX_VISIBILITY_TIMEOUT_SECS
                )));
            }
            if stage.dedup_window_secs > MAX_DEDUP_WINDOW_SECS {
                return Err(config_err(format!(
                    "Stage '{}' dedup_window_secs must be at most {}",
                    stage.name, MAX_DEDUP_WINDOW_SECS
                )));
            }
            if let QueueBackend::Jetstream { url, .. } = &stage.queue {
                if url.is_empty() {
                    return Err(config_err(format!(
                        "Stage '{}' uses jetstream without a url",
                        stage.name
                    )));
                }
            }
            match &stage.deliver_to {
                DeliverTo::Stage(next) if !stages.contains(next.as_str()) => {
                    return Err(config_err(format!(
                        "Stage '{}' forwards to undefined stage '{}'",
                        stage.name, next
                    )));
                }
                DeliverTo::Sink(sink) if !sinks.contains(sink.as_str()) => {
                    return Err(config_err(format!(
                        "Stage '{}' delivers to undefined sink '{}'",
                        stage.name, sink
                    )));
                }
                DeliverTo::Transform(transform) => {
                    if transform.source.is_empty() {
                        return Err(config_err(format!(
                            "Stage '{}' transform needs a source",
                            stage.name
                        )));
                    }
                    if let Some(store) = &transform.store {
                        if !sinks.contains(store.as_str()) {
                            return Err(config_err(format!(
                                "Stage '{}' transform stores into undefined sink '{}'",
                                stage.name, store
                            )));
                        }
                    }
                }
                _ => {}
            }
        }
        self.check_forwarding_cycles()?;

        let mut paths = HashSet::new();
        for route in &self.ingress.routes {
            if !route.path.starts_with('/') || route.path == "/health" {
                return Err(config_err(format!(
                    "Ingress path '{}' must start with '/' and not be /health",
                    route.path
                )));
            }
            if route.source.is_empty() {
                return Err(config_err(format!(
                    "Ingress route '{}' needs a source",
                    route.path
                )));
            }
            if !paths.insert(route.path.as_str()) {
                return Err(config_err(format!("Duplicate ingress path '{}'", route.path)));
            }
        }
        if self.ingress.max_body_bytes == 0 {
            return Err(config_err("ingress.max_body_bytes must be positive"));
        }

        let policies = std::iter::once(&self.remediation.policy)
            .chain(self.remediation.policies.values());
        for policy in policies {
            policy
                .validate()
                .map_err(|e| config_err(format!("Retry policy: {}", e)))?;
        }

        Ok(())
    }

    fn check_forwarding_cycles(&self) -> Result<()> {
        let next: HashMap<&str, &str> = self
            .stages
            .iter()
            .filter_map(|s| match &s.deliver_to {
                DeliverTo::Stage(to) => Some((s.name.as_str(), to.as_str())),
                _ => None,
            })
            .collect();

        for start in next.keys() {
            let mut current = *start;
            for _ in 0..next.len() {
                match next.get(current) {
                    Some(&to) if to == *start => {
                        return Err(config_err(format!(
                            "Stage '{}' forwards back into itself",
                            start
                        )));
                    }
                    Some(&to) => current = to,
                    None => break,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Pattern;

    const EXAMPLE: &str = r#"
        [ingress]
        port = 9000

        [[ingress.routes]]
        path = "/events/public"
        source = "api.rest.public"

        [[ingress.routes]]
        path = "/events/lambda"
        source = "api.rest.lambda"
        type = "invoke"

        [[stages]]
        name = "insertion"
        deliver_to = { stage = "debuffering" }
        workers = 2

        [[stages]]
        name = "debuffering"
        deliver_to = { sink = "table" }
        max_receive_count = 3

        [[sinks]]
        name = "table"
        kind = "store"

        [[sinks]]
        name = "all-events"
        kind = "log"

        [[sinks]]
        name = "target"
        kind = "topic"
        topic = "pipeline.target"

        [[subscriptions]]
        name = "public"
        source = { exact = "api.rest.public" }
        target = { stage = "insertion" }

        [[subscriptions]]
        name = "log-all"
        source = "any"
        target = { sink = "all-events" }

        [router]
        unmatched = { route = { sink = "all-events" } }

        [shutdown]
        drain_timeout_secs = 5

        [remediation]
        enabled = true
        targets = ["bucket-1"]

        [remediation.policy]
        max_attempts = 3
        retry_interval_seconds = 10
    "#;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config.ingress.bind_address(), "127.0.0.1:8080");
        assert_eq!(config.ingress.max_body_bytes, 256 * 1024);
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.notifier, NotifierConfig::Memory);
        assert_eq!(config.router.unmatched, UnmatchedPolicy::Discard);
        assert_eq!(config.shutdown.drain_timeout(), Duration::from_secs(30));
        assert_eq!(config.remediation.policy, RetryPolicy::default());
        assert!(!config.remediation.enabled);
    }

    #[test]
    fn test_full_config() {
        let config = PipelineConfig::from_toml_str(EXAMPLE).unwrap();
        assert_eq!(config.ingress.port, 9000);
        assert_eq!(config.ingress.routes[0].event_type, "request");
        assert_eq!(config.ingress.routes[1].event_type, "invoke");

        let insertion = &config.stages[0];
        assert_eq!(insertion.deliver_to, DeliverTo::Stage("debuffering".into()));
        assert_eq!(insertion.consumer_settings().workers, 2);
        assert_eq!(insertion.queue_config().max_receive_count, 5);
        assert_eq!(config.stages[1].queue_config().max_receive_count, 3);

        assert_eq!(
            config.sinks[0].kind,
            SinkKind::Store {
                key_prefix: "events/".into()
            }
        );
        assert_eq!(
            config.sinks[2].kind,
            SinkKind::Topic {
                topic: "pipeline.target".into()
            }
        );

        let table = config.routing_table();
        assert_eq!(table.subscriptions()[0].source, Pattern::exact("api.rest.public"));
        assert_eq!(table.subscriptions()[1].source, Pattern::Any);
        assert_eq!(
            config.router.unmatched,
            UnmatchedPolicy::Route(Target::Sink("all-events".into()))
        );

        assert_eq!(config.remediation.policy.max_attempts, 3);
        assert_eq!(config.remediation.policy.retry_interval_seconds, 10);
        assert!(config.remediation.policy.automatic);
    }

    #[test]
    fn test_rejects_unknown_target() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [[subscriptions]]
            name = "a"
            source = "any"
            target = { sink = "missing" }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_stage_bounds() {
        let mut config = PipelineConfig::from_toml_str(EXAMPLE).unwrap();
        config.stages[0].max_receive_count = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::from_toml_str(EXAMPLE).unwrap();
        config.stages[1].workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_forwarding_cycle() {
        let mut config = PipelineConfig::from_toml_str(EXAMPLE).unwrap();
        config.stages[1].deliver_to = DeliverTo::Stage("insertion".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("forwards back into itself"));
    }

    #[test]
    fn test_rejects_duplicate_names_and_paths() {
        let mut config = PipelineConfig::from_toml_str(EXAMPLE).unwrap();
        config.sinks[1].name = "table".into();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::from_toml_str(EXAMPLE).unwrap();
        config.ingress.routes[1].path = "/events/public".into();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::from_toml_str(EXAMPLE).unwrap();
        config.ingress.routes[0].path = "/health".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_intervals() {
        let mut config = PipelineConfig::from_toml_str(EXAMPLE).unwrap();
        config.stages[0].visibility_timeout_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::from_toml_str(EXAMPLE).unwrap();
        config.stages[0].dedup_window_secs = MAX_DEDUP_WINDOW_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::from_toml_str(EXAMPLE).unwrap();
        config.remediation.policy.retry_interval_seconds = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry_interval_seconds"));

        // Unvalidated values are clamped instead of wrapping
        let mut stage = StageConfig::new("s", DeliverTo::Router);
        stage.visibility_timeout_secs = u64::MAX;
        stage.dedup_window_secs = u64::MAX;
        assert_eq!(
            stage.consumer_settings().visibility_timeout,
            chrono::Duration::seconds(MAX_VISIBILITY_TIMEOUT_SECS as i64)
        );
        assert!(stage.queue_config().dedup_window > chrono::Duration::zero());
    }

    #[test]
    fn test_jetstream_stage_and_transform() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [[stages]]
            name = "insertion"
            deliver_to = { transform = { source = "application.lambda", store = "table" } }
            visibility_timeout_secs = 45
            queue = { kind = "jetstream", url = "nats://127.0.0.1:4222", storage = "memory" }

            [[sinks]]
            name = "table"
            kind = "store"
            "#,
        )
        .unwrap();

        let stage = &config.stages[0];
        assert_eq!(
            stage.deliver_to,
            DeliverTo::Transform(TransformConfig {
                source: "application.lambda".into(),
                store: Some("table".into()),
            })
        );
        let settings = stage.jetstream_settings().unwrap();
        assert_eq!(settings.stream_name, "PIPELINE_INSERTION");
        assert_eq!(settings.subject, "a3s.pipeline.stage.insertion");
        assert_eq!(settings.ack_wait, Duration::from_secs(45));
        assert_eq!(settings.storage, JetStreamStorage::Memory);

        assert!(StageConfig::new("x", DeliverTo::Router)
            .jetstream_settings()
            .is_none());
    }

    #[test]
    fn test_rejects_transform_into_unknown_sink() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [[stages]]
            name = "insertion"
            deliver_to = { transform = { source = "application.lambda", store = "missing" } }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("undefined sink 'missing'"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, EXAMPLE).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.stages.len(), 2);

        let missing = PipelineConfig::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, PipelineError::Config(_)));
    }
}

//! Event router
//!
//! Pattern-matched fan-out to stages and sinks
//!
//! The routing table is built once at startup and never mutated. Each
//! matching subscription gets its own delivery; deliveries run concurrently
//! and one target failing never stops the others.

use crate::buffer::BufferStage;
use crate::error::{PipelineError, Result};
use crate::sink::Sink;
use crate::types::Envelope;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// String matcher used by subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    /// Matches one exact value
    Exact(String),
    /// Matches values starting with the prefix
    Prefix(String),
    /// Matches everything
    Any,
}

impl Pattern {
    pub fn exact(value: impl Into<String>) -> Self {
        Pattern::Exact(value.into())
    }

    /// Prefix matcher; the empty prefix is `Any`
    pub fn prefix(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            Pattern::Any
        } else {
            Pattern::Prefix(value)
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Exact(expected) => value == expected,
            Pattern::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Pattern::Any => true,
        }
    }

    /// Whether this pattern accepts every value
    pub fn is_catch_all(&self) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Prefix(prefix) => prefix.is_empty(),
            Pattern::Exact(_) => false,
        }
    }
}

/// Where a matched event is delivered
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Enqueue into a buffer stage
    Stage(String),
    /// Write to a sink
    Sink(String),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Stage(name) => write!(f, "stage:{}", name),
            Target::Sink(name) => write!(f, "sink:{}", name),
        }
    }
}

/// One routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub name: String,
    pub source: Pattern,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<Pattern>,
    pub target: Target,
}

impl Subscription {
    pub fn matches(&self, envelope: &Envelope) -> bool {
        self.source.matches(envelope.source())
            && self
                .event_type
                .as_ref()
                .map_or(true, |p| p.matches(envelope.event_type()))
    }

    /// Audit/log-everything subscriptions; their failures never fail a publish
    pub fn is_catch_all(&self) -> bool {
        self.source.is_catch_all()
            && self.event_type.as_ref().map_or(true, Pattern::is_catch_all)
    }
}

/// What to do with an event no subscription matched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedPolicy {
    /// Drop with a warning
    #[default]
    Discard,
    /// Deliver to a fallback target
    Route(Target),
}

/// Immutable routing configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    subscriptions: Vec<Subscription>,
    unmatched: UnmatchedPolicy,
}

impl RoutingTable {
    pub fn new(subscriptions: Vec<Subscription>, unmatched: UnmatchedPolicy) -> Self {
        Self {
            subscriptions,
            unmatched,
        }
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn unmatched(&self) -> &UnmatchedPolicy {
        &self.unmatched
    }

    /// Subscriptions matching an envelope, in table order
    pub fn matching<'a>(&'a self, envelope: &'a Envelope) -> impl Iterator<Item = &'a Subscription> {
        self.subscriptions.iter().filter(move |s| s.matches(envelope))
    }

    fn targets(&self) -> impl Iterator<Item = &Target> {
        self.subscriptions
            .iter()
            .map(|s| &s.target)
            .chain(match &self.unmatched {
                UnmatchedPolicy::Route(t) => Some(t),
                UnmatchedPolicy::Discard => None,
            })
    }
}

/// A delivery that failed for one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub subscription: String,
    pub target: Target,
    pub catch_all: bool,
    pub error: String,
}

/// Per-publish delivery summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Number of subscriptions matched
    pub matched: usize,
    /// Subscriptions whose target accepted the event
    pub delivered: Vec<String>,
    /// Subscriptions whose target failed
    pub failed: Vec<DeliveryFailure>,
    /// Whether the unmatched policy handled the event
    pub unmatched: bool,
}

/// Routes envelopes to buffer stages and sinks
pub struct EventRouter {
    table: RoutingTable,
    stages: HashMap<String, Arc<BufferStage>>,
    sinks: HashMap<String, Arc<dyn Sink>>,
}

impl EventRouter {
    /// Build a router, checking every target in the table exists
    pub fn new(
        table: RoutingTable,
        stages: HashMap<String, Arc<BufferStage>>,
        sinks: HashMap<String, Arc<dyn Sink>>,
    ) -> Result<Self> {
        for target in table.targets() {
            let known = match target {
                Target::Stage(name) => stages.contains_key(name),
                Target::Sink(name) => sinks.contains_key(name),
            };
            if !known {
                return Err(PipelineError::Config(format!(
                    "Routing target '{}' is not defined",
                    target
                )));
            }
        }

        Ok(Self {
            table,
            stages,
            sinks,
        })
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Deliver an envelope to every matching subscription
    ///
    /// Fails with `Publish` if any non-catch-all delivery failed (after all
    /// deliveries were attempted), or if the unmatched fallback failed.
    /// Catch-all failures are reported in the log only.
    pub async fn publish(&self, envelope: &Envelope) -> Result<RouteReport> {
        let matched: Vec<&Subscription> = self.table.matching(envelope).collect();

        if matched.is_empty() {
            return self.publish_unmatched(envelope).await;
        }

        let deliveries = matched.iter().map(|sub| async move {
            let result = self.deliver(&sub.target, envelope).await;
            (*sub, result)
        });
        let results = join_all(deliveries).await;

        let mut report = RouteReport {
            matched: matched.len(),
            ..Default::default()
        };

        for (sub, result) in results {
            match result {
                Ok(()) => report.delivered.push(sub.name.clone()),
                Err(e) => {
                    let catch_all = sub.is_catch_all();
                    tracing::warn!(
                        event_id = %envelope.id(),
                        subscription = %sub.name,
                        target = %sub.target,
                        catch_all,
                        error = %e,
                        "Delivery failed"
                    );
                    report.failed.push(DeliveryFailure {
                        subscription: sub.name.clone(),
                        target: sub.target.clone(),
                        catch_all,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!(
            event_id = %envelope.id(),
            source = %envelope.source(),
            matched = report.matched,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Event routed"
        );

        let business_failures: Vec<&DeliveryFailure> =
            report.failed.iter().filter(|f| !f.catch_all).collect();
        if !business_failures.is_empty() {
            let reason = business_failures
                .iter()
                .map(|f| format!("{} ({}): {}", f.subscription, f.target, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PipelineError::Publish {
                event_id: envelope.id().to_string(),
                reason,
            });
        }

        Ok(report)
    }

    async fn publish_unmatched(&self, envelope: &Envelope) -> Result<RouteReport> {
        match &self.table.unmatched {
            UnmatchedPolicy::Discard => {
                tracing::warn!(
                    event_id = %envelope.id(),
                    source = %envelope.source(),
                    event_type = %envelope.event_type(),
                    "No subscription matched; event discarded"
                );
                Ok(RouteReport::default())
            }
            UnmatchedPolicy::Route(target) => {
                self.deliver(target, envelope)
                    .await
                    .map_err(|e| PipelineError::Publish {
                        event_id: envelope.id().to_string(),
                        reason: format!("unmatched fallback {}: {}", target, e),
                    })?;
                Ok(RouteReport {
                    unmatched: true,
                    ..Default::default()
                })
            }
        }
    }

    async fn deliver(&self, target: &Target, envelope: &Envelope) -> Result<()> {
        match target {
            Target::Stage(name) => {
                let stage = self
                    .stages
                    .get(name)
                    .ok_or_else(|| PipelineError::NotFound(format!("stage {}", name)))?;
                stage.enqueue(envelope).await.map(|_| ())
            }
            Target::Sink(name) => {
                let sink = self
                    .sinks
                    .get(name)
                    .ok_or_else(|| PipelineError::NotFound(format!("sink {}", name)))?;
                sink.write(envelope).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use async_trait::async_trait;

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        async fn write(&self, _envelope: &Envelope) -> Result<()> {
            Err(PipelineError::Sink {
                sink: "broken".into(),
                reason: "unavailable".into(),
            })
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    fn sub(name: &str, source: Pattern, target: Target) -> Subscription {
        Subscription {
            name: name.into(),
            source,
            event_type: None,
            target,
        }
    }

    fn sinks(entries: Vec<(&str, Arc<dyn Sink>)>) -> HashMap<String, Arc<dyn Sink>> {
        entries
            .into_iter()
            .map(|(name, sink)| (name.to_string(), sink))
            .collect()
    }

    #[test]
    fn test_pattern_matching() {
        assert!(Pattern::exact("api.rest.public").matches("api.rest.public"));
        assert!(!Pattern::exact("api.rest.public").matches("api.rest.publicx"));
        assert!(Pattern::prefix("api.").matches("api.rest.lambda"));
        assert!(!Pattern::prefix("api.").matches("application.lambda"));
        assert!(Pattern::Any.matches(""));
        assert!(Pattern::Prefix(String::new()).matches("anything"));
    }

    #[test]
    fn test_empty_prefix_is_catch_all() {
        assert_eq!(Pattern::prefix(""), Pattern::Any);
        assert!(Pattern::Prefix(String::new()).is_catch_all());
        assert!(!Pattern::prefix("api").is_catch_all());
    }

    #[test]
    fn test_subscription_type_filter() {
        let s = Subscription {
            name: "transformed".into(),
            source: Pattern::Any,
            event_type: Some(Pattern::exact("transformed")),
            target: Target::Sink("x".into()),
        };
        assert!(s.matches(&Envelope::new("a", "transformed", "{}")));
        assert!(!s.matches(&Envelope::new("a", "request", "{}")));
        assert!(!s.is_catch_all());
    }

    #[test]
    fn test_pattern_serde_shapes() {
        let p: Pattern = serde_json::from_str(r#"{"prefix":"api."}"#).unwrap();
        assert_eq!(p, Pattern::prefix("api."));
        let p: Pattern = serde_json::from_str(r#""any""#).unwrap();
        assert_eq!(p, Pattern::Any);
        let t: Target = serde_json::from_str(r#"{"stage":"insertion"}"#).unwrap();
        assert_eq!(t, Target::Stage("insertion".into()));
    }

    #[test]
    fn test_router_rejects_unknown_target() {
        let table = RoutingTable::new(
            vec![sub("a", Pattern::Any, Target::Sink("missing".into()))],
            UnmatchedPolicy::Discard,
        );
        let err = EventRouter::new(table, HashMap::new(), HashMap::new()).err().unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn test_fan_out_to_exact_and_catch_all() {
        let business = Arc::new(MemorySink::new("business"));
        let audit = Arc::new(MemorySink::new("audit"));
        let table = RoutingTable::new(
            vec![
                sub("public", Pattern::exact("api.rest.public"), Target::Sink("business".into())),
                sub("log-all", Pattern::prefix(""), Target::Sink("audit".into())),
            ],
            UnmatchedPolicy::Discard,
        );
        let router = EventRouter::new(
            table,
            HashMap::new(),
            sinks(vec![("business", business.clone() as Arc<dyn Sink>), ("audit", audit.clone() as Arc<dyn Sink>)]),
        )
        .unwrap();

        let env = Envelope::new("api.rest.public", "request", r#"{"x":1}"#);
        let report = router.publish(&env).await.unwrap();
        assert_eq!(report.matched, 2);
        assert_eq!(business.received().await, vec![env.clone()]);
        assert_eq!(audit.received().await, vec![env.clone()]);

        let other = Envelope::new("api.rest.lambda", "request", "{}");
        assert_eq!(router.publish(&other).await.unwrap().matched, 1);
        assert_eq!(business.len().await, 1);
        assert_eq!(audit.len().await, 2);
    }

    #[tokio::test]
    async fn test_catch_all_failure_is_isolated() {
        let business = Arc::new(MemorySink::new("business"));
        let table = RoutingTable::new(
            vec![
                sub("log-all", Pattern::Any, Target::Sink("broken".into())),
                sub("public", Pattern::exact("api.rest.public"), Target::Sink("business".into())),
            ],
            UnmatchedPolicy::Discard,
        );
        let router = EventRouter::new(
            table,
            HashMap::new(),
            sinks(vec![("business", business.clone() as Arc<dyn Sink>), ("broken", Arc::new(FailingSink) as Arc<dyn Sink>)]),
        )
        .unwrap();

        let report = router
            .publish(&Envelope::new("api.rest.public", "request", "{}"))
            .await
            .unwrap();
        assert_eq!(report.matched, 2);
        assert_eq!(report.delivered, vec!["public".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].catch_all);
        assert_eq!(business.len().await, 1);
    }

    #[tokio::test]
    async fn test_business_failure_fails_publish_but_others_still_delivered() {
        let audit = Arc::new(MemorySink::new("audit"));
        let table = RoutingTable::new(
            vec![
                sub("public", Pattern::exact("api.rest.public"), Target::Sink("broken".into())),
                sub("log-all", Pattern::Any, Target::Sink("audit".into())),
            ],
            UnmatchedPolicy::Discard,
        );
        let router = EventRouter::new(
            table,
            HashMap::new(),
            sinks(vec![("audit", audit.clone() as Arc<dyn Sink>), ("broken", Arc::new(FailingSink) as Arc<dyn Sink>)]),
        )
        .unwrap();

        let err = router
            .publish(&Envelope::new("api.rest.public", "request", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Publish { .. }));
        assert!(err.is_retryable());
        assert_eq!(audit.len().await, 1);
    }

    #[tokio::test]
    async fn test_unmatched_policies() {
        let fallback = Arc::new(MemorySink::new("fallback"));
        let table = RoutingTable::new(
            vec![sub("public", Pattern::exact("api.rest.public"), Target::Sink("fallback".into()))],
            UnmatchedPolicy::Discard,
        );
        let router = EventRouter::new(
            table,
            HashMap::new(),
            sinks(vec![("fallback", fallback.clone() as Arc<dyn Sink>)]),
        )
        .unwrap();
        let report = router.publish(&Envelope::new("other", "t", "{}")).await.unwrap();
        assert_eq!(report.matched, 0);
        assert!(!report.unmatched);
        assert!(fallback.is_empty().await);

        let table = RoutingTable::new(vec![], UnmatchedPolicy::Route(Target::Sink("fallback".into())));
        let router = EventRouter::new(
            table,
            HashMap::new(),
            sinks(vec![("fallback", fallback.clone() as Arc<dyn Sink>)]),
        )
        .unwrap();
        let report = router.publish(&Envelope::new("other", "t", "{}")).await.unwrap();
        assert_eq!(report.matched, 0);
        assert!(report.unmatched);
        assert_eq!(fallback.len().await, 1);
    }
}

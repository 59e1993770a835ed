//! Core data types for the a3s-pipeline system
//!
//! All types use camelCase JSON serialization for wire compatibility.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical internal representation of one event
///
/// Immutable once built: fields are private and the only mutators are the
/// consuming `with_*` builders used before the envelope is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique event identifier (evt-<uuid>), assigned at ingress
    id: String,

    /// Origin of the event (e.g., "api.rest.public")
    source: String,

    /// Event type (e.g., "request")
    #[serde(rename = "type")]
    event_type: String,

    /// Opaque payload, passed through verbatim
    detail: String,

    /// When the event entered the pipeline
    occurred_at: DateTime<Utc>,

    /// Opaque tracing propagation fields
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    trace_context: BTreeMap<String, String>,
}

impl Envelope {
    /// Create a new envelope with a fresh id and the current time
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::at(source, event_type, detail, Utc::now())
    }

    /// Create a new envelope with a fresh id and an explicit timestamp
    pub fn at(
        source: impl Into<String>,
        event_type: impl Into<String>,
        detail: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            source: source.into(),
            event_type: event_type.into(),
            detail: detail.into(),
            occurred_at,
            trace_context: BTreeMap::new(),
        }
    }

    /// Replace the generated id with a caller-derived one
    ///
    /// Used when the same logical event may be built twice (an ingress retry
    /// carrying an idempotency key, a transform replayed after redelivery) so
    /// that stage deduplication recognises the repeat.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a trace propagation entry
    pub fn with_trace(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.trace_context.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn trace_context(&self) -> &BTreeMap<String, String> {
        &self.trace_context
    }
}

/// Deterministic envelope id for a name, e.g. `"/events/public:key-1"`
pub fn derived_event_id(name: &str) -> String {
    format!("evt-{}", uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()))
}

/// Receipt token identifying one delivery of a buffered message
///
/// A new handle is minted on every delivery; handles from earlier deliveries
/// are rejected once the message has been redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHandle(String);

impl MessageHandle {
    /// Mint a fresh receipt handle
    pub fn generate() -> Self {
        Self(format!("rcpt-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer by a buffer stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedMessage {
    /// Receipt handle for this delivery
    pub handle: MessageHandle,

    /// The buffered event
    pub envelope: Envelope,

    /// Number of times this message has been delivered (1 on first delivery)
    pub receive_count: u32,

    /// When the message was first accepted by the stage
    pub first_enqueued_at: DateTime<Utc>,

    /// Deduplication key the message was enqueued under
    pub dedup_key: String,

    /// Stage that owns the message
    pub stage: String,
}

/// Compliance status of a monitored target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    Compliant,
    NonCompliant,
    #[default]
    Unknown,
}

impl std::fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplianceStatus::Compliant => write!(f, "COMPLIANT"),
            ComplianceStatus::NonCompliant => write!(f, "NON_COMPLIANT"),
            ComplianceStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Persisted compliance state of one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceRecord {
    pub target_id: String,
    pub status: ComplianceStatus,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl ComplianceRecord {
    /// A never-evaluated record
    pub fn unknown(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            status: ComplianceStatus::Unknown,
            last_evaluated_at: None,
            last_transition_at: None,
        }
    }
}

/// Retry configuration for one target/rule pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of attempts in one sequence
    #[serde(default = "default_max_attempts", alias = "max_attempts")]
    pub max_attempts: u32,

    /// Delay between a failed attempt and the next one
    #[serde(default = "default_retry_interval_seconds", alias = "retry_interval_seconds")]
    pub retry_interval_seconds: u64,

    /// Whether a compliance violation triggers remediation on its own
    #[serde(default = "default_automatic")]
    pub automatic: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_interval_seconds() -> u64 {
    60
}

fn default_automatic() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_interval_seconds: default_retry_interval_seconds(),
            automatic: default_automatic(),
        }
    }
}

/// Longest accepted retry interval (one year)
pub const MAX_RETRY_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

impl RetryPolicy {
    /// Interval between attempts, clamped to `MAX_RETRY_INTERVAL_SECS`
    pub fn retry_interval(&self) -> Duration {
        seconds_clamped(self.retry_interval_seconds, MAX_RETRY_INTERVAL_SECS)
    }

    /// Reject policies that can never run or would overflow the schedule
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.retry_interval_seconds > MAX_RETRY_INTERVAL_SECS {
            return Err(format!(
                "retry_interval_seconds {} exceeds the maximum of {}",
                self.retry_interval_seconds, MAX_RETRY_INTERVAL_SECS
            ));
        }
        Ok(())
    }
}

/// `secs` as a chrono duration, never above `max_secs`
pub fn seconds_clamped(secs: u64, max_secs: u64) -> Duration {
    let secs = i64::try_from(secs.min(max_secs)).unwrap_or(i64::MAX);
    Duration::try_seconds(secs).unwrap_or(Duration::MAX)
}

/// Outcome of a single remediation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Pending,
    Succeeded,
    Failed,
}

/// One try of a corrective action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationAttempt {
    pub target_id: String,
    pub sequence_id: String,
    /// 1-based, contiguous within a sequence
    pub attempt_number: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a remediation sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SequenceState {
    Running,
    Succeeded,
    FailedExhausted,
    Cancelled,
}

impl SequenceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SequenceState::Running)
    }
}

/// Persisted state machine driving the attempts for one triggered remediation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationSequence {
    pub sequence_id: String,
    pub target_id: String,
    pub policy: RetryPolicy,
    pub state: SequenceState,
    pub attempts: Vec<RemediationAttempt>,
    /// When the next attempt is due; `None` once terminal
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Exhausted but the operator alert has not been delivered yet
    #[serde(default)]
    pub alert_pending: bool,
}

impl RemediationSequence {
    /// Start a sequence whose first attempt is due at `now`
    pub fn start(target_id: impl Into<String>, policy: RetryPolicy, now: DateTime<Utc>) -> Self {
        let target_id = target_id.into();
        let sequence_id = format!("seq-{}", uuid::Uuid::new_v4());
        Self {
            attempts: vec![RemediationAttempt {
                target_id: target_id.clone(),
                sequence_id: sequence_id.clone(),
                attempt_number: 1,
                started_at: None,
                outcome: AttemptOutcome::Pending,
                error: None,
                next_retry_at: Some(now),
            }],
            sequence_id,
            target_id,
            policy,
            state: SequenceState::Running,
            next_retry_at: Some(now),
            created_at: now,
            updated_at: now,
            alert_pending: false,
        }
    }

    /// The attempt currently pending, if any
    pub fn current_attempt(&self) -> Option<&RemediationAttempt> {
        self.attempts
            .last()
            .filter(|a| a.outcome == AttemptOutcome::Pending)
    }

    /// Whether the pending attempt is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == SequenceState::Running && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_creation() {
        let env = Envelope::new("api.rest.public", "request", r#"{"x":1}"#);

        assert!(env.id().starts_with("evt-"));
        assert_eq!(env.source(), "api.rest.public");
        assert_eq!(env.event_type(), "request");
        assert_eq!(env.detail(), r#"{"x":1}"#);
        assert!(env.trace_context().is_empty());
    }

    #[test]
    fn test_envelope_ids_unique() {
        let a = Envelope::new("s", "t", "{}");
        let b = Envelope::new("s", "t", "{}");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::new("api.rest.public", "request", r#"{"x":1}"#);
        let json = serde_json::to_value(&env).unwrap();

        assert_eq!(json["id"], env.id());
        assert_eq!(json["source"], "api.rest.public");
        assert_eq!(json["type"], "request");
        assert_eq!(json["detail"], r#"{"x":1}"#);
        assert!(json["occurredAt"].is_string());
        assert!(json.get("traceContext").is_none());
    }

    #[test]
    fn test_envelope_trace_context_serialized_when_present() {
        let env = Envelope::new("s", "t", "{}").with_trace("traceparent", "00-abc-def-01");
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"traceContext\":{\"traceparent\":\"00-abc-def-01\"}"));

        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_envelope_without_trace_context_deserializes() {
        let json = r#"{
            "id": "evt-123",
            "source": "api.rest.lambda",
            "type": "request",
            "detail": "\"hello\"",
            "occurredAt": "2024-01-01T00:00:00Z"
        }"#;

        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.id(), "evt-123");
        assert_eq!(env.detail(), "\"hello\"");
        assert!(env.trace_context().is_empty());
    }

    #[test]
    fn test_message_handle_generate() {
        let h = MessageHandle::generate();
        assert!(h.as_str().starts_with("rcpt-"));
        assert_ne!(h, MessageHandle::generate());
    }

    #[test]
    fn test_compliance_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ComplianceStatus::NonCompliant).unwrap(),
            "\"NON_COMPLIANT\""
        );
        assert_eq!(ComplianceStatus::default(), ComplianceStatus::Unknown);
        assert_eq!(ComplianceStatus::Compliant.to_string(), "COMPLIANT");
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.retry_interval_seconds, 60);
        assert!(policy.automatic);
        assert_eq!(policy.retry_interval(), Duration::seconds(60));
    }

    #[test]
    fn test_retry_policy_bounds() {
        let huge = RetryPolicy {
            retry_interval_seconds: u64::MAX,
            ..Default::default()
        };
        assert!(huge.validate().is_err());
        // Clamped instead of wrapping negative or panicking
        assert_eq!(
            huge.retry_interval(),
            Duration::seconds(MAX_RETRY_INTERVAL_SECS as i64)
        );

        let never = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(never.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_derived_event_id_is_stable() {
        let a = derived_event_id("/events/public:key-1");
        assert!(a.starts_with("evt-"));
        assert_eq!(a, derived_event_id("/events/public:key-1"));
        assert_ne!(a, derived_event_id("/events/public:key-2"));

        let env = Envelope::new("s", "t", "{}").with_id(a.clone());
        assert_eq!(env.id(), a);
    }

    #[test]
    fn test_retry_policy_partial_deserialize() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"maxAttempts": 3}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.retry_interval_seconds, 60);
        assert!(policy.automatic);
    }

    #[test]
    fn test_sequence_start() {
        let now = Utc::now();
        let seq = RemediationSequence::start("stack-a", RetryPolicy::default(), now);

        assert!(seq.sequence_id.starts_with("seq-"));
        assert_eq!(seq.state, SequenceState::Running);
        assert_eq!(seq.attempts.len(), 1);
        assert_eq!(seq.attempts[0].attempt_number, 1);
        assert_eq!(seq.attempts[0].sequence_id, seq.sequence_id);
        assert!(seq.is_due(now));
        assert!(!seq.is_due(now - Duration::seconds(1)));
        assert_eq!(seq.current_attempt().unwrap().attempt_number, 1);
    }

    #[test]
    fn test_sequence_state_terminal() {
        assert!(!SequenceState::Running.is_terminal());
        assert!(SequenceState::Succeeded.is_terminal());
        assert!(SequenceState::FailedExhausted.is_terminal());
        assert!(SequenceState::Cancelled.is_terminal());
    }
}

//! Action executor
//!
//! Bounded-retry remediation as a persisted state machine
//!
//! A triggered remediation becomes a `RemediationSequence` stored under
//! `remediation/{target}`. The scheduler (`run` / `run_due`) executes every
//! due attempt, recording it as started before the action runs and as
//! succeeded or failed afterwards. A failed attempt schedules the next one
//! `retry_interval_seconds` later until `max_attempts` is reached.
//!
//! At most one non-terminal sequence exists per target: triggering while one
//! is running coalesces into it. All writes for a target happen under its
//! `KeyedLocks` entry and use `put_if_version`, so the lock is held for the
//! whole duration of an action and `cancel` can only land between attempts.
//! `run` gives every target's attempt its own task, so a slow action only
//! delays its own target.
//!
//! The exhausted-retries alert is an outbox: the sequence is persisted with
//! `alert_pending` set and the flag is only cleared once a publish succeeds.
//! Every scheduler pass re-publishes whatever is still pending.

use crate::clock::SharedClock;
use crate::error::{PipelineError, Result};
use crate::lock::KeyedLocks;
use crate::notify::{Notification, Notifier, OPERATOR_TOPIC, REMEDIATION_TOPIC};
use crate::store::{get_json, put_json, KvStore};
use crate::types::{
    AttemptOutcome, RemediationAttempt, RemediationSequence, RetryPolicy, SequenceState,
};
use async_trait::async_trait;
use futures::future::{join_all, ready};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Key prefix for persisted sequences
pub const SEQUENCE_PREFIX: &str = "remediation/";

/// Key prefix for undelivered alerts of sequences replaced by a new trigger
pub const ALERT_OUTBOX_PREFIX: &str = "remediation-alerts/";

const TRIGGER_RETRIES: usize = 3;

/// The corrective action for a non-compliant target
///
/// Attempts are persisted before the action runs, so after a crash the same
/// attempt number may execute twice; implementations must tolerate that.
#[async_trait]
pub trait RemediationAction: Send + Sync {
    async fn execute(&self, target_id: &str, attempt: &RemediationAttempt) -> Result<()>;
}

/// Result of `trigger`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new sequence was persisted with its first attempt due now
    Started(String),
    /// A sequence was already running; no new one was created
    Coalesced(String),
}

impl TriggerOutcome {
    pub fn sequence_id(&self) -> &str {
        match self {
            TriggerOutcome::Started(id) | TriggerOutcome::Coalesced(id) => id,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, TriggerOutcome::Started(_))
    }
}

type RunningSet = Arc<Mutex<HashSet<String>>>;

/// Marks a target as having an attempt in progress until dropped
struct RunningClaim {
    running: RunningSet,
    target_id: String,
}

impl RunningClaim {
    fn acquire(running: &RunningSet, target_id: &str) -> Option<Self> {
        let mut set = running.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(target_id.to_string()) {
            return None;
        }
        Some(Self {
            running: running.clone(),
            target_id: target_id.to_string(),
        })
    }
}

impl Drop for RunningClaim {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.target_id);
    }
}

/// Drives remediation sequences for every target
pub struct ActionExecutor {
    store: Arc<dyn KvStore>,
    notifier: Arc<dyn Notifier>,
    action: Arc<dyn RemediationAction>,
    clock: SharedClock,
    locks: KeyedLocks,
    running: RunningSet,
    wake: Notify,
}

fn sequence_key(target_id: &str) -> String {
    format!("{}{}", SEQUENCE_PREFIX, target_id)
}

fn outbox_key(sequence_id: &str) -> String {
    format!("{}{}", ALERT_OUTBOX_PREFIX, sequence_id)
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn KvStore>,
        notifier: Arc<dyn Notifier>,
        action: Arc<dyn RemediationAction>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            notifier,
            action,
            clock,
            locks: KeyedLocks::new(),
            running: Arc::new(Mutex::new(HashSet::new())),
            wake: Notify::new(),
        }
    }

    /// Start a sequence for `target_id`, or coalesce into a running one
    pub async fn trigger(&self, target_id: &str, policy: RetryPolicy) -> Result<TriggerOutcome> {
        policy.validate().map_err(PipelineError::Validation)?;

        let key = sequence_key(target_id);
        let _guard = self.locks.lock(target_id).await;

        let mut tries = 0;
        let sequence = loop {
            let existing = get_json::<RemediationSequence>(self.store.as_ref(), &key).await?;
            let expected = match existing {
                Some((seq, _)) if !seq.state.is_terminal() => {
                    tracing::debug!(
                        target_id = %target_id,
                        sequence_id = %seq.sequence_id,
                        "Remediation already running; coalesced"
                    );
                    return Ok(TriggerOutcome::Coalesced(seq.sequence_id));
                }
                Some((seq, version)) => {
                    if seq.alert_pending {
                        // Keep the undelivered alert once its sequence is replaced
                        put_json(self.store.as_ref(), &outbox_key(&seq.sequence_id), &seq, None)
                            .await
                            .or_else(|e| match e {
                                PipelineError::VersionConflict { .. } => Ok(0),
                                e => Err(e),
                            })?;
                    }
                    Some(version)
                }
                None => None,
            };

            let sequence = RemediationSequence::start(target_id, policy, self.clock.now());
            match put_json(self.store.as_ref(), &key, &sequence, expected).await {
                Ok(_) => break sequence,
                Err(PipelineError::VersionConflict { .. }) if tries < TRIGGER_RETRIES => {
                    tries += 1;
                }
                Err(e) => return Err(e),
            }
        };

        tracing::info!(
            target_id = %target_id,
            sequence_id = %sequence.sequence_id,
            max_attempts = policy.max_attempts,
            retry_interval_seconds = policy.retry_interval_seconds,
            "Remediation triggered"
        );
        self.wake.notify_one();
        Ok(TriggerOutcome::Started(sequence.sequence_id))
    }

    /// Trigger and stream the sequence's attempt updates until it is terminal
    ///
    /// Each attempt appears twice: once `PENDING` with `started_at` set, and
    /// once with its final outcome. Attempts only run while the scheduler
    /// (`run` or `run_due`) is being driven. If the subscription falls behind
    /// and updates are lost, the stream yields `PipelineError::Lagged` and
    /// ends; `sequence` still has the authoritative state.
    pub async fn remediate(
        &self,
        target_id: &str,
        policy: RetryPolicy,
    ) -> Result<BoxStream<'static, Result<RemediationAttempt>>> {
        // Subscribe first so no update published after the trigger is missed
        let updates = self.notifier.subscribe(REMEDIATION_TOPIC).await?;
        let sequence_id = self.trigger(target_id, policy).await?.sequence_id().to_string();

        // Inner `None` marks the end of the sequence
        let stream = updates
            .filter_map(move |item| {
                let wanted = sequence_id.clone();
                async move {
                    match item {
                        Ok(Notification::RemediationAttempt(attempt))
                            if attempt.sequence_id == wanted =>
                        {
                            Some(Some(Ok(attempt)))
                        }
                        Ok(Notification::RemediationFinished { sequence_id, .. })
                            if sequence_id == wanted =>
                        {
                            Some(None)
                        }
                        Ok(_) => None,
                        Err(e) => Some(Some(Err(e))),
                    }
                }
            })
            .scan(false, |failed, item| {
                let next = match item {
                    _ if *failed => None,
                    Some(Err(e)) => {
                        *failed = true;
                        Some(Err(e))
                    }
                    other => other,
                };
                ready(next)
            });

        Ok(stream.boxed())
    }

    /// Execute every attempt due now and wait for all of them
    ///
    /// Returns the attempts that finished. Targets run concurrently and one
    /// target's failure never affects another's; targets already being run
    /// by `run` are skipped. Pending alerts are re-published first.
    pub async fn run_due(&self) -> Result<Vec<RemediationAttempt>> {
        self.flush_alerts().await;

        let claims: Vec<RunningClaim> = self
            .due_targets()
            .await?
            .iter()
            .filter_map(|target| RunningClaim::acquire(&self.running, target))
            .collect();

        let results = join_all(claims.iter().map(|claim| self.run_attempt(&claim.target_id))).await;

        let mut finished = Vec::new();
        for (claim, result) in claims.iter().zip(results) {
            match result {
                Ok(Some(attempt)) => finished.push(attempt),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(target_id = %claim.target_id, error = %e, "Remediation attempt not run");
                }
            }
        }
        Ok(finished)
    }

    /// Cancel a running sequence; returns whether one was cancelled
    ///
    /// Waits for an in-progress attempt to finish first.
    pub async fn cancel(&self, target_id: &str) -> Result<bool> {
        let key = sequence_key(target_id);
        let _guard = self.locks.lock(target_id).await;

        let Some((mut seq, version)) =
            get_json::<RemediationSequence>(self.store.as_ref(), &key).await?
        else {
            return Ok(false);
        };
        if seq.state.is_terminal() {
            return Ok(false);
        }

        let now = self.clock.now();
        // The pending attempt never completed; drop it so numbers stay contiguous
        if seq.current_attempt().is_some() {
            seq.attempts.pop();
        }
        seq.state = SequenceState::Cancelled;
        seq.next_retry_at = None;
        seq.updated_at = now;
        put_json(self.store.as_ref(), &key, &seq, Some(version)).await?;

        tracing::info!(
            target_id = %target_id,
            sequence_id = %seq.sequence_id,
            "Remediation cancelled"
        );
        self.publish_finished(&seq).await;
        Ok(true)
    }

    /// Current sequence for a target, terminal or not
    pub async fn sequence(&self, target_id: &str) -> Result<Option<RemediationSequence>> {
        Ok(get_json(self.store.as_ref(), &sequence_key(target_id))
            .await?
            .map(|(seq, _)| seq))
    }

    /// Re-publish exhausted-retry alerts that were never delivered
    ///
    /// Returns how many were delivered on this pass.
    pub async fn flush_alerts(&self) -> usize {
        let mut delivered = 0;

        let sequences = match self.store.scan_prefix(SEQUENCE_PREFIX).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Alert outbox scan failed");
                return 0;
            }
        };
        for (_, row) in sequences {
            let Ok(seq) = serde_json::from_value::<RemediationSequence>(row.value) else {
                continue;
            };
            if seq.alert_pending && self.deliver_pending_alert(&seq.target_id).await {
                delivered += 1;
            }
        }

        let replaced = match self.store.scan_prefix(ALERT_OUTBOX_PREFIX).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Alert outbox scan failed");
                return delivered;
            }
        };
        for (key, row) in replaced {
            let Ok(seq) = serde_json::from_value::<RemediationSequence>(row.value) else {
                continue;
            };
            if self.publish_exhausted(&seq).await {
                match self.store.delete(&key).await {
                    Ok(()) => delivered += 1,
                    Err(e) => tracing::warn!(key = %key, error = %e, "Failed to clear delivered alert"),
                }
            }
        }

        delivered
    }

    /// Scheduler loop: run due attempts every `poll_interval` or when triggered
    ///
    /// Each target's attempt is its own task; a target is never run twice at
    /// once. On cancellation the loop stops scheduling and waits for the
    /// attempts already running to record their outcome.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, cancel: CancellationToken) {
        tracing::info!(poll_interval_ms = poll_interval.as_millis() as u64, "Remediation scheduler started");
        let mut attempts: JoinSet<()> = JoinSet::new();

        while !cancel.is_cancelled() {
            self.flush_alerts().await;

            match self.due_targets().await {
                Ok(due) => {
                    for target in due {
                        let Some(claim) = RunningClaim::acquire(&self.running, &target) else {
                            continue;
                        };
                        let executor = self.clone();
                        attempts.spawn(async move {
                            if let Err(e) = executor.run_attempt(&claim.target_id).await {
                                tracing::warn!(
                                    target_id = %claim.target_id,
                                    error = %e,
                                    "Remediation attempt not run"
                                );
                            }
                        });
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Remediation scan failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    log_join_error(joined);
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        if !attempts.is_empty() {
            tracing::info!(in_flight = attempts.len(), "Waiting for running remediation attempts");
        }
        while let Some(joined) = attempts.join_next().await {
            log_join_error(joined);
        }
        tracing::info!("Remediation scheduler stopped");
    }

    async fn due_targets(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        Ok(self
            .store
            .scan_prefix(SEQUENCE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(_, row)| serde_json::from_value::<RemediationSequence>(row.value).ok())
            .filter(|seq| seq.is_due(now))
            .map(|seq| seq.target_id)
            .collect())
    }

    async fn run_attempt(&self, target_id: &str) -> Result<Option<RemediationAttempt>> {
        let key = sequence_key(target_id);
        let _guard = self.locks.lock(target_id).await;

        let Some((mut seq, version)) =
            get_json::<RemediationSequence>(self.store.as_ref(), &key).await?
        else {
            return Ok(None);
        };
        // Cancelled or rescheduled while waiting for the lock
        if !seq.is_due(self.clock.now()) {
            return Ok(None);
        }

        let started_at = self.clock.now();
        let Some(current) = seq.attempts.last_mut() else {
            return Ok(None);
        };
        current.started_at = Some(started_at);
        let mut attempt = current.clone();
        seq.updated_at = started_at;
        let version = put_json(self.store.as_ref(), &key, &seq, Some(version)).await?;
        self.publish_attempt(&attempt).await;

        tracing::info!(
            target_id = %target_id,
            sequence_id = %seq.sequence_id,
            attempt = attempt.attempt_number,
            max_attempts = seq.policy.max_attempts,
            "Remediation attempt started"
        );

        let result = self.action.execute(target_id, &attempt).await;
        let finished_at = self.clock.now();

        match result {
            Ok(()) => {
                attempt.outcome = AttemptOutcome::Succeeded;
                attempt.next_retry_at = None;
                seq.state = SequenceState::Succeeded;
                seq.next_retry_at = None;
                tracing::info!(
                    target_id = %target_id,
                    sequence_id = %seq.sequence_id,
                    attempt = attempt.attempt_number,
                    "Remediation succeeded"
                );
            }
            Err(e) => {
                attempt.outcome = AttemptOutcome::Failed;
                attempt.error = Some(e.to_string());

                if attempt.attempt_number >= seq.policy.max_attempts {
                    attempt.next_retry_at = None;
                    seq.state = SequenceState::FailedExhausted;
                    seq.next_retry_at = None;
                    seq.alert_pending = true;
                    let exhausted = PipelineError::ExhaustedRetry {
                        target_id: target_id.to_string(),
                        attempts: attempt.attempt_number,
                    };
                    tracing::error!(
                        target_id = %target_id,
                        sequence_id = %seq.sequence_id,
                        last_error = %e,
                        "{}",
                        exhausted
                    );
                } else {
                    let next_at = finished_at + seq.policy.retry_interval();
                    attempt.next_retry_at = Some(next_at);
                    seq.next_retry_at = Some(next_at);
                    seq.attempts.push(RemediationAttempt {
                        target_id: target_id.to_string(),
                        sequence_id: seq.sequence_id.clone(),
                        attempt_number: attempt.attempt_number + 1,
                        started_at: None,
                        outcome: AttemptOutcome::Pending,
                        error: None,
                        next_retry_at: Some(next_at),
                    });
                    tracing::warn!(
                        target_id = %target_id,
                        sequence_id = %seq.sequence_id,
                        attempt = attempt.attempt_number,
                        next_retry_at = %next_at,
                        error = %e,
                        "Remediation attempt failed; retry scheduled"
                    );
                }
            }
        }

        let index = attempt.attempt_number as usize - 1;
        if let Some(slot) = seq.attempts.get_mut(index) {
            *slot = attempt.clone();
        }
        seq.updated_at = finished_at;
        let version = put_json(self.store.as_ref(), &key, &seq, Some(version)).await?;
        self.publish_attempt(&attempt).await;

        if seq.alert_pending && self.publish_exhausted(&seq).await {
            seq.alert_pending = false;
            if let Err(e) = put_json(self.store.as_ref(), &key, &seq, Some(version)).await {
                // Delivered again by the next flush; duplicates over losses
                tracing::warn!(target_id = %target_id, error = %e, "Failed to clear pending alert");
            }
        }
        if seq.state.is_terminal() {
            self.publish_finished(&seq).await;
        }

        Ok(Some(attempt))
    }

    /// Publish and clear the pending alert of `target_id`'s current sequence
    async fn deliver_pending_alert(&self, target_id: &str) -> bool {
        let key = sequence_key(target_id);
        let _guard = self.locks.lock(target_id).await;

        let (mut seq, version) =
            match get_json::<RemediationSequence>(self.store.as_ref(), &key).await {
                Ok(Some(found)) => found,
                Ok(None) => return false,
                Err(e) => {
                    tracing::warn!(target_id = %target_id, error = %e, "Failed to load sequence");
                    return false;
                }
            };
        if !seq.alert_pending || !self.publish_exhausted(&seq).await {
            return false;
        }

        seq.alert_pending = false;
        if let Err(e) = put_json(self.store.as_ref(), &key, &seq, Some(version)).await {
            tracing::warn!(target_id = %target_id, error = %e, "Failed to clear pending alert");
        }
        tracing::info!(
            target_id = %target_id,
            sequence_id = %seq.sequence_id,
            "Pending remediation alert delivered"
        );
        true
    }

    async fn publish_attempt(&self, attempt: &RemediationAttempt) {
        let notification = Notification::RemediationAttempt(attempt.clone());
        if let Err(e) = self.notifier.publish(REMEDIATION_TOPIC, &notification).await {
            tracing::warn!(
                target_id = %attempt.target_id,
                attempt = attempt.attempt_number,
                error = %e,
                "Failed to publish remediation attempt"
            );
        }
    }

    async fn publish_finished(&self, seq: &RemediationSequence) {
        let notification = Notification::RemediationFinished {
            target_id: seq.target_id.clone(),
            sequence_id: seq.sequence_id.clone(),
            state: seq.state,
            attempts: seq.attempts.len() as u32,
            at: seq.updated_at,
        };
        if let Err(e) = self.notifier.publish(REMEDIATION_TOPIC, &notification).await {
            tracing::warn!(
                target_id = %seq.target_id,
                sequence_id = %seq.sequence_id,
                error = %e,
                "Failed to publish remediation result"
            );
        }
    }

    /// Publish the exhausted-retries alert; returns whether it was delivered
    async fn publish_exhausted(&self, seq: &RemediationSequence) -> bool {
        let last = seq.attempts.last();
        let alert = Notification::RemediationExhausted {
            target_id: seq.target_id.clone(),
            sequence_id: seq.sequence_id.clone(),
            attempts: last.map_or(0, |a| a.attempt_number),
            last_error: last.and_then(|a| a.error.clone()),
            at: seq.updated_at,
        };
        match self.notifier.publish(OPERATOR_TOPIC, &alert).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    target_id = %seq.target_id,
                    sequence_id = %seq.sequence_id,
                    error = %e,
                    "Failed to publish exhausted-remediation alert; will retry"
                );
                false
            }
        }
    }
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Remediation attempt task failed");
    }
}

//! Compliance monitor
//!
//! Evaluates targets against a `ComplianceCheck`, persists one
//! `ComplianceRecord` per target under `compliance/{target}`, and publishes a
//! `ComplianceChanged` notification on every status change. A transition into
//! `NON_COMPLIANT` hands off to the action executor when the target's retry
//! policy is automatic.

use crate::clock::SharedClock;
use crate::error::{PipelineError, Result};
use crate::lock::KeyedLocks;
use crate::notify::{Notification, Notifier, COMPLIANCE_TOPIC};
use crate::remediation::ActionExecutor;
use crate::store::{get_json, put_json, KvStore};
use crate::types::{ComplianceRecord, ComplianceStatus, RetryPolicy};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Key prefix for persisted compliance records
pub const RECORD_PREFIX: &str = "compliance/";

const WRITE_RETRIES: usize = 3;

/// Decides whether a target currently complies with its rule
#[async_trait]
pub trait ComplianceCheck: Send + Sync {
    async fn evaluate(&self, target_id: &str) -> Result<ComplianceStatus>;
}

/// A check backed by an in-memory status table
///
/// Targets that were never set evaluate as `UNKNOWN`.
#[derive(Default)]
pub struct MemoryCheck {
    statuses: RwLock<HashMap<String, ComplianceStatus>>,
}

impl MemoryCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, target_id: impl Into<String>, status: ComplianceStatus) {
        self.statuses.write().await.insert(target_id.into(), status);
    }
}

#[async_trait]
impl ComplianceCheck for MemoryCheck {
    async fn evaluate(&self, target_id: &str) -> Result<ComplianceStatus> {
        Ok(self
            .statuses
            .read()
            .await
            .get(target_id)
            .copied()
            .unwrap_or_default())
    }
}

fn record_key(target_id: &str) -> String {
    format!("{}{}", RECORD_PREFIX, target_id)
}

/// Watches target compliance and triggers remediation on violations
pub struct ComplianceMonitor {
    store: Arc<dyn KvStore>,
    notifier: Arc<dyn Notifier>,
    check: Arc<dyn ComplianceCheck>,
    executor: Option<Arc<ActionExecutor>>,
    default_policy: RetryPolicy,
    policies: HashMap<String, RetryPolicy>,
    locks: KeyedLocks,
    clock: SharedClock,
}

impl ComplianceMonitor {
    pub fn new(
        store: Arc<dyn KvStore>,
        notifier: Arc<dyn Notifier>,
        check: Arc<dyn ComplianceCheck>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            notifier,
            check,
            executor: None,
            default_policy: RetryPolicy::default(),
            policies: HashMap::new(),
            locks: KeyedLocks::new(),
            clock,
        }
    }

    /// Hand violations to this executor
    pub fn with_executor(mut self, executor: Arc<ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Policy for targets without their own
    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_policy(mut self, target_id: impl Into<String>, policy: RetryPolicy) -> Self {
        self.policies.insert(target_id.into(), policy);
        self
    }

    pub fn policy_for(&self, target_id: &str) -> RetryPolicy {
        self.policies
            .get(target_id)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Evaluate one target and persist the result
    ///
    /// When the target moves into `NON_COMPLIANT`, remediation is triggered
    /// before the new record is written. A failed trigger therefore leaves
    /// the old record in place and the next evaluation sees the transition
    /// again; a repeated trigger coalesces into the running sequence.
    pub async fn evaluate(&self, target_id: &str) -> Result<ComplianceRecord> {
        let _guard = self.locks.lock(target_id).await;
        let status = self.check.evaluate(target_id).await?;
        let key = record_key(target_id);

        let mut tries = 0;
        loop {
            let (previous, version) =
                match get_json::<ComplianceRecord>(self.store.as_ref(), &key).await? {
                    Some((record, version)) => (record, Some(version)),
                    None => (ComplianceRecord::unknown(target_id), None),
                };

            let now = self.clock.now();
            let changed = previous.status != status;
            let record = ComplianceRecord {
                target_id: target_id.to_string(),
                status,
                last_evaluated_at: Some(now),
                last_transition_at: if changed {
                    Some(now)
                } else {
                    previous.last_transition_at
                },
            };

            if changed && status == ComplianceStatus::NonCompliant {
                self.hand_off(target_id).await?;
            }

            match put_json(self.store.as_ref(), &key, &record, version).await {
                Ok(_) => {}
                Err(PipelineError::VersionConflict { .. }) if tries < WRITE_RETRIES => {
                    tries += 1;
                    tracing::debug!(target_id = %target_id, tries, "Compliance record changed concurrently; retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }

            if changed {
                tracing::info!(
                    target_id = %target_id,
                    from = %previous.status,
                    to = %status,
                    "Compliance status changed"
                );
                let notification = Notification::ComplianceChanged {
                    target_id: target_id.to_string(),
                    from: previous.status,
                    to: status,
                    at: now,
                };
                if let Err(e) = self.notifier.publish(COMPLIANCE_TOPIC, &notification).await {
                    tracing::warn!(target_id = %target_id, error = %e, "Failed to publish compliance change");
                }
            } else {
                tracing::debug!(target_id = %target_id, status = %status, "Compliance confirmed");
            }

            return Ok(record);
        }
    }

    /// Stored record for a target; `UNKNOWN` if never evaluated
    pub async fn record(&self, target_id: &str) -> Result<ComplianceRecord> {
        Ok(get_json(self.store.as_ref(), &record_key(target_id))
            .await?
            .map(|(record, _)| record)
            .unwrap_or_else(|| ComplianceRecord::unknown(target_id)))
    }

    /// Every stored record, ordered by target id
    pub async fn records(&self) -> Result<Vec<ComplianceRecord>> {
        self.store
            .scan_prefix(RECORD_PREFIX)
            .await?
            .into_iter()
            .map(|(_, row)| serde_json::from_value(row.value).map_err(PipelineError::from))
            .collect()
    }

    /// Re-evaluate `targets` every `interval` until cancelled
    pub async fn run(&self, targets: Vec<String>, interval: Duration, cancel: CancellationToken) {
        tracing::info!(targets = targets.len(), "Compliance monitor started");

        while !cancel.is_cancelled() {
            let results = join_all(targets.iter().map(|t| self.evaluate(t))).await;
            for (target, result) in targets.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(target_id = %target, error = %e, "Compliance evaluation failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        tracing::info!("Compliance monitor stopped");
    }

    async fn hand_off(&self, target_id: &str) -> Result<()> {
        let policy = self.policy_for(target_id);
        let Some(executor) = &self.executor else {
            return Ok(());
        };
        if !policy.automatic {
            tracing::info!(target_id = %target_id, "Target non-compliant; automatic remediation disabled");
            return Ok(());
        }
        executor.trigger(target_id, policy).await.map(|_| ())
    }
}

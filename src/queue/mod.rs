//! Durable queue abstraction
//!
//! `DurableQueue` is the transport a buffer stage sits on: at-least-once
//! delivery with visibility timeouts, receive counting, and deduplication.
//! Any broker or database-backed queue satisfying it can back a stage.
//! `MemoryQueue` is the in-process implementation; `JetStreamQueue` keeps
//! messages in a NATS JetStream work-queue stream so they survive restarts.

mod jetstream;

pub use jetstream::{JetStreamQueue, JetStreamSettings, JetStreamStorage};

use crate::clock::SharedClock;
use crate::dlq::should_dead_letter;
use crate::error::{PipelineError, Result};
use crate::types::{BufferedMessage, Envelope, MessageHandle};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, Notify};

/// Result of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new message was queued
    Enqueued,
    /// The dedup key was seen within the window; nothing was queued
    Duplicate,
}

/// Point-in-time queue depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting to be received
    pub visible: usize,
    /// Messages currently owned by a consumer
    pub in_flight: usize,
}

impl QueueStats {
    /// No messages visible or in flight
    pub fn is_idle(&self) -> bool {
        self.visible == 0 && self.in_flight == 0
    }
}

/// Queue behavior knobs
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Deliveries allowed before a message is handed back for dead-lettering
    pub max_receive_count: u32,
    /// How long a dedup key suppresses repeats
    pub dedup_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_receive_count: 5,
            dedup_window: Duration::minutes(5),
        }
    }
}

/// Generic at-least-once queue with visibility timeouts
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Queue an envelope unless `dedup_key` was seen within the dedup window
    async fn enqueue(&self, envelope: Envelope, dedup_key: String) -> Result<EnqueueOutcome>;

    /// Claim the next visible message for `visibility`, if any
    async fn receive(&self, visibility: Duration) -> Result<Option<BufferedMessage>>;

    /// Delete a claimed message
    async fn ack(&self, handle: &MessageHandle) -> Result<()>;

    /// Return a claimed message to the queue before its visibility lapses
    ///
    /// A message at its receive ceiling is not requeued: it stays claimed
    /// under the same handle and is returned. The caller dead-letters it and
    /// then calls `ack`. If dead-lettering fails the caller does nothing and
    /// the message comes back through `reclaim_expired` once its visibility
    /// lapses, so it is never lost.
    async fn release(&self, handle: &MessageHandle) -> Result<Option<BufferedMessage>>;

    /// Return every message whose visibility lapsed to the queue
    ///
    /// Messages at their receive ceiling are returned for dead-lettering
    /// instead, still claimed (with a fresh visibility) under the handle in
    /// the returned message; `ack` removes them once the dead letter is stored.
    async fn reclaim_expired(&self) -> Result<Vec<BufferedMessage>>;

    /// Current depth
    async fn stats(&self) -> Result<QueueStats>;

    /// Suspend until a message may be visible or `timeout` elapses
    async fn wait_for_messages(&self, timeout: std::time::Duration) {
        tokio::time::sleep(timeout).await;
    }
}

struct Entry {
    envelope: Envelope,
    dedup_key: String,
    first_enqueued_at: DateTime<Utc>,
    receive_count: u32,
}

struct InFlight {
    entry: Entry,
    visibility: Duration,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    visible: VecDeque<Entry>,
    in_flight: HashMap<MessageHandle, InFlight>,
    dedup_seen: HashMap<String, DateTime<Utc>>,
    dedup_order: VecDeque<(String, DateTime<Utc>)>,
}

impl State {
    fn prune_dedup(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some((key, at)) = self.dedup_order.front() {
            if now - *at < window {
                break;
            }
            if self.dedup_seen.get(key) == Some(at) {
                self.dedup_seen.remove(key);
            }
            self.dedup_order.pop_front();
        }
    }
}

fn to_message(stage: &str, entry: &Entry, handle: MessageHandle) -> BufferedMessage {
    BufferedMessage {
        handle,
        envelope: entry.envelope.clone(),
        receive_count: entry.receive_count,
        first_enqueued_at: entry.first_enqueued_at,
        dedup_key: entry.dedup_key.clone(),
        stage: stage.to_string(),
    }
}

/// In-process durable queue
///
/// "Durable" within the process lifetime; visibility and dedup timing read
/// the injected clock.
pub struct MemoryQueue {
    name: String,
    config: QueueConfig,
    clock: SharedClock,
    state: Mutex<State>,
    available: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(State::default()),
            available: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Put an entry back at the tail, or keep it claimed for dead-lettering
    ///
    /// An entry at its ceiling stays in flight under `handle` until the caller
    /// acks it, so a failed dead-letter write leaves it recoverable.
    fn requeue_or_hold(
        &self,
        state: &mut State,
        handle: MessageHandle,
        mut in_flight: InFlight,
        now: DateTime<Utc>,
    ) -> Option<BufferedMessage> {
        if should_dead_letter(in_flight.entry.receive_count, self.config.max_receive_count) {
            let message = to_message(&self.name, &in_flight.entry, handle.clone());
            in_flight.deadline = now + in_flight.visibility;
            state.in_flight.insert(handle, in_flight);
            Some(message)
        } else {
            state.visible.push_back(in_flight.entry);
            None
        }
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn enqueue(&self, envelope: Envelope, dedup_key: String) -> Result<EnqueueOutcome> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.prune_dedup(now, self.config.dedup_window);

        if state.dedup_seen.contains_key(&dedup_key) {
            tracing::debug!(
                queue = %self.name,
                event_id = %envelope.id(),
                dedup_key = %dedup_key,
                "Duplicate enqueue collapsed"
            );
            return Ok(EnqueueOutcome::Duplicate);
        }

        state.dedup_seen.insert(dedup_key.clone(), now);
        state.dedup_order.push_back((dedup_key.clone(), now));
        state.visible.push_back(Entry {
            envelope,
            dedup_key,
            first_enqueued_at: now,
            receive_count: 0,
        });
        drop(state);

        self.available.notify_one();
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn receive(&self, visibility: Duration) -> Result<Option<BufferedMessage>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let Some(mut entry) = state.visible.pop_front() else {
            return Ok(None);
        };

        entry.receive_count += 1;
        let handle = MessageHandle::generate();
        let message = to_message(&self.name, &entry, handle.clone());
        state.in_flight.insert(
            handle,
            InFlight {
                entry,
                visibility,
                deadline: now + visibility,
            },
        );

        Ok(Some(message))
    }

    async fn ack(&self, handle: &MessageHandle) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| PipelineError::UnknownHandle(handle.to_string()))
    }

    async fn release(&self, handle: &MessageHandle) -> Result<Option<BufferedMessage>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let in_flight = state
            .in_flight
            .remove(handle)
            .ok_or_else(|| PipelineError::UnknownHandle(handle.to_string()))?;

        let at_ceiling = self.requeue_or_hold(&mut state, handle.clone(), in_flight, now);
        drop(state);

        if at_ceiling.is_none() {
            self.available.notify_one();
        }
        Ok(at_ceiling)
    }

    async fn reclaim_expired(&self) -> Result<Vec<BufferedMessage>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let mut expired: Vec<(MessageHandle, DateTime<Utc>)> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(h, f)| (h.clone(), f.deadline))
            .collect();
        // Oldest deadline first keeps redelivery order close to FIFO
        expired.sort_by_key(|(_, deadline)| *deadline);

        let mut at_ceiling = Vec::new();
        let mut requeued = 0usize;
        for (handle, _) in expired {
            if let Some(in_flight) = state.in_flight.remove(&handle) {
                match self.requeue_or_hold(&mut state, handle, in_flight, now) {
                    Some(message) => at_ceiling.push(message),
                    None => requeued += 1,
                }
            }
        }
        drop(state);

        if requeued > 0 {
            tracing::debug!(queue = %self.name, requeued, "Visibility expired, messages requeued");
            self.available.notify_waiters();
        }
        Ok(at_ceiling)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            visible: state.visible.len(),
            in_flight: state.in_flight.len(),
        })
    }

    async fn wait_for_messages(&self, timeout: std::time::Duration) {
        let notified = self.available.notified();
        {
            let state = self.state.lock().await;
            if !state.visible.is_empty() {
                return;
            }
        }
        let _ = tokio::time::timeout(timeout, notified).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn queue(max_receive_count: u32) -> (MemoryQueue, ManualClock) {
        let clock = ManualClock::default();
        let q = MemoryQueue::new(
            "test",
            QueueConfig {
                max_receive_count,
                dedup_window: Duration::minutes(5),
            },
            Arc::new(clock.clone()),
        );
        (q, clock)
    }

    fn envelope() -> Envelope {
        Envelope::new("api.rest.public", "request", "{}")
    }

    #[tokio::test]
    async fn test_enqueue_receive_ack() {
        let (q, _) = queue(5);
        let env = envelope();
        let key = env.id().to_string();
        assert_eq!(q.enqueue(env.clone(), key).await.unwrap(), EnqueueOutcome::Enqueued);

        let msg = q.receive(Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!(msg.envelope, env);
        assert_eq!(msg.receive_count, 1);
        assert_eq!(msg.stage, "test");
        assert_eq!(q.stats().await.unwrap(), QueueStats { visible: 0, in_flight: 1 });

        q.ack(&msg.handle).await.unwrap();
        assert!(q.stats().await.unwrap().is_idle());
        assert!(q.receive(Duration::seconds(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dedup_within_window() {
        let (q, clock) = queue(5);
        let env = envelope();

        assert_eq!(q.enqueue(env.clone(), "k".into()).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(q.enqueue(env.clone(), "k".into()).await.unwrap(), EnqueueOutcome::Duplicate);
        assert_eq!(q.stats().await.unwrap().visible, 1);

        // Still suppressed after the first copy is acknowledged
        let msg = q.receive(Duration::seconds(30)).await.unwrap().unwrap();
        q.ack(&msg.handle).await.unwrap();
        assert_eq!(q.enqueue(env.clone(), "k".into()).await.unwrap(), EnqueueOutcome::Duplicate);

        // Accepted again once the window has passed
        clock.advance(Duration::minutes(5));
        assert_eq!(q.enqueue(env, "k".into()).await.unwrap(), EnqueueOutcome::Enqueued);
    }

    #[tokio::test]
    async fn test_visibility_expiry_increments_receive_count() {
        let (q, clock) = queue(5);
        let env = envelope();
        q.enqueue(env.clone(), env.id().to_string()).await.unwrap();

        let first = q.receive(Duration::seconds(30)).await.unwrap().unwrap();
        assert!(q.receive(Duration::seconds(30)).await.unwrap().is_none());

        clock.advance(Duration::seconds(29));
        assert!(q.reclaim_expired().await.unwrap().is_empty());
        assert!(q.receive(Duration::seconds(30)).await.unwrap().is_none());

        clock.advance(Duration::seconds(1));
        assert!(q.reclaim_expired().await.unwrap().is_empty());
        let second = q.receive(Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!(second.receive_count, first.receive_count + 1);
        assert_ne!(second.handle, first.handle);

        // The stale handle no longer owns the message
        assert!(matches!(
            q.ack(&first.handle).await,
            Err(PipelineError::UnknownHandle(_))
        ));
        q.ack(&second.handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_ceiling_holds_message_for_dead_letter() {
        let (q, clock) = queue(2);
        let env = envelope();
        q.enqueue(env.clone(), env.id().to_string()).await.unwrap();

        let mut held = Vec::new();
        for expected in 1..=2 {
            let msg = q.receive(Duration::seconds(10)).await.unwrap().unwrap();
            assert_eq!(msg.receive_count, expected);
            clock.advance(Duration::seconds(10));
            held = q.reclaim_expired().await.unwrap();
            if expected < 2 {
                assert!(held.is_empty());
            }
        }
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].envelope.id(), env.id());
        assert_eq!(held[0].receive_count, 2);

        // Still owned until the dead letter is confirmed
        assert_eq!(q.stats().await.unwrap(), QueueStats { visible: 0, in_flight: 1 });
        assert!(q.receive(Duration::seconds(10)).await.unwrap().is_none());

        q.ack(&held[0].handle).await.unwrap();
        assert!(q.stats().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_unconfirmed_dead_letter_comes_back() {
        let (q, clock) = queue(1);
        let env = envelope();
        q.enqueue(env.clone(), env.id().to_string()).await.unwrap();

        let msg = q.receive(Duration::seconds(10)).await.unwrap().unwrap();
        let first = q.release(&msg.handle).await.unwrap().unwrap();
        assert_eq!(first.handle, msg.handle);

        // Never acked: handed back again after the visibility lapses
        clock.advance(Duration::seconds(9));
        assert!(q.reclaim_expired().await.unwrap().is_empty());
        clock.advance(Duration::seconds(1));
        let again = q.reclaim_expired().await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].envelope.id(), env.id());
        assert_eq!(again[0].receive_count, 1);
    }

    #[tokio::test]
    async fn test_release_requeues_at_tail() {
        let (q, _) = queue(5);
        let a = envelope();
        let b = envelope();
        q.enqueue(a.clone(), a.id().to_string()).await.unwrap();
        q.enqueue(b.clone(), b.id().to_string()).await.unwrap();

        let first = q.receive(Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!(first.envelope.id(), a.id());
        assert!(q.release(&first.handle).await.unwrap().is_none());

        let next = q.receive(Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!(next.envelope.id(), b.id());
        let again = q.receive(Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!(again.envelope.id(), a.id());
        assert_eq!(again.receive_count, 2);
    }

    #[tokio::test]
    async fn test_release_at_ceiling_returns_message() {
        let (q, _) = queue(1);
        let env = envelope();
        q.enqueue(env.clone(), env.id().to_string()).await.unwrap();

        let msg = q.receive(Duration::seconds(30)).await.unwrap().unwrap();
        let held = q.release(&msg.handle).await.unwrap().unwrap();
        assert_eq!(held.envelope.id(), env.id());
        assert_eq!(q.stats().await.unwrap().in_flight, 1);

        q.ack(&held.handle).await.unwrap();
        assert!(q.stats().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_wait_for_messages_wakes_on_enqueue() {
        let clock = ManualClock::default();
        let q = Arc::new(MemoryQueue::new("test", QueueConfig::default(), Arc::new(clock)));

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move {
                q.wait_for_messages(std::time::Duration::from_secs(5)).await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let env = envelope();
        q.enqueue(env.clone(), env.id().to_string()).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake before its timeout")
            .unwrap();
    }
}

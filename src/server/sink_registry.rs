//! Outbound sinks: per-recipient buffers that outlive connections
//!
//! Producers (handlers, the relay consumer) publish into the sink of a
//! [`RecipientKey`] whether or not that recipient is connected. The session of
//! the currently attached connection drains it through a [`SinkSubscription`].
//! Attaching a new subscription supersedes the previous one. Messages published
//! while nobody is attached stay buffered up to the sink capacity and are
//! replayed to the next subscriber.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::protocol::messages::{Envelope, Platform, RecipientKey};

/// What a full sink does with a new message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// `publish` waits for space; `try_publish` fails
    Block,
    /// Discard the oldest buffered message to make room
    #[default]
    DropOldest,
    /// Refuse the new message
    Reject,
}

impl OverflowPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "block" => Some(OverflowPolicy::Block),
            "drop_oldest" | "drop-oldest" => Some(OverflowPolicy::DropOldest),
            "reject" => Some(OverflowPolicy::Reject),
            _ => None,
        }
    }
}

/// Sink configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    /// Maximum buffered messages per sink
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Evict sinks left without a subscriber for this long (`None` keeps them)
    pub idle_ttl: Option<Duration>,
    /// How often the eviction sweep runs
    pub eviction_interval: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
            idle_ttl: Some(Duration::from_secs(30 * 60)),
            eviction_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct SinkState {
    buffer: VecDeque<Envelope>,
    subscriber: Option<u64>,
    next_subscriber: u64,
    detached_since: Option<Instant>,
    dropped: u64,
}

enum Push {
    Queued,
    Full(Envelope),
}

/// Buffered delivery channel for one recipient
#[derive(Debug)]
pub struct OutboundSink {
    key: RecipientKey,
    capacity: usize,
    overflow: OverflowPolicy,
    state: Mutex<SinkState>,
    /// Signalled on new messages, subscriber changes and disposal
    changed: Notify,
    /// Signalled when buffer space frees up
    space: Notify,
    disposed: AtomicBool,
}

impl OutboundSink {
    fn new(key: RecipientKey, config: &SinkConfig) -> Self {
        Self {
            key,
            capacity: config.capacity.max(1),
            overflow: config.overflow,
            state: Mutex::new(SinkState {
                buffer: VecDeque::new(),
                subscriber: None,
                next_subscriber: 0,
                detached_since: Some(Instant::now()),
                dropped: 0,
            }),
            changed: Notify::new(),
            space: Notify::new(),
            disposed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &RecipientKey {
        &self.key
    }

    fn disposed_error(&self) -> ChatError {
        ChatError::routing(format!("Sink for {} is disposed", self.key))
    }

    fn push(&self, envelope: Envelope) -> Result<Push> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }

        let mut state = self.lock();
        if state.buffer.len() >= self.capacity {
            match self.overflow {
                OverflowPolicy::Block => return Ok(Push::Full(envelope)),
                OverflowPolicy::Reject => {
                    return Err(ChatError::resource_limit(format!(
                        "Sink for {} is full ({} messages)",
                        self.key, self.capacity
                    )));
                }
                OverflowPolicy::DropOldest => {
                    state.buffer.pop_front();
                    state.dropped += 1;
                    warn!(
                        recipient = %self.key,
                        dropped = state.dropped,
                        "Sink full, dropped oldest message"
                    );
                }
            }
        }
        state.buffer.push_back(envelope);
        drop(state);

        self.changed.notify_waiters();
        Ok(Push::Queued)
    }

    /// Publish a message, waiting for space under [`OverflowPolicy::Block`]
    pub async fn publish(&self, envelope: Envelope) -> Result<()> {
        let mut pending = envelope;
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.push(pending)? {
                Push::Queued => return Ok(()),
                Push::Full(envelope) => pending = envelope,
            }

            space.await;
        }
    }

    /// Publish without waiting; a full sink under `Block` is an error
    pub fn try_publish(&self, envelope: Envelope) -> Result<()> {
        match self.push(envelope)? {
            Push::Queued => Ok(()),
            Push::Full(_) => Err(ChatError::resource_limit(format!(
                "Sink for {} is full ({} messages)",
                self.key, self.capacity
            ))),
        }
    }

    /// Attach a subscription, superseding any existing one
    pub fn subscribe(self: &Arc<Self>) -> SinkSubscription {
        let mut state = self.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        let superseded = state.subscriber.replace(id);
        state.detached_since = None;
        drop(state);

        if superseded.is_some() {
            debug!(recipient = %self.key, "Sink subscription superseded");
        }
        self.changed.notify_waiters();

        SinkSubscription {
            sink: Arc::clone(self),
            id,
        }
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_attached(&self) -> bool {
        self.lock().subscriber.is_some()
    }

    /// Messages discarded by the DropOldest policy so far
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// How long the sink has gone without a subscriber
    pub fn idle_for(&self) -> Option<Duration> {
        self.lock().detached_since.map(|since| since.elapsed())
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let discarded = {
            let mut state = self.lock();
            let discarded = state.buffer.len();
            state.buffer.clear();
            state.subscriber = None;
            discarded
        };
        if discarded > 0 {
            debug!(recipient = %self.key, discarded, "Disposed sink with undelivered messages");
        }
        self.changed.notify_waiters();
        self.space.notify_waiters();
    }
}

/// Drain side of a sink, held by the writer of the attached connection
#[derive(Debug)]
pub struct SinkSubscription {
    sink: Arc<OutboundSink>,
    id: u64,
}

impl SinkSubscription {
    pub fn key(&self) -> &RecipientKey {
        self.sink.key()
    }

    pub fn sink(&self) -> &Arc<OutboundSink> {
        &self.sink
    }

    /// Whether this is still the sink's active subscription
    pub fn is_current(&self) -> bool {
        !self.sink.is_disposed() && self.sink.lock().subscriber == Some(self.id)
    }

    /// Next buffered message.
    ///
    /// Returns `None` once the subscription is superseded or the sink disposed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let changed = self.sink.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                if self.sink.is_disposed() {
                    return None;
                }
                let mut state = self.sink.lock();
                if state.subscriber != Some(self.id) {
                    return None;
                }
                if let Some(envelope) = state.buffer.pop_front() {
                    drop(state);
                    self.sink.space.notify_waiters();
                    return Some(envelope);
                }
            }

            changed.await;
        }
    }

    /// Put a message that could not be written back at the head of the buffer
    pub fn requeue(&self, envelope: Envelope) {
        if self.sink.is_disposed() {
            return;
        }
        self.sink.lock().buffer.push_front(envelope);
        self.sink.changed.notify_waiters();
    }
}

impl Drop for SinkSubscription {
    fn drop(&mut self) {
        let mut state = self.sink.lock();
        if state.subscriber == Some(self.id) {
            state.subscriber = None;
            state.detached_since = Some(Instant::now());
        }
    }
}

/// Concurrent map from recipient key to its sink
#[derive(Debug, Default)]
pub struct SinkRegistry {
    sinks: DashMap<RecipientKey, Arc<OutboundSink>>,
    config: SinkConfig,
}

impl SinkRegistry {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            sinks: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Get or create the sink for `key`, atomically per key
    pub fn register_sink_flow(&self, key: &RecipientKey) -> Arc<OutboundSink> {
        self.sinks
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(recipient = %key, "Created outbound sink");
                Arc::new(OutboundSink::new(key.clone(), &self.config))
            })
            .value()
            .clone()
    }

    pub fn get_sink_flow(&self, key: &RecipientKey) -> Option<Arc<OutboundSink>> {
        self.sinks.get(key).map(|entry| entry.value().clone())
    }

    /// Remove and dispose the sink, discarding anything still buffered
    pub fn unregister(&self, key: &RecipientKey) -> bool {
        match self.sinks.remove(key) {
            Some((_, sink)) => {
                sink.dispose();
                true
            }
            None => false,
        }
    }

    /// Keys of the account that currently hold a sink, one lookup per platform
    pub fn keys_for_account(&self, account: &str) -> Vec<RecipientKey> {
        Platform::ALL
            .iter()
            .map(|platform| RecipientKey::new(account, *platform))
            .filter(|key| self.sinks.contains_key(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Dispose sinks that have had no subscriber for at least `ttl`
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let is_stale = |sink: &OutboundSink| sink.idle_for().is_some_and(|idle| idle >= ttl);

        let candidates: Vec<RecipientKey> = self
            .sinks
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            if let Some((_, sink)) = self.sinks.remove_if(&key, |_, sink| is_stale(sink)) {
                debug!(recipient = %key, buffered = sink.len(), "Evicting idle sink");
                sink.dispose();
                evicted += 1;
            }
        }
        evicted
    }

    /// Run the periodic eviction sweep until `cancel` fires.
    ///
    /// Returns `None` when no idle TTL is configured.
    pub fn spawn_eviction(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let ttl = self.config.idle_ttl?;
        let registry = Arc::clone(self);
        let period = self.config.eviction_interval;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle(ttl);
                        if evicted > 0 {
                            info!(evicted, remaining = registry.len(), "Evicted idle sinks");
                        }
                    }
                }
            }
            debug!("Sink eviction sweep stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ChatMessage, Payload};
    use tokio::time::{advance, timeout};

    fn chat(body: &str) -> Envelope {
        Envelope::chat(ChatMessage::new("alice", "bob", body))
    }

    fn body(envelope: &Envelope) -> &str {
        match &envelope.payload {
            Some(Payload::Chat(chat)) => &chat.body,
            _ => "",
        }
    }

    fn config(capacity: usize, overflow: OverflowPolicy) -> SinkConfig {
        SinkConfig {
            capacity,
            overflow,
            ..SinkConfig::default()
        }
    }

    #[test]
    fn test_register_returns_same_sink() {
        let registry = SinkRegistry::default();
        let key = RecipientKey::desktop("bob");

        let first = registry.register_sink_flow(&key);
        let second = registry.register_sink_flow(&key);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_buffered_before_subscribe_is_delivered() {
        let registry = SinkRegistry::default();
        let sink = registry.register_sink_flow(&RecipientKey::desktop("bob"));

        sink.publish(chat("early")).await.unwrap();
        assert_eq!(sink.len(), 1);

        let mut sub = sink.subscribe();
        let received = sub.recv().await.unwrap();
        assert_eq!(body(&received), "early");
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_disposes_and_recreates_empty() {
        let registry = SinkRegistry::default();
        let key = RecipientKey::desktop("bob");
        let old = registry.register_sink_flow(&key);
        old.publish(chat("stale")).await.unwrap();
        let mut sub = old.subscribe();

        assert!(registry.unregister(&key));
        assert!(old.is_disposed());
        assert!(sub.recv().await.is_none());
        assert!(old.try_publish(chat("late")).is_err());

        let fresh = registry.register_sink_flow(&key);
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(fresh.is_empty());
        assert!(!registry.unregister(&RecipientKey::mobile("bob")));
    }

    #[tokio::test]
    async fn test_new_subscriber_supersedes_old() {
        let registry = SinkRegistry::default();
        let sink = registry.register_sink_flow(&RecipientKey::desktop("bob"));

        let mut old = sink.subscribe();
        let waiter = tokio::spawn(async move { old.recv().await });
        tokio::task::yield_now().await;

        let mut new = sink.subscribe();
        assert!(waiter.await.unwrap().is_none());

        sink.publish(chat("for new")).await.unwrap();
        assert_eq!(body(&new.recv().await.unwrap()), "for new");
        assert!(sink.is_attached());

        drop(new);
        assert!(!sink.is_attached());
    }

    #[tokio::test]
    async fn test_drop_oldest_policy() {
        let registry = SinkRegistry::new(config(2, OverflowPolicy::DropOldest));
        let sink = registry.register_sink_flow(&RecipientKey::desktop("bob"));

        for text in ["one", "two", "three"] {
            sink.try_publish(chat(text)).unwrap();
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.dropped_count(), 1);

        let mut sub = sink.subscribe();
        assert_eq!(body(&sub.recv().await.unwrap()), "two");
        assert_eq!(body(&sub.recv().await.unwrap()), "three");
    }

    #[test]
    fn test_reject_policy() {
        let registry = SinkRegistry::new(config(1, OverflowPolicy::Reject));
        let sink = registry.register_sink_flow(&RecipientKey::desktop("bob"));

        sink.try_publish(chat("one")).unwrap();
        let err = sink.try_publish(chat("two")).unwrap_err();
        assert!(matches!(err, ChatError::ResourceLimit(_)));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let registry = SinkRegistry::new(config(1, OverflowPolicy::Block));
        let sink = registry.register_sink_flow(&RecipientKey::desktop("bob"));
        sink.publish(chat("one")).await.unwrap();

        assert!(sink.try_publish(chat("nope")).is_err());

        let blocked = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.publish(chat("two")).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        let mut sub = sink.subscribe();
        assert_eq!(body(&sub.recv().await.unwrap()), "one");

        timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(body(&sub.recv().await.unwrap()), "two");
    }

    #[tokio::test]
    async fn test_requeue_goes_to_head() {
        let registry = SinkRegistry::default();
        let sink = registry.register_sink_flow(&RecipientKey::desktop("bob"));
        sink.publish(chat("first")).await.unwrap();
        sink.publish(chat("second")).await.unwrap();

        let mut sub = sink.subscribe();
        let taken = sub.recv().await.unwrap();
        sub.requeue(taken);
        drop(sub);

        let mut next = sink.subscribe();
        assert_eq!(body(&next.recv().await.unwrap()), "first");
        assert_eq!(body(&next.recv().await.unwrap()), "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_skips_attached_sinks() {
        let registry = SinkRegistry::default();
        let idle = registry.register_sink_flow(&RecipientKey::desktop("idle"));
        let busy = registry.register_sink_flow(&RecipientKey::desktop("busy"));
        let _sub = busy.subscribe();

        advance(Duration::from_secs(10)).await;
        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 0);

        advance(Duration::from_secs(60)).await;
        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 1);
        assert!(idle.is_disposed());
        assert!(!busy.is_disposed());
        assert_eq!(registry.keys_for_account("busy"), vec![RecipientKey::desktop("busy")]);
        assert!(registry.keys_for_account("idle").is_empty());
    }

    #[test]
    fn test_keys_for_account_ignores_other_accounts() {
        let registry = SinkRegistry::default();
        registry.register_sink_flow(&RecipientKey::mobile("bob"));
        registry.register_sink_flow(&RecipientKey::desktop("bob"));
        registry.register_sink_flow(&RecipientKey::desktop("bobby"));

        assert_eq!(
            registry.keys_for_account("bob"),
            vec![RecipientKey::desktop("bob"), RecipientKey::mobile("bob")]
        );
        assert!(registry.keys_for_account("bo").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_sweep_runs_until_cancelled() {
        let registry = Arc::new(SinkRegistry::new(SinkConfig {
            idle_ttl: Some(Duration::from_secs(30)),
            eviction_interval: Duration::from_secs(10),
            ..SinkConfig::default()
        }));
        registry.register_sink_flow(&RecipientKey::mobile("carol"));

        let cancel = CancellationToken::new();
        let sweep = registry.spawn_eviction(cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        sweep.await.unwrap();
    }
}

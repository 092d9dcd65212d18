//! Topic-routed publish/subscribe.
//!
//! Publishing computes the event's topics from a static routing table and
//! hands a delivery to every matching subscriber's queue without waiting.
//! Each subscriber drains its own queue on its own task, so a slow or
//! failing handler never holds up the publisher or other subscribers.
//! Delivery is at-least-once: handler errors are retried, then the event is
//! dead-lettered for that subscriber.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::instrument;

use super::event::{event_types, EventDelivery, EventId, System, UnifiedEvent};
use crate::error::{ConfluenceError, Result};

/// Bus topics are the systems themselves.
pub type Topic = System;

// ═══════════════════════════════════════════════════════════════════════════════
// Routing
// ═══════════════════════════════════════════════════════════════════════════════

/// `event_types` entries are exact names, `PREFIX_*` prefixes, or `*`.
fn type_matches(pattern: &str, event_type: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => event_type.starts_with(prefix),
        None => pattern == event_type,
    }
}

/// One routing rule: events from `source` (any when unset) whose type
/// matches one of `event_types` (any when empty) also go to `topics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default)]
    pub source: Option<System>,
    #[serde(default)]
    pub event_types: Vec<String>,
    pub topics: Vec<Topic>,
}

impl RouteRule {
    pub fn new(source: Option<System>, event_types: &[&str], topics: &[Topic]) -> Self {
        Self {
            source,
            event_types: event_types.iter().map(|s| s.to_string()).collect(),
            topics: topics.to_vec(),
        }
    }

    pub fn matches(&self, event: &UnifiedEvent) -> bool {
        if self.source.is_some_and(|s| s != event.source) {
            return false;
        }
        self.event_types.is_empty() || self.event_types.iter().any(|p| type_matches(p, &event.event_type))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTable {
    rules: Vec<RouteRule>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(default_routes())
    }
}

fn default_routes() -> Vec<RouteRule> {
    vec![
        // Frontend-originated changes need backend processing.
        RouteRule::new(Some(System::Frontend), &[], &[System::Backend]),
        // Legacy-originated changes are mirrored into the modern side.
        RouteRule::new(Some(System::Legacy), &[], &[System::Backend]),
        // Modern writes to shared entities flow back to legacy.
        RouteRule::new(
            Some(System::Backend),
            &["USER_*", "TRADE_*", "PAYMENT_*"],
            &[System::Legacy],
        ),
        RouteRule::new(None, &[event_types::CONFLICT_RESOLVED], &[System::Backend, System::Legacy]),
    ]
}

impl RoutingTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Source topic, explicit target, plus every matching rule's topics.
    pub fn topics_for(&self, event: &UnifiedEvent) -> BTreeSet<Topic> {
        let mut topics = BTreeSet::new();
        topics.insert(event.source);
        if let Some(target) = event.target {
            topics.insert(target);
        }
        for rule in self.rules.iter().filter(|r| r.matches(event)) {
            topics.extend(rule.topics.iter().copied());
        }
        topics
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteRule>,

    /// Handler attempts per delivery before dead-lettering
    #[serde(default = "default_handler_max_attempts")]
    pub handler_max_attempts: u32,

    #[serde(default = "default_handler_retry_delay", with = "humantime_serde")]
    pub handler_retry_delay: Duration,

    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,
}

fn default_handler_max_attempts() -> u32 {
    3
}
fn default_handler_retry_delay() -> Duration {
    Duration::from_millis(50)
}
fn default_dedupe_capacity() -> usize {
    10_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            routes: default_routes(),
            handler_max_attempts: default_handler_max_attempts(),
            handler_retry_delay: default_handler_retry_delay(),
            dedupe_capacity: default_dedupe_capacity(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers and Sinks
// ═══════════════════════════════════════════════════════════════════════════════

/// A subscriber callback. Implementations must tolerate redelivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, delivery: &EventDelivery) -> Result<()>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventDelivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, delivery: &EventDelivery) -> Result<()> {
        (self.f)(delivery.clone()).await
    }
}

/// Wrap a closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventDelivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { name: name.into(), f })
}

/// Anything components can emit their own events into.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: UnifiedEvent) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscriptions
// ═══════════════════════════════════════════════════════════════════════════════

/// Which deliveries a subscriber wants. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

impl SubscriptionFilter {
    pub fn event_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_types: types.into_iter().map(Into::into).collect(),
            topics: Vec::new(),
        }
    }

    pub fn with_topics(mut self, topics: &[Topic]) -> Self {
        self.topics = topics.to_vec();
        self
    }

    fn matches(&self, event_type: &str, topics: &BTreeSet<Topic>) -> bool {
        let type_ok = self.event_types.is_empty() || self.event_types.iter().any(|p| type_matches(p, event_type));
        let topic_ok = self.topics.is_empty() || self.topics.iter().any(|t| topics.contains(t));
        type_ok && topic_ok
    }
}

struct SubscriberEntry {
    name: String,
    filter: SubscriptionFilter,
    sender: mpsc::UnboundedSender<EventDelivery>,
}

/// Handle returned by `subscribe`. Dropping it keeps the subscription alive.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    name: String,
    subscribers: Weak<DashMap<u64, SubscriberEntry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop further deliveries. Deliveries already queued still run.
    pub fn unsubscribe(self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.remove(&self.id);
            tracing::debug!(subscriber = %self.name, "Unsubscribed");
        }
    }
}

impl std::fmt::Debug for SubscriberEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberEntry").field("name", &self.name).finish()
    }
}

/// A delivery a subscriber gave up on.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub subscriber: String,
    pub event_id: EventId,
    pub event_type: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

const DEAD_LETTER_CAPACITY: usize = 1_000;

// ═══════════════════════════════════════════════════════════════════════════════
// Bus
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    dead_lettered: AtomicU64,
    in_flight: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub dead_lettered: u64,
    pub in_flight: u64,
    pub subscribers: usize,
}

/// Result of a publish: where the event went and how many subscribers got it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub topics: BTreeSet<Topic>,
    pub deliveries: usize,
}

pub struct EventBus {
    config: BusConfig,
    routing: RoutingTable,
    subscribers: Arc<DashMap<u64, SubscriberEntry>>,
    next_id: AtomicU64,
    counters: Arc<BusCounters>,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let routing = RoutingTable::new(config.routes.clone());
        Self {
            config,
            routing,
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            counters: Arc::new(BusCounters::default()),
            dead_letters: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Subscribe to the given event types (patterns allowed, empty = all).
    pub fn subscribe<I, S>(&self, event_types: I, handler: Arc<dyn EventHandler>) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_filtered(SubscriptionFilter::event_types(event_types), handler)
    }

    pub fn subscribe_filtered(&self, filter: SubscriptionFilter, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = handler.name().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        self.subscribers.insert(
            id,
            SubscriberEntry {
                name: name.clone(),
                filter,
                sender: tx,
            },
        );

        tokio::spawn(run_subscriber(
            handler,
            rx,
            self.config.handler_max_attempts.max(1),
            self.config.handler_retry_delay,
            self.counters.clone(),
            self.dead_letters.clone(),
        ));

        tracing::debug!(subscriber = %name, id, "Subscribed");
        Subscription {
            id,
            name,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Route and fan out a freshly stored event.
    pub fn publish(&self, event: UnifiedEvent) -> PublishReceipt {
        self.dispatch(Arc::new(event), None, false)
    }

    /// Route and fan out with the store sequence attached.
    pub fn publish_stored(&self, event: UnifiedEvent, sequence: u64) -> PublishReceipt {
        self.dispatch(Arc::new(event), Some(sequence), false)
    }

    /// Re-deliver a stored event, flagged as a replay.
    pub fn publish_replay(&self, event: UnifiedEvent, sequence: u64) -> PublishReceipt {
        self.dispatch(Arc::new(event), Some(sequence), true)
    }

    #[instrument(skip(self, event, sequence), fields(event_id = %event.id, event_type = %event.event_type))]
    fn dispatch(&self, event: Arc<UnifiedEvent>, sequence: Option<u64>, replay: bool) -> PublishReceipt {
        let topics = Arc::new(self.routing.topics_for(&event));
        let mut deliveries = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            if !entry.filter.matches(&event.event_type, &topics) {
                continue;
            }
            let delivery = EventDelivery {
                event: event.clone(),
                sequence,
                replay,
                attempt: 1,
                topics: topics.clone(),
            };
            self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
            if entry.sender.send(delivery).is_ok() {
                deliveries += 1;
            } else {
                self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                closed.push(*entry.key());
            }
        }

        for id in closed {
            if let Some((_, entry)) = self.subscribers.remove(&id) {
                tracing::warn!(subscriber = %entry.name, "Dropping subscriber whose task has exited");
            }
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        for topic in topics.iter() {
            counter!("confluence_events_published_total", "topic" => topic.as_str()).increment(1);
        }

        PublishReceipt {
            topics: (*topics).clone(),
            deliveries,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            subscribers: self.subscribers.len(),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    /// Wait until every queued delivery has been handled or dead-lettered,
    /// or `timeout` passes. Returns whether the bus drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.counters.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn emit(&self, event: UnifiedEvent) -> Result<()> {
        self.publish(event);
        Ok(())
    }
}

async fn run_subscriber(
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::UnboundedReceiver<EventDelivery>,
    max_attempts: u32,
    retry_delay: Duration,
    counters: Arc<BusCounters>,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
) {
    while let Some(mut delivery) = rx.recv().await {
        for attempt in 1..=max_attempts {
            delivery.attempt = attempt;
            let outcome = AssertUnwindSafe(handler.handle(&delivery))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ConfluenceError::internal(format!("handler {} panicked", handler.name()))));

            let err = match outcome {
                Ok(()) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) => e,
            };

            counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            counter!("confluence_handler_failures_total", "subscriber" => handler.name().to_string()).increment(1);

            if attempt < max_attempts {
                tracing::warn!(
                    subscriber = handler.name(),
                    event_id = %delivery.event.id,
                    attempt,
                    error = %err,
                    "Handler failed, redelivering"
                );
                tokio::time::sleep(retry_delay * attempt).await;
                continue;
            }

            let exhausted = ConfluenceError::retries_exhausted(format!("handler {}", handler.name()), attempt, err);
            tracing::error!(
                subscriber = handler.name(),
                event_id = %delivery.event.id,
                event_type = %delivery.event.event_type,
                error = %exhausted,
                "Delivery dead-lettered"
            );
            counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            counter!("confluence_handler_dead_letters_total", "subscriber" => handler.name().to_string())
                .increment(1);

            let mut letters = dead_letters.lock();
            if letters.len() >= DEAD_LETTER_CAPACITY {
                letters.pop_front();
            }
            letters.push_back(DeadLetter {
                subscriber: handler.name().to_string(),
                event_id: delivery.event.id,
                event_type: delivery.event.event_type.clone(),
                attempts: attempt,
                error: exhausted.to_string(),
                failed_at: Utc::now(),
            });
        }
        counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dedupe
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded set of recently seen event ids. The oldest id is evicted first.
pub struct DedupeWindow {
    capacity: usize,
    inner: Mutex<(HashSet<EventId>, VecDeque<EventId>)>,
}

impl DedupeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.inner.lock().0.contains(id)
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&self, id: EventId) -> bool {
        let mut guard = self.inner.lock();
        let (seen, order) = &mut *guard;
        if !seen.insert(id) {
            return false;
        }
        order.push_back(id);
        while order.len() > self.capacity {
            if let Some(old) = order.pop_front() {
                seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

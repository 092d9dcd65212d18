//! The ingest pipeline every event enters the core through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::instrument;

use super::locks::EntityLocks;
use crate::clock::{LocalClock, VectorClock};
use crate::conflict::{entity_key, ConflictResolver, EntityUpdate, Resolution};
use crate::error::Result;
use crate::events::{
    append_with_retry, event_types, EventBus, EventFilter, EventId, EventSink, EventStore, StoredEvent, System,
    Topic, UnifiedEvent,
};
use crate::resilience::{RetryPolicy, SlidingWindowRateLimiter};

// ═══════════════════════════════════════════════════════════════════════════════
// Outcomes
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub event_id: EventId,
    pub sequence: u64,
    /// Already stored; not published again
    pub duplicate: bool,
    pub topics: BTreeSet<Topic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<VectorClock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolutions: Vec<Resolution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub event_types: Vec<String>,
    pub replayed: usize,
    /// Subscriber deliveries queued across all replayed events
    pub deliveries: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub ingested: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub tracked_entities: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate limit → lock entity → stamp clock → store → resolve conflicts → publish.
///
/// The store append is the only step serialized per entity. Publishing
/// happens while the entity lock is still held so subscribers see one
/// entity's events in store order; delivery itself never blocks ingest.
pub struct SyncCoordinator {
    store: Arc<dyn EventStore>,
    bus: Arc<EventBus>,
    resolver: Arc<ConflictResolver>,
    ingress_limiter: Option<Arc<SlidingWindowRateLimiter>>,
    retry: RetryPolicy,
    locks: EntityLocks,
    entity_clocks: DashMap<String, VectorClock>,
    ingested: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn EventStore>,
        bus: Arc<EventBus>,
        resolver: Arc<ConflictResolver>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            bus,
            resolver,
            ingress_limiter: None,
            retry,
            locks: EntityLocks::new(),
            entity_clocks: DashMap::new(),
            ingested: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_ingress_limiter(mut self, limiter: Arc<SlidingWindowRateLimiter>) -> Self {
        self.ingress_limiter = Some(limiter);
        self
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn entity_clock(&self, entity_type: &str, entity_id: &str) -> Option<VectorClock> {
        self.entity_clocks
            .get(&entity_key(entity_type, entity_id))
            .map(|c| c.clone())
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            ingested: self.ingested.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            tracked_entities: self.entity_clocks.len(),
        }
    }

    /// Drop idle entity locks.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    /// Admit, persist and publish one event from an external producer.
    ///
    /// A rate-limit rejection is returned as-is with its retry-after; nothing
    /// is queued. Publishing only happens after the store acknowledged the
    /// append.
    pub async fn ingest(&self, event: UnifiedEvent) -> Result<IngestOutcome> {
        if let Some(ref limiter) = self.ingress_limiter {
            if let Err(e) = limiter.check(&event.producer_key()) {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(event_id = %event.id, producer = %event.producer_key(), "Ingest rate limited");
                return Err(e);
            }
        }
        self.store_and_publish(event).await
    }

    /// Ingest an event produced inside the core. The ingress limiter only
    /// meters external producers and is skipped.
    pub async fn ingest_internal(&self, event: UnifiedEvent) -> Result<IngestOutcome> {
        self.store_and_publish(event).await
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type, source = %event.source))]
    async fn store_and_publish(&self, mut event: UnifiedEvent) -> Result<IngestOutcome> {
        let key = event.entity_ref().map(|(t, id)| entity_key(t, id));
        let guard = match &key {
            Some(key) => Some(self.locks.acquire(key).await),
            None => None,
        };

        if let Some(key) = &key {
            let known = self.entity_clocks.get(key).map(|c| c.clone()).unwrap_or_default();
            if event.vector_clock.is_none() {
                event.vector_clock = Some(LocalClock::resume(event.source.as_str(), known).tick());
            }
        }

        // Malformed entity updates are rejected before anything is written.
        let update = EntityUpdate::from_event(&event)?;

        let ack = append_with_retry(self.store.as_ref(), &event, &self.retry).await?;
        if ack.duplicate {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(sequence = ack.sequence, "Duplicate event, not republished");
            return Ok(IngestOutcome {
                event_id: event.id,
                sequence: ack.sequence,
                duplicate: true,
                topics: BTreeSet::new(),
                vector_clock: event.vector_clock,
                resolutions: Vec::new(),
            });
        }
        self.ingested.fetch_add(1, Ordering::Relaxed);
        counter!("confluence_events_appended_total", "source" => event.source.as_str()).increment(1);

        if let (Some(key), Some(clock)) = (&key, &event.vector_clock) {
            self.entity_clocks.entry(key.clone()).or_default().merge(clock);
        }

        let resolutions = match update {
            Some(update) if self.resolver.is_conflict_prone(&update.entity_type) => {
                self.resolver.process(update).resolutions
            }
            _ => Vec::new(),
        };

        let receipt = self.bus.publish_stored(event.clone(), ack.sequence);
        drop(guard);

        for resolution in &resolutions {
            self.announce_resolution(&event, resolution).await;
        }

        Ok(IngestOutcome {
            event_id: event.id,
            sequence: ack.sequence,
            duplicate: false,
            topics: receipt.topics,
            vector_clock: event.vector_clock,
            resolutions,
        })
    }

    /// Store and broadcast a `CONFLICT_RESOLVED` event so both systems can
    /// converge on the merged values.
    async fn announce_resolution(&self, cause: &UnifiedEvent, resolution: &Resolution) {
        let payload = match serde_json::to_value(resolution) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize conflict resolution");
                return;
            }
        };
        let event = UnifiedEvent::new(event_types::CONFLICT_RESOLVED, System::Backend, payload)
            .with_correlation_id(cause.correlation_id.clone().unwrap_or_else(|| cause.id.to_string()))
            .with_metadata("producer", "conflict-resolver");

        match append_with_retry(self.store.as_ref(), &event, &self.retry).await {
            Ok(ack) => {
                self.bus.publish_stored(event, ack.sequence);
            }
            Err(e) => {
                tracing::warn!(caused_by = %cause.id, error = %e, "Failed to record conflict resolution");
            }
        }
    }

    /// Events matching the filter, in store order.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        self.store.query(filter).await
    }

    /// Re-drive stored events in `[from, to]` through current subscribers,
    /// flagged as replays. Empty `event_types` replays every type.
    #[instrument(skip(self, event_types))]
    pub async fn replay_events(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        event_types: Vec<String>,
    ) -> Result<ReplayReport> {
        let filter = EventFilter::new()
            .with_range(from, to)
            .with_types(event_types.iter().cloned());
        let stored = self.store.query(&filter).await?;

        let mut deliveries = 0;
        for entry in &stored {
            deliveries += self.bus.publish_replay(entry.event.clone(), entry.sequence).deliveries;
        }

        tracing::info!(replayed = stored.len(), deliveries, "Replayed stored events");
        Ok(ReplayReport {
            from,
            to,
            event_types,
            replayed: stored.len(),
            deliveries,
        })
    }
}

#[async_trait]
impl EventSink for SyncCoordinator {
    async fn emit(&self, event: UnifiedEvent) -> Result<()> {
        self.ingest(event).await.map(|_| ())
    }
}

/// Sink for the core's own producers (saga lifecycle, reconciliation
/// records), ingesting through [`SyncCoordinator::ingest_internal`].
pub struct InternalSink(Arc<SyncCoordinator>);

impl InternalSink {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self(coordinator)
    }
}

#[async_trait]
impl EventSink for InternalSink {
    async fn emit(&self, event: UnifiedEvent) -> Result<()> {
        self.0.ingest_internal(event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictConfig;
    use crate::error::ErrorCode;
    use crate::events::{BusConfig, InMemoryEventStore};
    use crate::resilience::RateLimitConfig;
    use serde_json::json;
    use std::time::Duration;

    fn coordinator() -> (Arc<InMemoryEventStore>, SyncCoordinator) {
        let store = Arc::new(InMemoryEventStore::new());
        let sync = SyncCoordinator::new(
            store.clone(),
            Arc::new(EventBus::new(BusConfig::default())),
            Arc::new(ConflictResolver::new(ConflictConfig::default())),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        );
        (store, sync)
    }

    fn profile_update(source: System, name: &str) -> UnifiedEvent {
        UnifiedEvent::new(
            "USER_PROFILE_UPDATED",
            source,
            json!({"entityType": "user", "entityId": "u-1", "changes": {"name": name}}),
        )
    }

    #[tokio::test]
    async fn test_unclocked_events_are_stamped_in_sequence() {
        let (_, sync) = coordinator();

        let first = sync.ingest(profile_update(System::Frontend, "A")).await.unwrap();
        let second = sync.ingest(profile_update(System::Frontend, "B")).await.unwrap();

        let c1 = first.vector_clock.unwrap();
        let c2 = second.vector_clock.unwrap();
        assert_eq!(c1.get("frontend"), 1);
        assert_eq!(c2.get("frontend"), 2);
        assert!(c1.happens_before(&c2));
        assert!(second.resolutions.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_is_not_republished() {
        let (store, sync) = coordinator();
        let event = profile_update(System::Legacy, "A");

        let first = sync.ingest(event.clone()).await.unwrap();
        let again = sync.ingest(event).await.unwrap();

        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert_eq!(again.sequence, first.sequence);
        assert_eq!(store.len(), 1);
        assert_eq!(sync.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_invalid_changes_rejected_before_append() {
        let (store, sync) = coordinator();
        let event = UnifiedEvent::new(
            "USER_PROFILE_UPDATED",
            System::Frontend,
            json!({"entityType": "user", "entityId": "u-1", "changes": [1, 2]}),
        );

        let err = sync.ingest(event).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidEvent);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_rejection_is_synchronous() {
        let (store, sync) = coordinator();
        let sync = sync.with_ingress_limiter(Arc::new(SlidingWindowRateLimiter::new(
            "ingress",
            RateLimitConfig::new(1, Duration::from_secs(3600)),
        )));

        sync.ingest(UnifiedEvent::new("PING", System::Frontend, json!({}))).await.unwrap();
        let err = sync
            .ingest(UnifiedEvent::new("PING", System::Frontend, json!({})))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::RateLimited);
        assert_eq!(store.len(), 1);
        assert_eq!(sync.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_internal_ingest_skips_ingress_limit() {
        let (store, sync) = coordinator();
        let sync = Arc::new(sync.with_ingress_limiter(Arc::new(SlidingWindowRateLimiter::new(
            "ingress",
            RateLimitConfig::new(1, Duration::from_secs(3600)),
        ))));
        let sink = InternalSink::new(sync.clone());

        for _ in 0..3 {
            sink.emit(UnifiedEvent::new("SAGA_STEP_COMPLETED", System::Backend, json!({})))
                .await
                .unwrap();
        }
        sync.ingest(UnifiedEvent::new("PING", System::Backend, json!({}))).await.unwrap();

        assert_eq!(store.len(), 4);
        assert_eq!(sync.stats().rejected, 0);
    }

    #[tokio::test]
    async fn test_persistent_append_failure_is_not_published() {
        let (store, sync) = coordinator();
        store.fail_next_appends(10);

        let err = sync
            .ingest(UnifiedEvent::new("PING", System::Frontend, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::EventStoreAppendFailed);
        assert_eq!(sync.bus().stats().published, 0);
    }
}

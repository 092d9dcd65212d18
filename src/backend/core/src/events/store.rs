//! Append-only event persistence.
//!
//! Two backends implement [`EventStore`]: an in-process store used by tests
//! and single-node deployments, and a PostgreSQL store. Appends are
//! idempotent on event id, so a redelivered event is acknowledged with its
//! original sequence instead of being stored twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::event::{EventId, StoredEvent, System, UnifiedEvent};
use crate::error::{ConfluenceError, ErrorCode, Result};
use crate::resilience::{retry_with_backoff, RetryPolicy};

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Acknowledgement of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendAck {
    pub sequence: u64,
    /// The event id was already stored; nothing new was written
    pub duplicate: bool,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event. Appending an id that already exists is a no-op that
    /// returns the original sequence.
    async fn append(&self, event: &UnifiedEvent) -> Result<AppendAck>;

    /// Events matching the filter, in arrival order.
    async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>>;

    async fn get(&self, id: EventId) -> Result<Option<StoredEvent>>;

    async fn count(&self) -> Result<u64>;

    fn backend(&self) -> &'static str;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════════════════════════

/// Selection criteria for queries and replay. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub source: Option<System>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Inclusive lower bound on the event timestamp
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the event timestamp
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    /// Only events stored after this sequence
    #[serde(default)]
    pub after_sequence: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source(mut self, source: System) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_range(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn after(mut self, sequence: u64) -> Self {
        self.after_sequence = Some(sequence);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, stored: &StoredEvent) -> bool {
        let event = &stored.event;
        if !self.event_types.is_empty() && !self.event_types.iter().any(|t| t == &event.event_type) {
            return false;
        }
        if self.source.is_some_and(|s| s != event.source) {
            return false;
        }
        if let Some(ref id) = self.correlation_id {
            if event.correlation_id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        if self.from.is_some_and(|from| event.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| event.timestamp > to) {
            return false;
        }
        if self.after_sequence.is_some_and(|seq| stored.sequence <= seq) {
            return false;
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryLog {
    events: Vec<StoredEvent>,
    by_id: HashMap<EventId, usize>,
}

/// Process-local store. Sequences start at 1.
#[derive(Default)]
pub struct InMemoryEventStore {
    log: RwLock<MemoryLog>,
    fail_appends: AtomicU32,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with a retryable storage error.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.log.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: &UnifiedEvent) -> Result<AppendAck> {
        let injected = self
            .fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(ConfluenceError::new(
                ErrorCode::DatabaseQueryFailed,
                "Event log temporarily unavailable",
            ));
        }

        let mut log = self.log.write();
        if let Some(&idx) = log.by_id.get(&event.id) {
            return Ok(AppendAck {
                sequence: log.events[idx].sequence,
                duplicate: true,
            });
        }

        let sequence = log.events.len() as u64 + 1;
        let idx = log.events.len();
        log.events.push(StoredEvent {
            sequence,
            stored_at: Utc::now(),
            event: event.clone(),
        });
        log.by_id.insert(event.id, idx);

        Ok(AppendAck {
            sequence,
            duplicate: false,
        })
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        let log = self.log.read();
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(log
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get(&self, id: EventId) -> Result<Option<StoredEvent>> {
        let log = self.log.read();
        Ok(log.by_id.get(&id).map(|&idx| log.events[idx].clone()))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.log.read().events.len() as u64)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PostgreSQL Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    sequence: i64,
    id: Uuid,
    event_type: String,
    source: String,
    target: Option<String>,
    payload: serde_json::Value,
    timestamp: DateTime<Utc>,
    correlation_id: Option<String>,
    vector_clock: Option<serde_json::Value>,
    metadata: serde_json::Value,
    stored_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for StoredEvent {
    type Error = ConfluenceError;

    fn try_from(row: EventRow) -> Result<Self> {
        let target = row.target.as_deref().map(str::parse::<System>).transpose()?;
        let vector_clock = row.vector_clock.map(serde_json::from_value).transpose()?;

        Ok(StoredEvent {
            sequence: row.sequence as u64,
            stored_at: row.stored_at,
            event: UnifiedEvent {
                id: EventId(row.id),
                event_type: row.event_type,
                source: row.source.parse()?,
                target,
                payload: row.payload,
                timestamp: row.timestamp,
                correlation_id: row.correlation_id,
                vector_clock,
                metadata: serde_json::from_value(row.metadata)?,
            },
        })
    }
}

const SELECT_EVENTS: &str = "SELECT sequence, id, event_type, source, target, payload, timestamp, \
     correlation_id, vector_clock, metadata, stored_at FROM unified_events";

/// Durable store backed by the `unified_events` table.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ConfluenceError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: &UnifiedEvent) -> Result<AppendAck> {
        let vector_clock = event
            .vector_clock
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO unified_events
                (id, event_type, source, target, payload, timestamp, correlation_id, vector_clock, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            RETURNING sequence
            "#,
        )
        .bind(event.id.0)
        .bind(&event.event_type)
        .bind(event.source.as_str())
        .bind(event.target.map(|t| t.as_str()))
        .bind(&event.payload)
        .bind(event.timestamp)
        .bind(&event.correlation_id)
        .bind(vector_clock)
        .bind(serde_json::to_value(&event.metadata)?)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(sequence) = inserted {
            return Ok(AppendAck {
                sequence: sequence as u64,
                duplicate: false,
            });
        }

        let existing: i64 = sqlx::query_scalar("SELECT sequence FROM unified_events WHERE id = $1")
            .bind(event.id.0)
            .fetch_one(&self.pool)
            .await?;

        Ok(AppendAck {
            sequence: existing as u64,
            duplicate: true,
        })
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_EVENTS);
        qb.push(" WHERE TRUE");

        if !filter.event_types.is_empty() {
            qb.push(" AND event_type = ANY(")
                .push_bind(filter.event_types.clone())
                .push(")");
        }
        if let Some(source) = filter.source {
            qb.push(" AND source = ").push_bind(source.as_str());
        }
        if let Some(ref id) = filter.correlation_id {
            qb.push(" AND correlation_id = ").push_bind(id.clone());
        }
        if let Some(from) = filter.from {
            qb.push(" AND timestamp >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" AND timestamp <= ").push_bind(to);
        }
        if let Some(after) = filter.after_sequence {
            qb.push(" AND sequence > ").push_bind(after as i64);
        }
        qb.push(" ORDER BY sequence ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<EventRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(StoredEvent::try_from).collect()
    }

    async fn get(&self, id: EventId) -> Result<Option<StoredEvent>> {
        let row = sqlx::query_as::<_, EventRow>(&format!("{} WHERE id = $1", SELECT_EVENTS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(StoredEvent::try_from).transpose()
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM unified_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retrying Append
// ═══════════════════════════════════════════════════════════════════════════════

/// Append with backoff on transient storage errors. A persistent failure
/// surfaces as `EventStoreAppendFailed` and the event is not published.
pub async fn append_with_retry(
    store: &dyn EventStore,
    event: &UnifiedEvent,
    policy: &RetryPolicy,
) -> Result<AppendAck> {
    match retry_with_backoff(policy, "event_store.append", || store.append(event)).await {
        Ok(ack) => Ok(ack),
        Err(e) if e.is_retryable() => {
            tracing::error!(
                alert = true,
                event_id = %event.id,
                event_type = %event.event_type,
                backend = store.backend(),
                error = %e,
                "Event append failed after retries"
            );
            Err(ConfluenceError::append_failed(event.id, policy.max_attempts.max(1)).with_source(e))
        }
        Err(e) => Err(e),
    }
}

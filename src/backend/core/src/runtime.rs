//! Wiring of every component from a [`Config`], and the lifecycle of the
//! background tasks that keep the two systems converging.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{
    ChangePoller, Collaborator, CollaboratorRoute, CommandForwarder, GuardedCollaborator, HttpCollaborator,
};
use crate::config::Config;
use crate::conflict::{ConflictResolver, OwnershipTable};
use crate::error::Result;
use crate::events::{EventBus, EventSink, EventStore, InMemoryEventStore, PgEventStore, Subscription, System};
use crate::reconciliation::ReconciliationSweep;
use crate::resilience::{CircuitBreakerRegistry, SlidingWindowRateLimiter};
use crate::saga::SagaOrchestrator;
use crate::strangler::{RouteHandler, StranglerRouter};
use crate::sync::{InternalSink, SyncCoordinator};

/// Every long-lived component of one sync core process.
pub struct SyncRuntime {
    config: Config,
    store: Arc<dyn EventStore>,
    bus: Arc<EventBus>,
    resolver: Arc<ConflictResolver>,
    breakers: Arc<CircuitBreakerRegistry>,
    ingress_limiter: Arc<SlidingWindowRateLimiter>,
    legacy_limiter: Arc<SlidingWindowRateLimiter>,
    coordinator: Arc<SyncCoordinator>,
    sagas: Arc<SagaOrchestrator>,
    router: Arc<StranglerRouter>,
    legacy: Option<Arc<dyn Collaborator>>,
    modern: Option<Arc<dyn Collaborator>>,
    reconciliation: Option<Arc<ReconciliationSweep>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SyncRuntime {
    /// Build from configuration: PostgreSQL when `database.url` is set,
    /// HTTP collaborators for whichever URLs are configured.
    pub async fn build(config: Config) -> Result<Self> {
        let store: Arc<dyn EventStore> = match config.database.url {
            Some(ref url) => {
                let store = PgEventStore::connect(url, config.database.max_connections).await?;
                store.migrate().await?;
                tracing::info!("Connected to PostgreSQL event store");
                Arc::new(store)
            }
            None => {
                tracing::warn!("No database configured, events are kept in memory only");
                Arc::new(InMemoryEventStore::new())
            }
        };

        let timeout = config.collaborators.request_timeout;
        let legacy = match config.collaborators.legacy_url {
            Some(ref url) => Some(Arc::new(HttpCollaborator::new(System::Legacy, url, timeout)?) as Arc<dyn Collaborator>),
            None => None,
        };
        let modern = match config.collaborators.modern_url {
            Some(ref url) => Some(Arc::new(HttpCollaborator::new(System::Backend, url, timeout)?) as Arc<dyn Collaborator>),
            None => None,
        };

        Self::with_parts(config, store, legacy, modern)
    }

    /// Build around an explicit store and raw (unguarded) collaborators.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn EventStore>,
        legacy: Option<Arc<dyn Collaborator>>,
        modern: Option<Arc<dyn Collaborator>>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(config.bus.clone()));
        let resolver = Arc::new(ConflictResolver::new(config.conflict.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.resilience.circuit_breaker.clone()));
        let ingress_limiter = Arc::new(SlidingWindowRateLimiter::new(
            "ingress",
            config.resilience.ingress_rate_limit.clone(),
        ));
        let legacy_limiter = Arc::new(SlidingWindowRateLimiter::new(
            "legacy",
            config.resilience.legacy_rate_limit.clone(),
        ));

        let coordinator = Arc::new(
            SyncCoordinator::new(
                store.clone(),
                bus.clone(),
                resolver.clone(),
                config.resilience.retry.clone(),
            )
            .with_ingress_limiter(ingress_limiter.clone()),
        );
        let sink: Arc<dyn EventSink> = Arc::new(InternalSink::new(coordinator.clone()));

        let sagas = Arc::new(SagaOrchestrator::new(config.saga.clone()).with_sink(sink.clone()));

        let guard = |inner: Arc<dyn Collaborator>| -> Arc<dyn Collaborator> {
            let system = inner.system();
            let mut guarded = GuardedCollaborator::new(
                inner,
                breakers.get_or_create(system.as_str()),
                config.resilience.retry.clone(),
            );
            if system == System::Legacy {
                guarded = guarded.with_rate_limiter(legacy_limiter.clone());
            }
            Arc::new(guarded)
        };
        let legacy = legacy.map(guard);
        let modern = modern.map(guard);

        let router = Arc::new(StranglerRouter::new(breakers.clone()));
        for route in &config.strangler.routes {
            let legacy_handler = legacy
                .clone()
                .map(|c| Arc::new(CollaboratorRoute::new(c)) as Arc<dyn RouteHandler>);
            let modern_handler = modern
                .clone()
                .map(|c| Arc::new(CollaboratorRoute::new(c)) as Arc<dyn RouteHandler>);
            router.register_route(route.clone(), legacy_handler, modern_handler)?;
        }

        let reconciliation = match (&legacy, &modern) {
            (Some(l), Some(m)) if config.reconciliation.enabled => Some(Arc::new(
                ReconciliationSweep::new(
                    config.reconciliation.clone(),
                    l.clone(),
                    m.clone(),
                    OwnershipTable::new(config.conflict.ownership_rules.clone()),
                )
                .with_sink(sink),
            )),
            _ => None,
        };

        Ok(Self {
            config,
            store,
            bus,
            resolver,
            breakers,
            ingress_limiter,
            legacy_limiter,
            coordinator,
            sagas,
            router,
            legacy,
            modern,
            reconciliation,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.config
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

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn sagas(&self) -> &Arc<SagaOrchestrator> {
        &self.sagas
    }

    pub fn router(&self) -> &Arc<StranglerRouter> {
        &self.router
    }

    /// Guarded legacy collaborator, when configured.
    pub fn legacy(&self) -> Option<&Arc<dyn Collaborator>> {
        self.legacy.as_ref()
    }

    /// Guarded modern collaborator, when configured.
    pub fn modern(&self) -> Option<&Arc<dyn Collaborator>> {
        self.modern.as_ref()
    }

    pub fn reconciliation(&self) -> Option<&Arc<ReconciliationSweep>> {
        self.reconciliation.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach forwarders and spawn every background loop.
    pub fn start(&self) {
        let token = self.shutdown.clone();
        let mut tasks = self.tasks.lock();
        let mut subscriptions = self.subscriptions.lock();
        let dedupe = self.config.bus.dedupe_capacity;
        let poll_interval = self.config.collaborators.poll_interval;

        for collaborator in self.legacy.iter().chain(self.modern.iter()) {
            subscriptions.push(CommandForwarder::attach(&self.bus, collaborator.clone(), dedupe));

            let poller = Arc::new(ChangePoller::new(collaborator.clone(), self.coordinator.clone()));
            tasks.push(poller.spawn(poll_interval, token.clone()));
        }

        tasks.push(self.sagas.clone().spawn_monitor(token.clone()));

        let sweep = self.config.resilience.sweep_interval;
        tasks.push(self.ingress_limiter.clone().spawn_sweeper(sweep, token.clone()));
        tasks.push(self.legacy_limiter.clone().spawn_sweeper(sweep, token.clone()));
        tasks.push(spawn_lock_pruner(self.coordinator.clone(), sweep, token.clone()));

        if let Some(ref reconciliation) = self.reconciliation {
            tasks.push(reconciliation.clone().spawn(token.clone()));
        }

        tracing::info!(
            background_tasks = tasks.len(),
            forwarders = subscriptions.len(),
            "Sync runtime started"
        );
    }

    /// Stop background loops, then give queued deliveries `drain_timeout`
    /// to finish.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        if !self.bus.drain(drain_timeout).await {
            tracing::warn!(in_flight = self.bus.stats().in_flight, "Bus did not drain before shutdown");
        }
        tracing::info!("Sync runtime stopped");
    }
}

fn spawn_lock_pruner(coordinator: Arc<SyncCoordinator>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = coordinator.prune_locks();
                    if pruned > 0 {
                        tracing::debug!(pruned, "Pruned idle entity locks");
                    }
                }
            }
        }
    })
}

//! Applies routed bus events to the target system.

use async_trait::async_trait;
use std::sync::Arc;

use super::collaborator::{Collaborator, Command};
use crate::error::Result;
use crate::events::{DedupeWindow, EventBus, EventDelivery, EventHandler, Subscription, SubscriptionFilter};

/// Metadata key naming the system an event was already applied to.
pub const APPLIED_TO: &str = "applied_to";

/// Bus subscriber that forwards every event routed to `target`'s topic as a
/// command on that system's collaborator.
///
/// Replays, events that originated in the target itself and events already
/// applied there (`applied_to` metadata) are skipped. An event is remembered
/// only after the command succeeds, so a retried delivery is forwarded again
/// while a duplicate delivery is not.
pub struct CommandForwarder {
    name: String,
    target: Arc<dyn Collaborator>,
    seen: DedupeWindow,
}

impl CommandForwarder {
    pub fn new(target: Arc<dyn Collaborator>, dedupe_capacity: usize) -> Self {
        Self {
            name: format!("forwarder.{}", target.system()),
            target,
            seen: DedupeWindow::new(dedupe_capacity),
        }
    }

    /// Subscribe a forwarder to the target system's topic.
    pub fn attach(bus: &EventBus, target: Arc<dyn Collaborator>, dedupe_capacity: usize) -> Subscription {
        let system = target.system();
        let forwarder = Arc::new(Self::new(target, dedupe_capacity));
        bus.subscribe_filtered(SubscriptionFilter::default().with_topics(&[system]), forwarder)
    }
}

#[async_trait]
impl EventHandler for CommandForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, delivery: &EventDelivery) -> Result<()> {
        let event = &delivery.event;
        let target = self.target.system();

        let applied = event.metadata.get(APPLIED_TO).is_some_and(|s| s == target.as_str());
        if delivery.is_replay() || event.source == target || applied || self.seen.contains(&event.id) {
            return Ok(());
        }

        self.target.send_command(&Command::from_event(event)).await?;
        self.seen.insert(event.id);

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            from = %event.source,
            to = %target,
            "Forwarded event"
        );
        Ok(())
    }
}

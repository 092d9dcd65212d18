//! Strangler route handler backed by a collaborator.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::collaborator::{Collaborator, Command};
use crate::error::Result;
use crate::events::{EventId, System};
use crate::strangler::{RouteHandler, RouteRequest};

/// Serves a route by sending the request to one system as a command named
/// after the route. The request's `correlationId` metadata is carried over.
pub struct CollaboratorRoute {
    collaborator: Arc<dyn Collaborator>,
    command_type: String,
}

impl CollaboratorRoute {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self {
            collaborator,
            command_type: String::new(),
        }
    }

    /// Override the command type; defaults to the route name.
    pub fn with_command_type(mut self, command_type: impl Into<String>) -> Self {
        self.command_type = command_type.into();
        self
    }
}

#[async_trait]
impl RouteHandler for CollaboratorRoute {
    async fn handle(&self, request: &RouteRequest) -> Result<Value> {
        let event_type = if self.command_type.is_empty() {
            request.route.clone()
        } else {
            self.command_type.clone()
        };
        let command = Command {
            event_id: EventId::new(),
            event_type,
            origin: System::Frontend,
            payload: request.payload.clone(),
            correlation_id: request.metadata.get("correlationId").cloned(),
        };

        self.collaborator.send_command(&command).await?;
        Ok(json!({
            "accepted": true,
            "commandId": command.event_id,
            "system": self.collaborator.system(),
        }))
    }
}

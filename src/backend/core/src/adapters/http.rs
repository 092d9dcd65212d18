//! HTTP collaborator.
//!
//! Endpoints, relative to the collaborator's base URL:
//!
//! | call | request |
//! |---|---|
//! | change feed | `GET /changes?since=<cursor>` → [`ChangeBatch`] |
//! | command | `POST /commands` with a [`Command`] body |
//! | entity listing | `GET /entities/<type>` → `[EntityRecord]` |

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::collaborator::{ChangeBatch, Collaborator, Command, EntityRecord};
use crate::error::{ErrorContext, ErrorCode, Result};
use crate::events::System;

pub struct HttpCollaborator {
    system: System,
    client: Client,
    base_url: String,
}

impl HttpCollaborator {
    pub fn new(system: System, base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("confluence/", env!("CARGO_PKG_VERSION")))
            .build()
            .with_error_code(ErrorCode::ConfigurationError)?;

        Ok(Self {
            system,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Collaborator for HttpCollaborator {
    fn system(&self) -> System {
        self.system
    }

    async fn changes_since(&self, cursor: Option<&str>) -> Result<ChangeBatch> {
        let mut request = self.client.get(self.url("/changes"));
        if let Some(cursor) = cursor {
            request = request.query(&[("since", cursor)]);
        }

        let batch = request.send().await?.error_for_status()?.json::<ChangeBatch>().await?;
        tracing::debug!(
            system = %self.system,
            changes = batch.changes.len(),
            next_cursor = ?batch.next_cursor,
            "Fetched change feed"
        );
        Ok(batch)
    }

    async fn send_command(&self, command: &Command) -> Result<()> {
        self.client
            .post(self.url("/commands"))
            .json(command)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_entities(&self, entity_type: &str) -> Result<Vec<EntityRecord>> {
        let records = self
            .client
            .get(self.url(&format!("/entities/{}", entity_type)))
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<EntityRecord>>()
            .await?;
        Ok(records)
    }
}

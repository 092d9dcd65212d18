//! Pulls collaborator change feeds into the sync pipeline.

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::collaborator::Collaborator;
use crate::error::{ErrorCode, Result};
use crate::events::EventSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub fetched: usize,
    pub ingested: usize,
    /// Changes ingest refused outright; the cursor moves past them
    pub skipped: usize,
}

/// Polls one collaborator from a cursor and ingests each change.
///
/// The cursor only advances once every change in a batch was handled. A
/// retryable or rate-limit error stops the batch and it is fetched again on
/// the next poll, where ingest dedupes the events that already made it
/// through. Any other error means the change itself is bad: it is logged,
/// counted and skipped.
pub struct ChangePoller {
    source: Arc<dyn Collaborator>,
    sink: Arc<dyn EventSink>,
    cursor: Mutex<Option<String>>,
}

impl ChangePoller {
    pub fn new(source: Arc<dyn Collaborator>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            source,
            sink,
            cursor: Mutex::new(None),
        }
    }

    pub fn with_cursor(self, cursor: impl Into<String>) -> Self {
        *self.cursor.lock() = Some(cursor.into());
        self
    }

    pub fn cursor(&self) -> Option<String> {
        self.cursor.lock().clone()
    }

    pub async fn poll_once(&self) -> Result<PollReport> {
        let cursor = self.cursor();
        let batch = self.source.changes_since(cursor.as_deref()).await?;
        let mut report = PollReport {
            fetched: batch.changes.len(),
            ..PollReport::default()
        };

        for change in batch.changes {
            let (event_id, event_type) = (change.id, change.event_type.clone());
            match self.sink.emit(change).await {
                Ok(()) => report.ingested += 1,
                Err(e) if e.is_retryable() || e.code() == ErrorCode::RateLimited => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        system = %self.source.system(),
                        %event_id,
                        event_type = %event_type,
                        error = %e,
                        "Skipping change rejected by ingest"
                    );
                    counter!("confluence_poll_rejected_total", "system" => self.source.system().as_str()).increment(1);
                    report.skipped += 1;
                }
            }
        }

        if let Some(next) = batch.next_cursor {
            *self.cursor.lock() = Some(next);
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match self.poll_once().await {
                        Ok(report) if report.fetched > 0 => {
                            tracing::info!(
                                system = %self.source.system(),
                                fetched = report.fetched,
                                skipped = report.skipped,
                                "Ingested collaborator changes"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(system = %self.source.system(), error = %e, "Change poll failed");
                        }
                    },
                }
            }
        })
    }
}

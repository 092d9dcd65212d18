//! Route-by-route migration from legacy to modern implementations.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::instrument;

use super::sampler::{sticky_bucket, RandomSampler, TrafficSampler};
use crate::error::{ConfluenceError, Result};
use crate::events::System;
use crate::resilience::CircuitBreakerRegistry;

// ═══════════════════════════════════════════════════════════════════════════════
// Route Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Legacy,
    Dual,
    Migrated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Implementation {
    Legacy,
    Modern,
}

impl Implementation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Modern => "modern",
        }
    }

    pub fn system(&self) -> System {
        match self {
            Self::Legacy => System::Legacy,
            Self::Modern => System::Backend,
        }
    }

    fn breaker_key(&self) -> String {
        format!("strangler.{}", self.system())
    }
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub status: MigrationStatus,
    /// Share of dual-mode traffic sent to modern, 0..=100
    #[serde(default)]
    pub traffic_split_percent: u8,
    /// Keep each user on the same side of the split
    #[serde(default = "default_sticky")]
    pub sticky: bool,
}

fn default_sticky() -> bool {
    true
}

impl RouteConfig {
    pub fn new(name: impl Into<String>, status: MigrationStatus) -> Self {
        Self {
            name: name.into(),
            status,
            traffic_split_percent: 0,
            sticky: default_sticky(),
        }
    }

    pub fn dual(name: impl Into<String>, split_percent: u8) -> Self {
        Self {
            traffic_split_percent: split_percent,
            ..Self::new(name, MigrationStatus::Dual)
        }
    }

    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.traffic_split_percent > 100 {
            return Err(ConfluenceError::configuration(format!(
                "route {}: traffic_split_percent {} exceeds 100",
                self.name, self.traffic_split_percent
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub route: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RouteRequest {
    pub fn new(route: impl Into<String>, payload: Value) -> Self {
        Self {
            route: route.into(),
            payload,
            ..Self::default()
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResponse {
    pub route: String,
    pub served_by: Implementation,
    pub body: Value,
    /// Modern was tried first and failed
    pub fell_back: bool,
}

/// One side's implementation of a route.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, request: &RouteRequest) -> Result<Value>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStats {
    pub legacy_served: u64,
    pub modern_served: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSummary {
    pub config: RouteConfig,
    pub has_legacy: bool,
    pub has_modern: bool,
    pub stats: RouteStats,
}

#[derive(Clone)]
struct RouteEntry {
    config: RouteConfig,
    legacy: Option<Arc<dyn RouteHandler>>,
    modern: Option<Arc<dyn RouteHandler>>,
}

impl RouteEntry {
    fn handler(&self, side: Implementation) -> Option<Arc<dyn RouteHandler>> {
        match side {
            Implementation::Legacy => self.legacy.clone(),
            Implementation::Modern => self.modern.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Router
// ═══════════════════════════════════════════════════════════════════════════════

pub struct StranglerRouter {
    routes: DashMap<String, RouteEntry>,
    overrides: DashMap<(String, String), Implementation>,
    stats: DashMap<String, RouteStats>,
    breakers: Arc<CircuitBreakerRegistry>,
    sampler: Arc<dyn TrafficSampler>,
}

impl StranglerRouter {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            routes: DashMap::new(),
            overrides: DashMap::new(),
            stats: DashMap::new(),
            breakers,
            sampler: Arc::new(RandomSampler),
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn TrafficSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn register_route(
        &self,
        config: RouteConfig,
        legacy: Option<Arc<dyn RouteHandler>>,
        modern: Option<Arc<dyn RouteHandler>>,
    ) -> Result<()> {
        config.validate()?;
        tracing::info!(
            route = %config.name,
            status = ?config.status,
            split = config.traffic_split_percent,
            "Registered strangler route"
        );
        self.stats.entry(config.name.clone()).or_default();
        self.routes.insert(config.name.clone(), RouteEntry { config, legacy, modern });
        Ok(())
    }

    /// Move a route along its migration. `split` updates the dual-mode share.
    pub fn set_status(&self, route: &str, status: MigrationStatus, split: Option<u8>) -> Result<RouteConfig> {
        let mut entry = self
            .routes
            .get_mut(route)
            .ok_or_else(|| ConfluenceError::route_not_found(route))?;

        let mut updated = entry.config.clone();
        updated.status = status;
        if let Some(split) = split {
            updated.traffic_split_percent = split;
        }
        updated.validate()?;

        tracing::info!(
            route,
            from = ?entry.config.status,
            to = ?status,
            split = updated.traffic_split_percent,
            "Route migration status changed"
        );
        entry.config = updated.clone();
        Ok(updated)
    }

    /// Pin (or unpin, with `None`) a user to one side of a dual route.
    pub fn set_user_override(&self, route: &str, user_id: &str, side: Option<Implementation>) {
        let key = (route.to_string(), user_id.to_string());
        match side {
            Some(side) => {
                self.overrides.insert(key, side);
            }
            None => {
                self.overrides.remove(&key);
            }
        }
    }

    pub fn routes(&self) -> Vec<RouteSummary> {
        let mut out: Vec<RouteSummary> = self
            .routes
            .iter()
            .map(|e| RouteSummary {
                config: e.config.clone(),
                has_legacy: e.legacy.is_some(),
                has_modern: e.modern.is_some(),
                stats: self.stats.get(e.key()).map(|s| s.clone()).unwrap_or_default(),
            })
            .collect();
        out.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        out
    }

    /// Which side a dual route would pick for this request.
    pub fn select(&self, config: &RouteConfig, request: &RouteRequest) -> Implementation {
        let split = config.traffic_split_percent;
        if let Some(ref user) = request.user_id {
            if let Some(side) = self.overrides.get(&(config.name.clone(), user.clone())) {
                return *side;
            }
            if config.sticky {
                return side_for(sticky_bucket(&config.name, user), split);
            }
        }
        side_for(self.sampler.sample(), split)
    }

    #[instrument(skip(self, request), fields(route = %request.route))]
    pub async fn route(&self, request: RouteRequest) -> Result<RouteResponse> {
        let entry = self
            .routes
            .get(&request.route)
            .map(|e| e.clone())
            .ok_or_else(|| ConfluenceError::route_not_found(&request.route))?;

        match entry.config.status {
            MigrationStatus::Legacy => self.call(&entry, Implementation::Legacy, &request, false).await,
            MigrationStatus::Migrated => self.call(&entry, Implementation::Modern, &request, false).await,
            MigrationStatus::Dual => match self.select(&entry.config, &request) {
                Implementation::Legacy => self.call(&entry, Implementation::Legacy, &request, false).await,
                Implementation::Modern => match self.call(&entry, Implementation::Modern, &request, false).await {
                    Ok(response) => Ok(response),
                    Err(e) => {
                        tracing::warn!(route = %request.route, error = %e, "Modern path failed, falling back to legacy");
                        counter!("confluence_strangler_fallbacks_total", "route" => request.route.clone()).increment(1);
                        self.stats.entry(request.route.clone()).or_default().fallbacks += 1;
                        self.call(&entry, Implementation::Legacy, &request, true).await
                    }
                },
            },
        }
    }

    async fn call(
        &self,
        entry: &RouteEntry,
        side: Implementation,
        request: &RouteRequest,
        fell_back: bool,
    ) -> Result<RouteResponse> {
        let route = &entry.config.name;
        let handler = entry
            .handler(side)
            .ok_or_else(|| ConfluenceError::no_implementation(route, side))?;
        let breaker = self.breakers.get_or_create(&side.breaker_key());

        let result = breaker.call(|| handler.handle(request)).await;
        let mut stats = self.stats.entry(route.clone()).or_default();
        match result {
            Ok(body) => {
                match side {
                    Implementation::Legacy => stats.legacy_served += 1,
                    Implementation::Modern => stats.modern_served += 1,
                }
                drop(stats);
                counter!(
                    "confluence_strangler_requests_total",
                    "route" => route.clone(),
                    "served_by" => side.as_str()
                )
                .increment(1);
                Ok(RouteResponse {
                    route: route.clone(),
                    served_by: side,
                    body,
                    fell_back,
                })
            }
            Err(e) => {
                stats.failures += 1;
                Err(e)
            }
        }
    }
}

fn side_for(percentile: u8, split: u8) -> Implementation {
    if percentile < split {
        Implementation::Modern
    } else {
        Implementation::Legacy
    }
}

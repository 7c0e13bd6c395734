//! # Synchronization
//!
//! Refreshes every registered cache in one linear pass:
//!
//! ```text
//! simple caches -> primary cache -> dependent caches -> per-group fan-out
//! ```
//!
//! Failures in the first three stages abort the run. The primary cache's
//! output supplies the group identifiers for the fan-out. Groups are
//! refreshed one at a time with the sidecar enabled until one of them
//! actually writes a table; the rest go to a bounded worker pool with
//! sidecar writes suppressed. Once any group fails, no further groups are
//! dispatched in parallel and the groups not yet scheduled are refreshed one
//! at a time instead. Group errors never stop the fan-out; the first one is
//! returned when every group has been processed.

use crate::caches::asset_basics::AssetBasics;
use crate::caches::distinct::DistinctValues;
use crate::caches::qc::QualityControl;
use crate::caches::raw_to_derived::RawToDerived;
use crate::caches::source_data::SourceData;
use crate::caches::{CacheContext, EntityCache, GroupCache};
use crate::config::SyncConfig;
use crate::dataset::Dataset;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Ordered set of caches a sync run refreshes
#[derive(Clone, Default)]
pub struct Registry {
    simple: Vec<Arc<dyn EntityCache>>,
    primary: Option<(Arc<dyn EntityCache>, String)>,
    dependent: Vec<Arc<dyn EntityCache>>,
    groups: Vec<Arc<dyn GroupCache>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The six standard caches
    pub fn standard() -> Result<Self> {
        Self::builder()
            .simple(DistinctValues::project_names())
            .simple(DistinctValues::subject_ids())
            .primary(AssetBasics::default(), "subject_id")
            .dependent(SourceData)
            .dependent(RawToDerived)
            .group(QualityControl)
            .build()
    }

    /// Registered names in run order
    pub fn names(&self) -> Vec<&'static str> {
        self.simple
            .iter()
            .map(|c| c.name())
            .chain(self.primary.iter().map(|(c, _)| c.name()))
            .chain(self.dependent.iter().map(|c| c.name()))
            .chain(self.groups.iter().map(|g| g.family()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }
}

/// Builder for [`Registry`]
#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
    names: HashSet<&'static str>,
    errors: Vec<String>,
}

impl RegistryBuilder {
    fn claim(&mut self, name: &'static str) -> bool {
        if self.names.insert(name) {
            true
        } else {
            self.errors.push(format!("'{}' is registered twice", name));
            false
        }
    }

    /// Refreshed first, in registration order
    pub fn simple(mut self, cache: impl EntityCache + 'static) -> Self {
        if self.claim(cache.name()) {
            self.registry.simple.push(Arc::new(cache));
        }
        self
    }

    /// The cache whose `group_column` drives the fan-out
    pub fn primary(mut self, cache: impl EntityCache + 'static, group_column: impl Into<String>) -> Self {
        if self.registry.primary.is_some() {
            self.errors.push("only one primary cache may be registered".to_string());
            return self;
        }
        if self.claim(cache.name()) {
            self.registry.primary = Some((Arc::new(cache), group_column.into()));
        }
        self
    }

    /// Refreshed after the primary cache
    pub fn dependent(mut self, cache: impl EntityCache + 'static) -> Self {
        if self.claim(cache.name()) {
            self.registry.dependent.push(Arc::new(cache));
        }
        self
    }

    /// Refreshed once per group identifier
    pub fn group(mut self, cache: impl GroupCache + 'static) -> Self {
        if self.claim(cache.family()) {
            self.registry.groups.push(Arc::new(cache));
        }
        self
    }

    pub fn build(self) -> Result<Registry> {
        if !self.errors.is_empty() {
            return Err(CacheError::ConfigError(format!(
                "Invalid cache registry: {}",
                self.errors.join("; ")
            )));
        }
        if !self.registry.groups.is_empty() && self.registry.primary.is_none() {
            return Err(CacheError::ConfigError(
                "Group caches need a primary cache to supply group identifiers".to_string(),
            ));
        }
        Ok(self.registry)
    }
}

/// How fan-out groups were processed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCounts {
    pub total: usize,
    pub synchronous: usize,
    pub parallel: usize,
    pub sequential: usize,
    /// Groups whose refresh failed or whose worker panicked
    pub failed: usize,
}

/// Summary of a sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Caches refreshed, in run order
    pub refreshed: Vec<String>,
    pub groups: GroupCounts,
    /// Whether a worker failure switched the fan-out to sequential mode
    pub fell_back: bool,
}

impl SyncReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            refreshed: Vec::new(),
            groups: GroupCounts::default(),
            fell_back: false,
        }
    }
}

/// Drives a full refresh of a [`Registry`]
pub struct SyncOrchestrator {
    ctx: CacheContext,
    registry: Registry,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(ctx: CacheContext, registry: Registry, config: SyncConfig) -> Self {
        Self {
            ctx,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Refresh everything
    ///
    /// A data-level error from a fan-out worker is returned after every
    /// remaining group has been processed.
    pub async fn run(&self) -> Result<SyncReport> {
        let mut report = SyncReport::new();
        info!(run_id = %report.run_id, caches = ?self.registry.names(), "Starting sync");

        for cache in &self.registry.simple {
            self.refresh(cache.as_ref(), &mut report).await?;
        }

        let groups = match &self.registry.primary {
            Some((cache, column)) => {
                let data = self.refresh(cache.as_ref(), &mut report).await?;
                data.distinct_strings(column)
            }
            None => Vec::new(),
        };

        for cache in &self.registry.dependent {
            self.refresh(cache.as_ref(), &mut report).await?;
        }

        let mut deferred: Option<CacheError> = None;
        for cache in &self.registry.groups {
            if let Err(e) = self.fan_out(cache.clone(), &groups, &mut report).await {
                deferred.get_or_insert(e);
            }
        }

        report.finished_at = Some(Utc::now());
        info!(
            run_id = %report.run_id,
            refreshed = report.refreshed.len(),
            groups = report.groups.total,
            fell_back = report.fell_back,
            "Sync finished"
        );

        match deferred {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn refresh(&self, cache: &dyn EntityCache, report: &mut SyncReport) -> Result<Dataset> {
        info!(cache = cache.name(), "Refreshing");
        let data = cache.refresh(&self.ctx).await.map_err(|e| {
            error!(cache = cache.name(), error = %e, "Refresh failed, aborting sync");
            e
        })?;
        report.refreshed.push(cache.name().to_string());
        Ok(data)
    }

    async fn fan_out(
        &self,
        cache: Arc<dyn GroupCache>,
        groups: &[String],
        report: &mut SyncReport,
    ) -> Result<()> {
        let family = cache.family();
        report.groups.total += groups.len();
        if groups.is_empty() {
            info!(cache = family, "No groups to refresh");
            report.refreshed.push(family.to_string());
            return Ok(());
        }

        let mut pending = groups.iter();
        let mut degraded = false;
        let mut data_error: Option<CacheError> = None;

        // one group at a time until a write lands and the family sidecar exists
        for group in pending.by_ref() {
            match cache.refresh_group(&self.ctx, group, true).await {
                Ok(Some(_)) => {
                    report.groups.synchronous += 1;
                    break;
                }
                Ok(None) => {
                    report.groups.synchronous += 1;
                    debug!(cache = family, group = %group, "Nothing written, family sidecar still pending");
                }
                Err(e) => {
                    error!(cache = family, group = %group, error = %e, "Group refresh failed");
                    report.groups.failed += 1;
                    data_error.get_or_insert(e);
                    degraded = true;
                }
            }
        }

        let max_workers = self.config.max_workers.max(1);
        let mut workers = JoinSet::new();

        if !degraded {
            info!(cache = family, groups = pending.len(), max_workers, "Dispatching groups to workers");
        }
        loop {
            while !degraded && workers.len() < max_workers {
                let Some(group) = pending.next() else { break };
                let cache = cache.clone();
                let ctx = self.ctx.clone();
                let group = group.clone();
                workers.spawn(async move {
                    let result = cache.refresh_group(&ctx, &group, false).await;
                    (group, result)
                });
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            match joined {
                Ok((_, Ok(_))) => report.groups.parallel += 1,
                Ok((group, Err(e))) => {
                    error!(cache = family, group = %group, error = %e, "Group refresh failed");
                    report.groups.failed += 1;
                    data_error.get_or_insert(e);
                    degraded = true;
                }
                Err(e) => {
                    error!(cache = family, error = %e, "Worker did not complete");
                    report.groups.failed += 1;
                    degraded = true;
                }
            }
        }

        let remaining: Vec<&String> = pending.collect();
        if degraded && !remaining.is_empty() {
            report.fell_back = true;
            warn!(
                cache = family,
                remaining = remaining.len(),
                "Group refresh failed, continuing sequentially"
            );
            for group in remaining {
                match cache.refresh_group(&self.ctx, group, false).await {
                    Ok(_) => report.groups.sequential += 1,
                    Err(e) => {
                        error!(cache = family, group = %group, error = %e, "Group refresh failed");
                        report.groups.failed += 1;
                        data_error.get_or_insert(e);
                    }
                }
            }
        }

        report.refreshed.push(family.to_string());
        match data_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

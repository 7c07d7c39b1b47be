//! One replication run: list both pools, plan, transfer, optionally prune.
//!
//! Every run re-derives its plan from freshly listed catalogs, so a run that
//! failed half way is safely re-evaluated by the next one. Nothing is retried
//! within a run.

use crate::bridge::{StreamBridge, TransferStats};
use crate::catalog::ClassCatalog;
use crate::error::SyncError;
use crate::executor::SnapshotStore;
use crate::naming::SnapshotPoint;
use crate::planner::{self, TransferPlan};
use crate::retention::RetentionPruner;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{error, info};

/// States a run passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Nothing has happened yet.
    Start,
    /// Listing snapshots on the source.
    ListingSource,
    /// Listing snapshots on the destination.
    ListingDestination,
    /// Reconciling the two catalogs.
    Planning,
    /// Sending the first snapshot in full.
    Bootstrapping,
    /// Sending an incremental range.
    Incrementing,
    /// Destination already up to date.
    Idle,
    /// Run stopped because the histories diverged.
    Aborted,
    /// Destroying old source snapshots.
    Pruning,
    /// Run finished.
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::ListingSource => "list source",
            Self::ListingDestination => "list destination",
            Self::Planning => "plan",
            Self::Bootstrapping => "bootstrap transfer",
            Self::Incrementing => "incremental transfer",
            Self::Idle => "idle",
            Self::Aborted => "aborted",
            Self::Pruning => "prune",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// A fatal failure, tagged with the phase it happened in.
#[derive(Debug, Error)]
#[error("{phase} phase failed: {source}")]
pub struct RunError {
    /// Phase that failed.
    pub phase: RunPhase,
    /// Underlying failure.
    #[source]
    pub source: SyncError,
}

impl RunError {
    fn new(phase: RunPhase, source: SyncError) -> Self {
        Self { phase, source }
    }
}

/// Per-run switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Prune the source after a successful run.
    pub prune: bool,
    /// Retention horizon used when pruning.
    pub horizon_days: u32,
    /// Plan only; no send, receive or destroy.
    pub dry_run: bool,
    /// After a bootstrap, re-list the destination and continue incrementally.
    pub continue_after_bootstrap: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            prune: false,
            horizon_days: 30,
            dry_run: false,
            continue_after_bootstrap: true,
        }
    }
}

/// One executed (or, in a dry run, planned) transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// The plan that was acted on.
    pub plan: TransferPlan,
    /// Stream statistics; `None` in a dry run.
    pub stats: Option<TransferStats>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Source dataset.
    pub source_dataset: String,
    /// Destination dataset.
    pub destination_dataset: String,
    /// Phases visited, in order.
    pub phases: Vec<RunPhase>,
    /// Plans acted on, in order.
    pub transfers: Vec<TransferRecord>,
    /// Newest snapshot present on both sides at the end of the run.
    pub in_sync_through: Option<SnapshotPoint>,
    /// Head of the pruned range, if anything was (or would be) pruned.
    pub pruned_through: Option<SnapshotPoint>,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

impl RunReport {
    fn new(source_dataset: &str, destination_dataset: &str, dry_run: bool) -> Self {
        Self {
            source_dataset: source_dataset.to_string(),
            destination_dataset: destination_dataset.to_string(),
            phases: vec![RunPhase::Start],
            transfers: Vec::new(),
            in_sync_through: None,
            pruned_through: None,
            dry_run,
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        info!(
            %phase,
            source = %self.source_dataset,
            destination = %self.destination_dataset,
            "entering phase"
        );
        self.phases.push(phase);
    }

    /// Total bytes moved by all transfers.
    pub fn bytes_transferred(&self) -> u64 {
        self.transfers
            .iter()
            .filter_map(|t| t.stats.as_ref())
            .map(|s| s.bytes)
            .sum()
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        let state = match &self.in_sync_through {
            Some(p) => format!("in sync through {p}"),
            None => "nothing to replicate".to_string(),
        };
        let mut out = format!(
            "{} -> {}: {}, {} transfer(s), {} bytes",
            self.source_dataset,
            self.destination_dataset,
            state,
            self.transfers.len(),
            self.bytes_transferred()
        );
        if let Some(p) = &self.pruned_through {
            out.push_str(&format!(", pruned through {p}"));
        }
        if self.dry_run {
            out.push_str(" (dry run)");
        }
        out
    }
}

/// Replicates one dataset from a source store to a destination store.
pub struct SyncJob<'a, S: SnapshotStore, D: SnapshotStore> {
    source: &'a S,
    destination: &'a D,
    source_dataset: String,
    destination_dataset: String,
    bridge: StreamBridge,
    options: SyncOptions,
}

impl<'a, S: SnapshotStore, D: SnapshotStore> SyncJob<'a, S, D> {
    /// Create a job.
    pub fn new(
        source: &'a S,
        source_dataset: impl Into<String>,
        destination: &'a D,
        destination_dataset: impl Into<String>,
        bridge: StreamBridge,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            destination,
            source_dataset: source_dataset.into(),
            destination_dataset: destination_dataset.into(),
            bridge,
            options,
        }
    }

    /// List both sides and return the plan, without acting on it.
    pub async fn plan(&self) -> Result<TransferPlan, RunError> {
        let source = self.list_source().await?;
        let destination = self.list_destination().await?;
        Ok(planner::plan(&source, &destination))
    }

    /// Execute the run.
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let mut report = RunReport::new(
            &self.source_dataset,
            &self.destination_dataset,
            self.options.dry_run,
        );
        match self.run_phases(&mut report).await {
            Ok(()) => {
                report.enter(RunPhase::Done);
                info!(summary = %report.summary(), "replication run finished");
                Ok(report)
            }
            Err(e) => {
                error!(phase = %e.phase, error = %e.source, "replication run failed");
                Err(e)
            }
        }
    }

    async fn run_phases(&self, report: &mut RunReport) -> Result<(), RunError> {
        report.enter(RunPhase::ListingSource);
        let source = self.list_source().await?;
        let mut bootstrapped = false;

        loop {
            report.enter(RunPhase::ListingDestination);
            let destination = self.list_destination().await?;

            report.enter(RunPhase::Planning);
            let plan = planner::plan(&source, &destination);
            info!(?plan, "planned transfer");

            match &plan {
                TransferPlan::Divergent { reason } => {
                    report.enter(RunPhase::Aborted);
                    return Err(RunError::new(
                        RunPhase::Planning,
                        SyncError::Divergent {
                            reason: reason.clone(),
                        },
                    ));
                }
                TransferPlan::NoOp => {
                    report.enter(RunPhase::Idle);
                    report.in_sync_through = source.newest().ok();
                    break;
                }
                TransferPlan::Bootstrap { target } => {
                    report.enter(RunPhase::Bootstrapping);
                    let stats = self.transfer(&plan).await?;
                    report.transfers.push(TransferRecord {
                        plan: plan.clone(),
                        stats,
                    });
                    report.in_sync_through = Some(target.clone());
                    // A dry run never changes the destination; re-planning would bootstrap again.
                    let catch_up = self.options.continue_after_bootstrap && !self.options.dry_run;
                    if catch_up && !bootstrapped {
                        bootstrapped = true;
                        continue;
                    }
                    break;
                }
                TransferPlan::Incremental { to, .. } => {
                    report.enter(RunPhase::Incrementing);
                    let stats = self.transfer(&plan).await?;
                    report.transfers.push(TransferRecord {
                        plan: plan.clone(),
                        stats,
                    });
                    report.in_sync_through = Some(to.clone());
                    break;
                }
            }
        }

        if self.options.prune {
            if let Some(now) = report.in_sync_through.as_ref().map(|p| p.timestamp) {
                report.enter(RunPhase::Pruning);
                report.pruned_through = self.prune(&source, now).await?;
            }
        }
        Ok(())
    }

    async fn list_source(&self) -> Result<ClassCatalog, RunError> {
        self.source
            .list(&self.source_dataset)
            .await
            .map_err(|e| RunError::new(RunPhase::ListingSource, e))
    }

    async fn list_destination(&self) -> Result<ClassCatalog, RunError> {
        self.destination
            .list(&self.destination_dataset)
            .await
            .map_err(|e| RunError::new(RunPhase::ListingDestination, e))
    }

    async fn transfer(&self, plan: &TransferPlan) -> Result<Option<TransferStats>, RunError> {
        let phase = match plan {
            TransferPlan::Bootstrap { .. } => RunPhase::Bootstrapping,
            _ => RunPhase::Incrementing,
        };
        if self.options.dry_run {
            info!(?plan, "dry run, not transferring");
            return Ok(None);
        }

        let fail = |e| RunError::new(phase, e);
        let producer = match plan {
            TransferPlan::Bootstrap { target } => {
                self.source.send(&self.source_dataset, target).await
            }
            TransferPlan::Incremental { from, to } => {
                self.source
                    .send_incremental(&self.source_dataset, from, to)
                    .await
            }
            TransferPlan::NoOp | TransferPlan::Divergent { .. } => return Ok(None),
        }
        .map_err(fail)?;
        let consumer = self
            .destination
            .receive(&self.destination_dataset)
            .await
            .map_err(fail)?;

        let stats = self.bridge.pump(producer, consumer).await.map_err(fail)?;
        Ok(Some(stats))
    }

    async fn prune(
        &self,
        source: &ClassCatalog,
        now: chrono::NaiveDateTime,
    ) -> Result<Option<SnapshotPoint>, RunError> {
        let pruner = RetentionPruner::new(self.options.horizon_days);
        if self.options.dry_run {
            let head = pruner.prune_head(source, now);
            info!(?head, "dry run, not pruning");
            return Ok(head);
        }
        pruner
            .prune(self.source, source, now)
            .await
            .map_err(|e| RunError::new(RunPhase::Pruning, e))
    }
}

/// Prune a dataset on its own, outside a replication run.
///
/// `now` is taken from the newest snapshot of the class, so the newest
/// snapshot is always kept.
pub async fn prune_only<S: SnapshotStore>(
    store: &S,
    dataset: &str,
    horizon_days: u32,
    dry_run: bool,
) -> Result<Option<SnapshotPoint>, RunError> {
    let catalog = store
        .list(dataset)
        .await
        .map_err(|e| RunError::new(RunPhase::ListingSource, e))?;
    let Ok(newest) = catalog.newest() else {
        info!(dataset, "no snapshots to prune");
        return Ok(None);
    };

    let pruner = RetentionPruner::new(horizon_days);
    if dry_run {
        return Ok(pruner.prune_head(&catalog, newest.timestamp));
    }
    pruner
        .prune(store, &catalog, newest.timestamp)
        .await
        .map_err(|e| RunError::new(RunPhase::Pruning, e))
}

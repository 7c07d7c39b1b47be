//! Retention pruning of source snapshots.
//!
//! Snapshots older than the retention horizon are destroyed with a single
//! bulk destroy. Only the source is ever pruned: the destination has to keep
//! its newest snapshot as the resume point for the next incremental transfer.

use crate::catalog::ClassCatalog;
use crate::error::Result;
use crate::executor::SnapshotStore;
use crate::naming::SnapshotPoint;
use chrono::{Duration, NaiveDateTime};
use tracing::{debug, info};

/// Age-based retention rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPruner {
    horizon_days: u32,
}

impl RetentionPruner {
    /// Keep snapshots newer than `horizon_days` days.
    pub fn new(horizon_days: u32) -> Self {
        Self { horizon_days }
    }

    /// Retention horizon in days.
    pub fn horizon_days(&self) -> u32 {
        self.horizon_days
    }

    /// Timestamps strictly before this are eligible for pruning.
    pub fn cutoff(&self, now: NaiveDateTime) -> NaiveDateTime {
        now - Duration::days(i64::from(self.horizon_days))
    }

    /// The newest snapshot strictly older than the cutoff, if anything is prunable.
    pub fn prune_head(&self, catalog: &ClassCatalog, now: NaiveDateTime) -> Option<SnapshotPoint> {
        let cutoff = self.cutoff(now);
        let oldest = catalog.oldest().ok()?;
        if oldest.timestamp >= cutoff {
            debug!(
                dataset = catalog.dataset(),
                %cutoff,
                "nothing older than the retention horizon"
            );
            return None;
        }
        catalog.last_before(Some(cutoff), true).ok()
    }

    /// Destroy every snapshot up to and including the prune head.
    ///
    /// Returns the head that was destroyed through, or `None` if nothing was
    /// old enough.
    pub async fn prune<S: SnapshotStore + ?Sized>(
        &self,
        store: &S,
        catalog: &ClassCatalog,
        now: NaiveDateTime,
    ) -> Result<Option<SnapshotPoint>> {
        let Some(head) = self.prune_head(catalog, now) else {
            return Ok(None);
        };
        info!(
            store = %store.describe(),
            dataset = catalog.dataset(),
            through = %head.tag(catalog.class()),
            horizon_days = self.horizon_days,
            "pruning snapshots"
        );
        store.destroy_up_to(catalog.dataset(), &head).await?;
        Ok(Some(head))
    }
}

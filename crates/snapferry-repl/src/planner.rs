//! Replication planning: reconcile source and destination histories.
//!
//! The destination's newest snapshot must exist, with the same frequency and
//! timestamp, on the source. It is the only point an incremental stream can
//! resume from without rolling the destination back.

use crate::catalog::ClassCatalog;
use crate::naming::SnapshotPoint;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What one planning round decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransferPlan {
    /// Destination has no snapshots of the class: send the oldest source snapshot in full.
    Bootstrap {
        /// Snapshot to send.
        target: SnapshotPoint,
    },
    /// Send every snapshot in `(from, to]` as one incremental stream.
    Incremental {
        /// Common snapshot already present on the destination.
        from: SnapshotPoint,
        /// Newest source snapshot.
        to: SnapshotPoint,
    },
    /// Nothing to send.
    NoOp,
    /// No common snapshot exists; manual intervention required.
    Divergent {
        /// Description of the mismatch.
        reason: String,
    },
}

impl TransferPlan {
    /// Returns true if executing the plan moves data.
    pub fn transfers(&self) -> bool {
        matches!(self, Self::Bootstrap { .. } | Self::Incremental { .. })
    }
}

/// Decide how to bring `destination` up to date with `source`.
///
/// Pure function of the two catalogs: the same inputs always give the same plan.
pub fn plan(source: &ClassCatalog, destination: &ClassCatalog) -> TransferPlan {
    let (Ok(source_first), Ok(source_last)) = (source.oldest(), source.newest()) else {
        debug!(dataset = source.dataset(), "source has no snapshots, nothing to send");
        return TransferPlan::NoOp;
    };

    let Ok(remote_last) = destination.newest() else {
        return TransferPlan::Bootstrap {
            target: source_first,
        };
    };

    let class = source.class();
    let resume = match source.first_after(Some(remote_last.timestamp), false) {
        Ok(first) if first == remote_last => first,
        // Several frequencies share the timestamp; only the identical one counts.
        Ok(first) if first.timestamp == remote_last.timestamp && source.contains(&remote_last) => {
            remote_last.clone()
        }
        Ok(first) => {
            return TransferPlan::Divergent {
                reason: format!(
                    "destination's newest snapshot {} is not on the source \
                     (next source snapshot is {})",
                    remote_last.tag(class),
                    first.tag(class)
                ),
            }
        }
        Err(_) => {
            return TransferPlan::Divergent {
                reason: format!(
                    "destination's newest snapshot {} is newer than every source snapshot",
                    remote_last.tag(class)
                ),
            }
        }
    };

    if source_last == resume {
        TransferPlan::NoOp
    } else {
        TransferPlan::Incremental {
            from: resume,
            to: source_last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn p(freq: &str, d: u32) -> SnapshotPoint {
        SnapshotPoint::new(freq, day(d))
    }

    fn catalog(points: &[SnapshotPoint]) -> ClassCatalog {
        ClassCatalog::from_points("tank", "auto", points.iter().cloned())
    }

    #[test]
    fn test_empty_source_is_noop() {
        let plan = plan(&catalog(&[]), &catalog(&[p("daily", 1)]));
        assert_eq!(plan, TransferPlan::NoOp);
        assert!(!plan.transfers());
    }

    #[test]
    fn test_bootstrap_sends_oldest() {
        let source = catalog(&[p("hourly", 3), p("daily", 2), p("hourly", 1), p("daily", 4)]);
        let plan = plan(&source, &catalog(&[]));
        assert_eq!(
            plan,
            TransferPlan::Bootstrap {
                target: p("hourly", 1)
            }
        );
        assert!(plan.transfers());
    }

    #[test]
    fn test_incremental_from_remote_last_to_source_last() {
        let source = catalog(&[p("daily", 1), p("daily", 2), p("hourly", 3), p("daily", 4)]);
        let dest = catalog(&[p("daily", 1), p("daily", 2)]);
        assert_eq!(
            plan(&source, &dest),
            TransferPlan::Incremental {
                from: p("daily", 2),
                to: p("daily", 4)
            }
        );
    }

    #[test]
    fn test_incremental_after_source_pruned_older_history() {
        // Source no longer has day 1, but the resume point is still there.
        let source = catalog(&[p("daily", 2), p("daily", 3)]);
        let dest = catalog(&[p("daily", 1), p("daily", 2)]);
        assert_eq!(
            plan(&source, &dest),
            TransferPlan::Incremental {
                from: p("daily", 2),
                to: p("daily", 3)
            }
        );
    }

    #[test]
    fn test_in_sync_is_noop() {
        let source = catalog(&[p("daily", 1), p("daily", 2)]);
        let dest = catalog(&[p("daily", 1), p("daily", 2)]);
        assert_eq!(plan(&source, &dest), TransferPlan::NoOp);
    }

    #[test]
    fn test_divergent_when_remote_last_missing_on_source() {
        let source = catalog(&[p("daily", 1), p("daily", 3)]);
        let dest = catalog(&[p("daily", 1), p("daily", 2)]);
        match plan(&source, &dest) {
            TransferPlan::Divergent { reason } => {
                assert!(reason.contains("auto_daily-2024-05-02-00h00U"), "{reason}");
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn test_divergent_when_frequency_differs() {
        // Same timestamp, different identity: not a common ancestor.
        let source = catalog(&[p("daily", 1), p("hourly", 2), p("daily", 3)]);
        let dest = catalog(&[p("daily", 1), p("daily", 2)]);
        assert!(matches!(plan(&source, &dest), TransferPlan::Divergent { .. }));
    }

    #[test]
    fn test_divergent_when_destination_is_ahead() {
        let source = catalog(&[p("daily", 1), p("daily", 2)]);
        let dest = catalog(&[p("daily", 1), p("daily", 2), p("daily", 3)]);
        assert!(matches!(plan(&source, &dest), TransferPlan::Divergent { .. }));
    }

    #[test]
    fn test_shared_timestamp_resumes_from_identical_point() {
        // Both daily and hourly exist at day 2 on the source; the destination only has hourly.
        let source = catalog(&[p("daily", 2), p("hourly", 2), p("hourly", 3)]);
        let dest = catalog(&[p("hourly", 2)]);
        assert_eq!(
            plan(&source, &dest),
            TransferPlan::Incremental {
                from: p("hourly", 2),
                to: p("hourly", 3)
            }
        );
    }

    #[test]
    fn test_shared_timestamp_at_head_is_noop() {
        let source = catalog(&[p("daily", 2), p("hourly", 2)]);
        let dest = catalog(&[p("hourly", 2)]);
        assert_eq!(plan(&source, &dest), TransferPlan::NoOp);
    }

    #[test]
    fn test_missing_snapshot_at_resume_timestamp_is_sent() {
        // hourly@2 sorts after daily@2, so it still has to be shipped.
        let source = catalog(&[p("daily", 2), p("hourly", 2)]);
        let dest = catalog(&[p("daily", 2)]);
        assert_eq!(
            plan(&source, &dest),
            TransferPlan::Incremental {
                from: p("daily", 2),
                to: p("hourly", 2)
            }
        );
    }

    #[test]
    fn test_plan_is_idempotent() {
        let source = catalog(&[p("daily", 1), p("daily", 2), p("daily", 3)]);
        let dest = catalog(&[p("daily", 1)]);
        assert_eq!(plan(&source, &dest), plan(&source, &dest));
    }

    #[test]
    fn test_plan_serializes_with_action_tag() {
        let json = serde_json::to_value(TransferPlan::NoOp).unwrap();
        assert_eq!(json["action"], "no_op");
    }
}

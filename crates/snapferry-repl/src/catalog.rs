//! Snapshot catalog: an index of listed snapshot names.
//!
//! The catalog is a flat map keyed by `(dataset, class, frequency)` whose values
//! are ascending, duplicate-free timestamp sequences. It is rebuilt from a fresh
//! listing whenever the state of a pool may have changed and is never updated
//! in place.

use crate::error::{Result, SyncError};
use crate::naming::{SnapshotName, SnapshotPoint};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

type SeriesKey = (String, String, String);

/// Index of every snapshot on a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotCatalog {
    series: BTreeMap<SeriesKey, Vec<NaiveDateTime>>,
}

impl SnapshotCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and index a listing of snapshot names.
    ///
    /// Fails on the first malformed name: silently dropping an entry could hide
    /// a gap in a history that incremental transfers rely on.
    pub fn build<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = names
            .into_iter()
            .map(|n| SnapshotName::parse(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_names(parsed))
    }

    /// Index already decoded identities.
    pub fn from_names(names: impl IntoIterator<Item = SnapshotName>) -> Self {
        let mut series: BTreeMap<SeriesKey, Vec<NaiveDateTime>> = BTreeMap::new();
        for name in names {
            let key = (
                name.dataset().to_string(),
                name.class().to_string(),
                name.frequency().to_string(),
            );
            series.entry(key).or_default().push(name.timestamp());
        }
        for timestamps in series.values_mut() {
            timestamps.sort();
            timestamps.dedup();
        }
        Self { series }
    }

    /// Timestamps of one `(dataset, class, frequency)` series, ascending.
    pub fn timestamps(&self, dataset: &str, class: &str, frequency: &str) -> &[NaiveDateTime] {
        self.series
            .get(&(dataset.to_string(), class.to_string(), frequency.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The slice of the catalog for one dataset and class.
    ///
    /// Returns an empty catalog when nothing matches.
    pub fn class(&self, dataset: &str, class: &str) -> ClassCatalog {
        let series = self
            .series
            .iter()
            .filter(|((d, c, _), _)| d == dataset && c == class)
            .map(|((_, _, f), ts)| (f.clone(), ts.clone()))
            .collect();
        ClassCatalog {
            dataset: dataset.to_string(),
            class: class.to_string(),
            series,
        }
    }

    /// Distinct datasets, sorted.
    pub fn datasets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.series.keys().map(|(d, _, _)| d.as_str()).collect();
        out.dedup();
        out
    }

    /// Distinct classes present on a dataset, sorted.
    pub fn classes(&self, dataset: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .series
            .keys()
            .filter(|(d, _, _)| d == dataset)
            .map(|(_, c, _)| c.as_str())
            .collect();
        out.dedup();
        out
    }

    /// Total number of snapshots indexed.
    pub fn len(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    /// Returns true if no snapshots are indexed.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// The snapshots of one class on one dataset, grouped by frequency.
///
/// Queries scan every frequency: frequency is carried with each answer but
/// does not partition the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCatalog {
    dataset: String,
    class: String,
    series: BTreeMap<String, Vec<NaiveDateTime>>,
}

impl ClassCatalog {
    /// Create an empty class catalog.
    pub fn new(dataset: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            class: class.into(),
            series: BTreeMap::new(),
        }
    }

    /// Build a class catalog directly from points.
    pub fn from_points(
        dataset: impl Into<String>,
        class: impl Into<String>,
        points: impl IntoIterator<Item = SnapshotPoint>,
    ) -> Self {
        let mut catalog = Self::new(dataset, class);
        for p in points {
            catalog.series.entry(p.frequency).or_default().push(p.timestamp);
        }
        for timestamps in catalog.series.values_mut() {
            timestamps.sort();
            timestamps.dedup();
        }
        catalog
    }

    /// Dataset this catalog describes.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Class this catalog describes.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Frequencies present, sorted.
    pub fn frequencies(&self) -> Vec<&str> {
        self.series.keys().map(String::as_str).collect()
    }

    /// Timestamps of one frequency, ascending.
    pub fn timestamps(&self, frequency: &str) -> &[NaiveDateTime] {
        self.series
            .get(frequency)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Oldest snapshot satisfying `t >= bound` (`t > bound` when `strict`).
    ///
    /// With no bound every snapshot qualifies. Ties on timestamp resolve to
    /// the lexicographically smallest frequency.
    pub fn first_after(&self, bound: Option<NaiveDateTime>, strict: bool) -> Result<SnapshotPoint> {
        self.series
            .iter()
            .filter_map(|(freq, timestamps)| {
                let idx = match bound {
                    None => 0,
                    Some(b) if strict => timestamps.partition_point(|t| *t <= b),
                    Some(b) => timestamps.partition_point(|t| *t < b),
                };
                timestamps
                    .get(idx)
                    .map(|ts| SnapshotPoint::new(freq.clone(), *ts))
            })
            .min()
            .ok_or(SyncError::EmptyCatalog)
    }

    /// Newest snapshot satisfying `t <= bound` (`t < bound` when `strict`).
    ///
    /// Ties on timestamp resolve to the lexicographically largest frequency.
    pub fn last_before(&self, bound: Option<NaiveDateTime>, strict: bool) -> Result<SnapshotPoint> {
        self.series
            .iter()
            .filter_map(|(freq, timestamps)| {
                let idx = match bound {
                    None => timestamps.len(),
                    Some(b) if strict => timestamps.partition_point(|t| *t < b),
                    Some(b) => timestamps.partition_point(|t| *t <= b),
                };
                idx.checked_sub(1)
                    .map(|i| SnapshotPoint::new(freq.clone(), timestamps[i]))
            })
            .max()
            .ok_or(SyncError::EmptyCatalog)
    }

    /// Globally oldest snapshot.
    pub fn oldest(&self) -> Result<SnapshotPoint> {
        self.first_after(None, false)
    }

    /// Globally newest snapshot.
    pub fn newest(&self) -> Result<SnapshotPoint> {
        self.last_before(None, false)
    }

    /// Returns true if the exact `(frequency, timestamp)` pair is present.
    pub fn contains(&self, point: &SnapshotPoint) -> bool {
        self.series
            .get(&point.frequency)
            .map(|ts| ts.binary_search(&point.timestamp).is_ok())
            .unwrap_or(false)
    }

    /// All points, in `(timestamp, frequency)` order.
    pub fn points(&self) -> Vec<SnapshotPoint> {
        let mut out: Vec<SnapshotPoint> = self
            .series
            .iter()
            .flat_map(|(f, ts)| ts.iter().map(move |t| SnapshotPoint::new(f.clone(), *t)))
            .collect();
        out.sort();
        out
    }

    /// Full identity of a point in this catalog's dataset and class.
    pub fn snapshot_name(&self, point: &SnapshotPoint) -> Result<SnapshotName> {
        SnapshotName::from_point(&self.dataset, &self.class, point)
    }

    /// Number of snapshots.
    pub fn len(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    /// Returns true if the class has no snapshots.
    pub fn is_empty(&self) -> bool {
        self.series.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn sample() -> ClassCatalog {
        SnapshotCatalog::build([
            "p@c_h-2024-01-02-00h00U",
            "p@c_h-2024-01-01-00h00U",
            "p@c_d-2024-01-01-00h00U",
            "p@c_d-2024-01-05-00h00U",
            "p@other_h-2024-01-03-00h00U",
            "q@c_h-2024-01-09-00h00U",
        ])
        .unwrap()
        .class("p", "c")
    }

    #[test]
    fn test_build_groups_and_sorts() {
        let catalog = SnapshotCatalog::build([
            "p@c_h-2024-01-01-00h00U",
            "p@c_h-2024-01-02-00h00U",
            "p@c_d-2024-01-01-00h00U",
        ])
        .unwrap();

        assert_eq!(catalog.timestamps("p", "c", "h"), &[day(1), day(2)]);
        assert_eq!(catalog.timestamps("p", "c", "d"), &[day(1)]);
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_build_sorts_unordered_listing() {
        let catalog = SnapshotCatalog::build([
            "p@c_h-2024-01-03-00h00U",
            "p@c_h-2024-01-01-00h00U",
            "p@c_h-2024-01-02-00h00U",
        ])
        .unwrap();
        assert_eq!(catalog.timestamps("p", "c", "h"), &[day(1), day(2), day(3)]);
    }

    #[test]
    fn test_build_fails_on_first_malformed() {
        let err = SnapshotCatalog::build(["p@c_h-2024-01-01-00h00U", "p@manual"]).unwrap_err();
        assert!(matches!(err, SyncError::MalformedName { .. }));
    }

    #[test]
    fn test_class_slice() {
        let c = sample();
        assert_eq!(c.dataset(), "p");
        assert_eq!(c.class(), "c");
        assert_eq!(c.frequencies(), vec!["d", "h"]);
        assert_eq!(c.len(), 4);
    }

    #[test]
    fn test_missing_class_is_empty() {
        let catalog = SnapshotCatalog::build(["p@c_h-2024-01-01-00h00U"]).unwrap();
        let c = catalog.class("p", "missing");
        assert!(c.is_empty());
        assert!(matches!(c.oldest(), Err(SyncError::EmptyCatalog)));
        assert!(matches!(c.newest(), Err(SyncError::EmptyCatalog)));
    }

    #[test]
    fn test_first_after_across_frequencies() {
        let c = sample();
        assert_eq!(c.first_after(None, false).unwrap(), SnapshotPoint::new("d", day(1)));
        assert_eq!(c.first_after(Some(day(2)), false).unwrap(), SnapshotPoint::new("h", day(2)));
        assert_eq!(c.first_after(Some(day(2)), true).unwrap(), SnapshotPoint::new("d", day(5)));
        assert!(matches!(c.first_after(Some(day(5)), true), Err(SyncError::EmptyCatalog)));
    }

    #[test]
    fn test_last_before_across_frequencies() {
        let c = sample();
        assert_eq!(c.last_before(None, false).unwrap(), SnapshotPoint::new("d", day(5)));
        assert_eq!(c.last_before(Some(day(4)), false).unwrap(), SnapshotPoint::new("h", day(2)));
        assert_eq!(c.last_before(Some(day(2)), true).unwrap(), SnapshotPoint::new("h", day(1)));
        assert!(matches!(c.last_before(Some(day(1)), true), Err(SyncError::EmptyCatalog)));
    }

    #[test]
    fn test_timestamp_tie_break_is_by_frequency() {
        // Both "d" and "h" exist at day 1.
        let c = sample();
        assert_eq!(c.first_after(Some(day(1)), false).unwrap().frequency, "d");
        assert_eq!(c.last_before(Some(day(1)), false).unwrap().frequency, "h");
    }

    #[test]
    fn test_contains_uses_frequency_and_timestamp() {
        let c = sample();
        assert!(c.contains(&SnapshotPoint::new("h", day(2))));
        assert!(!c.contains(&SnapshotPoint::new("d", day(2))));
    }

    #[test]
    fn test_points_ordered() {
        let c = sample();
        let points = c.points();
        assert_eq!(points.len(), 4);
        assert!(points.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_datasets_and_classes() {
        let catalog = SnapshotCatalog::build([
            "p@c_h-2024-01-01-00h00U",
            "p@other_h-2024-01-01-00h00U",
            "q@c_h-2024-01-01-00h00U",
        ])
        .unwrap();
        assert_eq!(catalog.datasets(), vec!["p", "q"]);
        assert_eq!(catalog.classes("p"), vec!["c", "other"]);
    }

    #[test]
    fn test_snapshot_name_for_point() {
        let c = sample();
        let name = c.snapshot_name(&SnapshotPoint::new("h", day(2))).unwrap();
        assert_eq!(name.to_string(), "p@c_h-2024-01-02-00h00U");
    }
}

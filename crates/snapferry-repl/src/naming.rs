//! Snapshot naming scheme.
//!
//! Every replicated snapshot is named `<dataset>@<class>_<frequency>-<timestamp>`
//! where the timestamp is rendered as `YYYY-MM-DD-HHhMMU`, for example
//! `tank/home@zfs-auto-snap_hourly-2024-01-01-13h05U`. Names that do not follow
//! this form exactly are rejected rather than skipped.

use crate::error::{Result, SyncError};
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `strftime` format of the timestamp component.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%Hh%MU";

/// Render a timestamp in the fixed snapshot format.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp in the fixed snapshot format.
///
/// Returns `None` unless the text is exactly what [`format_timestamp`] would
/// produce for the parsed value, so unpadded or otherwise lenient forms are
/// rejected.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .ok()
        .filter(|ts| format_timestamp(ts) == text)
}

/// A snapshot's position within one `(dataset, class)` history.
///
/// Points order by timestamp first and frequency second, which gives the
/// catalog queries a deterministic answer when two frequencies share a
/// timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotPoint {
    /// When the snapshot was taken.
    pub timestamp: NaiveDateTime,
    /// Frequency tag (hourly, daily, ...).
    pub frequency: String,
}

impl SnapshotPoint {
    /// Create a new point.
    pub fn new(frequency: impl Into<String>, timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            frequency: frequency.into(),
        }
    }

    /// The part of the snapshot name after `@` for the given class.
    pub fn tag(&self, class: &str) -> String {
        format!(
            "{}_{}-{}",
            class,
            self.frequency,
            format_timestamp(&self.timestamp)
        )
    }
}

impl fmt::Display for SnapshotPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.frequency, format_timestamp(&self.timestamp))
    }
}

/// Structured identity of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotName {
    dataset: String,
    class: String,
    frequency: String,
    timestamp: NaiveDateTime,
}

impl SnapshotName {
    /// Build an identity, validating that it has a canonical string form.
    pub fn new(
        dataset: impl Into<String>,
        class: impl Into<String>,
        frequency: impl Into<String>,
        timestamp: NaiveDateTime,
    ) -> Result<Self> {
        let dataset = dataset.into();
        let class = class.into();
        let frequency = frequency.into();

        check_component("dataset", &dataset, &['@'])?;
        check_component("class", &class, &['@', '_'])?;
        check_component("frequency", &frequency, &['@', '-'])?;

        if timestamp.second() != 0 || timestamp.nanosecond() != 0 {
            return Err(SyncError::InvalidName {
                field: "timestamp",
                value: timestamp.to_string(),
                reason: "snapshot timestamps have minute resolution",
            });
        }
        if !(0..=9999).contains(&timestamp.year()) {
            return Err(SyncError::InvalidName {
                field: "timestamp",
                value: timestamp.to_string(),
                reason: "year must have four digits",
            });
        }

        Ok(Self {
            dataset,
            class,
            frequency,
            timestamp,
        })
    }

    /// Decode a canonical snapshot name.
    pub fn parse(name: &str) -> Result<Self> {
        let malformed = |reason: String| SyncError::MalformedName {
            name: name.to_string(),
            reason,
        };

        let (dataset, tag) = name
            .split_once('@')
            .ok_or_else(|| malformed("missing '@' separator".into()))?;
        let (class, rest) = tag
            .split_once('_')
            .ok_or_else(|| malformed("missing '_' separator".into()))?;
        let (frequency, stamp) = rest
            .split_once('-')
            .ok_or_else(|| malformed("missing '-' after frequency".into()))?;
        let timestamp = parse_timestamp(stamp).ok_or_else(|| {
            malformed(format!("timestamp {stamp:?} does not match YYYY-MM-DD-HHhMMU"))
        })?;

        Self::new(dataset, class, frequency, timestamp).map_err(|e| malformed(e.to_string()))
    }

    /// Build the identity for a point of a `(dataset, class)` history.
    pub fn from_point(dataset: &str, class: &str, point: &SnapshotPoint) -> Result<Self> {
        Self::new(dataset, class, point.frequency.clone(), point.timestamp)
    }

    /// Dataset path.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Class tag (e.g. the auto-snapshot prefix).
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Frequency tag.
    pub fn frequency(&self) -> &str {
        &self.frequency
    }

    /// Timestamp.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// The `(frequency, timestamp)` pair.
    pub fn point(&self) -> SnapshotPoint {
        SnapshotPoint::new(self.frequency.clone(), self.timestamp)
    }

    /// The part of the name after `@`.
    pub fn tag(&self) -> String {
        self.point().tag(&self.class)
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dataset, self.tag())
    }
}

impl FromStr for SnapshotName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn check_component(field: &'static str, value: &str, forbidden: &[char]) -> Result<()> {
    if value.is_empty() {
        return Err(SyncError::InvalidName {
            field,
            value: value.to_string(),
            reason: "must not be empty",
        });
    }
    if value.contains(forbidden) {
        return Err(SyncError::InvalidName {
            field,
            value: value.to_string(),
            reason: "contains a reserved separator",
        });
    }
    Ok(())
}

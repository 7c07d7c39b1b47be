//! Error types for the snapshot replication subsystem.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while listing, planning, transferring or pruning snapshots.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A snapshot name does not follow `<dataset>@<class>_<frequency>-<timestamp>`.
    #[error("malformed snapshot name {name:?}: {reason}")]
    MalformedName {
        /// The offending name as listed.
        name: String,
        /// Which part of the name failed to parse.
        reason: String,
    },

    /// Refused to build a snapshot identity from invalid components.
    #[error("invalid snapshot {field} {value:?}: {reason}")]
    InvalidName {
        /// Component name (dataset, class, frequency).
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A catalog query found no snapshot satisfying its bound.
    #[error("no snapshot matches the query")]
    EmptyCatalog,

    /// A storage or remote command exited non-zero.
    #[error("command `{command}` failed with exit code {exit_code}: {stderr}")]
    ExecutionFailed {
        /// The command line that was run.
        command: String,
        /// Exit code (-1 when terminated by a signal).
        exit_code: i32,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// Source and destination share no common snapshot.
    #[error("source and destination have diverged: {reason}")]
    Divergent {
        /// Human-readable description of the mismatch.
        reason: String,
    },

    /// The receiving process exited while data was still being streamed.
    #[error("receiving process exited early with code {exit_code}")]
    ConsumerDied {
        /// Exit code of the consumer.
        exit_code: i32,
    },

    /// The consumer accepted fewer bytes than were offered.
    #[error("short write to receiving process: wrote {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes offered.
        expected: usize,
        /// Bytes accepted.
        written: usize,
    },

    /// Send or receive process did not exit within the allowed time after EOF.
    #[error("processes did not exit within {timeout:?} after the stream ended")]
    ProcessHangTimeout {
        /// The exit-wait bound that elapsed.
        timeout: Duration,
    },

    /// At least one side of a transfer exited non-zero.
    #[error("transfer failed: send exited {producer_code}, receive exited {consumer_code}")]
    TransferFailed {
        /// Exit code of the producing (send) process.
        producer_code: i32,
        /// Exit code of the consuming (receive) process.
        consumer_code: i32,
    },

    /// A child process could not be started.
    #[error("failed to spawn `{command}`")]
    Spawn {
        /// The command line that could not be started.
        command: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Result alias for the replication subsystem.
pub type Result<T> = std::result::Result<T, SyncError>;

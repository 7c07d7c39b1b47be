#![warn(missing_docs)]

//! snapferry replication subsystem: ZFS snapshot naming, catalog reconciliation,
//! send/receive streaming over ssh and retention pruning

pub mod bridge;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod memory;
pub mod naming;
pub mod planner;
pub mod retention;

pub use error::{Result, SyncError};

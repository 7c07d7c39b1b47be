//! Command-line interface for the `snapferry` binary.

use crate::bridge::StreamBridge;
use crate::config::SyncConfig;
use crate::engine::{prune_only, RunError, RunPhase, SyncJob};
use crate::error::SyncError;
use crate::executor::{RemoteExecutor, SnapshotStore, Target, LOCALHOST};
use crate::planner::TransferPlan;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line interface.
#[derive(Parser)]
#[command(name = "snapferry")]
#[command(about = "Replicate ZFS snapshots between pools over ssh", long_about = None)]
pub struct Cli {
    /// Config file (.toml or .json).
    #[arg(short, long, global = true, env = "SNAPFERRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Snapshot class to replicate (overrides the config file).
    #[arg(long, global = true)]
    pub class: Option<String>,

    /// ssh identity file for remote hosts (overrides the config file).
    #[arg(short, long, global = true, env = "SNAPFERRY_IDENTITY_FILE")]
    pub identity_file: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Replicate SOURCE to DESTINATION, bootstrapping or continuing incrementally.
    Sync {
        /// Source dataset.
        source: String,
        /// Destination dataset.
        destination: String,
        /// Host holding the source pool.
        #[arg(long, default_value = LOCALHOST)]
        source_host: String,
        /// Host holding the destination pool.
        #[arg(long, default_value = LOCALHOST)]
        dest_host: String,
        /// Prune old source snapshots after a successful run.
        #[arg(long)]
        prune: bool,
        /// Retention horizon in days (overrides the config file).
        #[arg(long)]
        horizon_days: Option<u32>,
        /// Plan only; send, receive and destroy nothing.
        #[arg(long)]
        dry_run: bool,
        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Destroy snapshots older than the retention horizon on one dataset.
    Prune {
        /// Dataset to prune.
        dataset: String,
        /// Host holding the pool.
        #[arg(long, default_value = LOCALHOST)]
        host: String,
        /// Retention horizon in days (overrides the config file).
        #[arg(long)]
        horizon_days: Option<u32>,
        /// Report what would be destroyed without destroying it.
        #[arg(long)]
        dry_run: bool,
    },
    /// List the class's snapshots on a dataset.
    List {
        /// Dataset to list.
        dataset: String,
        /// Host holding the pool.
        #[arg(long, default_value = LOCALHOST)]
        host: String,
    },
    /// Show what `sync` would do.
    Plan {
        /// Source dataset.
        source: String,
        /// Destination dataset.
        destination: String,
        /// Host holding the source pool.
        #[arg(long, default_value = LOCALHOST)]
        source_host: String,
        /// Host holding the destination pool.
        #[arg(long, default_value = LOCALHOST)]
        dest_host: String,
    },
}

impl Cli {
    /// Config file contents (or defaults) with command-line overrides applied.
    pub fn load_config(&self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => SyncConfig::default(),
        };
        if let Some(class) = &self.class {
            config.class = class.clone();
        }
        if let Some(identity) = &self.identity_file {
            config.identity_file = Some(identity.clone());
        }
        config.validate()?;
        Ok(config)
    }

    /// Execute the selected subcommand.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Sync {
                source,
                destination,
                source_host,
                dest_host,
                prune,
                horizon_days,
                dry_run,
                json,
            } => {
                let src = executor(&config, &source_host);
                let dst = executor(&config, &dest_host);
                let mut options = config.sync_options();
                options.prune = prune;
                options.dry_run = dry_run;
                if let Some(days) = horizon_days {
                    options.horizon_days = days;
                }

                let bridge = StreamBridge::new(config.bridge_config());
                let job = SyncJob::new(&src, source, &dst, destination, bridge, options);
                let report = job.run().await?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!("{}", report.summary());
                }
                Ok(())
            }
            Command::Prune {
                dataset,
                host,
                horizon_days,
                dry_run,
            } => {
                let exec = executor(&config, &host);
                let days = horizon_days.unwrap_or(config.horizon_days);
                match prune_only(&exec, &dataset, days, dry_run).await? {
                    Some(head) => {
                        let verb = if dry_run { "would prune" } else { "pruned" };
                        println!("{verb} {dataset} through {}", head.tag(&config.class));
                    }
                    None => println!("nothing to prune on {dataset}"),
                }
                Ok(())
            }
            Command::List { dataset, host } => {
                let exec = executor(&config, &host);
                let catalog = exec.list(&dataset).await?;
                for point in catalog.points() {
                    println!("{}", catalog.snapshot_name(&point)?);
                }
                Ok(())
            }
            Command::Plan {
                source,
                destination,
                source_host,
                dest_host,
            } => {
                let src = executor(&config, &source_host);
                let dst = executor(&config, &dest_host);
                let job = SyncJob::new(
                    &src,
                    source,
                    &dst,
                    destination,
                    StreamBridge::new(config.bridge_config()),
                    config.sync_options(),
                );
                let plan = job.plan().await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
                if let TransferPlan::Divergent { reason } = plan {
                    tracing::warn!(%reason, "histories have diverged");
                    return Err(RunError {
                        phase: RunPhase::Planning,
                        source: SyncError::Divergent { reason },
                    }
                    .into());
                }
                Ok(())
            }
        }
    }
}

fn executor(config: &SyncConfig, host: &str) -> RemoteExecutor {
    let target = if host == LOCALHOST {
        Target::local()
    } else {
        Target::remote(host, config.identity_file.clone())
    };
    RemoteExecutor::new(target, config.class.clone(), config.executor_config())
}

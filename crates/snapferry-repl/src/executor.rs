//! Execution of storage operations on a local or remote pool.
//!
//! A [`Target`] named `localhost` runs `zfs` directly; any other host is
//! reached through `ssh`, carrying the configured identity file. Captured
//! operations (`list`, `destroy`) return their output; streaming operations
//! (`send`, `receive`) hand back live process handles for the
//! [`StreamBridge`](crate::bridge::StreamBridge).

use crate::bridge::{ConsumerStream, ProducerStream, StreamProcess};
use crate::catalog::{ClassCatalog, SnapshotCatalog};
use crate::error::{Result, SyncError};
use crate::naming::{SnapshotName, SnapshotPoint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Host name that selects local execution.
pub const LOCALHOST: &str = "localhost";

/// Where a pool lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// `localhost` or an ssh destination (`host` or `user@host`).
    pub host: String,
    /// Private key passed to ssh with `-i`.
    pub identity_file: Option<PathBuf>,
}

impl Target {
    /// The local machine.
    pub fn local() -> Self {
        Self {
            host: LOCALHOST.to_string(),
            identity_file: None,
        }
    }

    /// A host reached over ssh.
    pub fn remote(host: impl Into<String>, identity_file: Option<PathBuf>) -> Self {
        Self {
            host: host.into(),
            identity_file,
        }
    }

    /// Returns true if operations run without ssh.
    pub fn is_local(&self) -> bool {
        self.host == LOCALHOST
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

/// How commands are built for a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Storage command, split on whitespace (e.g. `zfs` or `sudo zfs`).
    pub zfs_command: String,
    /// Remote shell binary.
    pub ssh_command: String,
    /// Extra options placed before `-i` on the ssh command line.
    pub ssh_options: Vec<String>,
    /// Pass `-F` to `zfs receive`.
    pub receive_force: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            zfs_command: "zfs".to_string(),
            ssh_command: "ssh".to_string(),
            ssh_options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            receive_force: false,
        }
    }
}

/// The storage operations replication needs from one pool.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Handle returned by `send`.
    type Producer: ProducerStream;
    /// Handle returned by `receive`.
    type Consumer: ConsumerStream;

    /// Where this store lives, for diagnostics.
    fn describe(&self) -> String;

    /// Snapshots of the configured class on `dataset`; empty if there are none.
    async fn list(&self, dataset: &str) -> Result<ClassCatalog>;

    /// Start a full stream of one snapshot.
    async fn send(&self, dataset: &str, point: &SnapshotPoint) -> Result<Self::Producer>;

    /// Start one stream carrying every snapshot in `(from, to]`.
    async fn send_incremental(
        &self,
        dataset: &str,
        from: &SnapshotPoint,
        to: &SnapshotPoint,
    ) -> Result<Self::Producer>;

    /// Start applying a stream into `dataset`.
    async fn receive(&self, dataset: &str) -> Result<Self::Consumer>;

    /// Destroy every snapshot of the class on `dataset` whose timestamp is at
    /// or before `point`'s, in one bulk operation. Snapshots of other classes
    /// are left alone.
    async fn destroy_up_to(&self, dataset: &str, point: &SnapshotPoint) -> Result<()>;
}

/// Runs `zfs` operations on one target for one snapshot class.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    target: Target,
    class: String,
    config: ExecutorConfig,
}

impl RemoteExecutor {
    /// Create an executor.
    pub fn new(target: Target, class: impl Into<String>, config: ExecutorConfig) -> Self {
        Self {
            target,
            class: class.into(),
            config,
        }
    }

    /// The target this executor runs on.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Full argv for a storage operation on this target.
    pub fn command_line(&self, op: &[String]) -> Vec<String> {
        let mut zfs: Vec<String> = self
            .config
            .zfs_command
            .split_whitespace()
            .map(String::from)
            .collect();
        if zfs.is_empty() {
            zfs.push("zfs".to_string());
        }
        zfs.extend(op.iter().cloned());

        if self.target.is_local() {
            return zfs;
        }

        let mut argv = vec![self.config.ssh_command.clone()];
        argv.extend(self.config.ssh_options.iter().cloned());
        if let Some(identity) = &self.target.identity_file {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }
        argv.push(self.target.host.clone());
        // ssh hands the remaining words to the remote shell, which splits them again.
        argv.extend(zfs.iter().map(|a| shell_quote(a)));
        argv
    }

    fn command(&self, op: &[String]) -> (Command, String) {
        let argv = self.command_line(op);
        let line = argv.join(" ");
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        (cmd, line)
    }

    fn full_name(&self, dataset: &str, point: &SnapshotPoint) -> Result<String> {
        Ok(SnapshotName::from_point(dataset, &self.class, point)?.to_string())
    }

    async fn run_captured(&self, op: &[String]) -> Result<String> {
        let (mut cmd, line) = self.command(op);
        debug!(target = %self.target, command = %line, "running");

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SyncError::Spawn {
                command: line.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(SyncError::ExecutionFailed {
                command: line,
                exit_code: exit_code(output.status),
                stderr,
            });
        }
        if !stderr.is_empty() {
            warn!(
                target = %self.target,
                command = %line,
                stderr = %stderr,
                "command succeeded with stderr output"
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn receive_op(&self, dataset: &str) -> Vec<String> {
        let mut op = vec!["receive".to_string()];
        if self.config.receive_force {
            op.push("-F".to_string());
        }
        op.push(dataset.to_string());
        op
    }

    fn spawn_producer(&self, op: &[String]) -> Result<ProcessProducer> {
        let (cmd, line) = self.command(op);
        debug!(target = %self.target, command = %line, "starting send");
        ProcessProducer::spawn(cmd, line)
    }
}

#[async_trait]
impl SnapshotStore for RemoteExecutor {
    type Producer = ProcessProducer;
    type Consumer = ProcessConsumer;

    fn describe(&self) -> String {
        self.target.to_string()
    }

    async fn list(&self, dataset: &str) -> Result<ClassCatalog> {
        let op = args(&["list", "-H", "-t", "snapshot", "-o", "name"]);
        let stdout = self.run_captured(&op).await?;
        let catalog = parse_listing(&stdout)?.class(dataset, &self.class);
        debug!(
            target = %self.target,
            dataset,
            class = %self.class,
            snapshots = catalog.len(),
            "listed snapshots"
        );
        Ok(catalog)
    }

    async fn send(&self, dataset: &str, point: &SnapshotPoint) -> Result<ProcessProducer> {
        let name = self.full_name(dataset, point)?;
        self.spawn_producer(&["send".to_string(), name])
    }

    async fn send_incremental(
        &self,
        dataset: &str,
        from: &SnapshotPoint,
        to: &SnapshotPoint,
    ) -> Result<ProcessProducer> {
        let from = self.full_name(dataset, from)?;
        let to = self.full_name(dataset, to)?;
        self.spawn_producer(&["send".to_string(), "-I".to_string(), from, to])
    }

    async fn receive(&self, dataset: &str) -> Result<ProcessConsumer> {
        let (cmd, line) = self.command(&self.receive_op(dataset));
        debug!(target = %self.target, command = %line, "starting receive");
        ProcessConsumer::spawn(cmd, line)
    }

    async fn destroy_up_to(&self, dataset: &str, point: &SnapshotPoint) -> Result<()> {
        let doomed: Vec<SnapshotPoint> = self
            .list(dataset)
            .await?
            .points()
            .into_iter()
            .filter(|p| p.timestamp <= point.timestamp)
            .collect();
        let Some(names) = destroy_argument(dataset, &self.class, &doomed) else {
            debug!(target = %self.target, dataset, "no snapshots to destroy");
            return Ok(());
        };
        self.run_captured(&["destroy".to_string(), names]).await?;
        Ok(())
    }
}

/// `zfs destroy` argument naming several snapshots of one dataset,
/// `<dataset>@<tag>,<tag>,...`; `None` when `points` is empty.
///
/// Snapshots are named one by one rather than with the `%` range form, which
/// would also take every other class's snapshots created inside the range.
pub fn destroy_argument(dataset: &str, class: &str, points: &[SnapshotPoint]) -> Option<String> {
    if points.is_empty() {
        return None;
    }
    let tags: Vec<String> = points.iter().map(|p| p.tag(class)).collect();
    Some(format!("{}@{}", dataset, tags.join(",")))
}

/// Decode the output of `zfs list -H -o name`.
pub fn parse_listing(stdout: &str) -> Result<SnapshotCatalog> {
    SnapshotCatalog::build(stdout.lines().map(str::trim).filter(|l| !l.is_empty()))
}

/// Quote an argument for a POSIX shell unless it is plainly safe.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./@%:+=,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn args(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// A running send process whose stdout carries the stream.
#[derive(Debug)]
pub struct ProcessProducer {
    command: String,
    child: Child,
    stdout: Option<ChildStdout>,
}

impl ProcessProducer {
    /// Spawn `cmd` with stdout piped.
    pub fn spawn(mut cmd: Command, command: String) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SyncError::Spawn {
                command: command.clone(),
                source,
            })?;
        let stdout = child.stdout.take();
        Ok(Self {
            command,
            child,
            stdout,
        })
    }

    /// The command line this process runs.
    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl StreamProcess for ProcessProducer {
    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    async fn wait(&mut self) -> Result<i32> {
        Ok(exit_code(self.child.wait().await?))
    }

    async fn close(&mut self) -> Result<()> {
        self.stdout = None;
        Ok(())
    }
}

#[async_trait]
impl ProducerStream for ProcessProducer {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => Ok(stdout.read(buf).await?),
            None => Ok(0),
        }
    }
}

/// A running receive process whose stdin accepts the stream.
#[derive(Debug)]
pub struct ProcessConsumer {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ProcessConsumer {
    /// Spawn `cmd` with stdin piped.
    pub fn spawn(mut cmd: Command, command: String) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SyncError::Spawn {
                command: command.clone(),
                source,
            })?;
        let stdin = child.stdin.take();
        Ok(Self {
            command,
            child,
            stdin,
        })
    }

    /// The command line this process runs.
    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl StreamProcess for ProcessConsumer {
    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    async fn wait(&mut self) -> Result<i32> {
        self.stdin = None;
        Ok(exit_code(self.child.wait().await?))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConsumerStream for ProcessConsumer {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(0);
        };
        let mut written = 0;
        while written < buf.len() {
            let n = stdin.write(&buf[written..]).await?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    }
}

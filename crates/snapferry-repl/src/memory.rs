//! In-process snapshot store.
//!
//! `MemoryStore` simulates a pool and a send/receive stream format in memory so
//! that planning, streaming and pruning can be exercised end to end without
//! `zfs` or `ssh`. It enforces the same receive rules a real pool does: a full
//! stream only lands on a dataset without snapshots, and an incremental stream
//! only lands if the destination's newest snapshot is the stream's base.

use crate::bridge::{ConsumerStream, ProducerStream, StreamProcess};
use crate::catalog::{ClassCatalog, SnapshotCatalog};
use crate::error::{Result, SyncError};
use crate::executor::{destroy_argument, SnapshotStore};
use crate::naming::{SnapshotName, SnapshotPoint};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const STREAM_MAGIC: &str = "snapferry-memory-stream";

#[derive(Debug, Default)]
struct PoolState {
    snapshots: BTreeSet<SnapshotName>,
    send_exit_code: i32,
    receive_exit_code: i32,
    receive_dies_early: bool,
    destroyed: Vec<String>,
    streams_sent: u64,
}

/// A simulated pool holding snapshots of one class.
///
/// Clones share the same pool.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    class: String,
    state: Arc<Mutex<PoolState>>,
}

impl MemoryStore {
    /// Create an empty pool whose operations use `class`.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a snapshot of this store's class.
    pub fn add_snapshot(&self, dataset: &str, point: &SnapshotPoint) {
        if let Ok(name) = SnapshotName::from_point(dataset, &self.class, point) {
            self.state().snapshots.insert(name);
        }
    }

    /// Add a snapshot of any class.
    pub fn add_name(&self, name: SnapshotName) {
        self.state().snapshots.insert(name);
    }

    /// Every snapshot name on the pool, sorted.
    pub fn snapshot_names(&self) -> Vec<String> {
        self.state().snapshots.iter().map(ToString::to_string).collect()
    }

    /// `zfs destroy` arguments issued by `destroy_up_to`, in call order.
    pub fn destroyed(&self) -> Vec<String> {
        self.state().destroyed.clone()
    }

    /// Number of send streams started.
    pub fn streams_sent(&self) -> u64 {
        self.state().streams_sent
    }

    /// Make every later send exit with `code` after streaming.
    pub fn fail_sends_with(&self, code: i32) {
        self.state().send_exit_code = code;
    }

    /// Make every later receive consume its stream and then exit with `code`.
    pub fn fail_receives_with(&self, code: i32) {
        let mut state = self.state();
        state.receive_exit_code = code;
        state.receive_dies_early = false;
    }

    /// Make every later receive exit with `code` before reading anything.
    pub fn kill_receives_with(&self, code: i32) {
        let mut state = self.state();
        state.receive_exit_code = code;
        state.receive_dies_early = true;
    }

    fn require(&self, state: &PoolState, name: &SnapshotName, op: &str) -> Result<()> {
        if state.snapshots.contains(name) {
            return Ok(());
        }
        Err(SyncError::ExecutionFailed {
            command: format!("{op} {name}"),
            exit_code: 1,
            stderr: format!("could not find snapshot {name}"),
        })
    }

    fn producer(&self, state: &mut PoolState, header: String, tags: Vec<String>) -> MemoryProducer {
        state.streams_sent += 1;
        let mut data = header;
        for tag in tags {
            data.push('\n');
            data.push_str(&tag);
        }
        data.push('\n');
        MemoryProducer {
            data: data.into_bytes(),
            pos: 0,
            exit_code: state.send_exit_code,
        }
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    type Producer = MemoryProducer;
    type Consumer = MemoryConsumer;

    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn list(&self, dataset: &str) -> Result<ClassCatalog> {
        let names = self.state().snapshots.clone();
        Ok(SnapshotCatalog::from_names(names).class(dataset, &self.class))
    }

    async fn send(&self, dataset: &str, point: &SnapshotPoint) -> Result<MemoryProducer> {
        let name = SnapshotName::from_point(dataset, &self.class, point)?;
        let mut state = self.state();
        self.require(&state, &name, "send")?;
        Ok(self.producer(&mut state, format!("{STREAM_MAGIC} full"), vec![name.tag()]))
    }

    async fn send_incremental(
        &self,
        dataset: &str,
        from: &SnapshotPoint,
        to: &SnapshotPoint,
    ) -> Result<MemoryProducer> {
        let from_name = SnapshotName::from_point(dataset, &self.class, from)?;
        let to_name = SnapshotName::from_point(dataset, &self.class, to)?;
        let mut state = self.state();
        self.require(&state, &from_name, "send -I")?;
        self.require(&state, &to_name, "send -I")?;

        let mut range: Vec<SnapshotName> = state
            .snapshots
            .iter()
            .filter(|n| n.dataset() == dataset && n.class() == self.class)
            .filter(|n| {
                let p = n.point();
                p > *from && p <= *to
            })
            .cloned()
            .collect();
        range.sort_by_key(SnapshotName::point);
        let tags = range.iter().map(SnapshotName::tag).collect();

        let header = format!("{STREAM_MAGIC} incremental {}", from_name.tag());
        Ok(self.producer(&mut state, header, tags))
    }

    async fn receive(&self, dataset: &str) -> Result<MemoryConsumer> {
        let state = self.state();
        Ok(MemoryConsumer {
            dataset: dataset.to_string(),
            pool: Arc::clone(&self.state),
            buf: Vec::new(),
            closed: false,
            forced_exit: (state.receive_exit_code != 0).then_some(state.receive_exit_code),
            dies_early: state.receive_dies_early,
            exit_code: None,
        })
    }

    async fn destroy_up_to(&self, dataset: &str, point: &SnapshotPoint) -> Result<()> {
        let mut state = self.state();
        let doomed = |n: &SnapshotName| {
            n.dataset() == dataset && n.class() == self.class && n.timestamp() <= point.timestamp
        };
        let mut points: Vec<SnapshotPoint> = state
            .snapshots
            .iter()
            .filter(|n| doomed(*n))
            .map(SnapshotName::point)
            .collect();
        points.sort();
        if let Some(names) = destroy_argument(dataset, &self.class, &points) {
            state.destroyed.push(names);
            state.snapshots.retain(|n| !doomed(n));
        }
        Ok(())
    }
}

/// In-memory send stream.
#[derive(Debug)]
pub struct MemoryProducer {
    data: Vec<u8>,
    pos: usize,
    exit_code: i32,
}

#[async_trait]
impl StreamProcess for MemoryProducer {
    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        Ok((self.pos >= self.data.len()).then_some(self.exit_code))
    }

    async fn wait(&mut self) -> Result<i32> {
        Ok(self.exit_code)
    }

    async fn close(&mut self) -> Result<()> {
        self.pos = self.data.len();
        Ok(())
    }
}

#[async_trait]
impl ProducerStream for MemoryProducer {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// In-memory receive stream; applies the snapshots once it is waited on.
#[derive(Debug)]
pub struct MemoryConsumer {
    dataset: String,
    pool: Arc<Mutex<PoolState>>,
    buf: Vec<u8>,
    closed: bool,
    forced_exit: Option<i32>,
    dies_early: bool,
    exit_code: Option<i32>,
}

impl MemoryConsumer {
    fn apply(&self) -> i32 {
        let Ok(text) = std::str::from_utf8(&self.buf) else {
            return 1;
        };
        let mut lines = text.lines();
        let Some(header) = lines.next().and_then(|h| h.strip_prefix(STREAM_MAGIC)) else {
            return 1;
        };
        let names: Result<Vec<SnapshotName>> = lines
            .map(|tag| SnapshotName::parse(&format!("{}@{}", self.dataset, tag)))
            .collect();
        let Ok(names) = names else {
            return 1;
        };

        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let header = header.trim();
        if header == "full" {
            if pool.snapshots.iter().any(|n| n.dataset() == self.dataset) {
                return 1;
            }
        } else if let Some(base_tag) = header.strip_prefix("incremental ") {
            let Ok(base) = SnapshotName::parse(&format!("{}@{}", self.dataset, base_tag)) else {
                return 1;
            };
            let newest = pool
                .snapshots
                .iter()
                .filter(|n| n.dataset() == self.dataset && n.class() == base.class())
                .max_by_key(|n| n.point());
            if newest != Some(&base) {
                return 1;
            }
        } else {
            return 1;
        }

        pool.snapshots.extend(names);
        0
    }
}

#[async_trait]
impl StreamProcess for MemoryConsumer {
    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        if self.dies_early {
            return Ok(self.forced_exit);
        }
        Ok(self.exit_code)
    }

    async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let code = match self.forced_exit {
            Some(code) => code,
            None => self.apply(),
        };
        self.exit_code = Some(code);
        Ok(code)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl ConsumerStream for MemoryConsumer {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(SyncError::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }
}

//! Stream bridge: pumps a serialized snapshot stream from a send process into a
//! receive process.
//!
//! The bridge only sees the [`ProducerStream`] and [`ConsumerStream`]
//! capabilities, so the same loop drives real `zfs send | zfs receive` pairs and
//! the in-process streams used in tests.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default chunk size for one read/write round trip (4 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Default bound on waiting for both processes to exit after EOF.
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on how long a failed write waits to learn the consumer's exit code.
const WRITE_FAILURE_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of one side of a transfer.
#[async_trait]
pub trait StreamProcess: Send {
    /// Exit code if the process has already exited, without blocking.
    fn try_exit_code(&mut self) -> Result<Option<i32>>;

    /// Block until the process exits and return its exit code.
    async fn wait(&mut self) -> Result<i32>;

    /// Close our end of the process's pipe.
    async fn close(&mut self) -> Result<()>;
}

/// The sending side: a readable byte stream.
#[async_trait]
pub trait ProducerStream: StreamProcess {
    /// Read up to `buf.len()` bytes. Returns 0 at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// The receiving side: a writable byte stream.
#[async_trait]
pub trait ConsumerStream: StreamProcess {
    /// Write `buf`, returning how many bytes were accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;
}

/// Bridge tuning.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum bytes moved per read/write round trip.
    pub chunk_size: usize,
    /// How long to wait for both processes to exit once the stream ends.
    pub exit_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }
}

/// Statistics for one completed transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Bytes moved from producer to consumer.
    pub bytes: u64,
    /// Number of non-empty chunks moved.
    pub chunks: u64,
    /// Wall-clock duration of the transfer in milliseconds.
    pub elapsed_ms: u64,
}

/// Moves bytes between one producer and one consumer.
#[derive(Debug, Clone, Default)]
pub struct StreamBridge {
    config: BridgeConfig,
}

impl StreamBridge {
    /// Create a bridge with the given tuning.
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// The bridge's configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Pump the producer's stream into the consumer until EOF, then reap both.
    ///
    /// Succeeds only if every chunk was accepted in full and both processes
    /// exited with code 0. Both processes are reaped before any result is
    /// returned, including on failure.
    pub async fn pump<P, C>(&self, mut producer: P, mut consumer: C) -> Result<TransferStats>
    where
        P: ProducerStream,
        C: ConsumerStream,
    {
        let started = Instant::now();
        let mut stats = TransferStats::default();

        if let Err(e) = self.copy(&mut producer, &mut consumer, &mut stats).await {
            warn!(error = %e, bytes = stats.bytes, "transfer aborted, reaping processes");
            self.reap(&mut producer, &mut consumer).await;
            return Err(e);
        }

        if let Err(e) = consumer.close().await {
            warn!(error = %e, "closing receive input failed");
        }

        let (producer_code, consumer_code) = self.wait_both(&mut producer, &mut consumer).await?;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;

        if producer_code != 0 || consumer_code != 0 {
            return Err(SyncError::TransferFailed {
                producer_code,
                consumer_code,
            });
        }

        info!(
            bytes = stats.bytes,
            chunks = stats.chunks,
            elapsed_ms = stats.elapsed_ms,
            "stream transfer complete"
        );
        Ok(stats)
    }

    async fn copy<P, C>(
        &self,
        producer: &mut P,
        consumer: &mut C,
        stats: &mut TransferStats,
    ) -> Result<()>
    where
        P: ProducerStream,
        C: ConsumerStream,
    {
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        loop {
            let n = producer.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }

            // A write into a dead consumer would surface as a broken pipe and hide its exit code.
            if let Some(exit_code) = consumer.try_exit_code()? {
                return Err(SyncError::ConsumerDied { exit_code });
            }

            let written = match consumer.write(&buf[..n]).await {
                Ok(written) => written,
                Err(e) => return Err(self.classify_write_failure(consumer, e).await),
            };
            if written < n {
                return Err(SyncError::ShortWrite {
                    expected: n,
                    written,
                });
            }

            stats.bytes += n as u64;
            stats.chunks += 1;
            debug!(chunk = n, total = stats.bytes, "chunk forwarded");
        }
    }

    async fn classify_write_failure<C: ConsumerStream>(
        &self,
        consumer: &mut C,
        err: SyncError,
    ) -> SyncError {
        let grace = self.config.exit_timeout.min(WRITE_FAILURE_GRACE);
        match tokio::time::timeout(grace, consumer.wait()).await {
            Ok(Ok(exit_code)) => SyncError::ConsumerDied { exit_code },
            _ => err,
        }
    }

    async fn wait_both<P, C>(&self, producer: &mut P, consumer: &mut C) -> Result<(i32, i32)>
    where
        P: ProducerStream,
        C: ConsumerStream,
    {
        let timeout = self.config.exit_timeout;
        match tokio::time::timeout(timeout, async {
            tokio::try_join!(producer.wait(), consumer.wait())
        })
        .await
        {
            Ok(codes) => codes,
            Err(_) => Err(SyncError::ProcessHangTimeout { timeout }),
        }
    }

    async fn reap<P, C>(&self, producer: &mut P, consumer: &mut C)
    where
        P: ProducerStream,
        C: ConsumerStream,
    {
        if let Err(e) = producer.close().await {
            debug!(error = %e, "closing send output failed");
        }
        if let Err(e) = consumer.close().await {
            debug!(error = %e, "closing receive input failed");
        }
        match self.wait_both(producer, consumer).await {
            Ok((producer_code, consumer_code)) => {
                debug!(producer_code, consumer_code, "reaped transfer processes");
            }
            Err(e) => warn!(error = %e, "could not reap transfer processes"),
        }
    }
}

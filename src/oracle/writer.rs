//! The Oracle writer: drains the circular buffer into time/size-triggered
//! batches, partitions by destination, commits with per-row failure
//! reporting, retries with exponential backoff, and spills to CSV on final
//! failure (spec §4.11).

use super::csv_spill::{spill_to_csv, SpillError};
use super::session::{OracleError, OraclePool};
use crate::buffer::CircularBuffer;
use crate::metrics::{READINGS_WRITTEN, WRITER_BATCH_LATENCY, WRITER_BATCH_SIZE};
use crate::sample::{BufferEntry, Destination};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub write_interval: Duration,
    pub batch_size: usize,
    pub retry_count: u32,
    pub backup_dir: PathBuf,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            write_interval: Duration::from_secs(1),
            batch_size: 500,
            retry_count: 3,
            backup_dir: PathBuf::from("backup"),
        }
    }
}

/// Exponential backoff schedule for commit retries: 1s, 2s, 4s (spec §4.11
/// step 7).
fn backoff_for_attempt(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(4))
}

#[derive(Debug, Default)]
pub struct WriterMetrics {
    pub total_batches: AtomicU64,
    pub successful_batches: AtomicU64,
    pub failed_batches: AtomicU64,
    pub total_rows_written: AtomicU64,
    pub total_rows_spilled: AtomicU64,
}

impl WriterMetrics {
    pub fn snapshot(&self) -> WriterMetricsSnapshot {
        WriterMetricsSnapshot {
            total_batches: self.total_batches.load(Ordering::Relaxed),
            successful_batches: self.successful_batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            total_rows_written: self.total_rows_written.load(Ordering::Relaxed),
            total_rows_spilled: self.total_rows_spilled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriterMetricsSnapshot {
    pub total_batches: u64,
    pub successful_batches: u64,
    pub failed_batches: u64,
    pub total_rows_written: u64,
    pub total_rows_spilled: u64,
}

/// Drains `buffer` into batches and commits them through `pool`, spilling to
/// CSV under `config.backup_dir` on permanent failure.
pub struct OracleWriter {
    buffer: Arc<CircularBuffer>,
    pool: Arc<dyn OraclePool>,
    config: WriterConfig,
    metrics: Arc<WriterMetrics>,
    wake: Notify,
    spill_sequence: AtomicU64,
}

impl OracleWriter {
    pub fn new(buffer: Arc<CircularBuffer>, pool: Arc<dyn OraclePool>, config: WriterConfig) -> Self {
        Self {
            buffer,
            pool,
            config,
            metrics: Arc::new(WriterMetrics::default()),
            wake: Notify::new(),
            spill_sequence: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> Arc<WriterMetrics> {
        self.metrics.clone()
    }

    /// Nudge the writer to drain immediately rather than waiting out the
    /// rest of `write_interval` — called once the buffer reaches
    /// `batch_size` (spec §4.11 step 1: "whichever first").
    pub fn wake_now(&self) {
        self.wake.notify_one();
    }

    /// The writer's main loop. Runs until `cancel` is triggered, at which
    /// point it performs one extended final drain-and-flush (spec §4.11
    /// "Shutdown").
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.write_interval) => {}
                _ = self.wake.notified() => {}
                _ = cancel.cancelled() => break,
            }
            self.drain_and_write_one_batch().await;
        }
        self.shutdown_flush().await;
    }

    async fn drain_and_write_one_batch(&self) {
        let entries = self.buffer.get(self.config.batch_size);
        if entries.is_empty() {
            return;
        }
        self.write_batch_with_retry(entries).await;
    }

    /// Attempt to commit a batch, retrying with backoff up to
    /// `config.retry_count` times before spilling to CSV.
    async fn write_batch_with_retry(&self, entries: Vec<BufferEntry>) {
        self.metrics.total_batches.fetch_add(1, Ordering::Relaxed);
        let (log_entries, op_entries) = partition(&entries);
        let started = Instant::now();

        let mut attempt = 0u32;
        loop {
            match self.commit_once(&log_entries, &op_entries).await {
                Ok(()) => {
                    self.metrics.successful_batches.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .total_rows_written
                        .fetch_add(entries.len() as u64, Ordering::Relaxed);
                    READINGS_WRITTEN
                        .with_label_values(&[Destination::DatatagLog.as_str()])
                        .inc_by(log_entries.len() as f64);
                    READINGS_WRITTEN
                        .with_label_values(&[Destination::Operation.as_str()])
                        .inc_by(op_entries.len() as f64);
                    WRITER_BATCH_LATENCY
                        .with_label_values(&["success"])
                        .observe(started.elapsed().as_secs_f64());
                    WRITER_BATCH_SIZE
                        .with_label_values(&["success"])
                        .observe(entries.len() as f64);
                    return;
                }
                Err(e) => {
                    if attempt >= self.config.retry_count {
                        warn!(
                            error = %e,
                            attempts = attempt + 1,
                            rows = entries.len(),
                            "Oracle batch commit exhausted retries, spilling to CSV"
                        );
                        self.metrics.failed_batches.fetch_add(1, Ordering::Relaxed);
                        WRITER_BATCH_LATENCY
                            .with_label_values(&["spilled"])
                            .observe(started.elapsed().as_secs_f64());
                        WRITER_BATCH_SIZE
                            .with_label_values(&["spilled"])
                            .observe(entries.len() as f64);
                        self.spill(&log_entries, &op_entries).await;
                        return;
                    }
                    let delay = backoff_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_secs = delay.as_secs(), "Oracle batch commit failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn commit_once(
        &self,
        log_entries: &[BufferEntry],
        op_entries: &[BufferEntry],
    ) -> Result<(), OracleError> {
        let mut session = self.pool.acquire().await?;
        if !log_entries.is_empty() {
            let outcome = session.insert_datatag_log(log_entries).await?;
            if !outcome.all_succeeded() {
                return Err(OracleError::RowFailed {
                    index: outcome.failed_rows[0].0,
                    message: outcome.failed_rows[0].1.clone(),
                });
            }
        }
        if !op_entries.is_empty() {
            let outcome = session.insert_operation(op_entries).await?;
            if !outcome.all_succeeded() {
                return Err(OracleError::RowFailed {
                    index: outcome.failed_rows[0].0,
                    message: outcome.failed_rows[0].1.clone(),
                });
            }
        }
        session.commit().await
    }

    async fn spill(&self, log_entries: &[BufferEntry], op_entries: &[BufferEntry]) {
        let now = chrono::Utc::now();
        let n = self.spill_sequence.fetch_add(1, Ordering::Relaxed) as u32;
        let spilled = log_entries.len() + op_entries.len();

        if !log_entries.is_empty() {
            self.spill_one(Destination::DatatagLog, log_entries, now, n).await;
        }
        if !op_entries.is_empty() {
            self.spill_one(Destination::Operation, op_entries, now, n).await;
        }
        self.metrics
            .total_rows_spilled
            .fetch_add(spilled as u64, Ordering::Relaxed);
    }

    async fn spill_one(
        &self,
        destination: Destination,
        entries: &[BufferEntry],
        now: chrono::DateTime<chrono::Utc>,
        n: u32,
    ) {
        match spill_to_csv(&self.config.backup_dir, destination, entries, now, n).await {
            Ok(path) => info!(path = %path.display(), rows = entries.len(), "batch spilled after exhausted retries"),
            Err(SpillError::CreateDir(path, e)) => {
                error!(path = %path.display(), error = %e, "fatal: cannot create CSV backup directory");
            }
            Err(e) => error!(error = %e, "fatal: CSV spill failed, rows are lost"),
        }
    }

    /// Drain the buffer completely and write straight to CSV, bypassing the
    /// Oracle pool entirely (spec §4.11 "Shutdown").
    async fn shutdown_flush(&self) {
        let remaining = self.buffer.drain_all();
        if remaining.is_empty() {
            return;
        }
        info!(rows = remaining.len(), "writer shutdown: flushing remaining buffer to CSV");
        let (log_entries, op_entries) = partition(&remaining);
        self.spill(&log_entries, &op_entries).await;
    }
}

fn partition(entries: &[BufferEntry]) -> (Vec<BufferEntry>, Vec<BufferEntry>) {
    let mut log_entries = Vec::new();
    let mut op_entries = Vec::new();
    for entry in entries {
        match entry.sample.kind.destination() {
            Destination::DatatagLog => log_entries.push(entry.clone()),
            Destination::Operation => op_entries.push(entry.clone()),
        }
    }
    (log_entries, op_entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mc3e::{DeviceAddress, DeviceCode};
    use crate::oracle::session::{FakeOracleStore, InMemoryOraclePool, OraclePoolConfig};
    use crate::sample::{Quality, RawValue, Sample, TagKind};

    fn make_entry(offset: u32, kind: TagKind) -> BufferEntry {
        let sample = Sample::new(
            "PLC01",
            DeviceAddress::new(DeviceCode::D, offset),
            "EQUIP0000000001",
            kind,
            RawValue::Word(offset as u16),
            1.0,
            Quality::Good,
        );
        BufferEntry::new(sample)
    }

    #[tokio::test]
    async fn drains_exact_batch_size_in_one_commit() {
        let buffer = Arc::new(CircularBuffer::new(1000));
        for i in 0..500 {
            buffer.put(make_entry(i, TagKind::WordHost));
        }
        let store = FakeOracleStore::new();
        let pool = InMemoryOraclePool::new(store.clone(), OraclePoolConfig::default());
        let writer = OracleWriter::new(
            buffer.clone(),
            pool,
            WriterConfig {
                batch_size: 500,
                ..WriterConfig::default()
            },
        );

        writer.drain_and_write_one_batch().await;

        assert_eq!(buffer.size(), 0);
        assert_eq!(store.committed_count(), 500);
        assert_eq!(writer.metrics().snapshot().successful_batches, 1);
    }

    #[tokio::test]
    async fn unreachable_store_retries_then_spills_and_empties_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(CircularBuffer::new(2000));
        for i in 0..600 {
            buffer.put(make_entry(i, TagKind::Alarm));
        }
        for i in 0..600 {
            buffer.put(make_entry(i, TagKind::Operation));
        }
        let store = FakeOracleStore::new();
        store.set_reachable(false);
        let pool = InMemoryOraclePool::new(store.clone(), OraclePoolConfig::default());
        let writer = OracleWriter::new(
            buffer.clone(),
            pool,
            WriterConfig {
                batch_size: 1200,
                backup_dir: dir.path().to_path_buf(),
                retry_count: 1,
                ..WriterConfig::default()
            },
        );

        writer.drain_and_write_one_batch().await;

        assert_eq!(buffer.size(), 0);
        assert_eq!(store.committed_count(), 0);
        assert_eq!(writer.metrics().snapshot().total_rows_spilled, 1200);

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2, "expected one CSV per destination");
    }

    #[tokio::test]
    async fn shutdown_flush_drains_remaining_entries_to_csv() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(CircularBuffer::new(100));
        for i in 0..10 {
            buffer.put(make_entry(i, TagKind::State));
        }
        let store = FakeOracleStore::new();
        let pool = InMemoryOraclePool::new(store, OraclePoolConfig::default());
        let writer = OracleWriter::new(
            buffer.clone(),
            pool,
            WriterConfig {
                backup_dir: dir.path().to_path_buf(),
                ..WriterConfig::default()
            },
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        writer.run(cancel).await;

        assert_eq!(buffer.size(), 0);
        assert_eq!(writer.metrics().snapshot().total_rows_spilled, 10);
    }

    #[test]
    fn backoff_schedule_matches_spec() {
        assert_eq!(backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(4));
    }
}

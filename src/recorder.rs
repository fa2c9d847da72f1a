//! Request recorder: turns per-request capture events into store writes
//!
//! Two strategies, chosen at startup:
//!
//! - **Immediate**: every call appends to the store before returning. The
//!   append runs on the blocking pool under the store's mutex, so concurrent
//!   callers are serialized. Errors are returned to the caller.
//! - **Buffered**: calls push onto a bounded queue drained by one background
//!   writer. A full queue makes callers wait. The writer flushes when the
//!   batch reaches the threshold or when the oldest queued record has waited
//!   for the flush interval. Flush failures are logged and the batch is
//!   dropped.
//!
//! Both strategies write through [`RecordStore::append_gated`], so a flush
//! always adds to the existing history. A write that outlives the write
//! timeout is abandoned and never reaches the store.

use crate::config::{CaptureConfig, CaptureStrategy};
use crate::record::RequestRecord;
use crate::store::{AppendError, CommitGate, RecordStore, StoreError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Extra time granted to the background writer on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RecordError {
    /// Existing store could not be read or parsed
    #[error("failed to read record store: {0}")]
    Read(#[source] StoreError),
    /// Store could not be written
    #[error("failed to write record store: {0}")]
    Write(#[source] StoreError),
    /// Store write did not finish within the write timeout
    #[error("record store write timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// Recorder has been shut down
    #[error("recorder is shut down")]
    Closed,
    /// The blocking write task panicked or was cancelled
    #[error("record store task failed: {0}")]
    Task(String),
}

impl From<AppendError> for RecordError {
    fn from(err: AppendError) -> Self {
        match err {
            AppendError::Read(e) => RecordError::Read(e),
            AppendError::Write(e) => RecordError::Write(e),
            e @ AppendError::Abandoned => RecordError::Task(e.to_string()),
        }
    }
}

/// Recorder settings
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub strategy: CaptureStrategy,
    /// Bounded queue capacity (buffered only)
    pub queue_capacity: usize,
    /// Batch size that triggers a flush (buffered only)
    pub flush_threshold: usize,
    /// Max age of the oldest unflushed record (buffered only)
    pub flush_interval: Duration,
    /// Upper bound on a single store write
    pub write_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for RecorderConfig {
    fn from(capture: &CaptureConfig) -> Self {
        Self {
            strategy: capture.strategy,
            queue_capacity: capture.queue_capacity,
            flush_threshold: capture.flush_threshold,
            flush_interval: capture.flush_interval(),
            write_timeout: capture.write_timeout(),
        }
    }
}

/// Counters for recorder activity
#[derive(Debug, Default)]
pub struct RecorderStats {
    /// Records accepted by `record`
    pub recorded: AtomicU64,
    /// Successful store writes
    pub flushes: AtomicU64,
    /// Records that reached the store
    pub persisted: AtomicU64,
    /// Records lost to failed writes
    pub dropped: AtomicU64,
}

impl RecorderStats {
    fn record_flush(&self, records: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.persisted.fetch_add(records as u64, Ordering::Relaxed);
    }

    fn record_dropped(&self, records: usize) {
        self.dropped.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn get_recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn get_flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn get_persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn get_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

enum Mode {
    Immediate,
    Buffered(BufferedWriter),
}

struct BufferedWriter {
    tx: mpsc::Sender<RequestRecord>,
    shutdown_tx: watch::Sender<bool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    shutdown_budget: Duration,
}

/// Records requests into a [`RecordStore`] using the configured strategy
pub struct Recorder {
    strategy: CaptureStrategy,
    store: Arc<RecordStore>,
    write_timeout: Duration,
    stats: Arc<RecorderStats>,
    closed: AtomicBool,
    mode: Mode,
}

impl Recorder {
    /// Create a recorder writing to `store`.
    ///
    /// The buffered strategy spawns its writer task, so this must be called
    /// from within a tokio runtime.
    pub fn new(config: RecorderConfig, store: Arc<RecordStore>) -> Self {
        let stats = Arc::new(RecorderStats::default());

        let mode = match config.strategy {
            CaptureStrategy::Immediate => Mode::Immediate,
            CaptureStrategy::Buffered => {
                let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
                let (shutdown_tx, shutdown_rx) = watch::channel(false);

                let writer = BatchWriter {
                    store: Arc::clone(&store),
                    stats: Arc::clone(&stats),
                    threshold: config.flush_threshold.max(1),
                    flush_interval: config.flush_interval,
                    write_timeout: config.write_timeout,
                };
                let handle = tokio::spawn(writer.run(rx, shutdown_rx));

                // Draining a full queue can take several flushes
                let flushes = config.queue_capacity / config.flush_threshold.max(1) + 2;
                let shutdown_budget =
                    config.write_timeout * u32::try_from(flushes).unwrap_or(u32::MAX) + SHUTDOWN_GRACE;

                Mode::Buffered(BufferedWriter {
                    tx,
                    shutdown_tx,
                    writer: Mutex::new(Some(handle)),
                    shutdown_budget,
                })
            }
        };

        info!(
            strategy = config.strategy.as_str(),
            path = %store.path().display(),
            queue_capacity = config.queue_capacity,
            flush_threshold = config.flush_threshold,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            write_timeout_ms = config.write_timeout.as_millis() as u64,
            "Request recorder started"
        );

        Self {
            strategy: config.strategy,
            store,
            write_timeout: config.write_timeout,
            stats,
            closed: AtomicBool::new(false),
            mode,
        }
    }

    pub fn strategy(&self) -> CaptureStrategy {
        self.strategy
    }

    /// Whether a recording failure must stop the request from being forwarded
    pub fn is_fail_closed(&self) -> bool {
        self.strategy == CaptureStrategy::Immediate
    }

    pub fn stats(&self) -> Arc<RecorderStats> {
        Arc::clone(&self.stats)
    }

    /// Record one request.
    ///
    /// Immediate: returns once the record is in the store. Buffered: returns
    /// once the record is queued, waiting for space if the queue is full.
    pub async fn record(&self, entry: RequestRecord) -> Result<(), RecordError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RecordError::Closed);
        }

        match &self.mode {
            Mode::Immediate => {
                let result =
                    append_with_timeout(&self.store, vec![entry], self.write_timeout).await;
                match result {
                    Ok(_) => {
                        self.stats.recorded.fetch_add(1, Ordering::Relaxed);
                        self.stats.record_flush(1);
                        Ok(())
                    }
                    Err(e) => {
                        self.stats.record_dropped(1);
                        Err(e)
                    }
                }
            }
            Mode::Buffered(buffered) => {
                buffered
                    .tx
                    .send(entry)
                    .await
                    .map_err(|_| RecordError::Closed)?;
                self.stats.recorded.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Stop accepting records, drain the queue and flush what is left.
    ///
    /// Safe to call more than once; only the first call waits for the writer.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Mode::Buffered(buffered) = &self.mode {
            let _ = buffered.shutdown_tx.send(true);

            let handle = buffered.writer.lock().take();
            if let Some(handle) = handle {
                match tokio::time::timeout(buffered.shutdown_budget, handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "Record writer task failed"),
                    Err(_) => warn!(
                        budget_ms = buffered.shutdown_budget.as_millis() as u64,
                        "Record writer did not finish draining before shutdown deadline"
                    ),
                }
            }
        }

        info!(
            strategy = self.strategy.as_str(),
            recorded = self.stats.get_recorded(),
            persisted = self.stats.get_persisted(),
            dropped = self.stats.get_dropped(),
            "Request recorder stopped"
        );
    }
}

/// Append `records` on the blocking pool, bounded by `timeout`.
///
/// On timeout the pending write is abandoned so it cannot land later. If it
/// had already started its final rename, that rename is awaited instead and
/// its result returned.
async fn append_with_timeout(
    store: &Arc<RecordStore>,
    records: Vec<RequestRecord>,
    timeout: Duration,
) -> Result<usize, RecordError> {
    let store = Arc::clone(store);
    let gate = Arc::new(CommitGate::new());
    let mut task = tokio::task::spawn_blocking({
        let gate = Arc::clone(&gate);
        move || store.append_gated(&records, &gate)
    });

    let joined = match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            if gate.abandon() {
                return Err(RecordError::Timeout(timeout));
            }
            task.await
        }
    };

    match joined {
        Ok(result) => Ok(result?),
        Err(e) => Err(RecordError::Task(e.to_string())),
    }
}

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    Threshold,
    Interval,
    Shutdown,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Threshold => "threshold",
            FlushReason::Interval => "interval",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

/// The single background task that owns buffered writes
struct BatchWriter {
    store: Arc<RecordStore>,
    stats: Arc<RecorderStats>,
    threshold: usize,
    flush_interval: Duration,
    write_timeout: Duration,
}

impl BatchWriter {
    async fn run(
        self,
        mut rx: mpsc::Receiver<RequestRecord>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut batch = Vec::with_capacity(self.threshold);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(entry) = received else { break };
                    if batch.is_empty() {
                        deadline = Some(Instant::now() + self.flush_interval);
                    }
                    batch.push(entry);
                    if batch.len() >= self.threshold {
                        self.flush(&mut batch, FlushReason::Threshold).await;
                        deadline = None;
                    }
                }
                _ = wait_until(deadline) => {
                    self.flush(&mut batch, FlushReason::Interval).await;
                    deadline = None;
                }
                _ = shutdown_rx.changed() => {
                    // Anything already queued is still written; new sends fail
                    rx.close();
                    while let Some(entry) = rx.recv().await {
                        batch.push(entry);
                        if batch.len() >= self.threshold {
                            self.flush(&mut batch, FlushReason::Threshold).await;
                        }
                    }
                    break;
                }
            }
        }

        self.flush(&mut batch, FlushReason::Shutdown).await;
        debug!(path = %self.store.path().display(), "Record writer stopped");
    }

    async fn flush(&self, batch: &mut Vec<RequestRecord>, reason: FlushReason) {
        if batch.is_empty() {
            return;
        }

        let records = std::mem::replace(batch, Vec::with_capacity(self.threshold));
        let count = records.len();

        match append_with_timeout(&self.store, records, self.write_timeout).await {
            Ok(total) => {
                self.stats.record_flush(count);
                debug!(
                    path = %self.store.path().display(),
                    reason = reason.as_str(),
                    flushed = count,
                    total,
                    "Flushed buffered records"
                );
            }
            Err(e) => {
                self.stats.record_dropped(count);
                error!(
                    path = %self.store.path().display(),
                    reason = reason.as_str(),
                    dropped = count,
                    error = %e,
                    "Failed to flush buffered records"
                );
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;

    fn sample(n: usize) -> RequestRecord {
        RequestRecord::new(
            "GET",
            format!("/req/{}", n),
            "Unknown",
            BTreeMap::new(),
            "127.0.0.1:40000",
            "03-14-24 - 09:26",
        )
    }

    fn store_at(path: &Path) -> Arc<RecordStore> {
        Arc::new(RecordStore::new(path))
    }

    fn immediate() -> RecorderConfig {
        RecorderConfig {
            strategy: CaptureStrategy::Immediate,
            ..RecorderConfig::default()
        }
    }

    fn buffered(threshold: usize, flush_interval: Duration) -> RecorderConfig {
        RecorderConfig {
            strategy: CaptureStrategy::Buffered,
            queue_capacity: 100,
            flush_threshold: threshold,
            flush_interval,
            write_timeout: Duration::from_secs(5),
        }
    }

    async fn wait_for_flushes(stats: &RecorderStats, flushes: u64, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if stats.get_flushes() >= flushes {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn urls(path: &Path) -> Vec<String> {
        crate::store::read_records(path)
            .unwrap()
            .iter()
            .map(|r| r.url().to_string())
            .collect()
    }

    #[test]
    fn test_config_from_capture_config() {
        let capture = CaptureConfig {
            strategy: CaptureStrategy::Immediate,
            queue_capacity: 10,
            flush_threshold: 5,
            flush_interval_ms: 250,
            write_timeout_ms: 750,
        };
        let config = RecorderConfig::from(&capture);
        assert_eq!(config.strategy, CaptureStrategy::Immediate);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.flush_threshold, 5);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.write_timeout, Duration::from_millis(750));
    }

    #[tokio::test]
    async fn test_immediate_writes_each_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profile.json");
        let recorder = Recorder::new(immediate(), store_at(&path));

        assert!(recorder.is_fail_closed());
        recorder.record(sample(1)).await.unwrap();
        assert_eq!(urls(&path), ["/req/1"]);
        recorder.record(sample(2)).await.unwrap();
        assert_eq!(urls(&path), ["/req/1", "/req/2"]);
        assert_eq!(recorder.stats().get_flushes(), 2);
    }

    #[tokio::test]
    async fn test_immediate_corrupt_store_is_read_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profile.json");
        std::fs::write(&path, "garbage").unwrap();
        let recorder = Recorder::new(immediate(), store_at(&path));

        let err = recorder.record(sample(1)).await.unwrap_err();
        assert!(matches!(err, RecordError::Read(_)));
        assert_eq!(recorder.stats().get_dropped(), 1);
    }

    #[tokio::test]
    async fn test_immediate_unwritable_store_is_write_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("no-such-dir").join("profile.json");
        let recorder = Recorder::new(immediate(), store_at(&path));

        let err = recorder.record(sample(1)).await.unwrap_err();
        assert!(matches!(err, RecordError::Write(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_immediate_concurrent_records_are_not_lost() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profile.json");
        let recorder = Arc::new(Recorder::new(immediate(), store_at(&path)));

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..64 {
            let recorder = Arc::clone(&recorder);
            tasks.spawn(async move { recorder.record(sample(n)).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let mut seen = urls(&path);
        assert_eq!(seen.len(), 64);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 64);
    }

    #[tokio::test]
    async fn test_buffered_below_threshold_waits_for_interval() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profile.json");
        let recorder = Recorder::new(
            buffered(10, Duration::from_millis(400)),
            store_at(&path),
        );
        let stats = recorder.stats();

        for n in 0..3 {
            recorder.record(sample(n)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!path.exists(), "store written before threshold or interval");

        assert!(wait_for_flushes(&stats, 1, Duration::from_secs(3)).await);
        assert_eq!(urls(&path), ["/req/0", "/req/1", "/req/2"]);
        assert_eq!(stats.get_flushes(), 1);
    }

    #[tokio::test]
    async fn test_buffered_threshold_triggers_one_flush_appended_to_history() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profile.json");
        let store = store_at(&path);
        store.write(&[sample(100), sample(101)]).unwrap();

        let recorder = Recorder::new(buffered(5, Duration::from_secs(60)), store);
        let stats = recorder.stats();

        for n in 0..5 {
            recorder.record(sample(n)).await.unwrap();
        }

        assert!(wait_for_flushes(&stats, 1, Duration::from_secs(3)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.get_flushes(), 1);
        assert_eq!(stats.get_persisted(), 5);
        assert_eq!(
            urls(&path),
            ["/req/100", "/req/101", "/req/0", "/req/1", "/req/2", "/req/3", "/req/4"]
        );
    }

    #[tokio::test]
    async fn test_buffered_consecutive_flushes_keep_history() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profile.json");
        let recorder = Recorder::new(buffered(3, Duration::from_secs(60)), store_at(&path));
        let stats = recorder.stats();

        for n in 0..9 {
            recorder.record(sample(n)).await.unwrap();
        }

        assert!(wait_for_flushes(&stats, 3, Duration::from_secs(3)).await);
        let expected: Vec<String> = (0..9).map(|n| format!("/req/{}", n)).collect();
        assert_eq!(urls(&path), expected);
    }

    #[tokio::test]
    async fn test_buffered_shutdown_flushes_partial_batch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profile.json");
        let recorder = Recorder::new(buffered(100, Duration::from_secs(60)), store_at(&path));

        for n in 0..7 {
            recorder.record(sample(n)).await.unwrap();
        }
        recorder.shutdown().await;

        assert_eq!(urls(&path).len(), 7);
        assert!(matches!(recorder.record(sample(8)).await, Err(RecordError::Closed)));

        // Second shutdown is a no-op
        recorder.shutdown().await;
    }

    #[tokio::test]
    async fn test_buffered_flush_failure_is_not_surfaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("no-such-dir").join("profile.json");
        let recorder = Recorder::new(buffered(2, Duration::from_secs(60)), store_at(&path));
        let stats = recorder.stats();

        for n in 0..4 {
            recorder.record(sample(n)).await.unwrap();
        }
        recorder.shutdown().await;

        assert!(!recorder.is_fail_closed());
        assert_eq!(stats.get_recorded(), 4);
        assert_eq!(stats.get_dropped(), 4);
        assert_eq!(stats.get_flushes(), 0);
    }

    #[tokio::test]
    async fn test_immediate_shutdown_rejects_records() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::new(immediate(), store_at(&tmp.path().join("p.json")));
        recorder.shutdown().await;
        assert!(matches!(recorder.record(sample(1)).await, Err(RecordError::Closed)));
    }

    #[tokio::test]
    async fn test_immediate_timeout_leaves_store_unchanged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profile.json");
        let store = store_at(&path);
        store.write(&[sample(100)]).unwrap();
        let config = RecorderConfig {
            write_timeout: Duration::from_millis(100),
            ..immediate()
        };
        let recorder = Recorder::new(config, Arc::clone(&store));

        let stalled = store.stall();
        let err = recorder.record(sample(1)).await.unwrap_err();
        assert!(matches!(err, RecordError::Timeout(t) if t == Duration::from_millis(100)));
        drop(stalled);

        // The timed-out write still runs once the lock frees, but must not commit
        recorder.record(sample(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(urls(&path), ["/req/100", "/req/2"]);
        assert_eq!(recorder.stats().get_dropped(), 1);
        assert_eq!(recorder.stats().get_persisted(), 1);
    }

    #[tokio::test]
    async fn test_buffered_full_queue_blocks_until_writer_drains() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("profile.json");
        let store = store_at(&path);
        let config = RecorderConfig {
            strategy: CaptureStrategy::Buffered,
            queue_capacity: 1,
            flush_threshold: 1,
            flush_interval: Duration::from_secs(60),
            write_timeout: Duration::from_secs(5),
        };
        let recorder = Recorder::new(config, Arc::clone(&store));
        let stats = recorder.stats();

        let stalled = store.stall();

        // The writer takes the first record and blocks on the store
        recorder.record(sample(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The second fills the queue, the third has to wait
        tokio::time::timeout(Duration::from_secs(1), recorder.record(sample(1)))
            .await
            .unwrap()
            .unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(200), recorder.record(sample(2))).await;
        assert!(pending.is_err(), "record returned while the queue was full");

        drop(stalled);
        tokio::time::timeout(Duration::from_secs(3), recorder.record(sample(2)))
            .await
            .unwrap()
            .unwrap();
        recorder.shutdown().await;

        assert_eq!(urls(&path), ["/req/0", "/req/1", "/req/2"]);
        assert_eq!(stats.get_recorded(), 3);
        assert_eq!(stats.get_dropped(), 0);
    }
}

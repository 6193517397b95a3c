use crate::convert::{Conversion, Converter};
use crate::line_protocol::WriteRecord;
use crate::store::TimeSeriesStore;
use bytes::Bytes;
use futures::future;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;


/// Payload exactly as delivered by the subscription.
pub type RawMessage = Bytes;

#[derive(Debug)]
pub struct IngestStats {
    pub ingest_queue_depth: AtomicU64,
    pub batch_queue_depth: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_ignored: AtomicU64,
    pub conversion_failures: AtomicU64,
    pub records_converted: AtomicU64,
    pub records_written: AtomicU64,
    pub records_dropped: AtomicU64,
    pub batches_written: AtomicU64,
    pub batches_failed: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            ingest_queue_depth: AtomicU64::new(0),
            batch_queue_depth: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_ignored: AtomicU64::new(0),
            conversion_failures: AtomicU64::new(0),
            records_converted: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    fn log_summary(&self) {
        tracing::info!(
            received = self.messages_received.load(Ordering::Relaxed),
            converted = self.records_converted.load(Ordering::Relaxed),
            ignored = self.messages_ignored.load(Ordering::Relaxed),
            conversion_failures = self.conversion_failures.load(Ordering::Relaxed),
            written = self.records_written.load(Ordering::Relaxed),
            dropped = self.records_dropped.load(Ordering::Relaxed),
            batches_failed = self.batches_failed.load(Ordering::Relaxed),
            "pipeline stopped"
        );
    }
}

/// Producer side of the ingest queue, handed to the subscription.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::UnboundedSender<RawMessage>,
    stats: Arc<IngestStats>,
}

impl IngestHandle {
    pub fn new(tx: mpsc::UnboundedSender<RawMessage>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Never blocks. Returns false once the conversion stage has stopped.
    pub fn enqueue(&self, payload: RawMessage) -> bool {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let queue_depth = self.stats.ingest_queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, len = payload.len(), "queued message");
        if self.tx.send(payload).is_err() {
            self.stats.ingest_queue_depth.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!("conversion stage stopped; dropping message");
            return false;
        }
        true
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PipelineSettings {
    pub flush_count: usize,
    pub flush_interval: Duration,
}

/// Records buffered since the last flush. Due when `flush_count` records are
/// held or `flush_interval` has elapsed since the last flush.
#[derive(Debug)]
pub struct BatchAccumulator {
    records: Vec<WriteRecord>,
    flush_count: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

/// A batch taken out of the accumulator for writing.
#[derive(Debug)]
pub struct Batch {
    pub records: Vec<WriteRecord>,
    pub started: Instant,
}

impl BatchAccumulator {
    pub fn new(settings: PipelineSettings, now: Instant) -> Self {
        let flush_count = settings.flush_count.max(1);
        Self {
            records: Vec::with_capacity(flush_count.min(4096)),
            flush_count,
            flush_interval: settings.flush_interval,
            last_flush: now,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends and reports whether the batch is now due.
    pub fn push(&mut self, record: WriteRecord, now: Instant) -> bool {
        self.records.push(record);
        self.is_due(now)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        !self.records.is_empty()
            && (self.records.len() >= self.flush_count
                || now.saturating_duration_since(self.last_flush) >= self.flush_interval)
    }

    /// When a non-empty batch becomes due by time.
    pub fn deadline(&self) -> Option<Instant> {
        if self.records.is_empty() {
            None
        } else {
            Some(self.last_flush + self.flush_interval)
        }
    }

    pub fn take(&mut self) -> Batch {
        Batch {
            records: std::mem::take(&mut self.records),
            started: self.last_flush,
        }
    }

    pub fn mark_flushed(&mut self, now: Instant) {
        self.last_flush = now;
    }
}

#[derive(Clone, Copy, Debug)]
enum FlushTrigger {
    Size,
    Interval,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Held by each stage task. A stage that unwinds cancels the pipeline so the
/// process shuts down instead of running with a dead stage.
struct StageGuard {
    stage: &'static str,
    cancel: CancellationToken,
}

impl StageGuard {
    fn new(stage: &'static str, cancel: &CancellationToken) -> Self {
        Self {
            stage,
            cancel: cancel.clone(),
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(stage = self.stage, "pipeline stage panicked; shutting down");
            self.cancel.cancel();
        }
    }
}

pub fn spawn_converter(
    converter: Converter,
    mut rx: mpsc::UnboundedReceiver<RawMessage>,
    tx: mpsc::UnboundedSender<WriteRecord>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _guard = StageGuard::new("conversion", &cancel);
        let mut draining = false;
        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled(), if !draining => {
                    // Stop accepting; whatever is already queued still converts.
                    draining = true;
                    rx.close();
                    continue;
                }
                raw = rx.recv() => raw,
            };
            let Some(raw) = raw else {
                break;
            };
            stats.ingest_queue_depth.fetch_sub(1, Ordering::Relaxed);
            convert_one(&converter, &raw, &tx, &stats);
        }
        tracing::debug!("conversion stage stopped");
    })
}

fn convert_one(
    converter: &Converter,
    raw: &RawMessage,
    tx: &mpsc::UnboundedSender<WriteRecord>,
    stats: &IngestStats,
) {
    match converter.convert(raw) {
        Ok(Conversion::Record(record)) => {
            tracing::trace!(
                measurement = record.measurement(),
                ts = record.timestamp_ns(),
                fields = record.field_segment(),
                "converted message"
            );
            stats.batch_queue_depth.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = tx.send(record) {
                stats.batch_queue_depth.fetch_sub(1, Ordering::Relaxed);
                stats.records_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(record = %err.0, "write stage stopped; dropping record");
                return;
            }
            stats.records_converted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Conversion::Ignored) => {
            stats.messages_ignored.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            stats.conversion_failures.fetch_add(1, Ordering::Relaxed);
            stats.record_error(err.to_string());
            tracing::error!(error = %err, "dropping message that failed conversion");
        }
    }
}

pub fn spawn_writer<S: TimeSeriesStore>(
    store: S,
    mut rx: mpsc::UnboundedReceiver<WriteRecord>,
    stats: Arc<IngestStats>,
    settings: PipelineSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _guard = StageGuard::new("write", &cancel);
        let mut batch = BatchAccumulator::new(settings, Instant::now());
        let mut draining = false;

        loop {
            let deadline = batch.deadline();
            tokio::select! {
                _ = cancel.cancelled(), if !draining => {
                    // Keep draining until the conversion stage hangs up.
                    draining = true;
                    flush(&store, &mut batch, &stats, FlushTrigger::Shutdown).await;
                }
                _ = sleep_until(deadline) => {
                    flush(&store, &mut batch, &stats, FlushTrigger::Interval).await;
                }
                record = rx.recv() => {
                    match record {
                        Some(record) => {
                            stats.batch_queue_depth.fetch_sub(1, Ordering::Relaxed);
                            let now = Instant::now();
                            if batch.push(record, now) {
                                let trigger = if batch.len() >= settings.flush_count.max(1) {
                                    FlushTrigger::Size
                                } else {
                                    FlushTrigger::Interval
                                };
                                flush(&store, &mut batch, &stats, trigger).await;
                            }
                        }
                        None => {
                            flush(&store, &mut batch, &stats, FlushTrigger::Shutdown).await;
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("write stage stopped");
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}

/// Writes the buffered batch once. A failed batch is dropped, not retried, and
/// the flush timer restarts either way.
async fn flush<S: TimeSeriesStore>(
    store: &S,
    batch: &mut BatchAccumulator,
    stats: &IngestStats,
    trigger: FlushTrigger,
) {
    if batch.is_empty() {
        return;
    }

    let taken = batch.take();
    let len = taken.records.len();
    let since_last = Instant::now().saturating_duration_since(taken.started);
    let rate = (len as f64 / since_last.as_secs_f64().max(0.001)) as u64;
    tracing::info!(
        len,
        rate,
        trigger = trigger.as_str(),
        "InfluxDB batch size: {len}, wrote {rate} entries/sec"
    );

    let result = store.write_batch(&taken.records).await;
    batch.mark_flushed(Instant::now());
    stats.last_batch_len.store(len as u64, Ordering::Relaxed);

    match result {
        Ok(()) => {
            stats.records_written.fetch_add(len as u64, Ordering::Relaxed);
            stats.batches_written.fetch_add(1, Ordering::Relaxed);
            let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
            stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
            stats.clear_error();
        }
        Err(err) => {
            stats.records_dropped.fetch_add(len as u64, Ordering::Relaxed);
            stats.batches_failed.fetch_add(1, Ordering::Relaxed);
            stats.record_error(err.to_string());
            let lines = taken
                .records
                .iter()
                .map(WriteRecord::as_str)
                .collect::<Vec<_>>()
                .join("\n");
            tracing::error!(error = %err, len, batch = %lines, "failed to write batch; dropping it");
        }
    }
}

/// Owns the queues and the stages between subscription and store.
pub struct Pipeline {
    ingest: IngestHandle,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
    source: Option<JoinHandle<()>>,
    converter: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Pipeline {
    /// Spawns the conversion and write stages. The store moves into the write
    /// stage, so anything that needs it beforehand (retention) must run first.
    pub fn start<S: TimeSeriesStore>(
        store: S,
        converter: Converter,
        settings: PipelineSettings,
        cancel: CancellationToken,
    ) -> Self {
        let stats = Arc::new(IngestStats::new());
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel::<RawMessage>();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<WriteRecord>();

        let writer = spawn_writer(store, batch_rx, stats.clone(), settings, cancel.clone());
        let converter =
            spawn_converter(converter, ingest_rx, batch_tx, stats.clone(), cancel.clone());

        Self {
            ingest: IngestHandle::new(ingest_tx, stats.clone()),
            stats,
            cancel,
            source: None,
            converter,
            writer,
        }
    }

    #[cfg(test)]
    pub fn ingest_handle(&self) -> IngestHandle {
        self.ingest.clone()
    }

    #[cfg(test)]
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Spawns the subscription stage feeding the ingest queue.
    pub fn spawn_source<F, Fut>(&mut self, source: F)
    where
        F: FnOnce(IngestHandle, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let fut = source(self.ingest.clone(), self.cancel.clone());
        self.source = Some(tokio::spawn(async move {
            if let Err(err) = fut.await {
                tracing::error!(error = %err, "subscription stage exited");
            }
        }));
    }

    /// Signals every stage, waits for queued data to drain and the final flush.
    pub async fn shutdown(self) {
        let Pipeline {
            ingest,
            stats,
            cancel,
            source,
            converter,
            writer,
        } = self;
        cancel.cancel();
        if let Some(source) = source {
            if let Err(err) = source.await {
                tracing::warn!(error = %err, "subscription task failed");
            }
        }
        drop(ingest);
        if let Err(err) = converter.await {
            tracing::warn!(error = %err, "conversion task failed");
        }
        if let Err(err) = writer.await {
            tracing::warn!(error = %err, "write task failed");
        }
        stats.log_summary();
    }
}

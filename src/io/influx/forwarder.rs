// src/io/influx/forwarder.rs
//
// Batching forwarder between the decode loop and the database: a bounded
// submit queue feeding a worker task that flushes on size or age and
// retries failed batches with exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::ForwardError;
use crate::io::traits::PointSink;
use crate::io::Reading;
use crate::settings::DatabaseSettings;

#[derive(Default)]
struct ForwardStats {
    written: AtomicU64,
    dropped: AtomicU64,
}

// ============================================================================
// Forwarder
// ============================================================================

/// Handle to the transmit worker. Submission never blocks: when the queue
/// is full the reading is rejected immediately and the caller counts it.
pub struct Forwarder {
    tx: mpsc::Sender<Reading>,
    handle: JoinHandle<()>,
    stats: Arc<ForwardStats>,
}

impl Forwarder {
    /// Spawn the transmit worker on the current runtime.
    pub fn start(settings: DatabaseSettings, sink: Arc<dyn PointSink>) -> Forwarder {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let stats = Arc::new(ForwardStats::default());
        let handle = tokio::spawn(run_worker(settings, sink, rx, stats.clone()));
        Forwarder { tx, handle, stats }
    }

    /// Queue one reading without waiting. Fails fast with QueueOverflow
    /// when the queue is full or the worker is gone.
    pub fn submit(&self, reading: Reading) -> Result<(), ForwardError> {
        self.tx
            .try_send(reading)
            .map_err(|_| ForwardError::QueueOverflow)
    }

    /// Points acknowledged by the sink.
    pub fn points_written(&self) -> u64 {
        self.stats.written.load(Ordering::Relaxed)
    }

    /// Points dropped after exhausting the retry budget.
    pub fn points_dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the worker to drain and flush what is
    /// left, bounded by `timeout`. Returns (written, dropped) totals.
    pub async fn shutdown(self, timeout: Duration) -> (u64, u64) {
        let Forwarder {
            tx,
            mut handle,
            stats,
        } = self;
        drop(tx); // end of input; the worker flushes and exits

        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            warn!(
                "final flush did not finish within {} ms, abandoning it",
                timeout.as_millis()
            );
            handle.abort();
        }
        (
            stats.written.load(Ordering::Relaxed),
            stats.dropped.load(Ordering::Relaxed),
        )
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker(
    settings: DatabaseSettings,
    sink: Arc<dyn PointSink>,
    mut rx: mpsc::Receiver<Reading>,
    stats: Arc<ForwardStats>,
) {
    let batch_age = Duration::from_millis(settings.batch_age_ms);
    let mut batch: Vec<Reading> = Vec::with_capacity(settings.batch_size);
    let mut deadline = Instant::now() + batch_age;

    loop {
        if batch.is_empty() {
            // Nothing pending: block until a reading arrives or input ends.
            match rx.recv().await {
                Some(reading) => {
                    batch.push(reading);
                    deadline = Instant::now() + batch_age;
                }
                None => break,
            }
        } else {
            // The oldest queued reading bounds how long we wait for more.
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(reading)) => batch.push(reading),
                Ok(None) => break,
                Err(_) => {
                    flush_batch(sink.as_ref(), &settings, &mut batch, &stats).await;
                    continue;
                }
            }
        }

        if batch.len() >= settings.batch_size {
            flush_batch(sink.as_ref(), &settings, &mut batch, &stats).await;
        }
    }

    // Input closed: deliver whatever is left before exiting.
    if !batch.is_empty() {
        flush_batch(sink.as_ref(), &settings, &mut batch, &stats).await;
    }
}

/// Transmit one batch as a whole, retrying with exponential backoff up to
/// the configured bound. Past the bound the batch is dropped and counted;
/// it is never interleaved with newer readings.
async fn flush_batch(
    sink: &dyn PointSink,
    settings: &DatabaseSettings,
    batch: &mut Vec<Reading>,
    stats: &ForwardStats,
) {
    if batch.is_empty() {
        return;
    }

    let mut backoff = Duration::from_millis(settings.retry_backoff_min_ms);
    let max_backoff = Duration::from_millis(settings.retry_backoff_max_ms);

    for attempt in 0..=settings.retry_attempts {
        if attempt > 0 {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
        match sink.write_points(batch).await {
            Ok(()) => {
                debug!("wrote {} points", batch.len());
                stats.written.fetch_add(batch.len() as u64, Ordering::Relaxed);
                batch.clear();
                return;
            }
            Err(err) => {
                warn!("write attempt {} failed: {err}", attempt + 1);
            }
        }
    }

    warn!(
        "dropping {} points after {} retries",
        batch.len(),
        settings.retry_attempts
    );
    stats.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
    batch.clear();
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn reading(sequence: u32) -> Reading {
        Reading::with_value(1, sequence, f64::from(sequence))
    }

    fn settings(batch_size: usize, batch_age_ms: u64) -> DatabaseSettings {
        DatabaseSettings {
            batch_size,
            batch_age_ms,
            retry_attempts: 3,
            retry_backoff_min_ms: 500,
            retry_backoff_max_ms: 10_000,
            ..DatabaseSettings::default()
        }
    }

    /// Records successful batches; fails the first `fail_remaining` calls.
    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<Vec<Reading>>>,
        call_instants: Mutex<Vec<Instant>>,
        fail_remaining: AtomicUsize,
    }

    impl RecordingSink {
        fn failing(times: usize) -> Self {
            let sink = RecordingSink::default();
            sink.fail_remaining.store(times, Ordering::Relaxed);
            sink
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }

        fn sequences(&self, i: usize) -> Vec<u32> {
            self.writes.lock().unwrap()[i]
                .iter()
                .map(|r| r.sequence)
                .collect()
        }
    }

    #[async_trait]
    impl PointSink for RecordingSink {
        async fn write_points(&self, points: &[Reading]) -> Result<(), ForwardError> {
            self.call_instants.lock().unwrap().push(Instant::now());
            if self.fail_remaining.load(Ordering::Relaxed) > 0 {
                self.fail_remaining.fetch_sub(1, Ordering::Relaxed);
                return Err(ForwardError::ConnectionRefused {
                    detail: "connection reset".to_string(),
                });
            }
            self.writes.lock().unwrap().push(points.to_vec());
            Ok(())
        }
    }

    /// Accepts the first call and never returns from it.
    struct StuckSink;

    #[async_trait]
    impl PointSink for StuckSink {
        async fn write_points(&self, _points: &[Reading]) -> Result<(), ForwardError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    async fn wait_for_writes(sink: &RecordingSink, n: usize) {
        for _ in 0..1000 {
            if sink.write_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sink never reached {n} writes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_at_size_threshold() {
        let sink = Arc::new(RecordingSink::default());
        let forwarder = Forwarder::start(settings(3, 60_000), sink.clone());

        for seq in 1..=3 {
            forwarder.submit(reading(seq)).unwrap();
        }

        wait_for_writes(&sink, 1).await;
        assert_eq!(sink.sequences(0), vec![1, 2, 3]);
        assert_eq!(forwarder.points_written(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_at_age_threshold() {
        let sink = Arc::new(RecordingSink::default());
        let forwarder = Forwarder::start(settings(100, 1000), sink.clone());

        forwarder.submit(reading(1)).unwrap();
        forwarder.submit(reading(2)).unwrap();

        // Far below the size threshold: only age can trigger this flush.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        wait_for_writes(&sink, 1).await;
        assert_eq!(sink.sequences(0), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_increases_then_drops() {
        // Four failures exhaust the initial attempt plus three retries.
        let sink = Arc::new(RecordingSink::failing(4));
        let forwarder = Forwarder::start(settings(1, 1000), sink.clone());

        forwarder.submit(reading(1)).unwrap();

        for _ in 0..1000 {
            if forwarder.points_dropped() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(forwarder.points_dropped(), 1);
        assert_eq!(sink.write_count(), 0);

        {
            let instants = sink.call_instants.lock().unwrap();
            assert_eq!(instants.len(), 4);
            let deltas: Vec<Duration> = instants.windows(2).map(|w| w[1] - w[0]).collect();
            assert_eq!(deltas[0], Duration::from_millis(500));
            assert_eq!(deltas[1], Duration::from_millis(1000));
            assert_eq!(deltas[2], Duration::from_millis(2000));
        }

        // The database is back: later readings still get through.
        forwarder.submit(reading(2)).unwrap();
        wait_for_writes(&sink, 1).await;
        assert_eq!(sink.sequences(0), vec![2]);
        assert_eq!(forwarder.points_written(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_retries_whole_never_interleaved() {
        let sink = Arc::new(RecordingSink::failing(1));
        let forwarder = Forwarder::start(settings(2, 1000), sink.clone());

        forwarder.submit(reading(1)).unwrap();
        forwarder.submit(reading(2)).unwrap();

        // Lands while the first batch is in its backoff sleep.
        tokio::time::sleep(Duration::from_millis(50)).await;
        forwarder.submit(reading(3)).unwrap();

        wait_for_writes(&sink, 2).await;
        assert_eq!(sink.sequences(0), vec![1, 2]);
        assert_eq!(sink.sequences(1), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow_fails_fast() {
        let sink = Arc::new(StuckSink);
        let config = DatabaseSettings {
            queue_capacity: 1,
            batch_size: 1,
            ..DatabaseSettings::default()
        };
        let forwarder = Forwarder::start(config, sink);

        forwarder.submit(reading(1)).unwrap();
        // Let the worker pull the first reading into its stuck write.
        tokio::time::sleep(Duration::from_millis(10)).await;

        forwarder.submit(reading(2)).unwrap();
        let overflow = forwarder.submit(reading(3));
        assert!(matches!(overflow, Err(ForwardError::QueueOverflow)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_batch() {
        let sink = Arc::new(RecordingSink::default());
        let forwarder = Forwarder::start(settings(100, 60_000), sink.clone());

        forwarder.submit(reading(1)).unwrap();
        forwarder.submit(reading(2)).unwrap();

        let (written, dropped) = forwarder.shutdown(Duration::from_secs(5)).await;
        assert_eq!((written, dropped), (2, 0));
        assert_eq!(sink.sequences(0), vec![1, 2]);
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::event::Event;
use crate::health::HealthMetrics;
use crate::store::EventStore;

/// Sizing and timing for a batch buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    /// Queue capacity; enqueue waits while this many events are pending.
    pub buffer_size: usize,
    /// Flush as soon as this many events have accumulated.
    pub batch_size: usize,
    /// Flush whatever has accumulated at least this often.
    pub flush_interval: Duration,
    /// Upper bound on a single store write.
    pub flush_timeout: Duration,
}

impl From<&IngestConfig> for BufferConfig {
    fn from(cfg: &IngestConfig) -> Self {
        Self {
            buffer_size: cfg.buffer_size,
            batch_size: cfg.batch_size,
            flush_interval: cfg.flush_interval,
            flush_timeout: cfg.flush_timeout,
        }
    }
}

/// Bounded event queue drained by a single background flusher.
///
/// The flusher writes a batch when `batch_size` events have accumulated or
/// `flush_interval` has elapsed, whichever comes first. Failed batches are
/// logged and dropped. Events leave in the order they were enqueued.
pub struct BatchBuffer {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Event>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    health: Option<Arc<HealthMetrics>>,
}

impl BatchBuffer {
    /// Spawns the flusher on the current runtime and returns the buffer.
    pub fn start<S: EventStore>(
        store: Arc<S>,
        cfg: BufferConfig,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let buffer_size = cfg.buffer_size.max(1);
        let cfg = BufferConfig {
            buffer_size,
            batch_size: cfg.batch_size.max(1),
            ..cfg
        };

        let (tx, rx) = mpsc::channel::<Event>(buffer_size);
        let task = tokio::spawn(run_flusher(store, rx, cfg, health.clone()));

        info!(
            buffer_size = cfg.buffer_size,
            batch_size = cfg.batch_size,
            flush_interval = ?cfg.flush_interval,
            "batch buffer started",
        );

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            task: parking_lot::Mutex::new(Some(task)),
            health,
        }
    }

    /// Queue an event for the next flush.
    ///
    /// Waits for space while the queue is full. Fails once shutdown has begun.
    pub async fn enqueue(&self, event: Event) -> Result<(), IngestError> {
        let tx = self.tx.lock().clone().ok_or(IngestError::Closed)?;

        tx.send(event).await.map_err(|_| IngestError::Closed)?;

        if let Some(h) = &self.health {
            h.events_enqueued.inc();
            h.queue_length.set((tx.max_capacity() - tx.capacity()) as f64);
        }

        Ok(())
    }

    /// Number of events waiting for the flusher.
    pub fn queued(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stop accepting events and wait until everything queued is flushed.
    ///
    /// Calling this again is a no-op.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().take();
        let Some(tx) = tx else {
            return;
        };
        let pending = tx.max_capacity() - tx.capacity();
        drop(tx);

        info!(pending, "draining batch buffer");

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "batch flusher task failed");
            }
        }

        if let Some(h) = &self.health {
            h.queue_length.set(0.0);
        }

        info!("batch buffer drained");
    }
}

async fn run_flusher<S: EventStore>(
    store: Arc<S>,
    mut rx: mpsc::Receiver<Event>,
    cfg: BufferConfig,
    health: Option<Arc<HealthMetrics>>,
) {
    let mut batch = Vec::with_capacity(cfg.batch_size);
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + cfg.flush_interval,
        cfg.flush_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(event) => {
                        batch.push(event);
                        record_queue_length(health.as_deref(), &rx);

                        if batch.len() >= cfg.batch_size {
                            let items = std::mem::replace(
                                &mut batch,
                                Vec::with_capacity(cfg.batch_size),
                            );
                            flush(store.as_ref(), items, &cfg, health.as_deref()).await;
                            record_queue_length(health.as_deref(), &rx);
                            ticker.reset();
                        }
                    }
                    None => {
                        // Input closed: write the remainder and exit.
                        if !batch.is_empty() {
                            let items = std::mem::take(&mut batch);
                            flush(store.as_ref(), items, &cfg, health.as_deref()).await;
                        }
                        return;
                    }
                }
            }

            _ = ticker.tick() => {
                if !batch.is_empty() {
                    let items = std::mem::replace(
                        &mut batch,
                        Vec::with_capacity(cfg.batch_size),
                    );
                    flush(store.as_ref(), items, &cfg, health.as_deref()).await;
                }
                record_queue_length(health.as_deref(), &rx);
            }
        }
    }
}

async fn flush<S: EventStore>(
    store: &S,
    batch: Vec<Event>,
    cfg: &BufferConfig,
    health: Option<&HealthMetrics>,
) {
    let size = batch.len();
    let start = Instant::now();

    let outcome = tokio::time::timeout(cfg.flush_timeout, store.create_batch(&batch)).await;

    match outcome {
        Ok(Ok(())) => {
            let elapsed = start.elapsed();
            debug!(batch_size = size, elapsed = ?elapsed, "flushed event batch");

            if let Some(h) = health {
                h.batches_flushed.inc();
                h.flush_duration.observe(elapsed.as_secs_f64());
                h.flush_batch_size.observe(size as f64);
            }
        }
        Ok(Err(e)) => {
            let err = format!("{e:#}");
            error!(batch_size = size, error = %err, "flushing event batch failed, dropping");
            record_drop(health, size);
        }
        Err(_) => {
            error!(
                batch_size = size,
                timeout = ?cfg.flush_timeout,
                "flushing event batch timed out, dropping",
            );
            record_drop(health, size);
        }
    }
}

fn record_queue_length(health: Option<&HealthMetrics>, rx: &mpsc::Receiver<Event>) {
    if let Some(h) = health {
        h.queue_length.set(rx.len() as f64);
    }
}

fn record_drop(health: Option<&HealthMetrics>, size: usize) {
    if let Some(h) = health {
        h.flush_errors.inc();
        h.events_dropped.inc_by(size as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use tokio::sync::Notify;

    use super::*;
    use crate::event::{EventBuilder, EventRequest};
    use crate::metrics::{MetricsFilter, MetricsResult};

    /// Records every batch it is asked to write.
    #[derive(Default)]
    struct RecordingStore {
        batches: parking_lot::Mutex<Vec<Vec<Event>>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        notify: Notify,
        fail: bool,
        delay: Option<Duration>,
    }

    impl RecordingStore {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().iter().map(Vec::len).collect()
        }
    }

    impl EventStore for RecordingStore {
        async fn create(&self, event: &Event) -> Result<()> {
            self.create_batch(std::slice::from_ref(event)).await
        }

        async fn create_batch(&self, events: &[Event]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(active, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let result = if self.fail {
                Err(anyhow::anyhow!("store unavailable"))
            } else {
                self.batches.lock().push(events.to_vec());
                Ok(())
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.notify.notify_one();
            result
        }

        async fn fetch_metrics(&self, _filter: &MetricsFilter) -> Result<MetricsResult> {
            Ok(MetricsResult::default())
        }
    }

    fn cfg(batch_size: usize, flush_interval: Duration) -> BufferConfig {
        BufferConfig {
            buffer_size: 64,
            batch_size,
            flush_interval,
            flush_timeout: Duration::from_secs(5),
        }
    }

    fn event(n: usize) -> Event {
        EventBuilder::new(Duration::ZERO)
            .build(EventRequest {
                event_name: "tap".to_string(),
                channel: "app".to_string(),
                user_id: format!("user-{n}"),
                timestamp: 1_700_000_000,
                ..Default::default()
            })
            .expect("valid event")
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn test_flushes_when_batch_size_reached() {
        let store = Arc::new(RecordingStore::default());
        let buffer = BatchBuffer::start(Arc::clone(&store), cfg(3, HOUR), None);

        for i in 0..3 {
            buffer.enqueue(event(i)).await.expect("enqueue");
        }

        tokio::time::timeout(Duration::from_secs(1), store.notify.notified())
            .await
            .expect("size-triggered flush");
        assert_eq!(store.batch_sizes(), vec![3]);

        buffer.shutdown().await;
        assert_eq!(store.batch_sizes(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_partial_batch_on_interval() {
        let store = Arc::new(RecordingStore::default());
        let buffer = BatchBuffer::start(
            Arc::clone(&store),
            cfg(100, Duration::from_millis(200)),
            None,
        );

        buffer.enqueue(event(0)).await.expect("enqueue");
        buffer.enqueue(event(1)).await.expect("enqueue");
        assert!(store.batch_sizes().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.batch_sizes(), vec![2]);

        buffer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_remainder() {
        let store = Arc::new(RecordingStore::default());
        let buffer = BatchBuffer::start(Arc::clone(&store), cfg(100, HOUR), None);

        for i in 0..5 {
            buffer.enqueue(event(i)).await.expect("enqueue");
        }
        buffer.shutdown().await;

        assert_eq!(store.batch_sizes(), vec![5]);
        assert_eq!(buffer.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_empty_flushes() {
        let store = Arc::new(RecordingStore::default());
        let buffer = BatchBuffer::start(
            Arc::clone(&store),
            cfg(10, Duration::from_millis(100)),
            None,
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        buffer.shutdown().await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserves_fifo_order_across_batches() {
        let store = Arc::new(RecordingStore::default());
        let buffer = BatchBuffer::start(Arc::clone(&store), cfg(4, HOUR), None);

        for i in 0..10 {
            buffer.enqueue(event(i)).await.expect("enqueue");
        }
        buffer.shutdown().await;

        assert_eq!(store.batch_sizes(), vec![4, 4, 2]);
        let users: Vec<String> = store
            .batches
            .lock()
            .iter()
            .flatten()
            .map(|e| e.user_id.clone())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("user-{i}")).collect();
        assert_eq!(users, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_shutdown_is_rejected() {
        let store = Arc::new(RecordingStore::default());
        let buffer = BatchBuffer::start(Arc::clone(&store), cfg(10, HOUR), None);

        buffer.shutdown().await;
        assert!(buffer.is_closed());

        let err = buffer.enqueue(event(0)).await.expect_err("closed");
        assert!(matches!(err, IngestError::Closed));

        // Second shutdown is a no-op.
        buffer.shutdown().await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_drops_batch_and_continues() {
        let store = Arc::new(RecordingStore::failing());
        let health = Arc::new(HealthMetrics::new(":0").expect("health metrics"));
        let buffer = BatchBuffer::start(
            Arc::clone(&store),
            cfg(2, HOUR),
            Some(Arc::clone(&health)),
        );

        for i in 0..4 {
            buffer.enqueue(event(i)).await.expect("enqueue");
        }
        buffer.shutdown().await;

        // One attempt per batch, no retries.
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert_eq!(health.flush_errors.get(), 2.0);
        assert_eq!(health.events_dropped.get(), 4.0);
        assert_eq!(health.batches_flushed.get(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_flush_is_bounded_by_timeout() {
        let store = Arc::new(RecordingStore::slow(Duration::from_secs(60)));
        let health = Arc::new(HealthMetrics::new(":0").expect("health metrics"));
        let mut config = cfg(2, HOUR);
        config.flush_timeout = Duration::from_millis(100);
        let buffer = BatchBuffer::start(Arc::clone(&store), config, Some(Arc::clone(&health)));

        buffer.enqueue(event(0)).await.expect("enqueue");
        buffer.enqueue(event(1)).await.expect("enqueue");

        tokio::time::timeout(Duration::from_secs(1), buffer.shutdown())
            .await
            .expect("shutdown bounded by flush timeout");

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert!(store.batch_sizes().is_empty());
        assert_eq!(health.events_dropped.get(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_waits_when_full() {
        let store = Arc::new(RecordingStore::slow(Duration::from_secs(2)));
        let config = BufferConfig {
            buffer_size: 1,
            batch_size: 1,
            flush_interval: HOUR,
            flush_timeout: Duration::from_secs(10),
        };
        let buffer = BatchBuffer::start(Arc::clone(&store), config, None);

        // First event is taken by the flusher, which then sits in the slow store.
        buffer.enqueue(event(0)).await.expect("enqueue");
        tokio::task::yield_now().await;
        // Second fills the queue.
        buffer.enqueue(event(1)).await.expect("enqueue");
        assert_eq!(buffer.queued(), 1);

        // Third cannot proceed until the flusher frees a slot.
        let blocked =
            tokio::time::timeout(Duration::from_millis(500), buffer.enqueue(event(2))).await;
        assert!(blocked.is_err(), "enqueue should wait while full");

        buffer.enqueue(event(3)).await.expect("enqueue after space frees");
        buffer.shutdown().await;

        let users: Vec<String> = store
            .batches
            .lock()
            .iter()
            .flatten()
            .map(|e| e.user_id.clone())
            .collect();
        assert_eq!(users, vec!["user-0", "user-1", "user-3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_gauge_tracks_drained_queue() {
        let store = Arc::new(RecordingStore::default());
        let health = Arc::new(HealthMetrics::new(":0").expect("health metrics"));
        let buffer = BatchBuffer::start(
            Arc::clone(&store),
            cfg(100, Duration::from_millis(100)),
            Some(Arc::clone(&health)),
        );

        for i in 0..5 {
            buffer.enqueue(event(i)).await.expect("enqueue");
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(store.batch_sizes(), vec![5]);
        assert_eq!(buffer.queued(), 0);
        assert_eq!(health.queue_length.get(), buffer.queued() as f64);

        buffer.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_serialize_writes() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 50;

        let store = Arc::new(RecordingStore::slow(Duration::from_millis(1)));
        let buffer = Arc::new(BatchBuffer::start(
            Arc::clone(&store),
            BufferConfig {
                buffer_size: 32,
                batch_size: 16,
                flush_interval: Duration::from_millis(10),
                flush_timeout: Duration::from_secs(5),
            },
            None,
        ));

        let mut producers = Vec::with_capacity(PRODUCERS);
        for p in 0..PRODUCERS {
            let buffer = Arc::clone(&buffer);
            producers.push(tokio::spawn(async move {
                for i in 0..PER_PRODUCER {
                    let event = EventBuilder::new(Duration::ZERO)
                        .build(EventRequest {
                            event_name: "tap".to_string(),
                            channel: "app".to_string(),
                            user_id: format!("p{p}-{i}"),
                            timestamp: 1_700_000_000,
                            ..Default::default()
                        })
                        .expect("valid event");
                    buffer.enqueue(event).await.expect("enqueue");
                }
            }));
        }
        for producer in producers {
            producer.await.expect("producer task");
        }
        buffer.shutdown().await;

        assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);

        let flushed: Vec<Event> = store.batches.lock().iter().flatten().cloned().collect();
        assert_eq!(flushed.len(), PRODUCERS * PER_PRODUCER);

        let keys: std::collections::HashSet<&str> =
            flushed.iter().map(|e| e.dedup_key.as_str()).collect();
        assert_eq!(keys.len(), flushed.len());

        // Each producer's events arrive in the order it sent them.
        let mut next = [0usize; PRODUCERS];
        for e in &flushed {
            let (p, i) = e.user_id[1..].split_once('-').expect("producer id");
            let p: usize = p.parse().expect("producer index");
            let i: usize = i.parse().expect("sequence");
            assert_eq!(i, next[p], "producer {p} out of order");
            next[p] += 1;
        }
        assert!(next.iter().all(|n| *n == PER_PRODUCER));
    }
}

//! # Progress Tracking
//!
//! Periodically samples the transfer progress of every registered connection
//! and publishes one batched [`ProgressUpdate`] per tick.
//!
//! Each tracked connection owns a fixed-size [`RingBuffer`] of samples. The
//! reported speed is the average delta between consecutive determinate
//! samples in that window, divided by the nominal tick interval.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use slynet::progress::ProgressAggregator;
//! use slynet::registry::PeerRegistry;
//!
//! # async fn run() {
//! let registry = PeerRegistry::new(false, []);
//! let aggregator = ProgressAggregator::start(registry, Duration::from_secs(1), 10);
//! let mut updates = aggregator.subscribe();
//! while let Ok(update) = updates.recv().await {
//!     for status in update.statuses {
//!         println!("{}: {:.0} B/s", status.connection_id, status.speed);
//!     }
//! }
//! # }
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::device::DeviceId;
use crate::registry::{ConnectionEvent, PeerRegistry};

const UPDATE_CAPACITY: usize = 64;

/// Transfer state reported by a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressSample {
    pub indeterminate: bool,
    pub current: i64,
    pub maximum: i64,
}

impl ProgressSample {
    pub fn determinate(current: i64, maximum: i64) -> Self {
        Self {
            indeterminate: false,
            current,
            maximum,
        }
    }
}

impl Default for ProgressSample {
    fn default() -> Self {
        Self {
            indeterminate: true,
            current: 0,
            maximum: 0,
        }
    }
}

/// Derived per-connection status; the first four fields mirror the most
/// recent sample.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressStatus {
    pub connection_id: DeviceId,
    pub indeterminate: bool,
    pub current: i64,
    pub maximum: i64,
    /// Bytes per second.
    pub speed: f64,
}

/// One batch per tick. `statuses` may be empty.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub at: DateTime<Utc>,
    pub statuses: Vec<ProgressStatus>,
}

/// Fixed-capacity store that overwrites its oldest entry.
#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    last_index: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            last_index: capacity - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn push(&mut self, value: T) {
        self.last_index = (self.last_index + 1) % self.slots.len();
        self.slots[self.last_index] = Some(value);
    }

    pub fn latest(&self) -> Option<&T> {
        self.slots[self.last_index].as_ref()
    }

    /// Stored values, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let len = self.slots.len();
        (1..=len).filter_map(move |offset| self.slots[(self.last_index + offset) % len].as_ref())
    }
}

/// Computes the status for one window, or `None` when no determinate delta
/// exists yet.
pub fn compute_status(
    id: DeviceId,
    window: &RingBuffer<ProgressSample>,
    interval: Duration,
) -> Option<ProgressStatus> {
    let latest = *window.latest()?;

    let mut previous: Option<&ProgressSample> = None;
    let mut total: i64 = 0;
    let mut count: u32 = 0;
    for sample in window.iter().filter(|s| !s.indeterminate) {
        if let Some(previous) = previous {
            total += sample.current - previous.current;
            count += 1;
        }
        previous = Some(sample);
    }

    if count == 0 {
        return None;
    }

    let average = total as f64 / f64::from(count);
    Some(ProgressStatus {
        connection_id: id,
        indeterminate: latest.indeterminate,
        current: latest.current,
        maximum: latest.maximum,
        speed: average / interval.as_secs_f64(),
    })
}

struct Inner {
    registry: Arc<PeerRegistry>,
    archives: Mutex<HashMap<DeviceId, RingBuffer<ProgressSample>>>,
    history: usize,
    interval: Duration,
    updates: broadcast::Sender<ProgressUpdate>,
}

impl Inner {
    fn track(&self, id: DeviceId) {
        self.archives
            .lock()
            .entry(id)
            .or_insert_with(|| RingBuffer::new(self.history));
    }

    fn untrack(&self, id: &DeviceId) {
        self.archives.lock().remove(id);
    }

    fn reconcile(&self) {
        let live = self.registry.connection_ids();
        let mut archives = self.archives.lock();
        archives.retain(|id, _| live.contains(id));
        for id in live {
            archives.entry(id).or_insert_with(|| RingBuffer::new(self.history));
        }
    }

    fn tick(&self) -> ProgressUpdate {
        let statuses = {
            let mut archives = self.archives.lock();
            for (id, window) in archives.iter_mut() {
                if let Some(connection) = self.registry.try_get_connection(id) {
                    window.push(connection.progress());
                }
            }
            archives
                .iter()
                .filter_map(|(id, window)| compute_status(*id, window, self.interval))
                .collect::<Vec<_>>()
        };

        let update = ProgressUpdate {
            at: Utc::now(),
            statuses,
        };
        trace!("Publishing progress for {} connection(s)", update.statuses.len());
        let _ = self.updates.send(update.clone());
        update
    }
}

/// Background sampler bound to one [`PeerRegistry`].
pub struct ProgressAggregator {
    inner: Arc<Inner>,
    shutdown_tx: Option<mpsc::UnboundedSender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressAggregator {
    /// Tracks every connection already registered and starts the timer. The
    /// first tick fires one `interval` after this call.
    pub fn start(registry: Arc<PeerRegistry>, interval: Duration, history: usize) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let mut events = registry.subscribe();

        let inner = Arc::new(Inner {
            registry,
            archives: Mutex::new(HashMap::new()),
            history: history.max(2),
            interval,
            updates,
        });
        inner.reconcile();

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        let loop_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        loop_inner.tick();
                    }
                    event = events.recv() => {
                        match event {
                            Ok(ConnectionEvent::Added(id)) => {
                                debug!("Tracking progress of {}", id);
                                loop_inner.track(id);
                            }
                            Ok(ConnectionEvent::Removed(id)) => loop_inner.untrack(&id),
                            Err(RecvError::Lagged(missed)) => {
                                warn!("Missed {} connection events, reconciling", missed);
                                loop_inner.reconcile();
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            debug!("Progress aggregator stopped");
        });

        info!("Progress aggregator started ({:?} interval)", interval);
        Self {
            inner,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.inner.updates.subscribe()
    }

    /// Samples every tracked connection and publishes the resulting update.
    pub fn tick(&self) -> ProgressUpdate {
        self.inner.tick()
    }

    pub fn track(&self, id: DeviceId) {
        self.inner.track(id);
    }

    pub fn untrack(&self, id: &DeviceId) {
        self.inner.untrack(id);
    }

    pub fn tracked_ids(&self) -> Vec<DeviceId> {
        self.inner.archives.lock().keys().copied().collect()
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Stops the timer and event listener. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressAggregator {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{EncryptedStream, SessionSeeds};
    use crate::registry::Connection;
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, DuplexStream};

    const HOUR: Duration = Duration::from_secs(3600);

    fn register(registry: &Arc<PeerRegistry>) -> (Arc<Connection>, DuplexStream) {
        let (local, remote) = duplex(64);
        let stream = EncryptedStream::new(local, SessionSeeds { read_seed: 3, write_seed: 4 });
        let connection = Arc::new(Connection::new(DeviceId::generate(), None, stream));
        assert!(registry.add_connection(connection.clone()));
        (connection, remote)
    }

    #[test]
    fn test_ring_buffer_overwrites_oldest() {
        let mut ring = RingBuffer::new(3);
        assert!(ring.latest().is_none());

        for value in 1..=4 {
            ring.push(value);
        }

        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.latest(), Some(&4));
        assert_eq!(ring.capacity(), 3);
    }

    #[test]
    fn test_single_sample_has_no_speed() {
        let mut ring = RingBuffer::new(10);
        ring.push(ProgressSample::determinate(500, 1000));
        assert!(compute_status(DeviceId::generate(), &ring, Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_speed_from_two_samples() {
        let id = DeviceId::generate();
        let mut ring = RingBuffer::new(10);
        ring.push(ProgressSample::determinate(0, 5_000_000));
        ring.push(ProgressSample::determinate(1_000_000, 5_000_000));

        let status = compute_status(id, &ring, Duration::from_millis(1000)).unwrap();
        assert_eq!(status.connection_id, id);
        assert_eq!(status.current, 1_000_000);
        assert_eq!(status.maximum, 5_000_000);
        assert!((status.speed - 1_000_000.0).abs() < f64::EPSILON);

        let halved = compute_status(id, &ring, Duration::from_millis(500)).unwrap();
        assert!((halved.speed - 2_000_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_indeterminate_samples_are_skipped() {
        let mut ring = RingBuffer::new(10);
        ring.push(ProgressSample::determinate(0, 900));
        ring.push(ProgressSample::default());
        ring.push(ProgressSample::determinate(300, 900));
        ring.push(ProgressSample::default());

        let status = compute_status(DeviceId::generate(), &ring, Duration::from_secs(1)).unwrap();
        assert!(status.indeterminate);
        assert!((status.speed - 300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_all_indeterminate_has_no_status() {
        let mut ring = RingBuffer::new(4);
        for _ in 0..4 {
            ring.push(ProgressSample::default());
        }
        assert!(compute_status(DeviceId::generate(), &ring, Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_window_only_averages_retained_samples() {
        let mut ring = RingBuffer::new(2);
        ring.push(ProgressSample::determinate(0, 0));
        ring.push(ProgressSample::determinate(1000, 0));
        ring.push(ProgressSample::determinate(1100, 0));

        let status = compute_status(DeviceId::generate(), &ring, Duration::from_secs(1)).unwrap();
        assert!((status.speed - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_tick_samples_registered_connections() {
        let registry = PeerRegistry::new(false, []);
        let (connection, _remote) = register(&registry);
        let mut aggregator = ProgressAggregator::start(registry.clone(), HOUR, 10);
        let mut updates = aggregator.subscribe();

        assert_eq!(aggregator.tracked_ids(), vec![connection.id()]);

        connection.set_progress(ProgressSample::determinate(0, 10_000));
        assert!(aggregator.tick().statuses.is_empty());

        connection.set_progress(ProgressSample::determinate(7_200, 10_000));
        let update = aggregator.tick();
        assert_eq!(update.statuses.len(), 1);
        assert_eq!(update.statuses[0].current, 7_200);
        assert!((update.statuses[0].speed - 2.0).abs() < 1e-9);

        // both ticks were published
        assert!(updates.recv().await.unwrap().statuses.is_empty());
        assert_eq!(updates.recv().await.unwrap(), update);

        aggregator.stop().await;
    }

    #[tokio::test]
    async fn test_empty_update_still_published() {
        let registry = PeerRegistry::new(false, []);
        let aggregator = ProgressAggregator::start(registry, HOUR, 10);
        let mut updates = aggregator.subscribe();

        aggregator.tick();
        assert!(updates.recv().await.unwrap().statuses.is_empty());
    }

    #[tokio::test]
    async fn test_follows_registry_events() {
        let registry = PeerRegistry::new(false, []);
        let mut aggregator = ProgressAggregator::start(registry.clone(), HOUR, 10);
        let (connection, _remote) = register(&registry);

        let id = connection.id();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !aggregator.tracked_ids().contains(&id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        connection.close().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !aggregator.tracked_ids().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        aggregator.stop().await;
        aggregator.stop().await;
    }

    #[tokio::test]
    async fn test_timer_publishes_periodically() {
        let registry = PeerRegistry::new(false, []);
        let (connection, _remote) = register(&registry);
        connection.set_progress(ProgressSample::determinate(0, 100));
        let aggregator = ProgressAggregator::start(registry, Duration::from_millis(20), 10);
        let mut updates = aggregator.subscribe();

        let first = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.statuses.is_empty());

        connection.set_progress(ProgressSample::determinate(50, 100));
        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let update = updates.recv().await.unwrap();
                if let Some(status) = update.statuses.into_iter().find(|s| s.current == 50) {
                    return status;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(status.maximum, 100);
        assert!(status.speed > 0.0);
    }
}

//! Per-point poll tasks and the reconciliation scheduler.
//!
//! The scheduler owns the active set: a map from point id to the task
//! polling that point. Reconciliation only ever adds to it - a point that
//! disappears from a later configuration fetch keeps polling, and a point
//! whose configuration changes keeps its original configuration. Both are
//! deliberate, documented limitations of the deployed system.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::config::PointConfig;
use crate::decode::decode;
use crate::publisher::ValueSink;
use crate::reader::RegisterReader;
use crate::source::ConfigSource;

/// How long a poll task gets to wind down at shutdown before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running poll loop for exactly one point.
///
/// Created the first time its point id shows up in a configuration batch,
/// kept until process shutdown. Never restarted or replaced, even when a
/// later batch carries a changed configuration for the same id.
pub struct PollTask {
    point: PointConfig,
    handle: JoinHandle<()>,
    failures: Arc<AtomicU64>,
}

impl PollTask {
    /// The configuration captured when the task started.
    pub fn point(&self) -> &PointConfig {
        &self.point
    }

    /// Cumulative failed read cycles. Observability only; scheduling never
    /// looks at it.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Owns the active poll tasks and reconciles them against the
/// configuration source on a fixed cadence.
pub struct Scheduler {
    source: Arc<dyn ConfigSource>,
    reader: Arc<dyn RegisterReader>,
    sink: Arc<dyn ValueSink>,
    refresh_interval: Duration,
    static_points: Vec<PointConfig>,
    active: HashMap<String, PollTask>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        reader: Arc<dyn RegisterReader>,
        sink: Arc<dyn ValueSink>,
        refresh_interval: Duration,
        static_points: Vec<PointConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            reader,
            sink,
            refresh_interval,
            static_points,
            active: HashMap::new(),
            shutdown,
        }
    }

    /// Number of points currently being polled.
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Look up the task for a point id.
    pub fn task(&self, point_id: &str) -> Option<&PollTask> {
        self.active.get(point_id)
    }

    /// Start a poll task for every point not yet active.
    ///
    /// Points already in the active set are skipped untouched, even when
    /// the incoming configuration differs - first config wins. Within one
    /// batch, the first record for a point id wins the same way.
    pub fn reconcile(&mut self, points: Vec<PointConfig>) {
        for point in points {
            let point_id = point.point_id();
            if self.active.contains_key(&point_id) {
                continue;
            }

            info!(
                point = %point_id,
                device = %format!("{}:{}", point.host, point.port),
                register = point.address,
                kind = point.register_kind.as_str(),
                interval_ms = point.poll_interval.as_millis() as u64,
                "Starting poll task"
            );

            let failures = Arc::new(AtomicU64::new(0));
            let handle = tokio::spawn(poll_loop(
                point.clone(),
                self.reader.clone(),
                self.sink.clone(),
                failures.clone(),
                self.shutdown.clone(),
            ));

            self.active.insert(
                point_id,
                PollTask {
                    point,
                    handle,
                    failures,
                },
            );
        }
    }

    /// Run until the shutdown signal fires.
    ///
    /// Static points start immediately; after that, every refresh tick
    /// fetches the current point list and reconciles it. A failed fetch
    /// is logged and treated as "no new points this round".
    pub async fn run(mut self) {
        let static_points = std::mem::take(&mut self.static_points);
        self.reconcile(static_points);

        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let points = match self.source.fetch().await {
                Ok(points) => points,
                Err(e) => {
                    warn!(error = %e, "Configuration fetch failed, keeping current point set");
                    Vec::new()
                }
            };

            self.reconcile(points);
        }

        self.stop().await;
    }

    /// Wait for every poll task to observe the shutdown signal, aborting
    /// stragglers after a grace period.
    async fn stop(mut self) {
        info!(points = self.active.len(), "Stopping poll tasks");

        for (point_id, mut task) in self.active.drain() {
            if timeout(SHUTDOWN_GRACE, &mut task.handle).await.is_err() {
                warn!(point = %point_id, "Poll task did not stop in time, aborting");
                task.handle.abort();
            }
        }
    }
}

/// The repeating read -> decode -> publish loop for one point.
///
/// Cycles never overlap: the ticker only fires again after the previous
/// cycle's body has finished or failed. Every failure is contained to its
/// own cycle.
async fn poll_loop(
    point: PointConfig,
    reader: Arc<dyn RegisterReader>,
    sink: Arc<dyn ValueSink>,
    failures: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let point_id = point.point_id();
    let topic = point.topic();

    let mut ticker = interval(point.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let words = match reader.read(&point).await {
            Ok(words) => words,
            Err(e) => {
                let count = failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(point = %point_id, failures = count, error = %e, "Register read failed");
                continue;
            }
        };

        let value = match decode(&words, point.word_order, point.data_type) {
            Ok(value) => value,
            Err(e) => {
                // Word count below 2 means the device answered with less
                // than the configured read asked for.
                error!(point = %point_id, error = %e, "Read response rejected by decoder");
                continue;
            }
        };

        if let Err(e) = sink.publish(&topic, &value).await {
            warn!(point = %point_id, error = %e, "Publish failed, value dropped");
        }
    }

    debug!(point = %point_id, "Poll task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterKind;
    use crate::decode::{DataType, DecodedValue, WordOrder};
    use crate::publisher::PublishError;
    use crate::reader::ReadError;
    use crate::source::FetchError;

    struct EmptySource;

    #[async_trait::async_trait]
    impl ConfigSource for EmptySource {
        async fn fetch(&self) -> Result<Vec<PointConfig>, FetchError> {
            Ok(Vec::new())
        }
    }

    struct FailingReader;

    #[async_trait::async_trait]
    impl RegisterReader for FailingReader {
        async fn read(&self, _point: &PointConfig) -> Result<Vec<u16>, ReadError> {
            Err(ReadError::Connect("unreachable".to_string()))
        }
    }

    struct NullSink;

    #[async_trait::async_trait]
    impl ValueSink for NullSink {
        async fn publish(&self, _topic: &str, _value: &DecodedValue) -> Result<(), PublishError> {
            Ok(())
        }
    }

    fn point(gauge_id: &str, interval_ms: u64) -> PointConfig {
        PointConfig {
            host: "127.0.0.1".to_string(),
            port: 502,
            slave: None,
            register_kind: RegisterKind::Holding,
            address: 0,
            count: 2,
            data_type: DataType::Uint32,
            word_order: WordOrder::MsbFirst,
            poll_interval: Duration::from_millis(interval_ms),
            gauge_id: gauge_id.to_string(),
            characteristic_id: "c".to_string(),
        }
    }

    fn scheduler(shutdown: watch::Receiver<bool>) -> Scheduler {
        Scheduler::new(
            Arc::new(EmptySource),
            Arc::new(FailingReader),
            Arc::new(NullSink),
            Duration::from_secs(10),
            Vec::new(),
            shutdown,
        )
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = scheduler(rx);

        let batch = vec![point("g1", 100), point("g2", 100)];
        scheduler.reconcile(batch.clone());
        assert_eq!(scheduler.active_len(), 2);

        scheduler.reconcile(batch);
        assert_eq!(scheduler.active_len(), 2);

        let _ = tx.send(true);
    }

    #[tokio::test]
    async fn test_first_config_wins() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = scheduler(rx);

        scheduler.reconcile(vec![point("g1", 100)]);
        scheduler.reconcile(vec![point("g1", 9000)]);

        let task = scheduler.task("g1/c").unwrap();
        assert_eq!(task.point().poll_interval, Duration::from_millis(100));

        let _ = tx.send(true);
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_one_batch() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = scheduler(rx);

        scheduler.reconcile(vec![point("g1", 100), point("g1", 9000)]);
        assert_eq!(scheduler.active_len(), 1);
        let task = scheduler.task("g1/c").unwrap();
        assert_eq!(task.point().poll_interval, Duration::from_millis(100));

        let _ = tx.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_counter_accumulates() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = scheduler(rx);

        scheduler.reconcile(vec![point("g1", 50)]);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let task = scheduler.task("g1/c").unwrap();
        assert!(task.failures() > 0, "read failures should be counted");

        let _ = tx.send(true);
    }
}

//! Scheduler behavior with mock collaborators.
//!
//! Timer-driven assertions run under paused time, so cadences are
//! asserted as loose read-count windows rather than exact tick counts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use mqtt_bridge_modbus::config::{PointConfig, RawPointRecord, RegisterKind};
use mqtt_bridge_modbus::decode::{DataType, DecodedValue, WordOrder};
use mqtt_bridge_modbus::publisher::{PublishError, ValueSink};
use mqtt_bridge_modbus::reader::{ReadError, RegisterReader};
use mqtt_bridge_modbus::scheduler::Scheduler;
use mqtt_bridge_modbus::source::{ConfigSource, FetchError};

/// Serves a scripted sequence of fetch results; the last entry repeats.
struct ScriptedSource {
    batches: Vec<Result<Vec<PointConfig>, String>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    fn new(batches: Vec<Result<Vec<PointConfig>, String>>) -> Self {
        assert!(!batches.is_empty());
        Self {
            batches,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ConfigSource for ScriptedSource {
    async fn fetch(&self) -> Result<Vec<PointConfig>, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let idx = call.min(self.batches.len() - 1);
        match &self.batches[idx] {
            Ok(points) => Ok(points.clone()),
            Err(msg) => Err(FetchError::Body(msg.clone())),
        }
    }
}

/// Serves canned register words per point id; unknown points fail to read.
#[derive(Default)]
struct MockReader {
    responses: HashMap<String, Vec<u16>>,
    reads: Mutex<HashMap<String, u64>>,
    addresses: Mutex<Vec<u16>>,
}

impl MockReader {
    fn with_response(mut self, point_id: &str, words: Vec<u16>) -> Self {
        self.responses.insert(point_id.to_string(), words);
        self
    }

    fn reads(&self, point_id: &str) -> u64 {
        self.reads
            .lock()
            .unwrap()
            .get(point_id)
            .copied()
            .unwrap_or(0)
    }

    fn requested_addresses(&self) -> Vec<u16> {
        self.addresses.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegisterReader for MockReader {
    async fn read(&self, point: &PointConfig) -> Result<Vec<u16>, ReadError> {
        *self
            .reads
            .lock()
            .unwrap()
            .entry(point.point_id())
            .or_insert(0) += 1;
        self.addresses.lock().unwrap().push(point.address);

        match self.responses.get(&point.point_id()) {
            Some(words) => Ok(words.clone()),
            None => Err(ReadError::Connect("unreachable".to_string())),
        }
    }
}

/// Records every publish instead of talking to a broker.
#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(String, DecodedValue)>>,
}

impl RecordingSink {
    fn published_to(&self, topic: &str) -> Vec<DecodedValue> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl ValueSink for RecordingSink {
    async fn publish(&self, topic: &str, value: &DecodedValue) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), value.clone()));
        Ok(())
    }
}

fn point(gauge_id: &str, characteristic_id: &str, interval_ms: u64) -> PointConfig {
    PointConfig {
        host: "192.168.123.50".to_string(),
        port: 502,
        slave: None,
        register_kind: RegisterKind::Holding,
        address: 0,
        count: 2,
        data_type: DataType::Uint32,
        word_order: WordOrder::MsbFirst,
        poll_interval: Duration::from_millis(interval_ms),
        gauge_id: gauge_id.to_string(),
        characteristic_id: characteristic_id.to_string(),
    }
}

/// Run the scheduler for a virtual time window, then shut it down.
async fn run_for(
    source: Arc<ScriptedSource>,
    reader: Arc<MockReader>,
    sink: Arc<RecordingSink>,
    refresh: Duration,
    window: Duration,
) {
    let (tx, rx) = watch::channel(false);
    let scheduler = Scheduler::new(source, reader, sink, refresh, Vec::new(), rx);
    let handle = tokio::spawn(scheduler.run());

    tokio::time::sleep(window).await;
    let _ = tx.send(true);
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_repeated_config_starts_one_task_per_point() {
    let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
        point("g1", "c1", 100),
        point("g2", "c2", 100),
    ])]));
    let reader = Arc::new(
        MockReader::default()
            .with_response("g1/c1", vec![0x0000, 0x00FF])
            .with_response("g2/c2", vec![0x0001, 0x0002]),
    );
    let sink = Arc::new(RecordingSink::default());

    // The same list is fetched on every 250ms refresh; a duplicated task
    // per refresh would roughly double the read rate each round.
    run_for(
        source,
        reader.clone(),
        sink.clone(),
        Duration::from_millis(250),
        Duration::from_secs(1),
    )
    .await;

    for point_id in ["g1/c1", "g2/c2"] {
        let reads = reader.reads(point_id);
        assert!(
            (5..=15).contains(&reads),
            "expected a single 100ms cadence for {}, saw {} reads",
            point_id,
            reads
        );
    }

    let values = sink.published_to("gauge/g1/c1");
    assert!(!values.is_empty());
    assert!(values.iter().all(|v| *v == DecodedValue::Integer(255)));
}

#[tokio::test(start_paused = true)]
async fn test_failing_point_does_not_block_others() {
    // g2 has no canned response, so every one of its reads fails.
    let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
        point("g1", "c1", 100),
        point("g2", "c2", 100),
    ])]));
    let reader = Arc::new(MockReader::default().with_response("g1/c1", vec![0x0000, 0x002A]));
    let sink = Arc::new(RecordingSink::default());

    run_for(
        source,
        reader.clone(),
        sink.clone(),
        Duration::from_millis(500),
        Duration::from_secs(1),
    )
    .await;

    assert!(reader.reads("g2/c2") >= 5, "failing point must keep retrying");
    assert!(sink.published_to("gauge/g2/c2").is_empty());

    let ok_values = sink.published_to("gauge/g1/c1");
    assert!(
        ok_values.len() >= 5,
        "healthy point should keep publishing, saw {}",
        ok_values.len()
    );
    assert!(ok_values.iter().all(|v| *v == DecodedValue::Integer(42)));
}

#[tokio::test(start_paused = true)]
async fn test_changed_config_keeps_original_cadence() {
    // Refresh 2 onward serves the same point id with a 5s interval; the
    // task started from refresh 1 must keep its 50ms cadence.
    let source = Arc::new(ScriptedSource::new(vec![
        Ok(vec![point("g1", "c1", 50)]),
        Ok(vec![point("g1", "c1", 5000)]),
    ]));
    let reader = Arc::new(MockReader::default().with_response("g1/c1", vec![0x0000, 0x0001]));
    let sink = Arc::new(RecordingSink::default());

    run_for(
        source,
        reader.clone(),
        sink,
        Duration::from_millis(200),
        Duration::from_secs(2),
    )
    .await;

    let reads = reader.reads("g1/c1");
    assert!(
        reads >= 20,
        "expected the original 50ms cadence to continue, saw {} reads",
        reads
    );
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failure_is_an_empty_round() {
    // First refresh fails, the second succeeds, then failures forever;
    // the point from refresh 2 must start and keep polling.
    let source = Arc::new(ScriptedSource::new(vec![
        Err("boom".to_string()),
        Ok(vec![point("g1", "c1", 100)]),
        Err("boom".to_string()),
    ]));
    let reader = Arc::new(MockReader::default().with_response("g1/c1", vec![0x0000, 0x0001]));
    let sink = Arc::new(RecordingSink::default());

    run_for(
        source,
        reader.clone(),
        sink,
        Duration::from_millis(100),
        Duration::from_secs(1),
    )
    .await;

    assert!(
        reader.reads("g1/c1") >= 3,
        "point from the successful round must be polled"
    );
}

#[tokio::test(start_paused = true)]
async fn test_tasks_stop_at_shutdown() {
    let source = Arc::new(ScriptedSource::new(vec![Ok(vec![point("g1", "c1", 100)])]));
    let reader = Arc::new(MockReader::default().with_response("g1/c1", vec![0x0000, 0x0001]));
    let sink = Arc::new(RecordingSink::default());

    run_for(
        source,
        reader.clone(),
        sink,
        Duration::from_millis(500),
        Duration::from_secs(1),
    )
    .await;

    let reads_at_shutdown = reader.reads("g1/c1");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        reader.reads("g1/c1"),
        reads_at_shutdown,
        "no reads may happen after shutdown"
    );
}

#[tokio::test(start_paused = true)]
async fn test_five_digit_address_scenario() {
    // A record in the device-facing 5-digit convention: holding register
    // 43269 is read at protocol address 3268; words [0x0000, 0x00FF]
    // publish as {"value":255} on the gauge topic.
    let record: RawPointRecord = serde_json::from_str(
        r#"{
            "host": "192.168.123.50",
            "port": "502",
            "registertype": "readHoldingRegisters",
            "register_address": "43269",
            "datatype": "unsigned_int",
            "byte_order": "msb_first",
            "speed": "500",
            "gauge_id": "8d0608bd",
            "characteristic_id": "bbb3a9aa"
        }"#,
    )
    .unwrap();
    let point = record.normalize().unwrap();
    assert_eq!(point.address, 3268);

    let source = Arc::new(ScriptedSource::new(vec![Ok(vec![point])]));
    let reader =
        Arc::new(MockReader::default().with_response("8d0608bd/bbb3a9aa", vec![0x0000, 0x00FF]));
    let sink = Arc::new(RecordingSink::default());

    run_for(
        source,
        reader.clone(),
        sink.clone(),
        Duration::from_secs(10),
        Duration::from_secs(2),
    )
    .await;

    assert!(reader.requested_addresses().iter().all(|a| *a == 3268));

    let values = sink.published_to("gauge/8d0608bd/bbb3a9aa");
    assert!(!values.is_empty());
    for value in &values {
        assert_eq!(
            serde_json::to_string(&serde_json::json!({ "value": value })).unwrap(),
            r#"{"value":255}"#
        );
    }
}

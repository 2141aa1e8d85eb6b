//! Telemetry emission loops
//!
//! One task per stream. Each cycle builds a frame from its source, hands it
//! to its sink and waits for the next tick; a failed send is logged and
//! counted, never retried. All streams stop when the shutdown channel flips,
//! abandoning a send that is still in flight.

use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::gateway::{telemetry_payload, GatewayLink, LinkError, TELEMETRY_TOPIC};
use crate::metrics::FrameSource;
use crate::models::TelemetryFrame;
use crate::platform::{PlatformClient, PlatformError};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http ingestion failed: {0}")]
    Http(#[from] PlatformError),

    #[error("gateway relay failed: {0}")]
    Link(#[from] LinkError),
}

/// Destination of a stream's frames
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: &TelemetryFrame) -> Result<(), TransportError>;
}

/// Direct HTTP ingestion with the device's own token
pub struct HttpIngest {
    client: PlatformClient,
    access_token: String,
}

impl HttpIngest {
    pub fn new(client: PlatformClient, access_token: impl Into<String>) -> Self {
        Self {
            client,
            access_token: access_token.into(),
        }
    }
}

#[async_trait]
impl FrameSink for HttpIngest {
    async fn send(&self, frame: &TelemetryFrame) -> Result<(), TransportError> {
        self.client.post_telemetry(&self.access_token, frame).await?;
        Ok(())
    }
}

/// Sub-device telemetry relayed through the shared gateway session
pub struct GatewayRelay {
    link: Arc<dyn GatewayLink>,
    sensor: String,
}

impl GatewayRelay {
    pub fn new(link: Arc<dyn GatewayLink>, sensor: impl Into<String>) -> Self {
        Self {
            link,
            sensor: sensor.into(),
        }
    }
}

#[async_trait]
impl FrameSink for GatewayRelay {
    async fn send(&self, frame: &TelemetryFrame) -> Result<(), TransportError> {
        let payload = telemetry_payload(&self.sensor, frame)?;
        self.link.publish(TELEMETRY_TOPIC, payload).await?;
        Ok(())
    }
}

/// Wall-clock millis that never go backwards.
///
/// Anchored to the system clock once, then advanced by the runtime's
/// monotonic `Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_millis: i64,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    pub fn starting_at(epoch_millis: i64) -> Self {
        Self {
            anchor_millis: epoch_millis,
            anchor: Instant::now(),
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.anchor_millis + self.anchor.elapsed().as_millis() as i64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Stream {
    pub name: String,
    pub source: Box<dyn FrameSource>,
    pub sink: Arc<dyn FrameSink>,
}

impl Stream {
    pub fn new(name: impl Into<String>, source: impl FrameSource + 'static, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            name: name.into(),
            source: Box::new(source),
            sink,
        }
    }
}

/// Per-stream outcome counters, returned when the stream stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReport {
    pub name: String,
    pub sent: u64,
    pub failed: u64,
}

/// Emit frames every `period` until `shutdown` turns true; the first frame goes out immediately
pub async fn run_stream(
    mut stream: Stream,
    period: Duration,
    clock: MonotonicClock,
    mut shutdown: watch::Receiver<bool>,
) -> StreamReport {
    let mut report = StreamReport {
        name: stream.name.clone(),
        ..Default::default()
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Stream {} started ({}s interval)", stream.name, period.as_secs_f64());

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() {
                    // sender gone, nobody can stop us any more
                    break;
                }
            }

            _ = ticker.tick() => {
                let ts = clock.now_millis();
                let frame = TelemetryFrame::new(ts, stream.source.sample(ts).await);

                // a sink stuck on a dead transport must not hold up shutdown
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        debug!("Stream {} abandoned frame at {} on shutdown", stream.name, ts);
                        break;
                    }

                    sent = stream.sink.send(&frame) => match sent {
                        Ok(()) => {
                            report.sent += 1;
                            debug!("Stream {} sent frame at {}", stream.name, ts);
                        }
                        Err(e) => {
                            report.failed += 1;
                            warn!("Stream {} failed to send frame: {}", stream.name, e);
                        }
                    }
                }
            }
        }
    }

    info!(
        "Stream {} stopped ({} sent, {} failed)",
        report.name, report.sent, report.failed
    );
    report
}

/// Owns the stream tasks and their shutdown channel
pub struct Emitter {
    tasks: JoinSet<StreamReport>,
    shutdown_tx: watch::Sender<bool>,
    period: Duration,
    clock: MonotonicClock,
}

impl Emitter {
    pub fn new(period: Duration) -> Self {
        Self::with_clock(period, MonotonicClock::new())
    }

    pub fn with_clock(period: Duration, clock: MonotonicClock) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tasks: JoinSet::new(),
            shutdown_tx,
            period,
            clock,
        }
    }

    pub fn spawn(&mut self, stream: Stream) {
        let shutdown = self.shutdown_tx.subscribe();
        self.tasks.spawn(run_stream(stream, self.period, self.clock, shutdown));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every stream and wait for their reports, sorted by name
    pub async fn shutdown(mut self) -> Vec<StreamReport> {
        info!("Stopping {} telemetry stream(s)", self.tasks.len());
        self.shutdown_tx.send_replace(true);

        let mut reports = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Telemetry stream task failed: {}", e),
            }
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Run until `signal` completes, then shut down
    pub async fn run_until<F>(self, signal: F) -> Vec<StreamReport>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MqttGatewaySession, MqttSettings};
    use crate::metrics::SensorReading;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicU64, Ordering};
    use thingslink_devkit::{Call, MockMqttClient, TestHarness};

    const START: i64 = 1_700_000_000_000;

    /// Counts cycles and returns the cycle number as its only value
    struct Counter(u64);

    #[async_trait]
    impl FrameSource for Counter {
        async fn sample(&mut self, _ts_millis: i64) -> Map<String, Value> {
            self.0 += 1;
            let mut values = Map::new();
            values.insert("cycle".into(), Value::from(self.0));
            values
        }
    }

    struct CountingSink(AtomicU64);

    #[async_trait]
    impl FrameSink for CountingSink {
        async fn send(&self, _frame: &TelemetryFrame) -> Result<(), TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn relay(mqtt: &MockMqttClient, sensor: &str) -> Stream {
        let link: Arc<dyn GatewayLink> = Arc::new(mqtt.clone());
        Stream::new(sensor, SensorReading, Arc::new(GatewayRelay::new(link, sensor)))
    }

    fn stamps(frames: &[Value]) -> Vec<i64> {
        frames.iter().map(|f| f["ts"].as_i64().unwrap()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_sensors_over_thirty_seconds() {
        let mqtt = MockMqttClient::new();
        let mut emitter = Emitter::with_clock(Duration::from_secs(10), MonotonicClock::starting_at(START));
        for sensor in ["Sensor1", "Sensor2", "Sensor3"] {
            emitter.spawn(relay(&mqtt, sensor));
        }
        assert_eq!(emitter.len(), 3);

        let reports = emitter
            .run_until(tokio::time::sleep(Duration::from_secs(25)))
            .await;

        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert_eq!((report.sent, report.failed), (3, 0), "{}", report.name);
            let frames = mqtt.gateway_frames(&report.name).unwrap();
            assert_eq!(stamps(&frames), vec![START, START + 10_000, START + 20_000]);
            for frame in &frames {
                let temperature = frame["values"]["temperature"].as_f64().unwrap();
                let humidity = frame["values"]["humidity"].as_f64().unwrap();
                assert!((20.0..=25.0).contains(&temperature));
                assert!((50.0..=60.0).contains(&humidity));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_does_not_delay_next() {
        let mqtt = MockMqttClient::new();
        mqtt.fail_next_publishes(1);
        let mut emitter = Emitter::with_clock(Duration::from_secs(10), MonotonicClock::starting_at(START));
        emitter.spawn(relay(&mqtt, "Sensor1"));

        let reports = emitter
            .run_until(tokio::time::sleep(Duration::from_secs(25)))
            .await;

        assert_eq!(reports[0].sent, 2);
        assert_eq!(reports[0].failed, 1);
        let frames = mqtt.gateway_frames("Sensor1").unwrap();
        assert_eq!(stamps(&frames), vec![START + 10_000, START + 20_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamps_never_decrease() {
        let mqtt = MockMqttClient::new();
        let mut emitter = Emitter::new(Duration::from_millis(700));
        emitter.spawn(relay(&mqtt, "Sensor1"));

        emitter
            .run_until(tokio::time::sleep(Duration::from_secs(30)))
            .await;

        let ts = stamps(&mqtt.gateway_frames("Sensor1").unwrap());
        assert!(ts.len() > 40);
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_frame_is_immediate() {
        let sink = Arc::new(CountingSink(AtomicU64::new(0)));
        let mut emitter = Emitter::new(Duration::from_secs(10));
        emitter.spawn(Stream::new("counter", Counter(0), sink.clone()));

        // Let the immediate first tick run
        tokio::time::sleep(Duration::from_millis(1)).await;
        let reports = emitter.shutdown().await;

        assert_eq!(reports, vec![StreamReport { name: "counter".into(), sent: 1, failed: 0 }]);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_signalled_stream_sends_nothing() {
        let (tx, rx) = watch::channel(true);
        let sink = Arc::new(CountingSink(AtomicU64::new(0)));
        let report = run_stream(
            Stream::new("counter", Counter(0), sink.clone()),
            Duration::from_secs(1),
            MonotonicClock::new(),
            rx,
        )
        .await;
        drop(tx);

        assert_eq!(report.sent + report.failed, 0);
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_ingest_survives_platform_errors() {
        let harness = TestHarness::new().with_platform().await.unwrap();
        let platform = harness.platform().unwrap();
        let token = platform.state().seed_device("MyGateway", true);
        platform.state().fail_next_telemetry(1);
        let client = PlatformClient::new(&platform.base_url()).unwrap();

        let mut emitter = Emitter::new(Duration::from_millis(50));
        let sink = Arc::new(HttpIngest::new(client, token.clone()));
        emitter.spawn(Stream::new("MyGateway", Counter(0), sink));

        harness
            .wait_until("three telemetry posts", 5_000, || platform.state().count(Call::Telemetry) >= 3)
            .await
            .unwrap();
        let reports = emitter.shutdown().await;

        let stored = platform.state().telemetry_for(&token);
        assert_eq!(reports[0].failed, 1);
        // a post cut off by shutdown may still have been stored
        let sent = reports[0].sent as usize;
        assert!(stored.len() == sent || stored.len() == sent + 1, "{} sent, {} stored", sent, stored.len());
        assert!(stored.len() >= 2);
        // the rejected first cycle is not resent
        assert_eq!(stored[0]["values"]["cycle"], 2);
    }

    /// Never finishes a send
    struct StalledSink;

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send(&self, _frame: &TelemetryFrame) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_stalled_send() {
        let mut emitter = Emitter::new(Duration::from_secs(10));
        emitter.spawn(Stream::new("stalled", Counter(0), Arc::new(StalledSink)));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let reports = tokio::time::timeout(Duration::from_secs(5), emitter.shutdown())
            .await
            .expect("shutdown waited on a stalled send");
        assert_eq!(reports, vec![StreamReport { name: "stalled".into(), sent: 0, failed: 0 }]);
    }

    #[tokio::test]
    async fn test_shutdown_with_unreachable_broker() {
        let session = Arc::new(MqttGatewaySession::connect(&MqttSettings {
            host: "127.0.0.1".into(),
            port: 1,
            client_id: "MyGateway".into(),
            access_token: "A1_TEST_TOKEN".into(),
        }));

        let mut emitter = Emitter::new(Duration::from_millis(20));
        for sensor in ["Sensor1", "Sensor2", "Sensor3"] {
            let link: Arc<dyn GatewayLink> = session.clone();
            emitter.spawn(Stream::new(sensor, SensorReading, Arc::new(GatewayRelay::new(link, sensor))));
        }
        // long enough to fill the client's request queue many times over
        tokio::time::sleep(Duration::from_secs(2)).await;

        let reports = tokio::time::timeout(Duration::from_secs(5), emitter.shutdown())
            .await
            .expect("shutdown hung on the unreachable broker");
        session.disconnect();

        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert!(report.failed > 0, "{:?}", report);
        }
    }
}

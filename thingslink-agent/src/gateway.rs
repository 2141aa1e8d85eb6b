//! MQTT gateway session shared by the sub-sensor streams
//!
//! `rumqttc::AsyncClient` hands each publish to the event loop as one request
//! over a bounded channel, and the event loop alone owns the socket. Any number
//! of tasks can publish through one client without interleaving bytes, so the
//! session is shared as `Arc<dyn GatewayLink>` with no extra locking.
//!
//! Publishes never wait for room in that channel. While the broker is down the
//! event loop stops draining it, and a full queue fails the publish instead.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, Incoming, MqttOptions, QoS};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::models::TelemetryFrame;

pub const CONNECT_TOPIC: &str = "v1/gateway/connect";
pub const TELEMETRY_TOPIC: &str = "v1/gateway/telemetry";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("mqtt client error: {0}")]
    Client(#[from] ClientError),

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Publish side of the gateway session
#[async_trait]
pub trait GatewayLink: Send + Sync {
    /// Publish one whole message at QoS 1
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError>;
}

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Gateway name, used as client id
    pub client_id: String,
    /// Gateway access token, used as username
    pub access_token: String,
}

/// Live session to the broker; the event loop runs in its own task
pub struct MqttGatewaySession {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

impl MqttGatewaySession {
    pub fn connect(settings: &MqttSettings) -> Self {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_credentials(&settings.access_token, "");

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let broker = format!("{}:{}", settings.host, settings.port);

        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        info!("Gateway session connected to {} ({:?})", broker, ack.code);
                    }
                    Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                        debug!("Broker acknowledged packet {}", ack.pkid);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Gateway session error: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Self { client, event_loop }
    }

    pub fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not delivered: {}", e);
        }
    }
}

impl Drop for MqttGatewaySession {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl GatewayLink for MqttGatewaySession {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        match self.client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            Ok(()) => Ok(()),
            Err(ClientError::TryRequest(_)) => Err(LinkError::Rejected(format!(
                "request queue full ({} pending), broker unreachable",
                REQUEST_CHANNEL_CAPACITY
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// Announce each sensor as a sub-device of the gateway
pub async fn register_sensors(link: &dyn GatewayLink, sensors: &[String]) -> Result<(), LinkError> {
    for sensor in sensors {
        let payload = serde_json::to_vec(&json!({"device": sensor, "type": "Sensor"}))?;
        link.publish(CONNECT_TOPIC, payload).await?;
        info!("Registered sensor {} with the gateway", sensor);
    }
    Ok(())
}

/// `{"<sensor>": [{"ts": .., "values": {..}}]}`
pub fn telemetry_payload(sensor: &str, frame: &TelemetryFrame) -> Result<Vec<u8>, LinkError> {
    Ok(serde_json::to_vec(&json!({ sensor: [frame] }))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};
    use std::sync::Arc;
    use thingslink_devkit::MockMqttClient;

    #[async_trait]
    impl GatewayLink for MockMqttClient {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
            MockMqttClient::publish(self, topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| LinkError::Rejected(e.to_string()))
        }
    }

    fn frame(ts: i64, temperature: f64) -> TelemetryFrame {
        let mut values = Map::new();
        values.insert("temperature".into(), Value::from(temperature));
        TelemetryFrame::new(ts, values)
    }

    #[tokio::test]
    async fn test_register_sensors() {
        let mqtt = MockMqttClient::new();
        let sensors = vec!["Sensor1".to_string(), "Sensor2".to_string()];

        register_sensors(&mqtt, &sensors).await.unwrap();

        assert_eq!(mqtt.connected_devices().unwrap(), sensors);
        let last: Value = mqtt.get_last_json_message(CONNECT_TOPIC).unwrap().unwrap();
        assert_eq!(last, json!({"device": "Sensor2", "type": "Sensor"}));
        assert!(mqtt
            .get_published_messages()
            .iter()
            .all(|m| m.qos == QoS::AtLeastOnce && !m.retain));
    }

    #[tokio::test]
    async fn test_registration_stops_on_failure() {
        let mqtt = MockMqttClient::new();
        mqtt.fail_next_publishes(1);

        let err = register_sensors(&mqtt, &["Sensor1".to_string()]).await.unwrap_err();
        assert!(matches!(err, LinkError::Rejected(_)));
        assert!(mqtt.connected_devices().unwrap().is_empty());
    }

    #[test]
    fn test_telemetry_payload_shape() {
        let payload = telemetry_payload("Sensor1", &frame(1_000, 21.5)).unwrap();
        let parsed: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            parsed,
            json!({"Sensor1": [{"ts": 1_000, "values": {"temperature": 21.5}}]})
        );
    }

    #[tokio::test]
    async fn test_concurrent_publishers_share_one_link() {
        let mqtt = MockMqttClient::new();
        let link: Arc<dyn GatewayLink> = Arc::new(mqtt.clone());

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let link = link.clone();
            tasks.spawn(async move {
                let sensor = format!("Sensor{}", i);
                for n in 0..10 {
                    let payload = telemetry_payload(&sensor, &frame(n, 20.0 + n as f64)).unwrap();
                    link.publish(TELEMETRY_TOPIC, payload).await.unwrap();
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        let messages = mqtt.json_messages(TELEMETRY_TOPIC).unwrap();
        assert_eq!(messages.len(), 80);
        for i in 0..8 {
            let frames = mqtt.gateway_frames(&format!("Sensor{}", i)).unwrap();
            let stamps: Vec<i64> = frames.iter().map(|f| f["ts"].as_i64().unwrap()).collect();
            assert_eq!(stamps, (0..10).collect::<Vec<_>>());
        }
    }

    fn unreachable_broker() -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".into(),
            port: 1,
            client_id: "MyGateway".into(),
            access_token: "A1_TEST_TOKEN".into(),
        }
    }

    #[tokio::test]
    async fn test_publish_fails_fast_once_queue_is_full() {
        let session = MqttGatewaySession::connect(&unreachable_broker());

        let mut rejected = 0;
        for _ in 0..REQUEST_CHANNEL_CAPACITY * 2 {
            let outcome = tokio::time::timeout(
                Duration::from_secs(1),
                session.publish(TELEMETRY_TOPIC, b"{}".to_vec()),
            )
            .await
            .expect("publish must not wait for the broker");
            if let Err(e) = outcome {
                assert!(matches!(e, LinkError::Rejected(_)), "{e}");
                rejected += 1;
            }
        }
        assert!(rejected > 0, "no publish was rejected");
        session.disconnect();
    }
}

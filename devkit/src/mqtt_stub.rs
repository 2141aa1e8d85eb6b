/*!
Mock MQTT client for tests without a broker

Stands in for the gateway's MQTT session. Records every publish, can be told
to reject the next publishes, and decodes gateway API messages for assertions.
*/

use anyhow::Result;
use rumqttc::QoS;
use serde_json::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const GATEWAY_CONNECT_TOPIC: &str = "v1/gateway/connect";
pub const GATEWAY_TELEMETRY_TOPIC: &str = "v1/gateway/telemetry";

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock MQTT client mirroring the publish side of rumqttc::AsyncClient
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    failures_pending: Arc<AtomicUsize>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail without recording them
    pub fn fail_next_publishes(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Record a publish (same argument order as AsyncClient::publish)
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        let rejected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            log::warn!("[MOCK] Rejected publish to {}", topic);
            anyhow::bail!("simulated publish failure on {}", topic);
        }

        let message = MockMessage {
            topic,
            payload: payload.into(),
            qos,
            retain,
        };
        log::info!("[MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().push(message);
        Ok(())
    }

    /// All recorded messages, in publish order
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Every payload on `topic` parsed as JSON
    pub fn json_messages(&self, topic: &str) -> Result<Vec<Value>> {
        self.find_messages_by_topic(topic)
            .iter()
            .map(|msg| serde_json::from_slice(&msg.payload).map_err(Into::into))
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    /// Device names announced on the gateway connect topic
    pub fn connected_devices(&self) -> Result<Vec<String>> {
        Ok(self
            .json_messages(GATEWAY_CONNECT_TOPIC)?
            .iter()
            .filter_map(|msg| msg["device"].as_str().map(str::to_string))
            .collect())
    }

    /// `{ts, values}` records relayed for one sub-device, in publish order
    pub fn gateway_frames(&self, device: &str) -> Result<Vec<Value>> {
        let mut frames = Vec::new();
        for msg in self.json_messages(GATEWAY_TELEMETRY_TOPIC)? {
            if let Some(records) = msg.get(device).and_then(Value::as_array) {
                frames.extend(records.iter().cloned());
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_publish() {
        let client = MockMqttClient::new();

        let payload = b"test message";
        client
            .publish("test/topic", QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .unwrap();

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "test/topic");
        assert_eq!(messages[0].payload, payload);
        assert_eq!(messages[0].qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let client = MockMqttClient::new();
        client.fail_next_publishes(1);

        assert!(client.publish("a", QoS::AtLeastOnce, false, b"1".to_vec()).await.is_err());
        assert!(client.publish("a", QoS::AtLeastOnce, false, b"2".to_vec()).await.is_ok());
        assert_eq!(client.find_messages_by_topic("a").len(), 1);
    }

    #[tokio::test]
    async fn test_gateway_message_decoding() {
        let client = MockMqttClient::new();
        let connect = serde_json::json!({"device": "Sensor1", "type": "Sensor"});
        let telemetry = serde_json::json!({
            "Sensor1": [{"ts": 1000, "values": {"temperature": 21.0}}]
        });
        client
            .publish(GATEWAY_CONNECT_TOPIC, QoS::AtLeastOnce, false, serde_json::to_vec(&connect).unwrap())
            .await
            .unwrap();
        client
            .publish(GATEWAY_TELEMETRY_TOPIC, QoS::AtLeastOnce, false, serde_json::to_vec(&telemetry).unwrap())
            .await
            .unwrap();

        assert_eq!(client.connected_devices().unwrap(), vec!["Sensor1"]);
        let frames = client.gateway_frames("Sensor1").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["ts"], 1000);
        assert!(client.gateway_frames("Sensor2").unwrap().is_empty());

        let last: Option<Value> = client.get_last_json_message(GATEWAY_CONNECT_TOPIC).unwrap();
        assert_eq!(last.unwrap()["type"], "Sensor");
    }
}

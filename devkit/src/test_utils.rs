/*!
Test harness for the provisioning agent

Bundles the stubs a scenario needs:
- Recording MQTT client standing in for the gateway session
- Optional fake platform server
- Expectations and assertions on published messages
*/

use crate::fake_platform::FakePlatform;
use crate::mqtt_stub::MockMqttClient;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    pub platform: Option<FakePlatform>,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::builder().is_test(true).try_init().ok();

        Self {
            mqtt_client: MockMqttClient::new(),
            platform: None,
            expectations: Vec::new(),
        }
    }

    /// Start a fake platform alongside the MQTT stub
    pub async fn with_platform(mut self) -> Result<Self> {
        self.platform = Some(FakePlatform::start().await?);
        Ok(self)
    }

    pub fn platform(&self) -> Result<&FakePlatform> {
        self.platform
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("harness started without a platform"))
    }

    /// Expect exactly `count` messages on `topic`
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    /// Poll until at least `count` messages were published on `topic`
    pub async fn wait_for_messages(&self, topic: &str, count: usize, timeout_ms: u64) -> Result<Vec<Value>> {
        let start = std::time::Instant::now();

        loop {
            let messages = self.mqtt_client.json_messages(topic)?;
            if messages.len() >= count {
                log::info!("Received {} message(s) on {}", messages.len(), topic);
                return Ok(messages);
            }
            if start.elapsed() >= Duration::from_millis(timeout_ms) {
                anyhow::bail!(
                    "timeout waiting for {} message(s) on {}, got {}",
                    count,
                    topic,
                    messages.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until `condition` holds
    pub async fn wait_until<F>(&self, what: &str, timeout_ms: u64, mut condition: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let start = std::time::Instant::now();
        while !condition() {
            if start.elapsed() >= Duration::from_millis(timeout_ms) {
                anyhow::bail!("timeout waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.mqtt_client.find_messages_by_topic(&expectation.topic).len();

            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
        }
        Ok(())
    }

    pub fn assert_message_sent(&self, topic: &str, expected_payload: &Value) -> Result<()> {
        for payload in self.mqtt_client.json_messages(topic)? {
            if payload == *expected_payload {
                return Ok(());
            }
        }
        anyhow::bail!("Expected message not found on topic: {}", topic);
    }

    /// Assert a dotted field of the latest message on `topic`
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let msg = self
            .mqtt_client
            .get_last_json_message::<Value>(topic)?
            .ok_or_else(|| anyhow::anyhow!("No message on {}", topic))?;
        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch: expected {:?}, got {:?}",
                field_path,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found in latest message on {}", field_path, topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let mut topic_counts = HashMap::new();
        let messages = self.mqtt_client.get_published_messages();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
}

/*!
# Thingslink DevKit - Test stubs for the provisioning agent

Library used by the agent's tests so they run without a real platform or broker:
- Recording MQTT client standing in for the gateway session
- Fake platform HTTP server (management + device data-plane endpoints)
- Test harness with expectations on published topics
*/

pub mod fake_platform;
pub mod mqtt_stub;
pub mod test_utils;

pub use fake_platform::{Call, FakePlatform, PlatformState, TENANT_PASSWORD, TENANT_USERNAME};
pub use mqtt_stub::MockMqttClient;
pub use test_utils::TestHarness;

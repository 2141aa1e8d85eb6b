//! Static attribute publishing (server or client scope)

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::AttributeValue;
use crate::platform::{ManagementSession, PlatformClient, PlatformError};

#[derive(Debug, Error)]
#[error("attribute publish failed: {0}")]
pub struct PublishError(#[from] pub PlatformError);

/// Where attributes land
pub enum AttributeTarget<'a> {
    /// Server scope, through the management API
    Server {
        session: &'a ManagementSession,
        device_id: &'a str,
    },
    /// Client scope, through the device data plane
    Client { access_token: &'a str },
}

impl AttributeTarget<'_> {
    fn scope(&self) -> &'static str {
        match self {
            AttributeTarget::Server { .. } => "server",
            AttributeTarget::Client { .. } => "client",
        }
    }
}

/// Push `attributes` to `target`, returning how many keys were sent
pub async fn publish_attributes(
    client: &PlatformClient,
    target: AttributeTarget<'_>,
    attributes: &BTreeMap<String, AttributeValue>,
) -> Result<usize, PublishError> {
    if attributes.is_empty() {
        debug!("No attributes configured, skipping publish");
        return Ok(0);
    }

    let mut body = Map::new();
    for (key, value) in attributes {
        body.insert(key.clone(), serde_json::to_value(value).unwrap_or(Value::Null));
    }
    let body = Value::Object(body);

    match &target {
        AttributeTarget::Server { session, device_id } => {
            client.post_server_attributes(session, device_id, &body).await?
        }
        AttributeTarget::Client { access_token } => client.post_client_attributes(access_token, &body).await?,
    }
    info!("Published {} {}-scope attribute(s)", attributes.len(), target.scope());
    Ok(attributes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use thingslink_devkit::{Call, FakePlatform, TENANT_PASSWORD, TENANT_USERNAME};

    fn sample() -> BTreeMap<String, AttributeValue> {
        BTreeMap::from([
            ("Model".to_string(), AttributeValue::Text("UG65-L04EU-915M-EA".into())),
            ("Serial Number".to_string(), AttributeValue::Text("6221E1789420".into())),
            ("Ports".to_string(), AttributeValue::Integer(4)),
        ])
    }

    #[tokio::test]
    async fn test_server_scope_upsert() {
        let platform = FakePlatform::start().await.unwrap();
        platform.state().seed_device("MyGateway", true);
        let device_id = platform.state().device_id("MyGateway").unwrap();
        let client = PlatformClient::new(&platform.base_url()).unwrap();
        let session = client.login(TENANT_USERNAME, TENANT_PASSWORD).await.unwrap();

        for _ in 0..2 {
            let target = AttributeTarget::Server {
                session: &session,
                device_id: &device_id,
            };
            assert_eq!(publish_attributes(&client, target, &sample()).await.unwrap(), 3);
        }

        let stored = platform.state().server_attributes_for(&device_id);
        assert_eq!(stored.as_object().unwrap().len(), 3);
        assert_eq!(stored["Model"], "UG65-L04EU-915M-EA");
        assert_eq!(stored["Ports"], 4);
    }

    #[tokio::test]
    async fn test_client_scope() {
        let platform = FakePlatform::start().await.unwrap();
        let token = platform.state().seed_device("MyGateway", true);
        let client = PlatformClient::new(&platform.base_url()).unwrap();

        let target = AttributeTarget::Client { access_token: &token };
        publish_attributes(&client, target, &sample()).await.unwrap();
        assert_eq!(platform.state().client_attributes_for(&token)["Serial Number"], "6221E1789420");
    }

    #[tokio::test]
    async fn test_empty_set_skipped() {
        let platform = FakePlatform::start().await.unwrap();
        let client = PlatformClient::new(&platform.base_url()).unwrap();

        let target = AttributeTarget::Client { access_token: "any" };
        assert_eq!(publish_attributes(&client, target, &BTreeMap::new()).await.unwrap(), 0);
        assert_eq!(platform.state().count(Call::ClientAttributes), 0);
    }

    #[tokio::test]
    async fn test_rejected_token() {
        let platform = FakePlatform::start().await.unwrap();
        let client = PlatformClient::new(&platform.base_url()).unwrap();

        let target = AttributeTarget::Client { access_token: "stale" };
        let err = publish_attributes(&client, target, &sample()).await.unwrap_err();
        assert_eq!(err.0.status(), Some(401));
    }
}

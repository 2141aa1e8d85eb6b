//! Idempotent provisioning of the gateway on the platform
//!
//! Setup runs in a fixed order, each step safe to repeat:
//! - `authenticate` - credentials to a bearer session
//! - `Reconciler` - device profile and device exist exactly once
//! - `CredentialManager` - a device access token the platform accepts
//! - `publish_attributes` - static attributes pushed with upsert semantics

pub mod alarms;
pub mod attributes;
pub mod credentials;
pub mod reconcile;

use thiserror::Error;
use tracing::info;

use crate::platform::{ManagementSession, PlatformClient, PlatformError};

pub use attributes::{publish_attributes, AttributeTarget};
pub use credentials::CredentialManager;
pub use reconcile::{ProfileDefinition, Reconciler};

/// Setup failures; each one ends the run
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("authentication failed: {0}")]
    Auth(#[source] PlatformError),

    #[error("could not ensure {kind} '{name}': {source}")]
    Reconcile {
        kind: &'static str,
        name: String,
        #[source]
        source: PlatformError,
    },

    #[error("could not obtain access token for device {device_id}: {source}")]
    Credential {
        device_id: String,
        #[source]
        source: PlatformError,
    },
}

/// Log in once for the management calls of this run
pub async fn authenticate(
    client: &PlatformClient,
    username: &str,
    password: &str,
) -> Result<ManagementSession, ProvisionError> {
    let session = client
        .login(username, password)
        .await
        .map_err(ProvisionError::Auth)?;
    info!("Logged in to {} as {}", client.base_url(), username);
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use thingslink_devkit::{Call, FakePlatform, TENANT_PASSWORD, TENANT_USERNAME};

    #[tokio::test]
    async fn test_authenticate() {
        let platform = FakePlatform::start().await.unwrap();
        let client = PlatformClient::new(&platform.base_url()).unwrap();

        authenticate(&client, TENANT_USERNAME, TENANT_PASSWORD).await.unwrap();
        assert_eq!(platform.state().count(Call::Login), 1);
    }

    #[tokio::test]
    async fn test_authenticate_failure_carries_body() {
        let platform = FakePlatform::start().await.unwrap();
        let client = PlatformClient::new(&platform.base_url()).unwrap();

        let err = authenticate(&client, TENANT_USERNAME, "nope").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Auth(_)));
        assert!(err.to_string().contains("Invalid username or password"));
    }
}

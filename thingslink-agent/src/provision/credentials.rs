//! Device access token resolution
//!
//! A cached token is reused only after the platform accepts it. Otherwise the
//! current token is fetched once through the management API and handed to a
//! `TokenStore` for the next run.

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::ProvisionError;
use crate::config::{ConfigError, ConfigStore};
use crate::platform::{ManagementSession, PlatformClient};

pub const ACCESS_TOKEN_KEY: &str = "device.access_token";

/// Where the access token survives between runs
#[async_trait]
pub trait TokenStore: Send {
    fn cached_token(&self) -> Option<String>;

    async fn persist_token(&mut self, token: &str) -> Result<(), ConfigError>;
}

#[async_trait]
impl TokenStore for ConfigStore {
    fn cached_token(&self) -> Option<String> {
        self.get_str(ACCESS_TOKEN_KEY)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }

    async fn persist_token(&mut self, token: &str) -> Result<(), ConfigError> {
        self.set(ACCESS_TOKEN_KEY, token)?;
        self.flush().await
    }
}

/// Token to use and whether it differs from the cached one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub token: String,
    pub refreshed: bool,
}

pub struct CredentialManager<'a> {
    client: &'a PlatformClient,
    session: &'a ManagementSession,
}

impl<'a> CredentialManager<'a> {
    pub fn new(client: &'a PlatformClient, session: &'a ManagementSession) -> Self {
        Self { client, session }
    }

    pub async fn resolve_token(&self, device_id: &str, cached: Option<&str>) -> Result<Resolved, ProvisionError> {
        if let Some(token) = cached.filter(|t| !t.is_empty()) {
            match self.client.check_device_token(token).await {
                Ok(()) => {
                    info!("Stored access token is valid");
                    return Ok(Resolved {
                        token: token.to_string(),
                        refreshed: false,
                    });
                }
                Err(e) => match e.status() {
                    Some(status) => warn!("Stored access token rejected with http {}, fetching current one", status),
                    None => warn!("Could not validate stored access token ({}), fetching current one", e),
                },
            }
        }

        let token = self
            .client
            .device_credentials(self.session, device_id)
            .await
            .map_err(|source| ProvisionError::Credential {
                device_id: device_id.to_string(),
                source,
            })?;
        info!("Fetched access token for device {}", device_id);
        Ok(Resolved { token, refreshed: true })
    }

    /// Resolve against the store's cached token and save a refreshed one.
    ///
    /// A failed save is logged; the token is still good for this run.
    pub async fn resolve_with_store<S>(&self, device_id: &str, store: &mut S) -> Result<Resolved, ProvisionError>
    where
        S: TokenStore + ?Sized,
    {
        let cached = store.cached_token();
        let resolved = self.resolve_token(device_id, cached.as_deref()).await?;
        if resolved.refreshed {
            match store.persist_token(&resolved.token).await {
                Ok(()) => info!("Access token saved"),
                Err(e) => error!("Failed to save access token: {}", e),
            }
        }
        Ok(resolved)
    }
}

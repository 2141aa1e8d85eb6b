//! HTTP client for the device-management platform
//!
//! Two surfaces share one `reqwest::Client`:
//! - Management API, authenticated with the bearer token from `login`
//!   (sent in the `X-Authorization` header)
//! - Device data plane, authenticated by the device access token in the path

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::models::{EntitySummary, PageData, TelemetryFrame};

/// Listing page size; only the first page is searched
pub const PAGE_SIZE: u32 = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("http {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn status(&self) -> Option<u16> {
        match self {
            PlatformError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Bearer session for management calls
#[derive(Debug, Clone)]
pub struct ManagementSession {
    bearer_token: String,
}

impl ManagementSession {
    pub fn new(bearer_token: impl Into<String>) -> Self {
        Self {
            bearer_token: bearer_token.into(),
        }
    }

    fn header(&self) -> String {
        format!("Bearer {}", self.bearer_token)
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialsResponse {
    #[serde(rename = "credentialsId")]
    credentials_id: Option<String>,
}

#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
}

impl PlatformClient {
    pub fn new(base_url: &str) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange credentials for a bearer session
    pub async fn login(&self, username: &str, password: &str) -> Result<ManagementSession, PlatformError> {
        let response = self
            .http
            .post(self.url("/api/auth/login"))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;
        let login: LoginResponse = decode(response).await?;
        login
            .token
            .filter(|t| !t.is_empty())
            .map(ManagementSession::new)
            .ok_or_else(|| PlatformError::Decode("login response has no token field".into()))
    }

    pub async fn list_device_profiles(&self, session: &ManagementSession) -> Result<Vec<EntitySummary>, PlatformError> {
        let path = format!("/api/deviceProfiles?pageSize={}&page=0", PAGE_SIZE);
        let page: PageData<EntitySummary> = self.get_json(session, &path).await?;
        if page.has_next {
            debug!("Device profile listing has more pages; only the first is searched");
        }
        Ok(page.data)
    }

    pub async fn create_device_profile(
        &self,
        session: &ManagementSession,
        payload: &Value,
    ) -> Result<EntitySummary, PlatformError> {
        self.post_json(session, "/api/deviceProfile", payload).await
    }

    pub async fn list_devices(&self, session: &ManagementSession) -> Result<Vec<EntitySummary>, PlatformError> {
        let path = format!("/api/tenant/devices?pageSize={}&page=0", PAGE_SIZE);
        let page: PageData<EntitySummary> = self.get_json(session, &path).await?;
        if page.has_next {
            debug!("Device listing has more pages; only the first is searched");
        }
        Ok(page.data)
    }

    pub async fn create_device(&self, session: &ManagementSession, payload: &Value) -> Result<EntitySummary, PlatformError> {
        self.post_json(session, "/api/device", payload).await
    }

    /// Access token of a device (`credentialsId`)
    pub async fn device_credentials(&self, session: &ManagementSession, device_id: &str) -> Result<String, PlatformError> {
        let path = format!("/api/device/{}/credentials", device_id);
        let credentials: CredentialsResponse = self.get_json(session, &path).await?;
        credentials
            .credentials_id
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PlatformError::Decode("credentials response has no credentialsId".into()))
    }

    pub async fn post_server_attributes(
        &self,
        session: &ManagementSession,
        device_id: &str,
        attributes: &Value,
    ) -> Result<(), PlatformError> {
        let path = format!("/api/plugins/telemetry/DEVICE/{}/attributes/SERVER_SCOPE", device_id);
        let response = self
            .http
            .post(self.url(&path))
            .header("X-Authorization", session.header())
            .json(attributes)
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    /// Lightweight data-plane read used to tell whether a device token is still accepted
    pub async fn check_device_token(&self, access_token: &str) -> Result<(), PlatformError> {
        let response = self
            .http
            .get(self.url(&format!("/api/v1/{}/attributes", access_token)))
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    pub async fn post_client_attributes(&self, access_token: &str, attributes: &Value) -> Result<(), PlatformError> {
        let response = self
            .http
            .post(self.url(&format!("/api/v1/{}/attributes", access_token)))
            .json(attributes)
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    pub async fn post_telemetry(&self, access_token: &str, frame: &TelemetryFrame) -> Result<(), PlatformError> {
        let response = self
            .http
            .post(self.url(&format!("/api/v1/{}/telemetry", access_token)))
            .json(frame)
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    async fn get_json<T: DeserializeOwned>(&self, session: &ManagementSession, path: &str) -> Result<T, PlatformError> {
        let response = self
            .http
            .get(self.url(path))
            .header("X-Authorization", session.header())
            .send()
            .await?;
        decode(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        session: &ManagementSession,
        path: &str,
        payload: &Value,
    ) -> Result<T, PlatformError> {
        let response = self
            .http
            .post(self.url(path))
            .header("X-Authorization", session.header())
            .json(payload)
            .send()
            .await?;
        decode(response).await
    }
}

/// Turn a non-success status into `PlatformError::Status`, keeping the body
async fn check(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    Err(PlatformError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PlatformError> {
    let body = check(response).await?.text().await?;
    serde_json::from_str(&body).map_err(|e| PlatformError::Decode(format!("{}: {}", e, body)))
}

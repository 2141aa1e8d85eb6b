/*!
Fake device-management platform

Small axum server emulating the REST surfaces the agent talks to:
- `/api/auth/login`, device profile and device listing/creation, device credentials,
  server-scope attributes (bearer authenticated)
- `/api/v1/{token}/attributes` and `/api/v1/{token}/telemetry` (device token)

Every call is counted, and knobs let tests reject or fail specific calls.
*/

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const TENANT_USERNAME: &str = "tenant@example.com";
pub const TENANT_PASSWORD: &str = "secret";

const JWT: &str = "fake-jwt-token";

/// Endpoints whose calls are counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Login,
    ListProfiles,
    CreateProfile,
    ListDevices,
    CreateDevice,
    FetchCredentials,
    ServerAttributes,
    CheckToken,
    ClientAttributes,
    Telemetry,
}

#[derive(Default)]
struct Inner {
    profiles: Vec<Value>,
    devices: Vec<Value>,
    /// device id -> access token
    tokens: HashMap<String, String>,
    server_attributes: HashMap<String, Map<String, Value>>,
    /// keyed by access token
    client_attributes: HashMap<String, Map<String, Value>>,
    telemetry: HashMap<String, Vec<Value>>,
    calls: HashMap<Call, usize>,
    omit_login_token: bool,
    reject_profile_creation: bool,
    fail_credentials: bool,
    telemetry_failures_pending: usize,
}

impl Inner {
    fn device_id_for_token(&self, token: &str) -> Option<String> {
        self.tokens
            .iter()
            .find(|(_, t)| t.as_str() == token)
            .map(|(id, _)| id.clone())
    }

    fn find_device(&self, name: &str) -> Option<&Value> {
        self.devices.iter().find(|d| d["name"] == name)
    }
}

/// Shared state behind the fake server
#[derive(Default)]
pub struct PlatformState {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl PlatformState {
    fn record(&self, call: Call) {
        *self.inner.lock().calls.entry(call).or_insert(0) += 1;
    }

    fn new_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{:08x}-0000-4000-8000-{:012x}", n, n)
    }

    fn new_token(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("A1_TEST_TOKEN_{}", n)
    }

    /// Number of calls received on an endpoint (including rejected ones)
    pub fn count(&self, call: Call) -> usize {
        self.inner.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Answer logins with a body that lacks the `token` field
    pub fn omit_login_token(&self, omit: bool) {
        self.inner.lock().omit_login_token = omit;
    }

    pub fn reject_profile_creation(&self, reject: bool) {
        self.inner.lock().reject_profile_creation = reject;
    }

    pub fn fail_credentials(&self, fail: bool) {
        self.inner.lock().fail_credentials = fail;
    }

    /// Answer the next `count` telemetry posts with 503
    pub fn fail_next_telemetry(&self, count: usize) {
        self.inner.lock().telemetry_failures_pending = count;
    }

    /// Pre-create a device profile, returning its id
    pub fn seed_profile(&self, name: &str) -> String {
        let id = self.new_id();
        self.inner.lock().profiles.push(json!({
            "id": {"id": id, "entityType": "DEVICE_PROFILE"},
            "name": name,
            "type": "DEFAULT",
        }));
        id
    }

    /// Pre-create a device, returning its access token
    pub fn seed_device(&self, name: &str, gateway: bool) -> String {
        let id = self.new_id();
        let token = self.new_token();
        let mut inner = self.inner.lock();
        inner.devices.push(json!({
            "id": {"id": id, "entityType": "DEVICE"},
            "name": name,
            "type": "DEFAULT",
            "additionalInfo": {"gateway": gateway},
        }));
        inner.tokens.insert(id, token.clone());
        token
    }

    /// Issue a new token for a device; the previous one stops being accepted
    pub fn rotate_token(&self, name: &str) -> Option<String> {
        let id = self.device_id(name)?;
        let token = self.new_token();
        self.inner.lock().tokens.insert(id, token.clone());
        Some(token)
    }

    pub fn profile(&self, name: &str) -> Option<Value> {
        self.inner.lock().profiles.iter().find(|p| p["name"] == name).cloned()
    }

    pub fn profiles_named(&self, name: &str) -> usize {
        self.inner.lock().profiles.iter().filter(|p| p["name"] == name).count()
    }

    pub fn device(&self, name: &str) -> Option<Value> {
        self.inner.lock().find_device(name).cloned()
    }

    pub fn devices_named(&self, name: &str) -> usize {
        self.inner.lock().devices.iter().filter(|d| d["name"] == name).count()
    }

    pub fn device_id(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .find_device(name)
            .and_then(|d| d["id"]["id"].as_str().map(str::to_string))
    }

    pub fn token_for(&self, name: &str) -> Option<String> {
        let id = self.device_id(name)?;
        self.inner.lock().tokens.get(&id).cloned()
    }

    pub fn telemetry_for(&self, token: &str) -> Vec<Value> {
        self.inner.lock().telemetry.get(token).cloned().unwrap_or_default()
    }

    pub fn client_attributes_for(&self, token: &str) -> Value {
        Value::Object(self.inner.lock().client_attributes.get(token).cloned().unwrap_or_default())
    }

    pub fn server_attributes_for(&self, device_id: &str) -> Value {
        Value::Object(self.inner.lock().server_attributes.get(device_id).cloned().unwrap_or_default())
    }
}

type Shared = Arc<PlatformState>;

fn error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({"status": status.as_u16(), "message": message})),
    )
        .into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("X-Authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", JWT))
        .unwrap_or(false)
}

async fn login(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    state.record(Call::Login);
    if body["username"] != TENANT_USERNAME || body["password"] != TENANT_PASSWORD {
        return error(StatusCode::UNAUTHORIZED, "Invalid username or password");
    }
    if state.inner.lock().omit_login_token {
        return Json(json!({"refreshToken": "fake-refresh"})).into_response();
    }
    Json(json!({"token": JWT, "refreshToken": "fake-refresh"})).into_response()
}

async fn list_profiles(State(state): State<Shared>, headers: HeaderMap) -> Response {
    state.record(Call::ListProfiles);
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "Authentication failed");
    }
    let data = state.inner.lock().profiles.clone();
    Json(json!({"data": data, "totalPages": 1, "totalElements": data.len(), "hasNext": false})).into_response()
}

async fn create_profile(State(state): State<Shared>, headers: HeaderMap, Json(mut body): Json<Value>) -> Response {
    state.record(Call::CreateProfile);
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "Authentication failed");
    }
    let name = body["name"].as_str().unwrap_or_default().to_string();
    {
        let inner = state.inner.lock();
        if inner.reject_profile_creation {
            return error(StatusCode::BAD_REQUEST, "Device profile data is invalid");
        }
        if inner.profiles.iter().any(|p| p["name"] == name.as_str()) {
            return error(StatusCode::BAD_REQUEST, "Device profile with such name already exists!");
        }
    }
    let id = state.new_id();
    body["id"] = json!({"id": id, "entityType": "DEVICE_PROFILE"});
    state.inner.lock().profiles.push(body.clone());
    Json(body).into_response()
}

async fn list_devices(State(state): State<Shared>, headers: HeaderMap) -> Response {
    state.record(Call::ListDevices);
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "Authentication failed");
    }
    let data = state.inner.lock().devices.clone();
    Json(json!({"data": data, "totalPages": 1, "totalElements": data.len(), "hasNext": false})).into_response()
}

async fn create_device(State(state): State<Shared>, headers: HeaderMap, Json(mut body): Json<Value>) -> Response {
    state.record(Call::CreateDevice);
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "Authentication failed");
    }
    let name = body["name"].as_str().unwrap_or_default().to_string();
    if state.inner.lock().find_device(&name).is_some() {
        return error(StatusCode::BAD_REQUEST, "Device with such name already exists!");
    }
    let id = state.new_id();
    let token = state.new_token();
    body["id"] = json!({"id": id, "entityType": "DEVICE"});
    let mut inner = state.inner.lock();
    inner.devices.push(body.clone());
    inner.tokens.insert(id, token);
    Json(body).into_response()
}

async fn credentials(State(state): State<Shared>, headers: HeaderMap, Path(device_id): Path<String>) -> Response {
    state.record(Call::FetchCredentials);
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "Authentication failed");
    }
    let inner = state.inner.lock();
    if inner.fail_credentials {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "Credentials lookup failed");
    }
    match inner.tokens.get(&device_id) {
        Some(token) => Json(json!({
            "deviceId": {"id": device_id, "entityType": "DEVICE"},
            "credentialsType": "ACCESS_TOKEN",
            "credentialsId": token,
        }))
        .into_response(),
        None => error(StatusCode::NOT_FOUND, "Requested item wasn't found!"),
    }
}

async fn server_attributes(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((device_id, scope)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    state.record(Call::ServerAttributes);
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "Authentication failed");
    }
    if scope != "SERVER_SCOPE" {
        return error(StatusCode::BAD_REQUEST, "Unsupported attribute scope");
    }
    let Value::Object(values) = body else {
        return error(StatusCode::BAD_REQUEST, "Attributes must be a JSON object");
    };
    let mut inner = state.inner.lock();
    if !inner.tokens.contains_key(&device_id) {
        return error(StatusCode::NOT_FOUND, "Requested item wasn't found!");
    }
    inner.server_attributes.entry(device_id).or_default().extend(values);
    StatusCode::OK.into_response()
}

async fn check_token(State(state): State<Shared>, Path(token): Path<String>) -> Response {
    state.record(Call::CheckToken);
    let inner = state.inner.lock();
    if inner.device_id_for_token(&token).is_none() {
        return error(StatusCode::UNAUTHORIZED, "Invalid access token");
    }
    let client = inner.client_attributes.get(&token).cloned().unwrap_or_default();
    Json(json!({"client": client, "shared": {}})).into_response()
}

async fn client_attributes(State(state): State<Shared>, Path(token): Path<String>, Json(body): Json<Value>) -> Response {
    state.record(Call::ClientAttributes);
    let Value::Object(values) = body else {
        return error(StatusCode::BAD_REQUEST, "Attributes must be a JSON object");
    };
    let mut inner = state.inner.lock();
    if inner.device_id_for_token(&token).is_none() {
        return error(StatusCode::UNAUTHORIZED, "Invalid access token");
    }
    inner.client_attributes.entry(token).or_default().extend(values);
    StatusCode::OK.into_response()
}

async fn telemetry(State(state): State<Shared>, Path(token): Path<String>, Json(body): Json<Value>) -> Response {
    state.record(Call::Telemetry);
    let mut inner = state.inner.lock();
    if inner.telemetry_failures_pending > 0 {
        inner.telemetry_failures_pending -= 1;
        return error(StatusCode::SERVICE_UNAVAILABLE, "Telemetry ingestion unavailable");
    }
    if inner.device_id_for_token(&token).is_none() {
        return error(StatusCode::UNAUTHORIZED, "Invalid access token");
    }
    inner.telemetry.entry(token).or_default().push(body);
    StatusCode::OK.into_response()
}

fn router(state: Shared) -> Router {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/deviceProfiles", get(list_profiles))
        .route("/api/deviceProfile", post(create_profile))
        .route("/api/tenant/devices", get(list_devices))
        .route("/api/device", post(create_device))
        .route("/api/device/{id}/credentials", get(credentials))
        .route("/api/plugins/telemetry/DEVICE/{id}/attributes/{scope}", post(server_attributes))
        .route("/api/v1/{token}/attributes", get(check_token).post(client_attributes))
        .route("/api/v1/{token}/telemetry", post(telemetry))
        .with_state(state)
}

/// Fake platform bound to an ephemeral local port, shut down on drop
pub struct FakePlatform {
    addr: SocketAddr,
    state: Shared,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FakePlatform {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state: Shared = Arc::new(PlatformState::default());
        let app = router(state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        log::info!("[FAKE] Platform listening on http://{}", addr);
        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> &PlatformState {
        &self.state
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for FakePlatform {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

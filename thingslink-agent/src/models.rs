//! Wire types shared by the platform client, the provisioning steps and the
//! telemetry streams.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Platform entity reference (`{"id": "...", "entityType": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityId {
    pub id: String,
    #[serde(rename = "entityType", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl EntityId {
    pub fn device_profile(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: Some("DEVICE_PROFILE".to_string()),
        }
    }
}

/// The part of a listed profile or device the reconciler cares about
#[derive(Debug, Clone, Deserialize)]
pub struct EntitySummary {
    pub id: EntityId,
    pub name: String,
}

/// One page of a paginated listing
#[derive(Debug, Deserialize)]
pub struct PageData<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(rename = "hasNext", default)]
    pub has_next: bool,
}

/// Attribute value as it appears in the config file and on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// One timestamped set of readings.
///
/// Serializes as `{"ts": <epoch millis>, "values": {...}}`, the shape accepted
/// both by the HTTP ingestion endpoint and inside gateway telemetry messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub ts: i64,
    pub values: Map<String, Value>,
}

impl TelemetryFrame {
    pub fn new(ts: i64, values: Map<String, Value>) -> Self {
        Self { ts, values }
    }
}

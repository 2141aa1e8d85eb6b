//! Alarm rules attached to the gateway device profile
//!
//! Static configuration data: each rule has a create condition and a mirrored
//! clear condition, serialized in the platform's profile-data format.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Time without telemetry before the no-data alarm fires
pub const NO_DATA_THRESHOLD_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyType {
    Attribute,
    TimeSeries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Equal,
    Greater,
    LessOrEqual,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterKey {
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredicateValue {
    pub default_value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Predicate {
    #[serde(rename = "type")]
    pub predicate_type: &'static str,
    pub operation: Operation,
    pub value: PredicateValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// One key comparison
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub key: FilterKey,
    pub value_type: &'static str,
    pub predicate: Predicate,
}

impl Condition {
    pub fn attribute_bool(key: &str, expected: bool) -> Self {
        Self {
            key: FilterKey {
                key_type: KeyType::Attribute,
                key: key.to_string(),
            },
            value_type: "BOOLEAN",
            predicate: Predicate {
                predicate_type: "BOOLEAN",
                operation: Operation::Equal,
                value: PredicateValue {
                    default_value: Value::Bool(expected),
                },
                units: None,
            },
        }
    }

    pub fn timeseries_numeric(key: &str, operation: Operation, threshold: i64, units: Option<&str>) -> Self {
        Self {
            key: FilterKey {
                key_type: KeyType::TimeSeries,
                key: key.to_string(),
            },
            value_type: "NUMERIC",
            predicate: Predicate {
                predicate_type: "NUMERIC",
                operation,
                value: PredicateValue {
                    default_value: Value::from(threshold),
                },
                units: units.map(str::to_string),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConditionSet {
    pub condition: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub condition: ConditionSet,
}

impl From<Condition> for Rule {
    fn from(condition: Condition) -> Self {
        Rule {
            condition: ConditionSet {
                condition: vec![condition],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRule {
    pub id: String,
    pub alarm_type: String,
    pub create_rules: BTreeMap<Severity, Rule>,
    pub clear_rule: Rule,
    pub detail: Option<String>,
}

impl AlarmRule {
    pub fn new(id: &str, alarm_type: &str, severity: Severity, create: Condition, clear: Condition) -> Self {
        Self {
            id: id.to_string(),
            alarm_type: alarm_type.to_string(),
            create_rules: BTreeMap::from([(severity, create.into())]),
            clear_rule: clear.into(),
            detail: None,
        }
    }
}

/// Online / offline / no-data alarms for a gateway
pub fn gateway_rules() -> Vec<AlarmRule> {
    vec![
        AlarmRule::new(
            "gatewayOnlineAlarmID",
            "Gateway Online Alarm",
            Severity::Minor,
            Condition::attribute_bool("active", true),
            Condition::attribute_bool("active", false),
        ),
        AlarmRule::new(
            "gatewayOfflineAlarmID",
            "Gateway Offline Alarm",
            Severity::Critical,
            Condition::attribute_bool("active", false),
            Condition::attribute_bool("active", true),
        ),
        AlarmRule::new(
            "noDataAlarmID",
            "No Data Alarm",
            Severity::Critical,
            Condition::timeseries_numeric("lastTelemetry", Operation::Greater, NO_DATA_THRESHOLD_MS, Some("ms")),
            Condition::timeseries_numeric(
                "lastTelemetry",
                Operation::LessOrEqual,
                NO_DATA_THRESHOLD_MS,
                Some("ms"),
            ),
        ),
    ]
}

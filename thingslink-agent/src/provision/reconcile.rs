//! Ensure the device profile and the device exist exactly once
//!
//! Lookup is by exact, case-sensitive name over the first listing page. A
//! missing resource is created; an existing one is reused untouched.

use serde_json::{json, Value};
use tracing::{info, warn};

use super::alarms::{gateway_rules, AlarmRule};
use super::ProvisionError;
use crate::models::{EntityId, EntitySummary};
use crate::platform::{ManagementSession, PlatformClient};

/// Id of a reconciled resource and whether this run created it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
    pub id: String,
    pub created: bool,
}

/// What a missing profile is created with
#[derive(Debug, Clone)]
pub struct ProfileDefinition {
    pub name: String,
    pub description: Option<String>,
    pub alarms: Vec<AlarmRule>,
}

impl ProfileDefinition {
    /// Gateway profile carrying the online / offline / no-data alarms
    pub fn gateway(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: Some("Device Profile for Gateway".to_string()),
            alarms: gateway_rules(),
        }
    }

    /// Profile without alarm rules
    pub fn plain(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            alarms: Vec::new(),
        }
    }

    pub fn payload(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "type": "DEFAULT",
            "transportType": "DEFAULT",
            "provisionType": "DISABLED",
            "default": false,
            "profileData": {
                "configuration": {"type": "DEFAULT"},
                "transportConfiguration": {"type": "DEFAULT"},
                "provisionConfiguration": {"type": "DISABLED", "provisionDeviceSecret": null},
                "alarms": self.alarms,
            },
        })
    }
}

/// First entry named `name`, warning when the name is ambiguous
fn find_by_name<'a>(kind: &str, entries: &'a [EntitySummary], name: &str) -> Option<&'a EntitySummary> {
    let mut matches = entries.iter().filter(|e| e.name == name);
    let first = matches.next()?;
    let extra = matches.count();
    if extra > 0 {
        warn!(
            "Found {} {}s named '{}'; using the first ({})",
            extra + 1,
            kind,
            name,
            first.id.id
        );
    }
    Some(first)
}

pub struct Reconciler<'a> {
    client: &'a PlatformClient,
    session: &'a ManagementSession,
}

impl<'a> Reconciler<'a> {
    pub fn new(client: &'a PlatformClient, session: &'a ManagementSession) -> Self {
        Self { client, session }
    }

    pub async fn ensure_profile(&self, definition: &ProfileDefinition) -> Result<Ensured, ProvisionError> {
        let name = definition.name.as_str();
        let reconcile_err = |source| ProvisionError::Reconcile {
            kind: "device profile",
            name: name.to_string(),
            source,
        };

        let profiles = self
            .client
            .list_device_profiles(self.session)
            .await
            .map_err(reconcile_err)?;
        if let Some(existing) = find_by_name("device profile", &profiles, name) {
            info!("Device profile '{}' already exists ({})", name, existing.id.id);
            return Ok(Ensured {
                id: existing.id.id.clone(),
                created: false,
            });
        }

        let created = self
            .client
            .create_device_profile(self.session, &definition.payload())
            .await
            .map_err(reconcile_err)?;
        info!(
            "Created device profile '{}' ({}) with {} alarm rule(s)",
            name,
            created.id.id,
            definition.alarms.len()
        );
        Ok(Ensured {
            id: created.id.id,
            created: true,
        })
    }

    pub async fn ensure_device(&self, name: &str, profile_id: &str, gateway: bool) -> Result<Ensured, ProvisionError> {
        let reconcile_err = |source| ProvisionError::Reconcile {
            kind: "device",
            name: name.to_string(),
            source,
        };

        let devices = self.client.list_devices(self.session).await.map_err(reconcile_err)?;
        if let Some(existing) = find_by_name("device", &devices, name) {
            info!("Device '{}' already exists ({})", name, existing.id.id);
            return Ok(Ensured {
                id: existing.id.id.clone(),
                created: false,
            });
        }

        let payload = json!({
            "name": name,
            "type": "DEFAULT",
            "deviceProfileId": EntityId::device_profile(profile_id),
            "additionalInfo": {"gateway": gateway},
        });
        let created = self
            .client
            .create_device(self.session, &payload)
            .await
            .map_err(reconcile_err)?;
        info!("Created device '{}' ({})", name, created.id.id);
        Ok(Ensured {
            id: created.id.id,
            created: true,
        })
    }
}

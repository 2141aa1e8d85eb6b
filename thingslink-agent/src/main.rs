//! Thingslink Agent - gateway provisioning and telemetry for device platforms
//!
//! On every start the agent:
//! - Logs in and makes sure the gateway's device profile and device exist
//! - Reuses its cached access token if the platform still accepts it,
//!   otherwise fetches and caches the current one
//! - Publishes the configured static attributes
//! - Streams gateway status over HTTP and, with sensors enabled, relays
//!   sub-sensor telemetry over the MQTT gateway API until Ctrl-C

mod config;
mod gateway;
mod metrics;
mod models;
mod platform;
mod provision;
mod telemetry;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::{AgentConfig, AttributeScope, ConfigStore, DEFAULT_CONFIG_FILE};
use gateway::{register_sensors, GatewayLink, MqttGatewaySession, MqttSettings};
use metrics::{GatewayStatus, SensorReading};
use platform::PlatformClient;
use provision::{
    authenticate, publish_attributes, AttributeTarget, CredentialManager, ProfileDefinition, Reconciler,
};
use telemetry::{Emitter, GatewayRelay, HttpIngest, Stream, StreamReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Gateway self-telemetry over HTTP only
    Gateway,
    /// Gateway self-telemetry plus MQTT-relayed sub-sensors
    GatewaySensors,
}

#[derive(Debug, Parser)]
#[command(name = "thingslink-agent", version, about = "Provision a gateway and stream its telemetry")]
struct Cli {
    /// Configuration file (also caches the device access token)
    #[arg(short, long, env = "THINGSLINK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = Role::GatewaySensors)]
    role: Role,

    /// Seconds between telemetry frames (overrides the config file)
    #[arg(long)]
    interval: Option<u64>,

    /// Tenant password (overrides the config file)
    #[arg(long, env = "THINGSLINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Stop after provisioning
    #[arg(long)]
    provision_only: bool,
}

/// Outcome of the setup phase
#[derive(Debug, Clone)]
struct Provisioned {
    device_id: String,
    access_token: String,
}

struct Agent {
    store: ConfigStore,
    config: AgentConfig,
    client: PlatformClient,
}

impl Agent {
    async fn load(path: &Path, password: Option<String>, interval: Option<u64>) -> Result<Self> {
        let store = ConfigStore::load(path).await.context("Failed to load configuration")?;
        let mut config = store.config().context("Failed to read configuration")?;
        if let Some(password) = password {
            config.platform.password = password;
        }
        if let Some(secs) = interval {
            config.telemetry.interval_secs = secs;
        }
        config.validate()?;

        let client = PlatformClient::new(config.platform.base_url()).context("Failed to build HTTP client")?;
        info!(
            "Configuration loaded from {} (device '{}')",
            store.path().display(),
            config.device.name
        );
        Ok(Self { store, config, client })
    }

    /// Make the platform state match the configuration
    async fn provision(&mut self) -> Result<Provisioned> {
        let platform = &self.config.platform;
        let device = &self.config.device;

        let session = authenticate(&self.client, &platform.username, &platform.password).await?;

        let reconciler = Reconciler::new(&self.client, &session);
        let definition = if device.alarm_rules {
            ProfileDefinition::gateway(&device.profile_name)
        } else {
            ProfileDefinition::plain(&device.profile_name)
        };
        let profile = reconciler.ensure_profile(&definition).await?;
        let gateway = reconciler.ensure_device(&device.name, &profile.id, true).await?;

        let resolved = CredentialManager::new(&self.client, &session)
            .resolve_with_store(&gateway.id, &mut self.store)
            .await?;

        let target = match self.config.telemetry.attribute_scope {
            AttributeScope::Server => AttributeTarget::Server {
                session: &session,
                device_id: &gateway.id,
            },
            AttributeScope::Client => AttributeTarget::Client {
                access_token: &resolved.token,
            },
        };
        if let Err(e) = publish_attributes(&self.client, target, &self.config.attributes).await {
            error!("{}", e);
        }

        info!("Gateway '{}' provisioned ({})", device.name, gateway.id);
        Ok(Provisioned {
            device_id: gateway.id,
            access_token: resolved.token,
        })
    }

    fn mqtt_settings(&self, provisioned: &Provisioned) -> MqttSettings {
        MqttSettings {
            host: self.config.platform.mqtt_host(),
            port: self.config.platform.mqtt_port,
            client_id: self.config.device.name.clone(),
            access_token: provisioned.access_token.clone(),
        }
    }

    /// Spawn the gateway stream, plus one relay stream per sensor when a link is given
    async fn start_telemetry(
        &self,
        provisioned: &Provisioned,
        link: Option<Arc<dyn GatewayLink>>,
    ) -> Result<Emitter> {
        let period = Duration::from_secs(self.config.telemetry.interval_secs);
        let mut emitter = Emitter::new(period);

        let ingest = Arc::new(HttpIngest::new(self.client.clone(), provisioned.access_token.clone()));
        emitter.spawn(Stream::new(&self.config.device.name, GatewayStatus::new(), ingest));

        if let Some(link) = link {
            let sensors = &self.config.telemetry.sensors;
            register_sensors(link.as_ref(), sensors)
                .await
                .context("Failed to register sensors")?;
            for sensor in sensors {
                let relay = Arc::new(GatewayRelay::new(link.clone(), sensor));
                emitter.spawn(Stream::new(sensor, SensorReading, relay));
            }
        }

        info!("Started {} telemetry stream(s)", emitter.len());
        Ok(emitter)
    }
}

fn log_reports(reports: &[StreamReport]) {
    for report in reports {
        info!(
            "Stream {}: {} frame(s) sent, {} failed",
            report.name, report.sent, report.failed
        );
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("thingslink_agent=info")),
        )
        .init();

    let cli = Cli::parse();
    info!("Thingslink agent v{} starting ({:?})", env!("CARGO_PKG_VERSION"), cli.role);

    let mut agent = Agent::load(&cli.config, cli.password, cli.interval).await?;
    let provisioned = agent.provision().await.context("Provisioning failed")?;
    if cli.provision_only {
        info!("Provision-only mode, exiting");
        return Ok(());
    }

    let session = match cli.role {
        Role::GatewaySensors => Some(Arc::new(MqttGatewaySession::connect(&agent.mqtt_settings(&provisioned)))),
        Role::Gateway => None,
    };
    let link = session.clone().map(|s| s as Arc<dyn GatewayLink>);

    let emitter = agent.start_telemetry(&provisioned, link).await?;
    let reports = emitter.run_until(wait_for_ctrl_c()).await;
    log_reports(&reports);

    if let Some(session) = session {
        session.disconnect();
    }
    info!("Device {} stopped cleanly", provisioned.device_id);
    Ok(())
}

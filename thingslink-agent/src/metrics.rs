//! Frame sources for the telemetry streams
//!
//! - `SensorReading`: synthetic temperature / humidity derived from the frame
//!   timestamp, so values are reproducible under a driven clock
//! - `GatewayStatus`: host status of the machine running the gateway, read
//!   through `sysinfo` on the blocking pool (the refreshes touch procfs and
//!   the mounted filesystems)

use async_trait::async_trait;
use chrono::{Local, TimeZone};
use serde_json::{Map, Value};
use sysinfo::{Disks, System};
use tracing::warn;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Produces the `values` of one telemetry frame
#[async_trait]
pub trait FrameSource: Send {
    async fn sample(&mut self, ts_millis: i64) -> Map<String, Value>;
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        round2(part / whole * 100.0)
    } else {
        0.0
    }
}

/// Sawtooth sensor over a five second period.
///
/// temperature stays in [20, 25], humidity in [50, 60].
#[derive(Debug, Default, Clone, Copy)]
pub struct SensorReading;

impl SensorReading {
    const PERIOD_SECS: f64 = 5.0;

    fn phase(ts_millis: i64) -> f64 {
        let secs = ts_millis as f64 / 1000.0;
        secs.rem_euclid(Self::PERIOD_SECS) / Self::PERIOD_SECS
    }
}

#[async_trait]
impl FrameSource for SensorReading {
    async fn sample(&mut self, ts_millis: i64) -> Map<String, Value> {
        let phase = Self::phase(ts_millis);
        let mut values = Map::new();
        values.insert("temperature".into(), Value::from(round2(20.0 + 5.0 * phase)));
        values.insert("humidity".into(), Value::from(round2(50.0 + 10.0 * phase)));
        values
    }
}

/// `13days,03:26:19`
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    format!("{}days,{:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

fn local_time(ts_millis: i64) -> String {
    Local
        .timestamp_millis_opt(ts_millis)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S %A").to_string())
        .unwrap_or_default()
}

/// sysinfo handles, owned by whichever thread is refreshing them
struct HostProbe {
    system: System,
    disks: Disks,
}

impl HostProbe {
    fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime it so later samples are meaningful
        system.refresh_cpu_usage();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh();
    }

    /// (total, available) bytes of the root filesystem, or of the largest disk
    fn storage(&self) -> (u64, u64) {
        let root = self
            .disks
            .list()
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| self.disks.list().iter().max_by_key(|d| d.total_space()));
        root.map(|d| (d.total_space(), d.available_space())).unwrap_or((0, 0))
    }

    fn values(&self, ts_millis: i64) -> Map<String, Value> {
        let total_mem = self.system.total_memory() as f64;
        let available_mem = self.system.available_memory() as f64;
        let (total_disk, available_disk) = self.storage();
        let (total_disk, available_disk) = (total_disk as f64, available_disk as f64);

        let mut values = Map::new();
        values.insert("LocalTime".into(), Value::from(local_time(ts_millis)));
        values.insert("Uptime".into(), Value::from(format_uptime(System::uptime())));
        values.insert(
            "CPULoad".into(),
            Value::from(round2(self.system.global_cpu_info().cpu_usage() as f64)),
        );
        values.insert("RAM_Capacity_MB".into(), Value::from(round2(total_mem / BYTES_PER_MB)));
        values.insert("RAM_Available_MB".into(), Value::from(round2(available_mem / BYTES_PER_MB)));
        values.insert(
            "RAM_Usage_Percent".into(),
            Value::from(percent(total_mem - available_mem, total_mem)),
        );
        values.insert("eMMC_Capacity_GB".into(), Value::from(round2(total_disk / BYTES_PER_GB)));
        values.insert("eMMC_Available_GB".into(), Value::from(round2(available_disk / BYTES_PER_GB)));
        values.insert(
            "eMMC_Usage_Percent".into(),
            Value::from(percent(total_disk - available_disk, total_disk)),
        );
        values
    }
}

/// Gateway host status: clock, uptime, CPU, RAM and storage
#[derive(Default)]
pub struct GatewayStatus {
    /// Built on first sample; taken out while a refresh runs
    probe: Option<HostProbe>,
}

impl GatewayStatus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FrameSource for GatewayStatus {
    async fn sample(&mut self, ts_millis: i64) -> Map<String, Value> {
        let probe = self.probe.take();
        let refreshed = tokio::task::spawn_blocking(move || {
            let mut probe = probe.unwrap_or_else(HostProbe::new);
            probe.refresh();
            let values = probe.values(ts_millis);
            (probe, values)
        })
        .await;

        match refreshed {
            Ok((probe, values)) => {
                self.probe = Some(probe);
                values
            }
            Err(e) => {
                warn!("Host status refresh failed: {}", e);
                Map::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uptime_format() {
        assert_eq!(format_uptime(1_135_579), "13days,03:26:19");
        assert_eq!(format_uptime(59), "0days,00:00:59");
    }

    #[tokio::test]
    async fn test_sensor_values_stay_in_range() {
        let mut sensor = SensorReading;
        for ts in (0..20_000).step_by(250) {
            let values = sensor.sample(1_700_000_000_000 + ts).await;
            let temperature = values["temperature"].as_f64().unwrap();
            let humidity = values["humidity"].as_f64().unwrap();
            assert!((20.0..=25.0).contains(&temperature), "temperature {}", temperature);
            assert!((50.0..=60.0).contains(&humidity), "humidity {}", humidity);
        }
    }

    #[tokio::test]
    async fn test_sensor_follows_timestamp() {
        let mut sensor = SensorReading;
        let start = sensor.sample(0).await;
        assert_eq!(start["temperature"], 20.0);
        assert_eq!(start["humidity"], 50.0);

        let mid = sensor.sample(2_500).await;
        assert_eq!(mid["temperature"], 22.5);
        assert_eq!(mid["humidity"], 55.0);
    }

    #[tokio::test]
    async fn test_gateway_status_keys() {
        let mut status = GatewayStatus::new();
        let values = status.sample(chrono::Utc::now().timestamp_millis()).await;

        for key in [
            "LocalTime",
            "Uptime",
            "CPULoad",
            "RAM_Capacity_MB",
            "RAM_Available_MB",
            "RAM_Usage_Percent",
            "eMMC_Capacity_GB",
            "eMMC_Available_GB",
            "eMMC_Usage_Percent",
        ] {
            assert!(values.contains_key(key), "missing {}", key);
        }
        assert!(values["RAM_Capacity_MB"].as_f64().unwrap() > 0.0);
        let usage = values["RAM_Usage_Percent"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&usage));
        assert!(values["Uptime"].as_str().unwrap().contains("days,"));

        // the handles survive the blocking refresh and are reused
        assert!(status.probe.is_some());
        let again = status.sample(chrono::Utc::now().timestamp_millis()).await;
        assert_eq!(again.len(), values.len());
    }
}

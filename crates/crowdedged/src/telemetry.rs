//! System telemetry collection
//!
//! Builds the snapshot carried in every heartbeat. Each metric is
//! collected independently and degrades to a default on failure, so a
//! missing sensor never costs the device its heartbeat.

use crowdedge_common::protocol::TelemetrySnapshot;
use crowdedge_common::OfflineQueue;
use std::path::Path;
use sysinfo::{Disks, System};
use tracing::debug;

const THERMAL_ZONE_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";
const HOSTAPD_CLI_TIMEOUT_SECS: u64 = 5;

/// Collect a telemetry snapshot, including the current queue depth.
pub async fn collect_snapshot(queue: &OfflineQueue) -> TelemetrySnapshot {
    let mut sys = System::new();

    // CPU usage needs two refreshes with a delay between them.
    sys.refresh_cpu();
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    sys.refresh_cpu();
    sys.refresh_memory();

    TelemetrySnapshot {
        cpu_usage: cpu_percent(&sys),
        memory_usage: memory_percent(&sys),
        disk_usage: root_disk_percent(),
        wifi_client_count: count_wifi_clients().await,
        uptime_seconds: read_uptime(),
        temperature_celsius: read_soc_temperature(),
        queue_depth: queue.stats().map(|s| s.total_count).unwrap_or(0),
    }
}

fn cpu_percent(sys: &System) -> f64 {
    let cpus = sys.cpus();
    if cpus.is_empty() {
        return 0.0;
    }
    let total: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum();
    (total / cpus.len() as f32) as f64
}

fn memory_percent(sys: &System) -> f64 {
    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(sys.available_memory());
    100.0 * used as f64 / total as f64
}

fn read_uptime() -> u64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|n| n.parse::<f64>().ok()))
        .map(|f| f as u64)
        .unwrap_or(0)
}

fn root_disk_percent() -> f64 {
    let disks = Disks::new_with_refreshed_list();

    for disk in disks.list() {
        if disk.mount_point() == Path::new("/") {
            let total = disk.total_space();
            if total == 0 {
                return 0.0;
            }
            let used = total.saturating_sub(disk.available_space());
            return 100.0 * used as f64 / total as f64;
        }
    }

    0.0
}

/// Count associated stations via hostapd_cli. Zero when hostapd is not
/// running or the tool is absent.
async fn count_wifi_clients() -> u32 {
    let run = tokio::process::Command::new("hostapd_cli")
        .arg("all_sta")
        .output();

    match tokio::time::timeout(std::time::Duration::from_secs(HOSTAPD_CLI_TIMEOUT_SECS), run).await {
        Ok(Ok(o)) if o.status.success() => {
            let stdout = String::from_utf8_lossy(&o.stdout);
            stdout.lines().filter(|line| is_mac_address(line.trim())).count() as u32
        }
        _ => {
            debug!("hostapd_cli unavailable, reporting 0 WiFi clients");
            0
        }
    }
}

fn is_mac_address(line: &str) -> bool {
    line.len() == 17
        && line.split(':').count() == 6
        && line.chars().all(|c| c.is_ascii_hexdigit() || c == ':')
}

/// SoC temperature from the first thermal zone, in Celsius. Absent on
/// hardware without the sysfs node.
fn read_soc_temperature() -> Option<f64> {
    let raw = std::fs::read_to_string(THERMAL_ZONE_PATH).ok()?;
    let millidegrees: i64 = raw.trim().parse().ok()?;
    Some(millidegrees as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_snapshot_values_are_bounded() {
        let tmp = NamedTempFile::new().unwrap();
        let queue = OfflineQueue::open_at(tmp.path()).unwrap();

        let snapshot = collect_snapshot(&queue).await;

        assert!(snapshot.cpu_usage.is_finite() && snapshot.cpu_usage >= 0.0);
        assert!(snapshot.memory_usage >= 0.0 && snapshot.memory_usage <= 100.0);
        assert!(snapshot.disk_usage >= 0.0 && snapshot.disk_usage <= 100.0);
        assert_eq!(snapshot.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_snapshot_reports_queue_depth() {
        let tmp = NamedTempFile::new().unwrap();
        let queue = OfflineQueue::open_at(tmp.path()).unwrap();
        queue.enqueue_analytics(&serde_json::json!({"n": 1})).unwrap();
        queue.enqueue_submission(&serde_json::json!({"name": "visitor"})).unwrap();

        let snapshot = collect_snapshot(&queue).await;
        assert_eq!(snapshot.queue_depth, 2);
    }

    #[test]
    fn test_mac_address_detection() {
        assert!(is_mac_address("aa:bb:cc:dd:ee:ff"));
        assert!(is_mac_address("00:11:22:33:44:55"));
        assert!(!is_mac_address("Selected interface 'wlan0'"));
        assert!(!is_mac_address("dot11RSNAStatsSTAAddress=aa:bb:cc:dd:ee:ff"));
        assert!(!is_mac_address(""));
    }
}

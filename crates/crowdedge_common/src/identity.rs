//! Device identity state.
//!
//! One instance per process, persisted across restarts as a JSON file.
//! The serial number is the durable re-provisioning key: it is generated
//! once and survives every wipe, while the credential, backend device id
//! and cached event configuration are cleared together on revocation.

use crate::error::{EdgeError, EdgeResult};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default identity file path
pub const DEVICE_STATE_PATH: &str = "/etc/crowdedge/device.json";

/// Default queue database path
pub const QUEUE_DB_PATH: &str = "/var/cache/crowdedge/queue.db";

const DEFAULT_BACKEND_URL: &str = "https://backend.crowdedge.io";
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
const DEFAULT_ANALYTICS_SYNC_INTERVAL_SECS: u64 = 120;

const SERIAL_PREFIX: &str = "CE-NODE-V1";

/// Last event configuration received from the backend, kept so the
/// portal keeps serving while the backend is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedConfig {
    pub payload: serde_json::Value,
    pub version: i64,
    pub cached_at: String,
}

/// Persistent device identity and operational parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Immutable once generated; never cleared by a wipe.
    pub serial: String,

    /// Backend-assigned id, present only while registered.
    #[serde(default)]
    pub device_id: Option<i64>,

    /// Bearer credential and HMAC signing key, issued by the backend.
    #[serde(default)]
    pub credential: Option<String>,

    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_analytics_sync_interval")]
    pub analytics_sync_interval_secs: u64,

    #[serde(default)]
    pub cached_config: Option<CachedConfig>,

    /// Last network name successfully applied to the radio config.
    #[serde(default)]
    pub applied_radio_name: Option<String>,
}

fn default_backend_url() -> String {
    std::env::var("CROWDEDGE_BACKEND_URL").unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string())
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_analytics_sync_interval() -> u64 {
    DEFAULT_ANALYTICS_SYNC_INTERVAL_SECS
}

impl DeviceIdentity {
    /// Fresh identity with a newly generated serial and default parameters.
    pub fn new() -> Self {
        Self {
            serial: generate_serial(),
            device_id: None,
            credential: None,
            backend_url: default_backend_url(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            analytics_sync_interval_secs: DEFAULT_ANALYTICS_SYNC_INTERVAL_SECS,
            cached_config: None,
            applied_radio_name: None,
        }
    }

    /// Load from disk, or create a fresh identity if the file is absent.
    pub fn load(path: &Path) -> EdgeResult<Self> {
        if !path.exists() {
            let identity = Self::new();
            info!("No identity file at {}, generated serial {}", path.display(), identity.serial);
            return Ok(identity);
        }

        let raw = fs::read_to_string(path)?;
        let identity: Self = serde_json::from_str(&raw)?;
        info!("Loaded device identity: {}", identity.serial);
        Ok(identity)
    }

    /// Persist to disk atomically (write-temp-then-rename).
    ///
    /// Mode 0644: the portal process runs as a different user and needs
    /// read access to the serial and cached configuration.
    pub fn save(&self, path: &Path) -> EdgeResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp: PathBuf = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o644));
        }

        Ok(())
    }

    /// Registered means a non-empty credential is held. The state is
    /// derived rather than stored so it can never disagree with the
    /// credential field.
    pub fn is_registered(&self) -> bool {
        self.credential.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// Clear credential, device id and cached configuration together.
    /// The serial survives so the backend can re-provision this device.
    pub fn wipe(&mut self) {
        self.credential = None;
        self.device_id = None;
        self.cached_config = None;
        warn!("Device data wiped, serial {} retained", self.serial);
    }

    /// Cache an event configuration if it is newer than what we hold.
    /// Returns false when the offered version is not an upgrade.
    pub fn cache_configuration(&mut self, payload: serde_json::Value, version: i64) -> bool {
        if let Some(existing) = &self.cached_config {
            if version <= existing.version {
                return false;
            }
        }

        self.cached_config = Some(CachedConfig {
            payload,
            version,
            cached_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        info!("Cached event configuration version {}", version);
        true
    }

    pub fn credential(&self) -> EdgeResult<&str> {
        self.credential
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| EdgeError::Auth("no device credential held".to_string()))
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a serial from the SoC serial in /proc/cpuinfo, falling back to
/// a random suffix on hardware where that line is absent.
fn generate_serial() -> String {
    if let Ok(cpuinfo) = fs::read_to_string("/proc/cpuinfo") {
        for line in cpuinfo.lines() {
            if line.starts_with("Serial") {
                if let Some(value) = line.split(':').nth(1) {
                    let value = value.trim();
                    if value.len() >= 3 {
                        return format!("{}-{}", SERIAL_PREFIX, &value[value.len() - 3..]);
                    }
                }
            }
        }
    }

    let suffix: u32 = rand::random::<u32>() % 1000;
    format!("{}-{:03}", SERIAL_PREFIX, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_identity_is_unregistered() {
        let identity = DeviceIdentity::new();
        assert!(!identity.is_registered());
        assert!(identity.serial.starts_with(SERIAL_PREFIX));
        assert!(identity.credential().is_err());
    }

    #[test]
    fn test_registered_requires_nonempty_credential() {
        let mut identity = DeviceIdentity::new();
        identity.credential = Some(String::new());
        assert!(!identity.is_registered());

        identity.credential = Some("tok-123".to_string());
        assert!(identity.is_registered());
        assert_eq!(identity.credential().unwrap(), "tok-123");
    }

    #[test]
    fn test_wipe_preserves_serial() {
        let mut identity = DeviceIdentity::new();
        let serial = identity.serial.clone();
        identity.credential = Some("tok-123".to_string());
        identity.device_id = Some(42);
        identity.cache_configuration(serde_json::json!({"wifi_ssid": "EventNet"}), 3);
        identity.applied_radio_name = Some("EventNet".to_string());

        identity.wipe();

        assert_eq!(identity.serial, serial);
        assert!(identity.credential.is_none());
        assert!(identity.device_id.is_none());
        assert!(identity.cached_config.is_none());
        assert!(!identity.is_registered());
        // Wipe does not touch what is already applied to the radio.
        assert_eq!(identity.applied_radio_name.as_deref(), Some("EventNet"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.json");

        let mut identity = DeviceIdentity::new();
        identity.credential = Some("tok-456".to_string());
        identity.device_id = Some(7);
        identity.heartbeat_interval_secs = 30;
        identity.save(&path).unwrap();

        let loaded = DeviceIdentity::load(&path).unwrap();
        assert_eq!(loaded.serial, identity.serial);
        assert_eq!(loaded.credential.as_deref(), Some("tok-456"));
        assert_eq!(loaded.device_id, Some(7));
        assert_eq!(loaded.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_load_missing_file_generates_serial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.json");

        let identity = DeviceIdentity::load(&path).unwrap();
        assert!(identity.serial.starts_with(SERIAL_PREFIX));
        assert!(!identity.is_registered());
    }

    #[test]
    fn test_cache_configuration_is_version_gated() {
        let mut identity = DeviceIdentity::new();

        assert!(identity.cache_configuration(serde_json::json!({"a": 1}), 2));
        assert!(!identity.cache_configuration(serde_json::json!({"a": 2}), 2));
        assert!(!identity.cache_configuration(serde_json::json!({"a": 3}), 1));
        assert!(identity.cache_configuration(serde_json::json!({"a": 4}), 3));

        let cached = identity.cached_config.unwrap();
        assert_eq!(cached.version, 3);
        assert_eq!(cached.payload["a"], 4);
    }
}

//! Wire protocol types for the device-to-backend API.
//!
//! Every message is an explicit record with a strict field set; unknown
//! fields in backend responses are ignored rather than reached into.
//! Authenticated bodies are signed through `signing::signed_body`, so
//! the field names here are part of the signature and must match the
//! backend exactly.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const HEARTBEAT_PATH: &str = "/api/v1/devices/heartbeat";
pub const REGISTER_PATH: &str = "/api/v1/devices/register";
pub const CONFIG_PATH: &str = "/api/v1/devices/config";
pub const ANALYTICS_PATH: &str = "/api/v1/devices/analytics";
pub const SUBMISSIONS_PATH: &str = "/api/v1/devices/submissions";

/// `status` value the backend uses to announce a revoked credential.
pub const STATUS_TOKEN_REVOKED: &str = "token_revoked";

/// `status` value for a serial the backend has not authorized yet.
pub const STATUS_UNAUTHORIZED: &str = "unauthorized";

/// RFC 3339 UTC timestamp with a trailing Z, the wire timestamp format.
pub fn wire_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// System telemetry carried in every heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub wifi_client_count: u32,
    pub uptime_seconds: u64,
    pub temperature_celsius: Option<f64>,
    pub queue_depth: u64,
}

/// Initial heartbeat from an unregistered device. Unsigned: it carries
/// the serial instead of a credential, and the backend answers with a
/// credential once the serial is authorized.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningHeartbeat {
    pub serial_number: String,
    pub firmware_version: String,
    pub telemetry: TelemetrySnapshot,
    pub timestamp: String,
}

/// Heartbeat from a registered device; signed with the credential it
/// carries.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedHeartbeat {
    pub device_token: String,
    pub telemetry: TelemetrySnapshot,
    pub timestamp: String,
}

/// Event configuration as delivered inside a heartbeat response. Only
/// the fields the agent acts on; the full payload is fetched through
/// the config endpoint and cached opaquely.
#[derive(Debug, Clone, Deserialize)]
pub struct EventConfiguration {
    #[serde(default)]
    pub config_version: Option<i64>,
    #[serde(default)]
    pub wifi_ssid: Option<String>,
}

/// A remote command delivered through a heartbeat response.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCommand {
    #[serde(default)]
    pub id: Option<i64>,
    pub command_type: CommandType,
    #[serde(default)]
    pub command_params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    ConfigRefresh,
    Restart,
    Wipe,
    UpdateFirmware,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Completed,
    Error,
}

/// Outcome of one command execution, reported back to the backend.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub detail: String,
}

impl CommandResult {
    pub fn completed(detail: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Completed,
            detail: detail.into(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Error,
            detail: detail.into(),
        }
    }
}

/// Heartbeat response. Everything is optional; an empty object is a
/// valid acknowledgement.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub device_token: Option<String>,
    #[serde(default)]
    pub token_expires_at: Option<String>,
    #[serde(default)]
    pub revocation_reason: Option<String>,
    #[serde(default)]
    pub configuration: Option<EventConfiguration>,
    #[serde(default)]
    pub commands: Vec<DeviceCommand>,
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<u64>,
}

impl HeartbeatResponse {
    pub fn is_token_revoked(&self) -> bool {
        self.status.as_deref() == Some(STATUS_TOKEN_REVOKED)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status.as_deref() == Some(STATUS_UNAUTHORIZED)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRequest {
    pub serial_number: String,
    pub firmware_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationResponse {
    pub device_id: i64,
    pub device_token: String,
    #[serde(default)]
    pub backend_url: Option<String>,
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<u64>,
}

/// Config endpoint response; the payload is cached opaquely for the
/// portal, with the version lifted out for gating.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFetchResponse {
    #[serde(default)]
    pub configuration: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsBatch {
    pub device_token: String,
    pub records: Vec<serde_json::Value>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionsBatch {
    pub device_token: String,
    pub submissions: Vec<serde_json::Value>,
    pub timestamp: String,
}

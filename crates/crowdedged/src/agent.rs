//! Heartbeat protocol and credential state machine.
//!
//! The agent is Unregistered until a heartbeat response carries a
//! credential, then Registered until the backend revokes it. Revocation
//! wipes everything except the serial, which is the key the backend
//! uses to re-provision the device. All outbound authenticated bodies
//! are signed with the current credential.

use crate::radio::RadioReconciler;
use crowdedge_common::error::{EdgeError, EdgeResult};
use crowdedge_common::protocol::{
    self, AuthenticatedHeartbeat, ConfigFetchResponse, EventConfiguration, HeartbeatResponse,
    ProvisioningHeartbeat, RegistrationRequest, RegistrationResponse, TelemetrySnapshot,
};
use crowdedge_common::{signing, DeviceIdentity, OfflineQueue};
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// What one heartbeat cycle concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Backend issued the first credential; device is now registered.
    Provisioned,
    /// Serial not authorized yet; retry on the next scheduled cycle.
    Pending,
    /// Registered exchange completed.
    Acknowledged,
    /// Credential revoked; identity wiped back to unregistered.
    Revoked,
}

pub struct EdgeAgent {
    pub(crate) http: reqwest::Client,
    pub(crate) identity: DeviceIdentity,
    identity_path: PathBuf,
    pub(crate) queue: OfflineQueue,
    radio: RadioReconciler,
}

impl EdgeAgent {
    pub fn new(
        identity: DeviceIdentity,
        identity_path: PathBuf,
        queue: OfflineQueue,
    ) -> EdgeResult<Self> {
        Self::with_radio(identity, identity_path, queue, RadioReconciler::new())
    }

    pub fn with_radio(
        identity: DeviceIdentity,
        identity_path: PathBuf,
        queue: OfflineQueue,
        radio: RadioReconciler,
    ) -> EdgeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("CrowdEdge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EdgeError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            identity,
            identity_path,
            queue,
            radio,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn is_registered(&self) -> bool {
        self.identity.is_registered()
    }

    pub fn heartbeat_interval_secs(&self) -> u64 {
        self.identity.heartbeat_interval_secs
    }

    pub fn analytics_sync_interval_secs(&self) -> u64 {
        self.identity.analytics_sync_interval_secs
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.identity.backend_url.trim_end_matches('/'), path)
    }

    pub(crate) fn persist(&self) -> EdgeResult<()> {
        self.identity.save(&self.identity_path)
    }

    /// One heartbeat exchange. Transport failures surface as errors and
    /// leave all state untouched; the next scheduled cycle retries
    /// naturally.
    pub async fn send_heartbeat(&mut self, telemetry: TelemetrySnapshot) -> EdgeResult<HeartbeatOutcome> {
        if self.identity.is_registered() {
            self.send_authenticated_heartbeat(telemetry).await
        } else {
            self.send_provisioning_heartbeat(telemetry).await
        }
    }

    /// Initial heartbeat: serial instead of credential, no signature.
    async fn send_provisioning_heartbeat(
        &mut self,
        telemetry: TelemetrySnapshot,
    ) -> EdgeResult<HeartbeatOutcome> {
        info!("Sending provisioning heartbeat for {}", self.identity.serial);

        let request = ProvisioningHeartbeat {
            serial_number: self.identity.serial.clone(),
            firmware_version: firmware_version(),
            telemetry,
            timestamp: protocol::wire_timestamp(),
        };

        let response = self
            .http
            .post(self.url(protocol::HEARTBEAT_PATH))
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(EdgeError::Transport(format!(
                "provisioning heartbeat failed: HTTP {}",
                response.status()
            )));
        }

        let body: HeartbeatResponse = response.json().await.map_err(transport)?;
        self.apply_provisioning_response(body)
    }

    /// Handle the backend's answer to a provisioning heartbeat.
    pub fn apply_provisioning_response(
        &mut self,
        mut response: HeartbeatResponse,
    ) -> EdgeResult<HeartbeatOutcome> {
        if let Some(credential) = response.device_token.take().filter(|t| !t.is_empty()) {
            self.identity.credential = Some(credential);
            self.persist()?;
            info!("Received device credential, {} is now registered", self.identity.serial);
            return Ok(HeartbeatOutcome::Provisioned);
        }

        if response.is_unauthorized() {
            info!(
                "Device not authorized yet: {}",
                response.message.as_deref().unwrap_or("no detail")
            );
        } else {
            debug!("No credential in provisioning response");
        }
        Ok(HeartbeatOutcome::Pending)
    }

    /// Registered heartbeat: telemetry + credential, HMAC-signed.
    async fn send_authenticated_heartbeat(
        &mut self,
        telemetry: TelemetrySnapshot,
    ) -> EdgeResult<HeartbeatOutcome> {
        let credential = self.identity.credential()?.to_string();

        let request = AuthenticatedHeartbeat {
            device_token: credential.clone(),
            telemetry,
            timestamp: protocol::wire_timestamp(),
        };
        let body = signing::signed_body(&credential, &request)?;

        let response = self
            .http
            .post(self.url(protocol::HEARTBEAT_PATH))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            error!("Backend rejected credential (HTTP 401), wiping device data");
            self.identity.wipe();
            self.persist()?;
            return Ok(HeartbeatOutcome::Revoked);
        }

        if !response.status().is_success() {
            return Err(EdgeError::Transport(format!(
                "heartbeat failed: HTTP {}",
                response.status()
            )));
        }

        let parsed: HeartbeatResponse = response.json().await.map_err(transport)?;
        self.apply_heartbeat_response(parsed).await
    }

    /// Handle a registered heartbeat response: revocation, credential
    /// rotation, interval overrides, configuration changes, commands.
    pub async fn apply_heartbeat_response(
        &mut self,
        response: HeartbeatResponse,
    ) -> EdgeResult<HeartbeatOutcome> {
        if response.is_token_revoked() {
            error!(
                "Credential revoked by backend: {}",
                response.revocation_reason.as_deref().unwrap_or("no reason given")
            );
            self.identity.wipe();
            self.persist()?;
            return Ok(HeartbeatOutcome::Revoked);
        }

        if let Some(token) = &response.device_token {
            if !token.is_empty() && self.identity.credential.as_deref() != Some(token.as_str()) {
                info!("Credential rotated by backend");
                if let Some(expires) = &response.token_expires_at {
                    debug!("New credential expires at {}", expires);
                }
                self.identity.credential = Some(token.clone());
                self.persist()?;
            }
        }

        if let Some(interval) = response.heartbeat_interval_seconds {
            if interval > 0 && interval != self.identity.heartbeat_interval_secs {
                info!("Heartbeat interval override from backend: {}s", interval);
                self.identity.heartbeat_interval_secs = interval;
                self.persist()?;
            }
        }

        if let Some(config) = &response.configuration {
            self.reconcile_radio(config).await;
        }

        for command in &response.commands {
            let result = self.process_command(command).await;
            info!(
                "Command {:?} finished with {:?}: {}",
                command.command_type, result.status, result.detail
            );
        }

        Ok(HeartbeatOutcome::Acknowledged)
    }

    /// Apply a configuration-borne network name change. Reconciliation
    /// failures are logged, not fatal to the heartbeat: the applied name
    /// stays unchanged and the backend will push the change again.
    async fn reconcile_radio(&mut self, config: &EventConfiguration) {
        let Some(requested) = config.wifi_ssid.as_deref() else {
            debug!("No network name in configuration, retaining current radio settings");
            return;
        };

        if self.identity.applied_radio_name.as_deref() == Some(requested) {
            debug!("Radio name unchanged: {}", requested);
            return;
        }

        info!(
            "Radio name change: {} -> {}",
            self.identity.applied_radio_name.as_deref().unwrap_or("(unset)"),
            requested
        );

        match self.radio.apply(requested).await {
            Ok(()) => {
                self.identity.applied_radio_name = Some(requested.to_string());
                if let Err(e) = self.persist() {
                    error!("Failed to persist applied radio name: {}", e);
                }
            }
            Err(e) => error!("Radio reconciliation failed: {}", e),
        }
    }

    /// Explicit registration against the register endpoint. Provisioning
    /// via heartbeat is the normal path; this is the operator-driven
    /// alternative.
    pub async fn register_device(&mut self) -> EdgeResult<()> {
        let request = RegistrationRequest {
            serial_number: self.identity.serial.clone(),
            firmware_version: firmware_version(),
        };
        info!("Registering device: {}", request.serial_number);

        let response = self
            .http
            .post(self.url(protocol::REGISTER_PATH))
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            status if status.is_success() => {
                let body: RegistrationResponse = response.json().await.map_err(transport)?;
                self.identity.device_id = Some(body.device_id);
                self.identity.credential = Some(body.device_token);
                if let Some(url) = body.backend_url {
                    self.identity.backend_url = url;
                }
                if let Some(interval) = body.heartbeat_interval_seconds {
                    self.identity.heartbeat_interval_secs = interval;
                }
                self.persist()?;
                info!("Device registered: id={}", body.device_id);
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(EdgeError::Auth(format!(
                "registration rejected: HTTP {}",
                response.status()
            ))),
            status => Err(EdgeError::Transport(format!(
                "registration failed: HTTP {}",
                status
            ))),
        }
    }

    /// Fetch the full event configuration. The credential travels as a
    /// query parameter here; the config endpoint is the one
    /// authenticated call the backend accepts unsigned.
    pub async fn fetch_configuration(&self) -> EdgeResult<Option<serde_json::Value>> {
        let credential = self.identity.credential()?;

        let response = self
            .http
            .get(self.url(protocol::CONFIG_PATH))
            .query(&[("device_token", credential)])
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                Err(EdgeError::Auth("config fetch rejected by backend".to_string()))
            }
            status if status.is_success() => {
                let body: ConfigFetchResponse = response.json().await.map_err(transport)?;
                Ok(body.configuration)
            }
            status => Err(EdgeError::Transport(format!(
                "config fetch failed: HTTP {}",
                status
            ))),
        }
    }

    /// Cache a fetched configuration payload. Returns false when the
    /// payload's version is not newer than what is already cached.
    pub fn cache_fetched_configuration(&mut self, payload: serde_json::Value) -> EdgeResult<bool> {
        let version = serde_json::from_value::<EventConfiguration>(payload.clone())
            .ok()
            .and_then(|c| c.config_version)
            .unwrap_or(1);

        let applied = self.identity.cache_configuration(payload, version);
        if applied {
            self.persist()?;
        }
        Ok(applied)
    }
}

pub(crate) fn transport(e: reqwest::Error) -> EdgeError {
    EdgeError::Transport(e.to_string())
}

pub(crate) fn firmware_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

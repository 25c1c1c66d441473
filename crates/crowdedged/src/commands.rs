//! Remote command dispatch.
//!
//! Commands arrive inside heartbeat responses. Each one produces a
//! `CommandResult`; a failing command never takes down the heartbeat
//! loop.

use crate::agent::EdgeAgent;
use crowdedge_common::protocol::{CommandResult, CommandType, DeviceCommand};
use serde::Deserialize;
use tracing::{info, warn};

/// Services cycled by the backend's restart command.
const MANAGED_SERVICES: [&str; 2] = ["crowdedge-agent", "crowdedge-portal"];

#[derive(Debug, Deserialize)]
struct FirmwareUpdateParams {
    #[serde(default)]
    firmware_url: Option<String>,
}

impl EdgeAgent {
    pub async fn process_command(&mut self, command: &DeviceCommand) -> CommandResult {
        info!("Processing command: {:?}", command.command_type);

        match command.command_type {
            CommandType::ConfigRefresh => self.handle_config_refresh().await,
            CommandType::Restart => handle_restart().await,
            CommandType::Wipe => self.handle_wipe(),
            CommandType::UpdateFirmware => handle_firmware_update(&command.command_params),
            CommandType::Unknown => {
                warn!("Unknown command type received");
                CommandResult::error("unknown command type")
            }
        }
    }

    async fn handle_config_refresh(&mut self) -> CommandResult {
        match self.fetch_configuration().await {
            Ok(Some(payload)) => match self.cache_fetched_configuration(payload) {
                Ok(true) => {
                    let version = self
                        .identity
                        .cached_config
                        .as_ref()
                        .map(|c| c.version)
                        .unwrap_or(0);
                    CommandResult::completed(format!("configuration refreshed to version {}", version))
                }
                Ok(false) => CommandResult::completed("configuration already current"),
                Err(e) => CommandResult::error(format!("failed to cache configuration: {}", e)),
            },
            Ok(None) => CommandResult::completed("no configuration assigned"),
            Err(e) => CommandResult::error(format!("config fetch failed: {}", e)),
        }
    }

    fn handle_wipe(&mut self) -> CommandResult {
        warn!("Wipe command received, clearing device data");
        self.identity.wipe();

        match self.persist() {
            Ok(()) => CommandResult::completed("device data wiped"),
            Err(e) => CommandResult::error(format!("wipe failed to persist: {}", e)),
        }
    }
}

async fn handle_restart() -> CommandResult {
    warn!("Restart command received, cycling managed services");

    for service in MANAGED_SERVICES {
        let output = tokio::process::Command::new("systemctl")
            .args(["restart", service])
            .output()
            .await;

        match output {
            Ok(o) if o.status.success() => {}
            Ok(o) => {
                let stderr = String::from_utf8_lossy(&o.stderr).trim().to_string();
                return CommandResult::error(format!("failed to restart {}: {}", service, stderr));
            }
            Err(e) => {
                return CommandResult::error(format!("failed to run systemctl: {}", e));
            }
        }
    }

    CommandResult::completed("services restarted")
}

fn handle_firmware_update(params: &serde_json::Value) -> CommandResult {
    let parsed: FirmwareUpdateParams = match serde_json::from_value(params.clone()) {
        Ok(parsed) => parsed,
        Err(_) => FirmwareUpdateParams { firmware_url: None },
    };

    match parsed.firmware_url {
        None => CommandResult::error("no firmware URL provided"),
        Some(url) => {
            info!("Firmware update requested: {}", url);
            CommandResult::error("firmware update not yet implemented")
        }
    }
}

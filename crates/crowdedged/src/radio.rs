//! Radio configuration reconciliation.
//!
//! Applies a backend-pushed network name to the hostapd config file and
//! restarts the service. The apply is transactional: a full snapshot of
//! the file is taken before the first write, and any failure from that
//! point on restores the snapshot byte-for-byte before the error is
//! returned.

use crowdedge_common::RadioError;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Default hostapd configuration path
pub const RADIO_CONF_PATH: &str = "/etc/hostapd/hostapd.conf";

const SSID_KEY: &str = "ssid=";
const DEFAULT_RESTART_TIMEOUT_SECS: u64 = 30;

/// In-flight change state, discarded once the attempt completes.
struct PendingChange {
    previous: Option<String>,
    snapshot: String,
}

pub struct RadioReconciler {
    conf_path: PathBuf,
    restart_cmd: Vec<String>,
    restart_timeout: Duration,
}

impl RadioReconciler {
    pub fn new() -> Self {
        Self {
            conf_path: PathBuf::from(RADIO_CONF_PATH),
            restart_cmd: vec![
                "systemctl".to_string(),
                "restart".to_string(),
                "hostapd".to_string(),
            ],
            restart_timeout: Duration::from_secs(DEFAULT_RESTART_TIMEOUT_SECS),
        }
    }

    /// Reconciler against a specific config file and restart command,
    /// for deployments with a non-standard layout and for tests.
    pub fn with_paths(conf_path: impl Into<PathBuf>, restart_cmd: Vec<String>) -> Self {
        Self {
            conf_path: conf_path.into(),
            restart_cmd,
            restart_timeout: Duration::from_secs(DEFAULT_RESTART_TIMEOUT_SECS),
        }
    }

    /// Apply a new network name: snapshot, rewrite the ssid= line,
    /// restart the service. On any failure after the rewrite the file
    /// is restored to the snapshot before the error is returned, so the
    /// on-disk config always matches either the old or the new state.
    pub async fn apply(&self, requested: &str) -> Result<(), RadioError> {
        info!("Applying radio name: {}", requested);

        let snapshot = fs::read_to_string(&self.conf_path).map_err(|e| self.read_error(e))?;

        let change = PendingChange {
            previous: find_current_ssid(&snapshot),
            snapshot,
        };

        let updated = rewrite_ssid(&change.snapshot, requested).ok_or(RadioError::KeyLineNotFound)?;

        if let Err(e) = fs::write(&self.conf_path, &updated) {
            self.rollback(&change);
            return Err(self.write_error(e));
        }

        match change.previous.as_deref() {
            Some(previous) => info!("Replaced radio name: {} -> {}", previous, requested),
            None => info!("Set radio name: {}", requested),
        }

        if let Err(e) = self.restart_service().await {
            warn!("Service restart failed, rolling back radio config");
            self.rollback(&change);
            return Err(e);
        }

        Ok(())
    }

    async fn restart_service(&self) -> Result<(), RadioError> {
        let (program, args) = self
            .restart_cmd
            .split_first()
            .ok_or_else(|| RadioError::Unexpected("empty restart command".to_string()))?;

        let run = tokio::process::Command::new(program).args(args).output();

        match timeout(self.restart_timeout, run).await {
            Err(_) => Err(RadioError::RestartTimeout {
                seconds: self.restart_timeout.as_secs(),
            }),
            Ok(Err(e)) => Err(RadioError::Unexpected(format!(
                "failed to run {}: {}",
                program, e
            ))),
            Ok(Ok(output)) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let detail = if stderr.is_empty() {
                    output.status.to_string()
                } else {
                    stderr
                };
                Err(RadioError::RestartFailed { stderr: detail })
            }
            Ok(Ok(_)) => {
                info!("Radio service restarted");
                Ok(())
            }
        }
    }

    /// Restore the pre-attempt file content. Best effort: a rollback
    /// failure is logged, the original error still propagates.
    fn rollback(&self, change: &PendingChange) {
        match fs::write(&self.conf_path, &change.snapshot) {
            Ok(()) => info!(
                "Rolled back radio config to previous name: {:?}",
                change.previous
            ),
            Err(e) => error!("Rollback of radio config failed: {}", e),
        }
    }

    fn read_error(&self, e: std::io::Error) -> RadioError {
        let path = self.conf_path.display().to_string();
        match e.kind() {
            ErrorKind::NotFound => RadioError::FileNotFound { path },
            ErrorKind::PermissionDenied => RadioError::PermissionDenied { path },
            _ => RadioError::Unexpected(e.to_string()),
        }
    }

    fn write_error(&self, e: std::io::Error) -> RadioError {
        let path = self.conf_path.display().to_string();
        match e.kind() {
            ErrorKind::PermissionDenied => RadioError::PermissionDenied { path },
            _ => RadioError::Unexpected(e.to_string()),
        }
    }
}

impl Default for RadioReconciler {
    fn default() -> Self {
        Self::new()
    }
}

fn find_current_ssid(content: &str) -> Option<String> {
    content
        .lines()
        .find(|line| line.trim_start().starts_with(SSID_KEY))
        .and_then(|line| line.trim_start().strip_prefix(SSID_KEY))
        .map(|value| value.to_string())
}

/// Rewrite every ssid= line with the requested value. None when the
/// file carries no such line.
fn rewrite_ssid(content: &str, requested: &str) -> Option<String> {
    let mut found = false;
    let mut lines: Vec<String> = Vec::new();

    for line in content.lines() {
        if line.trim_start().starts_with(SSID_KEY) {
            found = true;
            lines.push(format!("{}{}", SSID_KEY, requested));
        } else {
            lines.push(line.to_string());
        }
    }

    if !found {
        return None;
    }

    let mut updated = lines.join("\n");
    if content.ends_with('\n') {
        updated.push('\n');
    }
    Some(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONF: &str = "interface=wlan0\nssid=OldNet\nchannel=6\nwpa=2\n";

    fn conf_file(content: &str) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(content.as_bytes()).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    fn reconciler(tmp: &NamedTempFile, restart_cmd: &[&str]) -> RadioReconciler {
        RadioReconciler::with_paths(
            tmp.path(),
            restart_cmd.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_apply_rewrites_ssid_line() {
        let tmp = conf_file(CONF);
        let radio = reconciler(&tmp, &["true"]);

        radio.apply("EventNet2").await.unwrap();

        let content = fs::read_to_string(tmp.path()).unwrap();
        assert!(content.contains("ssid=EventNet2\n"));
        assert!(!content.contains("OldNet"));
        assert!(content.contains("interface=wlan0\n"));
        assert!(content.contains("channel=6\n"));
    }

    #[tokio::test]
    async fn test_restart_failure_rolls_back_exactly() {
        let tmp = conf_file(CONF);
        let radio = reconciler(&tmp, &["false"]);

        let err = radio.apply("EventNet2").await.unwrap_err();
        assert!(matches!(err, RadioError::RestartFailed { .. }));

        let content = fs::read_to_string(tmp.path()).unwrap();
        assert_eq!(content, CONF);
    }

    #[tokio::test]
    async fn test_missing_ssid_line_aborts_without_mutation() {
        let original = "interface=wlan0\nchannel=6\n";
        let tmp = conf_file(original);
        let radio = reconciler(&tmp, &["true"]);

        let err = radio.apply("EventNet2").await.unwrap_err();
        assert!(matches!(err, RadioError::KeyLineNotFound));

        let content = fs::read_to_string(tmp.path()).unwrap();
        assert_eq!(content, original);
    }

    #[tokio::test]
    async fn test_missing_file_is_typed() {
        let radio = RadioReconciler::with_paths(
            "/nonexistent/hostapd.conf",
            vec!["true".to_string()],
        );

        let err = radio.apply("EventNet2").await.unwrap_err();
        assert!(matches!(err, RadioError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn test_commented_ssid_line_does_not_match() {
        let original = "interface=wlan0\n# ssid=Commented\nchannel=6\n";
        let tmp = conf_file(original);
        let radio = reconciler(&tmp, &["true"]);

        let err = radio.apply("EventNet2").await.unwrap_err();
        assert!(matches!(err, RadioError::KeyLineNotFound));
    }

    #[test]
    fn test_rewrite_preserves_missing_trailing_newline() {
        let updated = rewrite_ssid("ssid=Old", "New").unwrap();
        assert_eq!(updated, "ssid=New");

        let updated = rewrite_ssid("ssid=Old\n", "New").unwrap();
        assert_eq!(updated, "ssid=New\n");
    }
}

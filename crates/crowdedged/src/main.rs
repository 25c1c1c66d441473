//! CrowdEdge Agent - on-device daemon
//!
//! Sends authenticated heartbeats, drains the offline queue to the
//! backend, and reconciles backend-pushed radio configuration.

use anyhow::{Context, Result};
use crowdedged::agent::{EdgeAgent, HeartbeatOutcome};
use crowdedged::telemetry;
use crowdedge_common::identity::DEVICE_STATE_PATH;
use crowdedge_common::{DeviceIdentity, OfflineQueue};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn, Level};

/// One tick of the scheduler loop.
const TICK_SECS: u64 = 1;

/// Stale queue items are purged once a day.
const CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;
const QUEUE_RETENTION_DAYS: i64 = 7;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("CrowdEdge agent v{} starting", env!("CARGO_PKG_VERSION"));

    let identity_path = PathBuf::from(DEVICE_STATE_PATH);
    let identity =
        DeviceIdentity::load(&identity_path).context("Failed to load device identity")?;

    // Local storage is the only fatal dependency: without the queue the
    // device cannot buffer data through an outage.
    let queue = OfflineQueue::open().context("Failed to initialize offline queue")?;

    if identity.is_registered() {
        info!("Device registered: {}", identity.serial);
    } else {
        info!(
            "Device not provisioned: {}, will request credential on first heartbeat",
            identity.serial
        );
    }
    info!(
        "Heartbeat interval: {}s, analytics sync interval: {}s",
        identity.heartbeat_interval_secs, identity.analytics_sync_interval_secs
    );

    let agent = EdgeAgent::new(identity, identity_path, queue)?;

    // The run loop holds a borrow of the SQLite-backed queue
    // (`rusqlite::Connection` is `!Sync`) across await points, so its
    // future is `!Send` and cannot be `tokio::spawn`ed. Drive it on a
    // `LocalSet` instead, which keeps the loop running concurrently on
    // the current thread while we await the shutdown signal.
    let local = tokio::task::LocalSet::new();
    local.spawn_local(run_loop(agent));

    local
        .run_until(tokio::signal::ctrl_c())
        .await?;
    info!("Shutting down");

    Ok(())
}

/// Single sequential control loop: one counter per periodic task,
/// compared against its interval every tick. Outbound calls block the
/// loop for at most their own timeout; a slow backend delays but never
/// corrupts the schedule.
async fn run_loop(mut agent: EdgeAgent) {
    let mut heartbeat_counter = 0u64;
    let mut sync_counter = 0u64;
    let mut cleanup_counter = 0u64;

    loop {
        tokio::time::sleep(Duration::from_secs(TICK_SECS)).await;
        heartbeat_counter += TICK_SECS;
        sync_counter += TICK_SECS;
        cleanup_counter += TICK_SECS;

        if heartbeat_counter >= agent.heartbeat_interval_secs() {
            heartbeat_counter = 0;

            let snapshot = telemetry::collect_snapshot(agent.queue()).await;
            match agent.send_heartbeat(snapshot).await {
                Ok(HeartbeatOutcome::Provisioned) => info!("Device provisioned by backend"),
                Ok(HeartbeatOutcome::Pending) => {
                    info!("Awaiting backend authorization, will retry next cycle")
                }
                Ok(HeartbeatOutcome::Acknowledged) => debug!("Heartbeat acknowledged"),
                Ok(HeartbeatOutcome::Revoked) => {
                    warn!("Credential revoked, device back to provisioning mode")
                }
                Err(e) => warn!("Heartbeat failed, will retry next cycle: {}", e),
            }
        }

        if agent.is_registered() && sync_counter >= agent.analytics_sync_interval_secs() {
            sync_counter = 0;

            match agent.sync_queue().await {
                Ok(report) if report.total_attempted() > 0 => info!(
                    "Queue sync: {} synced, {} failed",
                    report.total_synced(),
                    report.total_attempted() - report.total_synced()
                ),
                Ok(_) => {}
                Err(e) => warn!("Queue sync failed: {}", e),
            }
        }

        if cleanup_counter >= CLEANUP_INTERVAL_SECS {
            cleanup_counter = 0;

            match agent.queue().cleanup_older_than(QUEUE_RETENTION_DAYS) {
                Ok(0) => {}
                Ok(deleted) => info!("Purged {} stale queue items", deleted),
                Err(e) => warn!("Queue cleanup failed: {}", e),
            }
        }
    }
}

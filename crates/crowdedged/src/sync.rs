//! Batch sync - drains the offline queue to the backend.
//!
//! One batch is read in drain order (submissions first), partitioned by
//! kind, and each partition is uploaded with its own signed POST. The
//! partitions succeed or fail independently: a rejected analytics batch
//! never blocks submissions, and failed items stay queued with their
//! retry count bumped.

use crate::agent::EdgeAgent;
use crowdedge_common::error::EdgeResult;
use crowdedge_common::protocol::{self, AnalyticsBatch, SubmissionsBatch};
use crowdedge_common::signing;
use crowdedge_common::{QueueItem, QueueKind};
use serde::Serialize;
use tracing::{debug, info, warn};

const SYNC_BATCH_SIZE: usize = 100;

/// Per-kind outcome of one sync cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncReport {
    pub synced_submissions: usize,
    pub failed_submissions: usize,
    pub synced_analytics: usize,
    pub failed_analytics: usize,
}

impl SyncReport {
    pub fn total_synced(&self) -> usize {
        self.synced_submissions + self.synced_analytics
    }

    pub fn total_attempted(&self) -> usize {
        self.total_synced() + self.failed_submissions + self.failed_analytics
    }
}

impl EdgeAgent {
    /// Upload one batch of queued items. Never runs unregistered: batch
    /// endpoints require a signed body.
    pub async fn sync_queue(&self) -> EdgeResult<SyncReport> {
        let mut report = SyncReport::default();

        if !self.is_registered() {
            debug!("Device not registered, skipping queue sync");
            return Ok(report);
        }

        let batch = self.queue.dequeue_batch(SYNC_BATCH_SIZE)?;
        if batch.is_empty() {
            debug!("No queued items to sync");
            return Ok(report);
        }

        let credential = self.identity.credential()?.to_string();
        let (submissions, analytics): (Vec<QueueItem>, Vec<QueueItem>) = batch
            .into_iter()
            .partition(|item| item.kind == QueueKind::Submission);

        if !submissions.is_empty() {
            let (ids, payloads) = split_items(submissions);
            let request = SubmissionsBatch {
                device_token: credential.clone(),
                submissions: payloads,
                timestamp: protocol::wire_timestamp(),
            };

            if self.push_signed(protocol::SUBMISSIONS_PATH, &credential, &request).await {
                self.queue.mark_synced(&ids)?;
                report.synced_submissions = ids.len();
                info!("Synced {} portal submissions", ids.len());
            } else {
                self.queue.mark_failed(&ids)?;
                report.failed_submissions = ids.len();
                warn!("Failed to sync {} portal submissions", ids.len());
            }
        }

        if !analytics.is_empty() {
            let (ids, payloads) = split_items(analytics);
            let request = AnalyticsBatch {
                device_token: credential.clone(),
                records: payloads,
                timestamp: protocol::wire_timestamp(),
            };

            if self.push_signed(protocol::ANALYTICS_PATH, &credential, &request).await {
                self.queue.mark_synced(&ids)?;
                report.synced_analytics = ids.len();
                info!("Synced {} analytics records", ids.len());
            } else {
                self.queue.mark_failed(&ids)?;
                report.failed_analytics = ids.len();
                warn!("Failed to sync {} analytics records", ids.len());
            }
        }

        Ok(report)
    }

    /// Sign and POST one partition. Any failure, transport or HTTP,
    /// reports false so the caller marks the partition failed.
    async fn push_signed<T: Serialize>(&self, path: &str, credential: &str, request: &T) -> bool {
        let body = match signing::signed_body(credential, request) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to sign batch: {}", e);
                return false;
            }
        };

        match self.http.post(self.url(path)).json(&body).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!("Batch upload to {} failed: HTTP {}", path, response.status());
                false
            }
            Err(e) => {
                warn!("Batch upload to {} failed: {}", path, e);
                false
            }
        }
    }
}

fn split_items(items: Vec<QueueItem>) -> (Vec<i64>, Vec<serde_json::Value>) {
    let mut ids = Vec::with_capacity(items.len());
    let mut payloads = Vec::with_capacity(items.len());
    for item in items {
        ids.push(item.id);
        payloads.push(item.payload);
    }
    (ids, payloads)
}

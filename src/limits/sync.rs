//! Limit Sync (C7): at-least-once fan-out of updated limits to
//! downstream systems of record, with per-entry status persisted to
//! disk so a crash mid-sync is recoverable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::model::{now_ts, unix_seconds, LimitSet};
use crate::resilience::retry_backoff::{retry_with_backoff, BackoffPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointResult {
    pub endpoint: String,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    pub sync_id: String,
    pub user_id: String,
    pub limits: LimitSet,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub status: SyncStatus,
    pub results: Vec<EndpointResult>,
}

fn deterministic_sync_id(user_id: &str, limits: &LimitSet, timestamp: chrono::DateTime<chrono::Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(limits.daily.to_string().as_bytes());
    hasher.update(limits.transaction.to_string().as_bytes());
    hasher.update(limits.weekly.to_string().as_bytes());
    hasher.update(timestamp.timestamp().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct LimitSync {
    config: SyncConfig,
    status_dir: PathBuf,
    queue: (
        crossbeam_channel::Sender<SyncEntry>,
        crossbeam_channel::Receiver<SyncEntry>,
    ),
    client: reqwest::Client,
}

impl LimitSync {
    pub fn new(config: SyncConfig, status_dir: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client builder");
        Self {
            config,
            status_dir,
            queue: crossbeam_channel::unbounded(),
            client,
        }
    }

    /// Enqueues a sync entry and returns its deterministic id
    /// immediately; the draining worker performs the actual fan-out.
    pub fn apply(&self, user_id: &str, limits: LimitSet) -> String {
        let timestamp = now_ts();
        let sync_id = deterministic_sync_id(user_id, &limits, timestamp);
        let entry = SyncEntry {
            sync_id: sync_id.clone(),
            user_id: user_id.to_string(),
            limits,
            timestamp,
            status: SyncStatus::Pending,
            results: Vec::new(),
        };
        let _ = self.queue.0.send(entry);
        sync_id
    }

    pub fn manual_resync(&self, sync_id: &str) -> Result<()> {
        if let Some(entry) = self.read_status(sync_id)? {
            if entry.status == SyncStatus::Failed {
                let _ = self.queue.0.send(entry);
            }
        }
        Ok(())
    }

    /// Drains the queue continuously until the sender is dropped; run
    /// this as the single sync worker task.
    pub async fn run_worker(self: Arc<Self>) {
        loop {
            let entry = {
                let receiver = self.queue.1.clone();
                match tokio::task::spawn_blocking(move || receiver.recv_timeout(Duration::from_millis(500))).await {
                    Ok(Ok(entry)) => entry,
                    Ok(Err(_)) => continue,
                    Err(_) => break,
                }
            };
            self.process_entry(entry).await;
        }
    }

    async fn process_entry(&self, mut entry: SyncEntry) {
        let policy = BackoffPolicy::new(self.config.retry.max_retries.max(1), self.config.retry.backoff_ms);
        let mut results = Vec::new();
        let mut all_ok = true;

        for endpoint_template in &self.config.endpoints {
            let endpoint = endpoint_template.replace("{user_id}", &entry.user_id);
            let client = self.client.clone();
            let body = serde_json::json!({ "user_id": entry.user_id, "limits": entry.limits });
            let outcome = retry_with_backoff(policy, &endpoint, || {
                let client = client.clone();
                let endpoint = endpoint.clone();
                let body = body.clone();
                async move {
                    let resp = client.post(&endpoint).json(&body).send().await.map_err(|e| {
                        crate::error::Error::Storage(format!("limit sync post to {endpoint} failed: {e}"))
                    })?;
                    if resp.status().is_success() {
                        Ok(())
                    } else {
                        Err(crate::error::Error::Storage(format!(
                            "limit sync endpoint {endpoint} returned {}",
                            resp.status()
                        )))
                    }
                }
            })
            .await;

            let succeeded = outcome.is_ok();
            if !succeeded {
                warn!(endpoint, sync_id = %entry.sync_id, "limit sync endpoint failed after retries");
                all_ok = false;
            }
            results.push(EndpointResult {
                endpoint,
                succeeded,
            });
        }

        entry.results = results;
        entry.status = if all_ok { SyncStatus::Completed } else { SyncStatus::Failed };
        if let Err(err) = self.persist_status(&entry) {
            error!(sync_id = %entry.sync_id, error = %err, "failed to persist sync status");
        }
    }

    fn persist_status(&self, entry: &SyncEntry) -> Result<()> {
        std::fs::create_dir_all(&self.status_dir)?;
        let path = self.status_dir.join(format!("{}.json", entry.sync_id));
        let tmp = self.status_dir.join(format!("{}.json.tmp", entry.sync_id));
        std::fs::write(&tmp, serde_json::to_vec_pretty(entry)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_status(&self, sync_id: &str) -> Result<Option<SyncEntry>> {
        let path = self.status_dir.join(format!("{sync_id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Deletes status files older than 30 days.
    pub fn prune_old_status_files(&self) -> std::io::Result<usize> {
        let cutoff = unix_seconds().saturating_sub(30 * 24 * 3600);
        let mut removed = 0;
        if !self.status_dir.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.status_dir)? {
            let entry = entry?;
            if let Ok(metadata) = entry.metadata() {
                if let Ok(modified) = metadata.modified() {
                    let modified_secs = modified
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    if modified_secs < cutoff {
                        let _ = std::fs::remove_file(entry.path());
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Summary of completed/failed counts per endpoint over all
    /// persisted status files (a "recent window" in the absence of a
    /// time-series store is the full retained set, bounded by the
    /// retention janitor above).
    pub fn endpoint_summary(&self) -> Result<HashMap<String, (u64, u64)>> {
        let mut summary: HashMap<String, (u64, u64)> = HashMap::new();
        if !self.status_dir.exists() {
            return Ok(summary);
        }
        for entry in std::fs::read_dir(&self.status_dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = std::fs::read_to_string(entry.path())?;
            let sync_entry: SyncEntry = match serde_json::from_str(&text) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for result in sync_entry.results {
                let counter = summary.entry(result.endpoint).or_insert((0, 0));
                if result.succeeded {
                    counter.0 += 1;
                } else {
                    counter.1 += 1;
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_limits() -> LimitSet {
        LimitSet {
            daily: dec!(5000),
            transaction: dec!(1000),
            weekly: dec!(35000),
        }
    }

    #[test]
    fn sync_id_is_deterministic_for_same_inputs() {
        let ts = now_ts();
        let a = deterministic_sync_id("u1", &sample_limits(), ts);
        let b = deterministic_sync_id("u1", &sample_limits(), ts);
        assert_eq!(a, b);
    }

    #[test]
    fn sync_id_differs_by_user() {
        let ts = now_ts();
        let a = deterministic_sync_id("u1", &sample_limits(), ts);
        let b = deterministic_sync_id("u2", &sample_limits(), ts);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn status_file_roundtrips_through_persist_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let sync = LimitSync::new(SyncConfig::default(), dir.path().to_path_buf());
        let entry = SyncEntry {
            sync_id: "abc123".into(),
            user_id: "u1".into(),
            limits: sample_limits(),
            timestamp: now_ts(),
            status: SyncStatus::Completed,
            results: vec![EndpointResult {
                endpoint: "http://example".into(),
                succeeded: true,
            }],
        };
        sync.persist_status(&entry).unwrap();
        let reloaded = sync.read_status("abc123").unwrap().unwrap();
        assert_eq!(reloaded.status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn endpoint_summary_counts_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sync = LimitSync::new(SyncConfig::default(), dir.path().to_path_buf());
        let entry = SyncEntry {
            sync_id: "x".into(),
            user_id: "u1".into(),
            limits: sample_limits(),
            timestamp: now_ts(),
            status: SyncStatus::Failed,
            results: vec![
                EndpointResult {
                    endpoint: "a".into(),
                    succeeded: true,
                },
                EndpointResult {
                    endpoint: "b".into(),
                    succeeded: false,
                },
            ],
        };
        sync.persist_status(&entry).unwrap();
        let summary = sync.endpoint_summary().unwrap();
        assert_eq!(summary.get("a"), Some(&(1, 0)));
        assert_eq!(summary.get("b"), Some(&(0, 1)));
    }
}

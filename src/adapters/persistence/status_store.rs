//! Status Store - Atomic JSON Service Status Records
//!
//! One file per service under `status/`, replaced atomically (write to
//! tmp file, then rename) so a reader in another process always sees a
//! complete record.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, instrument, warn};

use crate::ports::status::{ServiceStatusRecord, StatusRepository};

/// File-backed status repository.
pub struct FileStatusStore {
    /// Directory holding `<service>.json` files.
    status_dir: PathBuf,
}

impl FileStatusStore {
    /// Create a store in `data_dir`, creating `status/` if needed.
    pub async fn new(data_dir: &str) -> Result<Self> {
        let status_dir = Path::new(data_dir).join("status");
        fs::create_dir_all(&status_dir)
            .await
            .context("Failed to create status directory")?;
        Ok(Self { status_dir })
    }

    /// Path of the status directory, without creating it.
    pub fn dir_for(data_dir: &str) -> PathBuf {
        Path::new(data_dir).join("status")
    }

    fn path_for(&self, service_name: &str) -> PathBuf {
        self.status_dir.join(format!("{}.json", file_stem(service_name)))
    }
}

#[async_trait]
impl StatusRepository for FileStatusStore {
    #[instrument(skip(self, record), fields(service = %record.service_name))]
    async fn write(&self, record: &ServiceStatusRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record).context("Failed to serialize status record")?;

        let path = self.path_for(&record.service_name);
        let tmp_path = path.with_extension("json.tmp");

        fs::write(&tmp_path, &json)
            .await
            .context("Failed to write tmp status file")?;
        fs::rename(&tmp_path, &path)
            .await
            .context("Failed to rename status file")?;

        debug!(path = %path.display(), status = %record.status, "Status record written");
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<ServiceStatusRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.status_dir)
            .await
            .context("Failed to read status directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str::<ServiceStatusRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping malformed status record"),
            }
        }

        records.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        Ok(records)
    }
}

/// Service names may contain characters that are unsafe in file names.
fn file_stem(service_name: &str) -> String {
    service_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::domain::ServiceStatus;

    fn record(name: &str, status: ServiceStatus) -> ServiceStatusRecord {
        ServiceStatusRecord {
            host_id: "host-1".into(),
            service_name: name.into(),
            pid: 42,
            run_id: Uuid::new_v4(),
            status,
            heartbeat: Some(Utc::now()),
            consecutive_failures: 0,
            stats: json!({"polls_completed": 3}),
            written_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_write_replaces_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(dir.path().to_str().unwrap()).await.unwrap();

        store.write(&record("kalshi_poller", ServiceStatus::Starting)).await.unwrap();
        store.write(&record("kalshi_poller", ServiceStatus::Running)).await.unwrap();
        store.write(&record("market/stream", ServiceStatus::Failed)).await.unwrap();

        let records = store.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].service_name, "kalshi_poller");
        assert_eq!(records[0].status, ServiceStatus::Running);
        assert_eq!(records[1].service_name, "market/stream");
        assert!(dir.path().join("status/market_stream.json").exists());
    }

    #[tokio::test]
    async fn test_read_all_skips_tmp_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(dir.path().to_str().unwrap()).await.unwrap();
        store.write(&record("poller", ServiceStatus::Running)).await.unwrap();

        let status_dir = FileStatusStore::dir_for(dir.path().to_str().unwrap());
        std::fs::write(status_dir.join("broken.json"), "{").unwrap();
        std::fs::write(status_dir.join("poller.json.tmp"), "{}").unwrap();

        let records = store.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
    }
}

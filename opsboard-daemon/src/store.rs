//! File-backed host inventory.
//!
//! The whole inventory is a single JSON array of records, read once at
//! startup and rewritten atomically (temp file + rename) on every
//! save. Fleets tracked here are small; simplicity beats a database.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use opsboard_core::{CoreError, HostRecord, HostStore};

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<String, HostRecord>>,
}

impl JsonFileStore {
    /// Open the inventory file, creating an empty store when the file
    /// does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let list: Vec<HostRecord> = serde_json::from_str(&content).map_err(|err| {
                    CoreError::Store(format!("parse {}: {err}", path.display()))
                })?;
                list.into_iter()
                    .map(|record| (record.hostname.to_lowercase(), record))
                    .collect()
            }
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(CoreError::Store(format!(
                    "read {}: {err}",
                    path.display()
                )))
            }
        };
        info!(path = %path.display(), hosts = records.len(), "inventory loaded");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn persist(&self, records: &HashMap<String, HostRecord>) -> Result<(), CoreError> {
        let mut list: Vec<&HostRecord> = records.values().collect();
        list.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        let json = serde_json::to_string_pretty(&list)
            .map_err(|err| CoreError::Store(format!("serialize inventory: {err}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| CoreError::Store(format!("create {}: {err}", parent.display())))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|err| CoreError::Store(format!("write {}: {err}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| CoreError::Store(format!("rename {}: {err}", tmp.display())))?;
        Ok(())
    }
}

#[async_trait]
impl HostStore for JsonFileStore {
    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<HostRecord>, CoreError> {
        let records = self.records.lock().await;
        Ok(records.get(&hostname.to_lowercase()).cloned())
    }

    async fn list_all(&self) -> Result<Vec<HostRecord>, CoreError> {
        let records = self.records.lock().await;
        let mut all: Vec<HostRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(all)
    }

    async fn save(&self, record: HostRecord) -> Result<(), CoreError> {
        let mut records = self.records.lock().await;
        records.insert(record.hostname.to_lowercase(), record);
        self.persist(&records).await
    }
}

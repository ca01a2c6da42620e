//! Host inventory storage and audit abstractions.
//!
//! The daemon provides a file-backed [`HostStore`]; tests use
//! [`MemoryHostStore`]. Hostname lookups are case-insensitive
//! everywhere.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use opsboard_proxmox::VmIdentity;

use crate::error::Result;

/// One tracked host in the inventory.
///
/// `node`/`vmid` form the mapping onto a cluster VM; both are optional
/// because records can predate discovery or describe hosts that are
/// not VMs at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Cluster node hosting the VM, when mapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Numeric VM id, when mapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl HostRecord {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    /// Case-insensitive tag membership.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// The stored node/vmid mapping, when both halves are present.
    pub fn mapping(&self) -> Option<VmIdentity> {
        match (&self.node, self.vmid) {
            (Some(node), Some(vmid)) if !node.is_empty() => Some(VmIdentity::new(node, vmid)),
            _ => None,
        }
    }
}

/// Persistent host inventory.
#[async_trait]
pub trait HostStore: Send + Sync {
    /// Look up a record by hostname, case-insensitively.
    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<HostRecord>>;

    /// All records. Order is implementation-defined but stable.
    async fn list_all(&self) -> Result<Vec<HostRecord>>;

    /// Insert or replace the record keyed by its hostname.
    async fn save(&self, record: HostRecord) -> Result<()>;
}

/// Sink for operator-visible action records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, actor: &str, action: &str, target: &str, detail: &str);
}

/// Audit sink that forwards entries to the log.
pub struct LogAudit;

#[async_trait]
impl AuditSink for LogAudit {
    async fn record(&self, actor: &str, action: &str, target: &str, detail: &str) {
        info!(actor, action, target, detail, "audit");
    }
}

/// In-memory store keyed by lowercased hostname.
#[derive(Default)]
pub struct MemoryHostStore {
    records: Mutex<HashMap<String, HostRecord>>,
}

impl MemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = HostRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.lock().expect("store lock");
            for record in records {
                map.insert(record.hostname.to_lowercase(), record);
            }
        }
        store
    }
}

#[async_trait]
impl HostStore for MemoryHostStore {
    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<HostRecord>> {
        let map = self.records.lock().expect("store lock");
        Ok(map.get(&hostname.to_lowercase()).cloned())
    }

    async fn list_all(&self) -> Result<Vec<HostRecord>> {
        let map = self.records.lock().expect("store lock");
        let mut all: Vec<HostRecord> = map.values().cloned().collect();
        all.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(all)
    }

    async fn save(&self, record: HostRecord) -> Result<()> {
        let mut map = self.records.lock().expect("store lock");
        map.insert(record.hostname.to_lowercase(), record);
        Ok(())
    }
}

/// Audit sink that remembers entries, for assertions in tests.
#[derive(Default)]
pub struct MemoryAudit {
    entries: Mutex<Vec<String>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries as "actor action target detail" lines, in order.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("audit lock").clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAudit {
    async fn record(&self, actor: &str, action: &str, target: &str, detail: &str) {
        self.entries
            .lock()
            .expect("audit lock")
            .push(format!("{actor} {action} {target} {detail}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let store = MemoryHostStore::with_records([HostRecord::new("Web-01")]);
        let found = store.find_by_hostname("web-01").await.unwrap();
        assert_eq!(found.unwrap().hostname, "Web-01");
    }

    #[tokio::test]
    async fn save_replaces_by_hostname() {
        let store = MemoryHostStore::new();
        let mut record = HostRecord::new("db1");
        store.save(record.clone()).await.unwrap();
        record.vmid = Some(107);
        store.save(record).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].vmid, Some(107));
    }

    #[test]
    fn mapping_requires_both_halves() {
        let mut record = HostRecord::new("db1");
        assert!(record.mapping().is_none());
        record.vmid = Some(107);
        assert!(record.mapping().is_none());
        record.node = Some("pve1".into());
        assert_eq!(record.mapping(), Some(VmIdentity::new("pve1", 107)));
    }

    #[test]
    fn has_tag_ignores_case() {
        let record = HostRecord {
            tags: vec!["Prod".into()],
            ..HostRecord::new("web1")
        };
        assert!(record.has_tag("prod"));
        assert!(!record.has_tag("dev"));
    }
}

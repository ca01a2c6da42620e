//! Live status cache for tracked hosts.
//!
//! A background task walks the inventory on a fixed interval and, for
//! each record, publishes a point-in-time [`LiveStatus`]: power state,
//! agent reachability, best IPv4 and optionally the busiest process.
//! Hosts are refreshed sequentially and independently; one failure
//! never blocks the rest of the sweep.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use opsboard_proxmox::{ClusterApi, NetworkInterface, RemoteExecutor, VmIdentity};

use crate::diag::{self, LocalDiagnostics, TopProcess};
use crate::error::Result;
use crate::identity::{self, ResolvedIdentity};
use crate::store::{HostRecord, HostStore};

/// State published for a record whose VM answered 404.
pub const STATE_MISSING: &str = "missing";

const EXEC_CAPTURE_TIMEOUT: Duration = Duration::from_secs(6);
const NPROC_TIMEOUT: Duration = Duration::from_secs(4);
const MIN_CAPTURE_INTERVAL: Duration = Duration::from_secs(30);
const MIN_TOUCH_INTERVAL: Duration = Duration::from_secs(5);

const NPROC_CMD: &str = "nproc 2>/dev/null || getconf _NPROCESSORS_ONLN 2>/dev/null || echo 1";

/// Point-in-time status of one tracked host.
///
/// Every refresh replaces the whole entry; fields are never merged
/// across refreshes.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub hostname: String,
    pub node: Option<String>,
    pub vmid: Option<u32>,
    /// Power state as reported, or [`STATE_MISSING`]. `None` for hosts
    /// that are not VMs.
    pub state: Option<String>,
    /// Whether the guest agent answered a ping. `None` when the VM was
    /// not reachable enough to ask.
    pub agent_up: Option<bool>,
    /// Best guest IPv4: first private address, else first non-loopback.
    pub ipv4: Option<String>,
    /// Busiest process by CPU, when capture is enabled and due.
    pub top: Option<TopProcess>,
    pub fetched_at: DateTime<Utc>,
}

/// Tuning for the refresh loop.
#[derive(Debug, Clone)]
pub struct StatusSettings {
    /// Interval between inventory sweeps.
    pub refresh_interval: Duration,
    /// Capture a top-process sample for running hosts.
    pub capture_top: bool,
    /// Minimum time between captures per host. Floored at 30s; the
    /// capture costs two guest execs.
    pub capture_interval: Duration,
    /// Persist `last_seen` on records observed running.
    pub touch_last_seen: bool,
    /// Node assumed for records that encode a vmid but store no node.
    pub default_node: String,
    /// Hostnames treated as the daemon's own machine.
    pub local_hosts: Vec<String>,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            capture_top: false,
            capture_interval: Duration::from_secs(120),
            touch_last_seen: false,
            default_node: "pve".to_string(),
            local_hosts: Vec::new(),
        }
    }
}

/// Periodically refreshed map of hostname to [`LiveStatus`].
pub struct LiveStatusCache {
    api: Arc<dyn ClusterApi>,
    executor: RemoteExecutor,
    store: Arc<dyn HostStore>,
    settings: StatusSettings,
    local: LocalDiagnostics,
    cache: RwLock<HashMap<String, LiveStatus>>,
    last_capture: Mutex<HashMap<String, Instant>>,
}

impl LiveStatusCache {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        store: Arc<dyn HostStore>,
        settings: StatusSettings,
    ) -> Self {
        let executor = RemoteExecutor::new(api.clone());
        let local = LocalDiagnostics::new(settings.local_hosts.clone());
        Self {
            api,
            executor,
            store,
            settings,
            local,
            cache: RwLock::new(HashMap::new()),
            last_capture: Mutex::new(HashMap::new()),
        }
    }

    /// Run the refresh loop until the task is aborted.
    pub async fn run(&self) {
        info!(
            interval_secs = self.settings.refresh_interval.as_secs(),
            capture_top = self.settings.capture_top,
            "live status refresher started"
        );
        let mut timer = tokio::time::interval(self.settings.refresh_interval);
        loop {
            timer.tick().await;
            self.refresh_once().await;
        }
    }

    /// One full sweep over the inventory.
    pub async fn refresh_once(&self) {
        let records = match self.store.list_all().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "inventory unavailable, skipping sweep");
                return;
            }
        };
        for record in records {
            if let Err(err) = self.refresh_host(&record).await {
                debug!(host = %record.hostname, error = %err, "live refresh failed");
            }
        }
    }

    /// Current status of every host, sorted by hostname.
    pub async fn all(&self) -> Vec<LiveStatus> {
        let cache = self.cache.read().await;
        let mut all: Vec<LiveStatus> = cache.values().cloned().collect();
        all.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        all
    }

    /// Current status of one host, if it has been refreshed yet.
    pub async fn get(&self, hostname: &str) -> Option<LiveStatus> {
        let cache = self.cache.read().await;
        cache.get(&hostname.to_lowercase()).cloned()
    }

    async fn refresh_host(&self, record: &HostRecord) -> Result<()> {
        let identity = match identity::resolve(record, &self.settings.default_node) {
            ResolvedIdentity::Vm(identity) => identity,
            ResolvedIdentity::NotAVm => {
                self.refresh_local(record).await;
                return Ok(());
            }
        };

        let state = match self
            .api
            .vm_current_status(&identity.node, identity.vmid)
            .await
        {
            Ok(current) => current.status,
            Err(err) if err.is_not_found() => {
                self.publish(record, LiveStatus {
                    hostname: record.hostname.clone(),
                    node: Some(identity.node),
                    vmid: Some(identity.vmid),
                    state: Some(STATE_MISSING.to_string()),
                    agent_up: None,
                    ipv4: None,
                    top: None,
                    fetched_at: Utc::now(),
                })
                .await;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let running = state.eq_ignore_ascii_case("running");

        let agent_up = self
            .api
            .agent_ping(&identity.node, identity.vmid)
            .await
            .is_ok();

        let mut ipv4 = None;
        if agent_up {
            match self
                .api
                .agent_network_interfaces(&identity.node, identity.vmid)
                .await
            {
                Ok(interfaces) => ipv4 = pick_best_ipv4(&interfaces),
                Err(err) => debug!(vm = %identity, error = %err, "interface listing failed"),
            }
        }

        let mut top = None;
        if agent_up && running && self.capture_due(&record.hostname) {
            top = self.capture_top(&identity).await;
        }

        self.publish(record, LiveStatus {
            hostname: record.hostname.clone(),
            node: Some(identity.node.clone()),
            vmid: Some(identity.vmid),
            state: Some(state),
            agent_up: Some(agent_up),
            ipv4,
            top,
            fetched_at: Utc::now(),
        })
        .await;

        if running && self.settings.touch_last_seen {
            self.touch_last_seen(record).await;
        }
        Ok(())
    }

    /// Hosts that are not VMs get a sparse entry; a top-process sample
    /// is taken only when the host is this machine.
    async fn refresh_local(&self, record: &HostRecord) {
        let mut top = None;
        if self.settings.capture_top
            && self.local.is_local_host(&record.hostname)
            && self.capture_due(&record.hostname)
        {
            top = self.local.top_by_cpu().await;
        }
        self.publish(record, LiveStatus {
            hostname: record.hostname.clone(),
            node: None,
            vmid: None,
            state: None,
            agent_up: None,
            ipv4: None,
            top,
            fetched_at: Utc::now(),
        })
        .await;
    }

    async fn publish(&self, record: &HostRecord, status: LiveStatus) {
        let mut cache = self.cache.write().await;
        cache.insert(record.hostname.to_lowercase(), status);
    }

    /// Per-host capture rate limit.
    fn capture_due(&self, hostname: &str) -> bool {
        if !self.settings.capture_top {
            return false;
        }
        let interval = self.settings.capture_interval.max(MIN_CAPTURE_INTERVAL);
        let mut last = self.last_capture.lock().expect("capture lock");
        let key = hostname.to_lowercase();
        let now = Instant::now();
        match last.get(&key) {
            Some(at) if now.duration_since(*at) < interval => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }

    /// Run `ps` in the guest for the busiest process and normalize its
    /// per-core `%cpu` by the guest's logical core count.
    async fn capture_top(&self, identity: &VmIdentity) -> Option<TopProcess> {
        let outcome = self
            .executor
            .execute(
                identity,
                "/bin/sh",
                &["-lc".to_string(), diag::ps_command("cpu", 1)],
                None,
                Some(EXEC_CAPTURE_TIMEOUT),
            )
            .await
            .ok()?;
        if outcome.exit_code != 0 {
            debug!(vm = %identity, exit_code = outcome.exit_code, "top capture failed");
            return None;
        }
        let mut top = diag::parse_ps_line(outcome.stdout.lines().next()?)?;

        let nproc = self
            .executor
            .execute(
                identity,
                "/bin/sh",
                &["-lc".to_string(), NPROC_CMD.to_string()],
                None,
                Some(NPROC_TIMEOUT),
            )
            .await
            .ok()
            .and_then(|o| o.stdout.trim().parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1);
        top.cpu = diag::round1(top.cpu / f64::from(nproc));
        Some(top)
    }

    /// Persist `last_seen`, throttled so a fast refresh interval does
    /// not rewrite the store every sweep.
    async fn touch_last_seen(&self, record: &HostRecord) {
        let throttle =
            chrono::Duration::from_std(MIN_TOUCH_INTERVAL.max(self.settings.refresh_interval / 2))
                .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let now = Utc::now();
        if let Some(seen) = record.last_seen {
            if now - seen < throttle {
                return;
            }
        }
        let mut updated = record.clone();
        updated.last_seen = Some(now);
        if let Err(err) = self.store.save(updated).await {
            debug!(host = %record.hostname, error = %err, "last_seen update failed");
        }
    }
}

/// Choose the address to show for a guest: IPv4 only, loopback
/// excluded, private (RFC1918) preferred, else the first seen.
pub fn pick_best_ipv4(interfaces: &[NetworkInterface]) -> Option<String> {
    let mut candidates: Vec<(Ipv4Addr, &str)> = Vec::new();
    for interface in interfaces {
        for entry in &interface.ip_addresses {
            if !entry.kind.eq_ignore_ascii_case("ipv4") {
                continue;
            }
            let Ok(ip) = entry.address.parse::<Ipv4Addr>() else {
                continue;
            };
            if ip.is_loopback() {
                continue;
            }
            candidates.push((ip, &entry.address));
        }
    }
    candidates
        .iter()
        .find(|(ip, _)| ip.is_private())
        .or_else(|| candidates.first())
        .map(|(_, address)| (*address).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsboard_proxmox::mock::MockCluster;
    use opsboard_proxmox::IpAddressEntry;

    use crate::store::MemoryHostStore;

    fn cache_with(
        mock: Arc<MockCluster>,
        store: Arc<MemoryHostStore>,
        settings: StatusSettings,
    ) -> LiveStatusCache {
        LiveStatusCache::new(mock, store, settings)
    }

    fn settings() -> StatusSettings {
        StatusSettings {
            default_node: "pve1".to_string(),
            ..StatusSettings::default()
        }
    }

    #[test]
    fn private_ipv4_beats_public() {
        let interfaces = vec![
            MockCluster::ipv4_interface("lo", &["127.0.0.1"]),
            MockCluster::ipv4_interface("eth0", &["8.8.8.8", "192.168.1.5"]),
        ];
        assert_eq!(pick_best_ipv4(&interfaces).as_deref(), Some("192.168.1.5"));
    }

    #[test]
    fn first_public_ipv4_used_when_no_private_exists() {
        let interfaces = vec![MockCluster::ipv4_interface("eth0", &["8.8.8.8", "1.1.1.1"])];
        assert_eq!(pick_best_ipv4(&interfaces).as_deref(), Some("8.8.8.8"));
    }

    #[test]
    fn loopback_only_yields_nothing() {
        let interfaces = vec![MockCluster::ipv4_interface("lo", &["127.0.0.1"])];
        assert_eq!(pick_best_ipv4(&interfaces), None);
    }

    #[test]
    fn ipv6_entries_are_ignored() {
        let interfaces = vec![NetworkInterface {
            name: Some("eth0".into()),
            ip_addresses: vec![IpAddressEntry {
                kind: "ipv6".into(),
                address: "fe80::1".into(),
            }],
        }];
        assert_eq!(pick_best_ipv4(&interfaces), None);
    }

    #[tokio::test]
    async fn running_vm_with_agent_is_fully_populated() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        mock.set_agent("pve1", 107, true);
        mock.set_interfaces(
            "pve1",
            107,
            vec![MockCluster::ipv4_interface("eth0", &["10.0.0.7"])],
        );
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new(
            "vm-107-db1",
        )]));

        let cache = cache_with(mock, store, settings());
        cache.refresh_once().await;

        let status = cache.get("vm-107-db1").await.unwrap();
        assert_eq!(status.state.as_deref(), Some("running"));
        assert_eq!(status.agent_up, Some(true));
        assert_eq!(status.ipv4.as_deref(), Some("10.0.0.7"));
        assert_eq!(status.node.as_deref(), Some("pve1"));
        assert_eq!(status.vmid, Some(107));
    }

    #[tokio::test]
    async fn vanished_vm_is_published_as_missing() {
        let mock = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryHostStore::with_records([HostRecord {
            node: Some("pve1".into()),
            vmid: Some(101),
            ..HostRecord::new("vm-101-ghost")
        }]));

        let cache = cache_with(mock, store, settings());
        cache.refresh_once().await;

        let status = cache.get("vm-101-ghost").await.unwrap();
        assert_eq!(status.state.as_deref(), Some(STATE_MISSING));
        assert_eq!(status.agent_up, None);
        assert_eq!(status.ipv4, None);
    }

    #[tokio::test]
    async fn unreachable_agent_reports_down_without_ip() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new(
            "vm-107-db1",
        )]));

        let cache = cache_with(mock, store, settings());
        cache.refresh_once().await;

        let status = cache.get("vm-107-db1").await.unwrap();
        assert_eq!(status.agent_up, Some(false));
        assert_eq!(status.ipv4, None);
    }

    #[tokio::test]
    async fn one_failing_host_does_not_block_the_sweep() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 200, "web1", "running");
        let store = Arc::new(MemoryHostStore::with_records([
            HostRecord {
                node: Some("pve1".into()),
                vmid: Some(100),
                ..HostRecord::new("vm-100-gone")
            },
            HostRecord {
                node: Some("pve1".into()),
                vmid: Some(200),
                ..HostRecord::new("web1")
            },
        ]));

        let cache = cache_with(mock, store, settings());
        cache.refresh_once().await;

        assert!(cache.get("vm-100-gone").await.is_some());
        assert_eq!(
            cache.get("web1").await.unwrap().state.as_deref(),
            Some("running")
        );
    }

    #[tokio::test]
    async fn top_capture_normalizes_by_core_count() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        mock.set_agent("pve1", 107, true);
        // First exec is the ps sample, second is nproc.
        mock.push_exec_result(0, 0, "4242 postgres 200.0 12.5\n", "");
        mock.push_exec_result(0, 0, "2\n", "");
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new(
            "vm-107-db1",
        )]));

        let cache = cache_with(
            mock,
            store,
            StatusSettings {
                capture_top: true,
                ..settings()
            },
        );
        cache.refresh_once().await;

        let top = cache.get("vm-107-db1").await.unwrap().top.unwrap();
        assert_eq!(top.name, "postgres");
        assert_eq!(top.cpu, 100.0);
        assert_eq!(top.mem, 12.5);
    }

    #[tokio::test]
    async fn capture_is_rate_limited_per_host() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        mock.set_agent("pve1", 107, true);
        mock.push_exec_result(0, 0, "1 a 10.0 1.0\n", "");
        mock.push_exec_result(0, 0, "4\n", "");
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new(
            "vm-107-db1",
        )]));

        let cache = cache_with(
            mock.clone(),
            store,
            StatusSettings {
                capture_top: true,
                ..settings()
            },
        );
        cache.refresh_once().await;
        cache.refresh_once().await;

        // Two sweeps, but only the first captured (ps + nproc).
        assert_eq!(mock.exec_calls(), 2);
    }

    #[tokio::test]
    async fn non_vm_host_gets_sparse_entry() {
        let mock = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new("bastion")]));

        let cache = cache_with(mock, store, settings());
        cache.refresh_once().await;

        let status = cache.get("bastion").await.unwrap();
        assert_eq!(status.state, None);
        assert_eq!(status.node, None);
        assert_eq!(status.vmid, None);
    }

    #[tokio::test]
    async fn touch_last_seen_persists_for_running_vms() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new(
            "vm-107-db1",
        )]));

        let cache = cache_with(
            mock,
            store.clone(),
            StatusSettings {
                touch_last_seen: true,
                ..settings()
            },
        );
        cache.refresh_once().await;

        let record = store.find_by_hostname("vm-107-db1").await.unwrap().unwrap();
        assert!(record.last_seen.is_some());
    }
}

//! Inventory reconciliation against the cluster's VM population.
//!
//! Preview is read-only: it lists every VM the cluster knows about,
//! matches them against inventory records, and reports three disjoint
//! findings - mapping proposals for matched records, unknown VMs with
//! no record, and records whose VM can no longer be found. Apply,
//! clear and archive are the explicit write operations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use opsboard_proxmox::{ClusterApi, ClusterResource, VmIdentity, VmKind};

use crate::error::Result;
use crate::identity::{expected_hostname, vmid_from_hostname};
use crate::store::{AuditSink, HostRecord, HostStore};

const ACTOR: &str = "reconciler";

/// Proposed node/vmid mapping for an existing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryProposal {
    pub hostname: String,
    pub node: String,
    pub vmid: u32,
    /// Which matching rule produced the proposal.
    pub reason: String,
}

/// A VM on the cluster with no matching inventory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnknownVm {
    pub node: String,
    pub vmid: u32,
    pub name: String,
    pub kind: String,
}

/// A record whose VM could not be found on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingRecord {
    pub hostname: String,
    pub node: Option<String>,
    pub vmid: u32,
}

/// Read-only result of one reconciliation preview.
#[derive(Debug, Default, Serialize)]
pub struct PreviewResult {
    pub proposals: Vec<DiscoveryProposal>,
    pub unknown: Vec<UnknownVm>,
    pub missing: Vec<MissingRecord>,
    /// How many VMs the listing produced. A low count alongside a
    /// large `missing` list usually means a permissions gap, not a
    /// mass deletion.
    pub observed_vms: usize,
}

/// One VM as observed by whichever listing succeeded.
struct ObservedVm {
    node: String,
    vmid: u32,
    name: String,
    kind: String,
}

/// Record-to-VM matching rules, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchRule {
    /// Hostname equals the `vm-<vmid>-<name>` convention.
    HostnameConvention,
    /// Hostname encodes the vmid in its `vm-<vmid>-` prefix.
    VmidPrefix,
    /// Hostname equals the VM's display name.
    NameEquality,
}

impl MatchRule {
    fn as_str(self) -> &'static str {
        match self {
            MatchRule::HostnameConvention => "hostname-convention",
            MatchRule::VmidPrefix => "vmid-prefix",
            MatchRule::NameEquality => "name-equality",
        }
    }

    fn matches(self, record: &HostRecord, vmid: u32, name: &str) -> bool {
        match self {
            MatchRule::HostnameConvention => {
                !name.trim().is_empty()
                    && record
                        .hostname
                        .eq_ignore_ascii_case(&expected_hostname(vmid, name))
            }
            MatchRule::VmidPrefix => vmid_from_hostname(&record.hostname) == Some(vmid),
            MatchRule::NameEquality => {
                !name.trim().is_empty() && record.hostname.eq_ignore_ascii_case(name.trim())
            }
        }
    }
}

const MATCH_RULES: [MatchRule; 3] = [
    MatchRule::HostnameConvention,
    MatchRule::VmidPrefix,
    MatchRule::NameEquality,
];

/// A higher-priority rule wins over any match by a lower one; within a
/// rule the first record in inventory order wins.
fn match_record<'a>(
    records: &'a [HostRecord],
    vmid: u32,
    name: &str,
) -> Option<(&'a HostRecord, MatchRule)> {
    for rule in MATCH_RULES {
        if let Some(record) = records.iter().find(|r| rule.matches(r, vmid, name)) {
            return Some((record, rule));
        }
    }
    None
}

/// Compares inventory records with the cluster's VMs.
pub struct InventoryReconciler {
    api: Arc<dyn ClusterApi>,
    store: Arc<dyn HostStore>,
    audit: Arc<dyn AuditSink>,
}

impl InventoryReconciler {
    pub fn new(api: Arc<dyn ClusterApi>, store: Arc<dyn HostStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { api, store, audit }
    }

    /// Compute proposals, unknown VMs and missing records without
    /// writing anything.
    pub async fn preview(&self) -> Result<PreviewResult> {
        let records = self.store.list_all().await?;
        let observed = self.observe_vms().await;

        let mut result = PreviewResult {
            observed_vms: observed.len(),
            ..PreviewResult::default()
        };

        // Presence indexes for the missing check below.
        let mut present_pairs: HashSet<(String, u32)> = HashSet::new();
        let mut present_vmids: HashSet<u32> = HashSet::new();
        let mut name_by_vmid: HashMap<u32, String> = HashMap::new();
        for vm in &observed {
            present_pairs.insert((vm.node.to_lowercase(), vm.vmid));
            present_vmids.insert(vm.vmid);
            name_by_vmid.insert(vm.vmid, vm.name.clone());
        }

        for vm in &observed {
            match match_record(&records, vm.vmid, &vm.name) {
                Some((record, rule)) => {
                    let node_differs = record
                        .node
                        .as_deref()
                        .map_or(true, |n| !n.eq_ignore_ascii_case(&vm.node));
                    let vmid_differs = record.vmid != Some(vm.vmid);
                    if node_differs || vmid_differs {
                        result.proposals.push(DiscoveryProposal {
                            hostname: record.hostname.clone(),
                            node: vm.node.clone(),
                            vmid: vm.vmid,
                            reason: rule.as_str().to_string(),
                        });
                    }
                }
                None => result.unknown.push(UnknownVm {
                    node: vm.node.clone(),
                    vmid: vm.vmid,
                    name: vm.name.clone(),
                    kind: vm.kind.clone(),
                }),
            }
        }

        for record in &records {
            if let Some(missing) = self.check_missing(record, &present_pairs, &present_vmids, &name_by_vmid).await {
                result.missing.push(missing);
            }
        }

        info!(
            proposals = result.proposals.len(),
            unknown = result.unknown.len(),
            missing = result.missing.len(),
            observed = result.observed_vms,
            "reconciliation preview"
        );
        Ok(result)
    }

    /// Write accepted proposals back to the store. Proposals whose
    /// record has disappeared are skipped. Returns the update count.
    pub async fn apply(&self, proposals: &[DiscoveryProposal]) -> Result<usize> {
        let mut updated = 0;
        for proposal in proposals {
            let Some(mut record) = self.store.find_by_hostname(&proposal.hostname).await? else {
                debug!(host = %proposal.hostname, "proposal target no longer exists, skipping");
                continue;
            };
            record.node = Some(proposal.node.clone());
            record.vmid = Some(proposal.vmid);
            self.store.save(record).await?;
            self.audit
                .record(
                    ACTOR,
                    "apply-mapping",
                    &proposal.hostname,
                    &VmIdentity::new(&proposal.node, proposal.vmid).to_string(),
                )
                .await;
            updated += 1;
        }
        Ok(updated)
    }

    /// Null out node/vmid on the named records. Records without a
    /// mapping are left untouched. Returns the update count.
    pub async fn clear_mappings(&self, hostnames: &[String]) -> Result<usize> {
        let mut cleared = 0;
        for hostname in hostnames {
            let Some(mut record) = self.store.find_by_hostname(hostname).await? else {
                continue;
            };
            if record.node.is_none() && record.vmid.is_none() {
                continue;
            }
            record.node = None;
            record.vmid = None;
            self.store.save(record).await?;
            self.audit
                .record(ACTOR, "clear-mapping", hostname, "")
                .await;
            cleared += 1;
        }
        Ok(cleared)
    }

    /// Archive records whose VM is gone: clear the mapping and tag the
    /// record "retired" (never twice). Returns the update count.
    pub async fn archive_missing(&self, missing: &[MissingRecord]) -> Result<usize> {
        let mut archived = 0;
        for entry in missing {
            let Some(mut record) = self.store.find_by_hostname(&entry.hostname).await? else {
                continue;
            };
            record.node = None;
            record.vmid = None;
            if !record.has_tag("retired") {
                record.tags.push("retired".to_string());
            }
            self.store.save(record).await?;
            self.audit
                .record(ACTOR, "archive-missing", &entry.hostname, "")
                .await;
            archived += 1;
        }
        Ok(archived)
    }

    /// List the cluster's VMs, falling back from the cluster-wide
    /// endpoint to per-node listings when it fails or returns nothing.
    /// Listing failures never abort the preview; they shrink it.
    async fn observe_vms(&self) -> Vec<ObservedVm> {
        let mut observed = Vec::new();
        match self.api.cluster_resources().await {
            Ok(resources) => {
                for resource in resources {
                    if let Some(vm) = observed_from_resource(resource) {
                        observed.push(vm);
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "cluster-wide listing failed, trying per-node");
            }
        }
        if !observed.is_empty() {
            return observed;
        }

        let nodes = match self.api.list_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                debug!(error = %err, "node listing failed");
                return observed;
            }
        };
        for node in nodes {
            for kind in VmKind::ALL {
                match self.api.list_node_vms(&node.node, kind).await {
                    Ok(vms) => {
                        for vm in vms {
                            observed.push(ObservedVm {
                                node: node.node.clone(),
                                vmid: vm.vmid,
                                name: vm.name.unwrap_or_default(),
                                kind: kind.as_str().to_string(),
                            });
                        }
                    }
                    Err(err) => {
                        debug!(node = %node.node, %kind, error = %err, "per-node listing failed, skipping");
                    }
                }
            }
        }
        observed
    }

    /// A mapped record counts as missing when no listing shows its VM
    /// and a direct status probe does not contradict that.
    async fn check_missing(
        &self,
        record: &HostRecord,
        present_pairs: &HashSet<(String, u32)>,
        present_vmids: &HashSet<u32>,
        name_by_vmid: &HashMap<u32, String>,
    ) -> Option<MissingRecord> {
        let vmid = record.vmid?;
        let stored_node = record
            .node
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());

        let present = match stored_node {
            Some(node) => present_pairs.contains(&(node.to_lowercase(), vmid)),
            // Without a stored node, a bare vmid hit only counts when
            // the observed VM's identity still resembles the record;
            // otherwise the vmid was likely reused.
            None => {
                present_vmids.contains(&vmid)
                    && name_by_vmid.get(&vmid).is_some_and(|name| {
                        record.hostname.eq_ignore_ascii_case(name)
                            || record
                                .hostname
                                .eq_ignore_ascii_case(&expected_hostname(vmid, name))
                    })
            }
        };
        if present {
            return None;
        }

        // One direct probe: the VM may exist but be invisible to the
        // listing (RBAC gaps, degraded cluster state).
        if let Some(node) = stored_node {
            match self.api.vm_current_status(node, vmid).await {
                Ok(_) => return None,
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    debug!(host = %record.hostname, error = %err, "missing probe inconclusive");
                }
            }
        }

        Some(MissingRecord {
            hostname: record.hostname.clone(),
            node: record.node.clone(),
            vmid,
        })
    }
}

fn observed_from_resource(resource: ClusterResource) -> Option<ObservedVm> {
    let node = resource.node.filter(|n| !n.is_empty())?;
    let vmid = resource.vmid?;
    Some(ObservedVm {
        node,
        vmid,
        name: resource.name.unwrap_or_default(),
        kind: resource.kind.unwrap_or_else(|| "qemu".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsboard_proxmox::mock::MockCluster;

    use crate::store::{MemoryAudit, MemoryHostStore};

    fn reconciler(
        mock: Arc<MockCluster>,
        store: Arc<MemoryHostStore>,
    ) -> (InventoryReconciler, Arc<MemoryAudit>) {
        let audit = Arc::new(MemoryAudit::new());
        (
            InventoryReconciler::new(mock, store, audit.clone()),
            audit,
        )
    }

    fn mapped(hostname: &str, node: &str, vmid: u32) -> HostRecord {
        HostRecord {
            node: Some(node.to_string()),
            vmid: Some(vmid),
            ..HostRecord::new(hostname)
        }
    }

    #[tokio::test]
    async fn convention_match_outranks_name_equality() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        let store = Arc::new(MemoryHostStore::with_records([
            HostRecord::new("db1"),
            HostRecord::new("vm-107-db1"),
        ]));

        let (reconciler, _) = reconciler(mock, store);
        let preview = reconciler.preview().await.unwrap();

        assert_eq!(preview.proposals.len(), 1);
        let proposal = &preview.proposals[0];
        assert_eq!(proposal.hostname, "vm-107-db1");
        assert_eq!(proposal.node, "pve1");
        assert_eq!(proposal.vmid, 107);
        assert_eq!(proposal.reason, "hostname-convention");
    }

    #[tokio::test]
    async fn correct_mapping_produces_no_proposal() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        let store = Arc::new(MemoryHostStore::with_records([mapped(
            "vm-107-db1",
            "pve1",
            107,
        )]));

        let (reconciler, _) = reconciler(mock, store);
        let preview = reconciler.preview().await.unwrap();

        assert!(preview.proposals.is_empty());
        assert!(preview.unknown.is_empty());
        assert!(preview.missing.is_empty());
        assert_eq!(preview.observed_vms, 1);
    }

    #[tokio::test]
    async fn unmatched_vm_is_reported_unknown() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm_kind("pve2", 300, "scratch", "stopped", VmKind::Lxc);
        let store = Arc::new(MemoryHostStore::new());

        let (reconciler, _) = reconciler(mock, store);
        let preview = reconciler.preview().await.unwrap();

        assert_eq!(preview.unknown.len(), 1);
        assert_eq!(preview.unknown[0].vmid, 300);
        assert_eq!(preview.unknown[0].kind, "lxc");
    }

    #[tokio::test]
    async fn per_node_fallback_covers_cluster_listing_failure() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        mock.fail_cluster_listing(true);
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new(
            "vm-107-db1",
        )]));

        let (reconciler, _) = reconciler(mock, store);
        let preview = reconciler.preview().await.unwrap();

        assert_eq!(preview.observed_vms, 1);
        assert_eq!(preview.proposals.len(), 1);
        assert_eq!(preview.proposals[0].node, "pve1");
    }

    #[tokio::test]
    async fn vanished_vm_lands_in_missing_exactly_once() {
        let mock = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryHostStore::with_records([mapped(
            "vm-42-old",
            "pve1",
            42,
        )]));

        let (reconciler, _) = reconciler(mock, store);
        let preview = reconciler.preview().await.unwrap();

        assert_eq!(preview.missing.len(), 1);
        assert_eq!(preview.missing[0].hostname, "vm-42-old");
        assert_eq!(preview.missing[0].vmid, 42);
        assert_eq!(preview.observed_vms, 0);
    }

    #[tokio::test]
    async fn status_probe_rescues_vm_hidden_from_listings() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        mock.hide_from_listings("pve1", 107);
        let store = Arc::new(MemoryHostStore::with_records([mapped(
            "vm-107-db1",
            "pve1",
            107,
        )]));

        let (reconciler, _) = reconciler(mock, store);
        let preview = reconciler.preview().await.unwrap();

        assert!(preview.missing.is_empty());
    }

    #[tokio::test]
    async fn reused_vmid_under_new_identity_counts_as_missing() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 200, "replacement", "running");
        // No stored node: presence would rest on the bare vmid alone.
        let store = Arc::new(MemoryHostStore::with_records([HostRecord {
            vmid: Some(200),
            ..HostRecord::new("web1")
        }]));

        let (reconciler, _) = reconciler(mock, store);
        let preview = reconciler.preview().await.unwrap();

        assert_eq!(preview.missing.len(), 1);
        assert_eq!(preview.missing[0].hostname, "web1");
    }

    #[tokio::test]
    async fn apply_writes_mapping_and_is_idempotent() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new(
            "vm-107-db1",
        )]));

        let (reconciler, audit) = reconciler(mock, store.clone());
        let preview = reconciler.preview().await.unwrap();
        assert_eq!(reconciler.apply(&preview.proposals).await.unwrap(), 1);
        assert_eq!(reconciler.apply(&preview.proposals).await.unwrap(), 1);

        let record = store.find_by_hostname("vm-107-db1").await.unwrap().unwrap();
        assert_eq!(record.node.as_deref(), Some("pve1"));
        assert_eq!(record.vmid, Some(107));
        assert_eq!(audit.entries().len(), 2);

        // Once applied, a fresh preview proposes nothing.
        let preview = reconciler.preview().await.unwrap();
        assert!(preview.proposals.is_empty());
    }

    #[tokio::test]
    async fn apply_skips_proposals_for_deleted_records() {
        let mock = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryHostStore::new());

        let (reconciler, _) = reconciler(mock, store);
        let orphan = DiscoveryProposal {
            hostname: "gone".into(),
            node: "pve1".into(),
            vmid: 1,
            reason: "vmid-prefix".into(),
        };
        assert_eq!(reconciler.apply(&[orphan]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_mappings_is_a_noop_without_a_mapping() {
        let mock = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryHostStore::with_records([
            mapped("web1", "pve1", 100),
            HostRecord::new("bastion"),
        ]));

        let (reconciler, _) = reconciler(mock, store.clone());
        let cleared = reconciler
            .clear_mappings(&["web1".to_string(), "bastion".to_string()])
            .await
            .unwrap();

        assert_eq!(cleared, 1);
        let record = store.find_by_hostname("web1").await.unwrap().unwrap();
        assert_eq!(record.node, None);
        assert_eq!(record.vmid, None);
    }

    #[tokio::test]
    async fn archive_adds_retired_tag_at_most_once() {
        let mock = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryHostStore::with_records([HostRecord {
            tags: vec!["prod".into()],
            ..mapped("vm-42-old", "pve1", 42)
        }]));

        let (reconciler, _) = reconciler(mock, store.clone());
        let preview = reconciler.preview().await.unwrap();
        assert_eq!(reconciler.archive_missing(&preview.missing).await.unwrap(), 1);
        assert_eq!(reconciler.archive_missing(&preview.missing).await.unwrap(), 1);

        let record = store.find_by_hostname("vm-42-old").await.unwrap().unwrap();
        assert_eq!(record.tags, vec!["prod".to_string(), "retired".to_string()]);
        assert_eq!(record.node, None);
        assert_eq!(record.vmid, None);
    }
}

//! Resolving inventory records to cluster VM identities.
//!
//! The fleet's hostname convention is `vm-<vmid>-<name>`; when a record
//! has no explicit mapping, the vmid can often be recovered from the
//! hostname alone.

use opsboard_proxmox::VmIdentity;

use crate::store::HostRecord;

/// Result of resolving a record to something the cluster can address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedIdentity {
    /// The record maps onto a VM.
    Vm(VmIdentity),
    /// The record carries no vmid and its hostname encodes none; the
    /// host is tracked but is not a managed VM.
    NotAVm,
}

impl ResolvedIdentity {
    pub fn as_vm(&self) -> Option<&VmIdentity> {
        match self {
            ResolvedIdentity::Vm(identity) => Some(identity),
            ResolvedIdentity::NotAVm => None,
        }
    }
}

/// Resolve a record to a VM identity.
///
/// The vmid comes from the stored mapping, falling back to the
/// `vm-<vmid>-` hostname prefix. The node comes from the stored
/// mapping, falling back to `default_node`.
pub fn resolve(record: &HostRecord, default_node: &str) -> ResolvedIdentity {
    let vmid = record.vmid.or_else(|| vmid_from_hostname(&record.hostname));
    let Some(vmid) = vmid else {
        return ResolvedIdentity::NotAVm;
    };
    let node = record
        .node
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or(default_node);
    ResolvedIdentity::Vm(VmIdentity::new(node, vmid))
}

/// Extract the vmid from a `vm-<vmid>-<rest>` hostname, if it has one.
pub fn vmid_from_hostname(hostname: &str) -> Option<u32> {
    let rest = hostname
        .get(..3)
        .filter(|p| p.eq_ignore_ascii_case("vm-"))
        .map(|_| &hostname[3..])?;
    let (digits, _) = rest.split_once('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The conventional hostname for a VM: `vm-<vmid>-<name>`, lowercased.
pub fn expected_hostname(vmid: u32, name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        format!("vm-{vmid}")
    } else {
        format!("vm-{vmid}-{}", name.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_prefix_yields_vmid() {
        assert_eq!(vmid_from_hostname("vm-107-db1"), Some(107));
        assert_eq!(vmid_from_hostname("VM-42-Web"), Some(42));
    }

    #[test]
    fn prefix_requires_trailing_dash_and_digits() {
        assert_eq!(vmid_from_hostname("vm-107"), None);
        assert_eq!(vmid_from_hostname("vm--db1"), None);
        assert_eq!(vmid_from_hostname("vm-1a7-db1"), None);
        assert_eq!(vmid_from_hostname("db1"), None);
        assert_eq!(vmid_from_hostname("vm"), None);
    }

    #[test]
    fn stored_mapping_wins_over_hostname() {
        let record = HostRecord {
            node: Some("pve2".into()),
            vmid: Some(200),
            ..HostRecord::new("vm-107-db1")
        };
        assert_eq!(
            resolve(&record, "pve1"),
            ResolvedIdentity::Vm(VmIdentity::new("pve2", 200))
        );
    }

    #[test]
    fn missing_node_falls_back_to_default() {
        let record = HostRecord::new("vm-107-db1");
        assert_eq!(
            resolve(&record, "pve1"),
            ResolvedIdentity::Vm(VmIdentity::new("pve1", 107))
        );
    }

    #[test]
    fn no_vmid_anywhere_is_not_a_vm() {
        let record = HostRecord::new("bastion");
        assert_eq!(resolve(&record, "pve1"), ResolvedIdentity::NotAVm);
    }

    #[test]
    fn expected_hostname_lowercases_name() {
        assert_eq!(expected_hostname(107, "DB1"), "vm-107-db1");
        assert_eq!(expected_hostname(107, ""), "vm-107");
        assert_eq!(expected_hostname(107, "  db1 "), "vm-107-db1");
    }
}

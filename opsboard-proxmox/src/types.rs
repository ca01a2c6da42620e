//! Wire types for the Proxmox VE API.
//!
//! The API wraps every response in a `{"data": ...}` envelope and uses
//! kebab-case field names for guest-agent payloads (`out-data`,
//! `ip-addresses`, ...). Fields we do not consume are left out; serde
//! ignores unknown keys by default.

use serde::{Deserialize, Deserializer, Serialize};

/// Identity of a VM on the cluster: node name plus numeric VM id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmIdentity {
    /// Cluster node hosting the VM (e.g. "pve1").
    pub node: String,
    /// Numeric VM id, unique within a node.
    pub vmid: u32,
}

impl VmIdentity {
    pub fn new(node: impl Into<String>, vmid: u32) -> Self {
        Self {
            node: node.into(),
            vmid,
        }
    }
}

impl std::fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node, self.vmid)
    }
}

/// VM kinds a node can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmKind {
    Qemu,
    Lxc,
}

impl VmKind {
    /// All kinds enumerated by the per-node inventory fallback.
    pub const ALL: [VmKind; 2] = [VmKind::Qemu, VmKind::Lxc];

    /// Path segment for `/nodes/{node}/{kind}`.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmKind::Qemu => "qemu",
            VmKind::Lxc => "lxc",
        }
    }
}

impl std::fmt::Display for VmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `{"data": ...}` envelope every Proxmox response uses.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiEnvelope<T> {
    pub data: T,
}

/// One entry from `/cluster/resources?type=vm`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterResource {
    /// Resource type ("qemu" or "lxc").
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Node the VM lives on.
    #[serde(default)]
    pub node: Option<String>,
    /// Numeric VM id.
    #[serde(default)]
    pub vmid: Option<u32>,
    /// VM display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Power state as reported by the cluster (e.g. "running").
    #[serde(default)]
    pub status: Option<String>,
}

/// A node in the cluster, as returned by `/nodes`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeListItem {
    /// The node name (e.g. "pve1").
    pub node: String,
    /// Current node status (e.g. "online", "offline", "unknown").
    #[serde(default)]
    pub status: Option<String>,
}

/// One VM from `/nodes/{node}/{qemu|lxc}`.
#[derive(Debug, Clone, Deserialize)]
pub struct VmListItem {
    /// Numeric VM id.
    pub vmid: u32,
    /// VM display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Power state.
    #[serde(default)]
    pub status: Option<String>,
}

/// Current VM status from `/nodes/{node}/qemu/{vmid}/status/current`.
#[derive(Debug, Clone, Deserialize)]
pub struct VmCurrentStatus {
    /// Power state ("running", "stopped", ...).
    #[serde(default)]
    pub status: String,
    /// VM display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Uptime in seconds, when running.
    #[serde(default)]
    pub uptime: Option<u64>,
}

/// Guest OS information from `/agent/get-osinfo`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OsInfo {
    /// Distro id (e.g. "ubuntu").
    #[serde(default)]
    pub id: Option<String>,
    /// OS name.
    #[serde(default)]
    pub name: Option<String>,
    /// Human-readable name (e.g. "Ubuntu 22.04.3 LTS").
    #[serde(default)]
    pub pretty_name: Option<String>,
    /// OS version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Kernel release.
    #[serde(default)]
    pub kernel_release: Option<String>,
}

/// One interface from `/agent/network-get-interfaces`.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInterface {
    /// Interface name inside the guest (e.g. "eth0").
    #[serde(default)]
    pub name: Option<String>,
    /// Addresses bound to the interface.
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<IpAddressEntry>,
}

/// One address in an interface's `ip-addresses` list.
#[derive(Debug, Clone, Deserialize)]
pub struct IpAddressEntry {
    /// "ipv4" or "ipv6".
    #[serde(rename = "ip-address-type", default)]
    pub kind: String,
    /// The address itself, without prefix.
    #[serde(rename = "ip-address", default)]
    pub address: String,
}

/// Response to a guest exec submission.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GuestExecStarted {
    pub pid: u32,
}

/// Guest process status from `/agent/exec-status?pid=`.
///
/// `exited` arrives as an integer flag (0/1) on current Proxmox versions
/// but has been seen as a boolean; accept both.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecStatus {
    #[serde(default, deserialize_with = "flag_from_any")]
    pub exited: bool,
    #[serde(default)]
    pub exitcode: Option<i32>,
    #[serde(rename = "out-data", default)]
    pub out_data: Option<String>,
    #[serde(rename = "err-data", default)]
    pub err_data: Option<String>,
}

fn flag_from_any<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_status_accepts_integer_exited_flag() {
        let st: ExecStatus = serde_json::from_str(
            r#"{"exited":1,"exitcode":0,"out-data":"hello\n","err-data":""}"#,
        )
        .unwrap();
        assert!(st.exited);
        assert_eq!(st.exitcode, Some(0));
        assert_eq!(st.out_data.as_deref(), Some("hello\n"));
    }

    #[test]
    fn exec_status_accepts_boolean_exited_flag() {
        let st: ExecStatus = serde_json::from_str(r#"{"exited":false}"#).unwrap();
        assert!(!st.exited);
        assert_eq!(st.exitcode, None);
    }

    #[test]
    fn network_interfaces_parse_kebab_case() {
        let raw = r#"[
            {"name":"lo","ip-addresses":[{"ip-address-type":"ipv4","ip-address":"127.0.0.1","prefix":8}]},
            {"name":"eth0","ip-addresses":[{"ip-address-type":"ipv4","ip-address":"192.168.1.5","prefix":24},
                                           {"ip-address-type":"ipv6","ip-address":"fe80::1","prefix":64}]}
        ]"#;
        let ifs: Vec<NetworkInterface> = serde_json::from_str(raw).unwrap();
        assert_eq!(ifs.len(), 2);
        assert_eq!(ifs[1].ip_addresses[0].address, "192.168.1.5");
        assert_eq!(ifs[1].ip_addresses[1].kind, "ipv6");
    }

    #[test]
    fn cluster_resource_tolerates_missing_fields() {
        let r: ClusterResource =
            serde_json::from_str(r#"{"type":"qemu","node":"pve1","vmid":107,"name":"db1"}"#)
                .unwrap();
        assert_eq!(r.vmid, Some(107));
        assert_eq!(r.status, None);
    }
}

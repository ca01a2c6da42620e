//! Cluster capability trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// One operation per remote capability of the hypervisor control API.
///
/// The live status cache and the inventory reconciler are written
/// against this trait so they can run on the real [`crate::ProxmoxClient`]
/// or on [`crate::mock::MockCluster`] in tests and dev mode.
///
/// Lifecycle actions return the opaque task id (UPID) the cluster uses
/// to track asynchronous completion; this layer does not poll those.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    // =========================================================================
    // VM lifecycle
    // =========================================================================

    /// Start a VM. Returns the task id.
    async fn start_vm(&self, node: &str, vmid: u32) -> Result<String>;

    /// Graceful (ACPI) shutdown. Returns the task id.
    async fn shutdown_vm(&self, node: &str, vmid: u32) -> Result<String>;

    /// Hard stop. Returns the task id.
    async fn stop_vm(&self, node: &str, vmid: u32) -> Result<String>;

    /// Hard reset. Returns the task id.
    async fn reset_vm(&self, node: &str, vmid: u32) -> Result<String>;

    // =========================================================================
    // VM status
    // =========================================================================

    /// Current power state of a VM. 404 means the VM does not exist.
    async fn vm_current_status(&self, node: &str, vmid: u32) -> Result<VmCurrentStatus>;

    // =========================================================================
    // Guest agent
    // =========================================================================

    /// Ping the guest agent. Ok means the agent answered.
    async fn agent_ping(&self, node: &str, vmid: u32) -> Result<()>;

    /// Guest OS information.
    async fn agent_os_info(&self, node: &str, vmid: u32) -> Result<OsInfo>;

    /// Network interfaces as seen from inside the guest.
    async fn agent_network_interfaces(&self, node: &str, vmid: u32)
        -> Result<Vec<NetworkInterface>>;

    /// Submit a command for execution inside the guest.
    ///
    /// `command` is `[program, arg1, arg2, ...]` and must not be empty.
    /// Returns the guest-side process id.
    async fn guest_exec(
        &self,
        node: &str,
        vmid: u32,
        command: &[String],
        input: Option<&str>,
    ) -> Result<u32>;

    /// Poll a previously submitted guest command.
    async fn guest_exec_status(&self, node: &str, vmid: u32, pid: u32) -> Result<ExecStatus>;

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Cluster-wide VM listing (`/cluster/resources?type=vm`).
    async fn cluster_resources(&self) -> Result<Vec<ClusterResource>>;

    /// All cluster nodes.
    async fn list_nodes(&self) -> Result<Vec<NodeListItem>>;

    /// VMs of one kind on one node.
    async fn list_node_vms(&self, node: &str, kind: VmKind) -> Result<Vec<VmListItem>>;
}

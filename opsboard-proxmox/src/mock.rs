//! Mock cluster backend for testing and development.
//!
//! Simulates the control API in memory: VMs with power states, agent
//! reachability, interface lists, and scripted guest-exec outcomes.
//! Useful for unit tests and for running the daemon without a cluster.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ProxmoxError, Result};
use crate::traits::ClusterApi;
use crate::types::*;

struct MockVm {
    name: String,
    status: String,
    kind: VmKind,
    agent: bool,
    interfaces: Vec<NetworkInterface>,
}

/// Scripted outcome for one guest-exec submission.
enum ExecScript {
    /// Report "not exited" for N polls, then exit with the given result.
    Exits {
        polls_left: usize,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// Never report exited.
    NeverExits,
}

/// In-memory [`ClusterApi`] implementation.
pub struct MockCluster {
    vms: Mutex<HashMap<(String, u32), MockVm>>,
    extra_nodes: Mutex<Vec<String>>,
    scripts: Mutex<VecDeque<ExecScript>>,
    running: Mutex<HashMap<u32, ExecScript>>,
    next_pid: AtomicU32,
    exec_calls: AtomicUsize,
    exec_status_calls: AtomicUsize,
    cluster_listing_fails: AtomicBool,
    exec_status_fails: AtomicBool,
    hidden_from_listings: Mutex<HashSet<(String, u32)>>,
    actions: Mutex<Vec<String>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            vms: Mutex::new(HashMap::new()),
            extra_nodes: Mutex::new(Vec::new()),
            scripts: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1000),
            exec_calls: AtomicUsize::new(0),
            exec_status_calls: AtomicUsize::new(0),
            cluster_listing_fails: AtomicBool::new(false),
            exec_status_fails: AtomicBool::new(false),
            hidden_from_listings: Mutex::new(HashSet::new()),
            actions: Mutex::new(Vec::new()),
        }
    }

    // =========================================================================
    // Setup
    // =========================================================================

    pub fn add_vm(&self, node: &str, vmid: u32, name: &str, status: &str) {
        self.add_vm_kind(node, vmid, name, status, VmKind::Qemu);
    }

    pub fn add_vm_kind(&self, node: &str, vmid: u32, name: &str, status: &str, kind: VmKind) {
        self.vms.lock().expect("mock lock").insert(
            (node.to_string(), vmid),
            MockVm {
                name: name.to_string(),
                status: status.to_string(),
                kind,
                agent: false,
                interfaces: Vec::new(),
            },
        );
    }

    pub fn remove_vm(&self, node: &str, vmid: u32) {
        self.vms
            .lock()
            .expect("mock lock")
            .remove(&(node.to_string(), vmid));
    }

    pub fn set_status(&self, node: &str, vmid: u32, status: &str) {
        if let Some(vm) = self
            .vms
            .lock()
            .expect("mock lock")
            .get_mut(&(node.to_string(), vmid))
        {
            vm.status = status.to_string();
        }
    }

    pub fn set_agent(&self, node: &str, vmid: u32, reachable: bool) {
        if let Some(vm) = self
            .vms
            .lock()
            .expect("mock lock")
            .get_mut(&(node.to_string(), vmid))
        {
            vm.agent = reachable;
        }
    }

    pub fn set_interfaces(&self, node: &str, vmid: u32, interfaces: Vec<NetworkInterface>) {
        if let Some(vm) = self
            .vms
            .lock()
            .expect("mock lock")
            .get_mut(&(node.to_string(), vmid))
        {
            vm.interfaces = interfaces;
        }
    }

    /// Register a node that exists even with no VMs on it.
    pub fn add_node(&self, node: &str) {
        self.extra_nodes
            .lock()
            .expect("mock lock")
            .push(node.to_string());
    }

    /// Queue an exec outcome: "not exited" for `polls` polls, then exit.
    pub fn push_exec_result(&self, polls: usize, exit_code: i32, stdout: &str, stderr: &str) {
        self.scripts
            .lock()
            .expect("mock lock")
            .push_back(ExecScript::Exits {
                polls_left: polls,
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
    }

    /// Queue an exec that never reports exited.
    pub fn push_exec_never_exits(&self) {
        self.scripts
            .lock()
            .expect("mock lock")
            .push_back(ExecScript::NeverExits);
    }

    /// Make `cluster_resources` fail, forcing the per-node fallback.
    pub fn fail_cluster_listing(&self, fail: bool) {
        self.cluster_listing_fails.store(fail, Ordering::SeqCst);
    }

    /// Make every exec-status poll fail.
    pub fn fail_exec_status(&self, fail: bool) {
        self.exec_status_fails.store(fail, Ordering::SeqCst);
    }

    /// Drop a VM from inventory listings while keeping it reachable
    /// through direct status calls. Simulates a token whose role can
    /// see the VM but not enumerate it.
    pub fn hide_from_listings(&self, node: &str, vmid: u32) {
        self.hidden_from_listings
            .lock()
            .expect("mock lock")
            .insert((node.to_string(), vmid));
    }

    /// Build an interface with IPv4 addresses, for `set_interfaces`.
    pub fn ipv4_interface(name: &str, addresses: &[&str]) -> NetworkInterface {
        NetworkInterface {
            name: Some(name.to_string()),
            ip_addresses: addresses
                .iter()
                .map(|a| IpAddressEntry {
                    kind: "ipv4".to_string(),
                    address: a.to_string(),
                })
                .collect(),
        }
    }

    // =========================================================================
    // Assertions
    // =========================================================================

    pub fn exec_calls(&self) -> usize {
        self.exec_calls.load(Ordering::SeqCst)
    }

    pub fn exec_status_calls(&self) -> usize {
        self.exec_status_calls.load(Ordering::SeqCst)
    }

    /// Lifecycle actions in submission order, as "action node/vmid".
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().expect("mock lock").clone()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lookup<T>(
        &self,
        node: &str,
        vmid: u32,
        f: impl FnOnce(&MockVm) -> T,
    ) -> Result<T> {
        let vms = self.vms.lock().expect("mock lock");
        match vms.get(&(node.to_string(), vmid)) {
            Some(vm) => Ok(f(vm)),
            None => Err(ProxmoxError::api(
                404,
                format!("no such VM '{vmid}' on node '{node}'"),
            )),
        }
    }

    fn lifecycle(&self, action: &str, node: &str, vmid: u32, new_status: &str) -> Result<String> {
        let mut vms = self.vms.lock().expect("mock lock");
        let vm = vms.get_mut(&(node.to_string(), vmid)).ok_or_else(|| {
            ProxmoxError::api(404, format!("no such VM '{vmid}' on node '{node}'"))
        })?;
        vm.status = new_status.to_string();
        self.actions
            .lock()
            .expect("mock lock")
            .push(format!("{action} {node}/{vmid}"));
        Ok(format!("UPID:{node}:mock:{action}:{vmid}"))
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn start_vm(&self, node: &str, vmid: u32) -> Result<String> {
        self.lifecycle("start", node, vmid, "running")
    }

    async fn shutdown_vm(&self, node: &str, vmid: u32) -> Result<String> {
        self.lifecycle("shutdown", node, vmid, "stopped")
    }

    async fn stop_vm(&self, node: &str, vmid: u32) -> Result<String> {
        self.lifecycle("stop", node, vmid, "stopped")
    }

    async fn reset_vm(&self, node: &str, vmid: u32) -> Result<String> {
        self.lifecycle("reset", node, vmid, "running")
    }

    async fn vm_current_status(&self, node: &str, vmid: u32) -> Result<VmCurrentStatus> {
        self.lookup(node, vmid, |vm| VmCurrentStatus {
            status: vm.status.clone(),
            name: Some(vm.name.clone()),
            uptime: None,
        })
    }

    async fn agent_ping(&self, node: &str, vmid: u32) -> Result<()> {
        let reachable = self.lookup(node, vmid, |vm| vm.agent)?;
        if reachable {
            Ok(())
        } else {
            Err(ProxmoxError::api(596, "guest agent is not running"))
        }
    }

    async fn agent_os_info(&self, node: &str, vmid: u32) -> Result<OsInfo> {
        self.lookup(node, vmid, |_| OsInfo {
            id: Some("mock".to_string()),
            name: Some("MockOS".to_string()),
            pretty_name: Some("MockOS 1.0".to_string()),
            version: Some("1.0".to_string()),
            kernel_release: None,
        })
    }

    async fn agent_network_interfaces(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<Vec<NetworkInterface>> {
        self.lookup(node, vmid, |vm| vm.interfaces.clone())
    }

    async fn guest_exec(
        &self,
        node: &str,
        vmid: u32,
        command: &[String],
        _input: Option<&str>,
    ) -> Result<u32> {
        if command.is_empty() {
            return Err(ProxmoxError::InvalidRequest(
                "command must contain at least the program".into(),
            ));
        }
        self.lookup(node, vmid, |_| ())?;
        self.exec_calls.fetch_add(1, Ordering::SeqCst);

        let script = self
            .scripts
            .lock()
            .expect("mock lock")
            .pop_front()
            .unwrap_or(ExecScript::Exits {
                polls_left: 0,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.running.lock().expect("mock lock").insert(pid, script);
        Ok(pid)
    }

    async fn guest_exec_status(&self, _node: &str, _vmid: u32, pid: u32) -> Result<ExecStatus> {
        self.exec_status_calls.fetch_add(1, Ordering::SeqCst);
        if self.exec_status_fails.load(Ordering::SeqCst) {
            return Err(ProxmoxError::api(500, "mock exec-status failure"));
        }

        let mut running = self.running.lock().expect("mock lock");
        match running.get_mut(&pid) {
            Some(ExecScript::NeverExits) => Ok(ExecStatus::default()),
            Some(ExecScript::Exits {
                polls_left,
                exit_code,
                stdout,
                stderr,
            }) => {
                if *polls_left > 0 {
                    *polls_left -= 1;
                    Ok(ExecStatus::default())
                } else {
                    Ok(ExecStatus {
                        exited: true,
                        exitcode: Some(*exit_code),
                        out_data: Some(stdout.clone()),
                        err_data: Some(stderr.clone()),
                    })
                }
            }
            None => Err(ProxmoxError::api(500, format!("unknown pid {pid}"))),
        }
    }

    async fn cluster_resources(&self) -> Result<Vec<ClusterResource>> {
        if self.cluster_listing_fails.load(Ordering::SeqCst) {
            return Err(ProxmoxError::api(403, "cluster scope not permitted"));
        }
        let vms = self.vms.lock().expect("mock lock");
        let hidden = self.hidden_from_listings.lock().expect("mock lock");
        Ok(vms
            .iter()
            .filter(|(key, _)| !hidden.contains(key))
            .map(|((node, vmid), vm)| ClusterResource {
                kind: Some(vm.kind.as_str().to_string()),
                node: Some(node.clone()),
                vmid: Some(*vmid),
                name: Some(vm.name.clone()),
                status: Some(vm.status.clone()),
            })
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeListItem>> {
        let vms = self.vms.lock().expect("mock lock");
        let mut nodes: Vec<String> = self.extra_nodes.lock().expect("mock lock").clone();
        for (node, _) in vms.keys() {
            if !nodes.contains(node) {
                nodes.push(node.clone());
            }
        }
        nodes.sort();
        Ok(nodes
            .into_iter()
            .map(|node| NodeListItem {
                node,
                status: Some("online".to_string()),
            })
            .collect())
    }

    async fn list_node_vms(&self, node: &str, kind: VmKind) -> Result<Vec<VmListItem>> {
        let vms = self.vms.lock().expect("mock lock");
        let hidden = self.hidden_from_listings.lock().expect("mock lock");
        Ok(vms
            .iter()
            .filter(|(key, vm)| key.0 == node && vm.kind == kind && !hidden.contains(*key))
            .map(|((_, vmid), vm)| VmListItem {
                vmid: *vmid,
                name: Some(vm.name.clone()),
                status: Some(vm.status.clone()),
            })
            .collect())
    }
}

//! Process diagnostics, remote and local.
//!
//! Remote diagnostics run `ps` inside a guest through the agent and
//! parse its output; local diagnostics sample the daemon's own host
//! via sysinfo for machines that are tracked but are not VMs.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sysinfo::{
    CpuRefreshKind, MemoryRefreshKind, ProcessRefreshKind, RefreshKind, System,
    MINIMUM_CPU_UPDATE_INTERVAL,
};
use tracing::debug;

use opsboard_proxmox::{ClusterApi, RemoteExecutor, VmIdentity};

use crate::error::Result;

/// One process in a diagnostic sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopProcess {
    pub pid: u32,
    pub name: String,
    /// CPU usage in percent of one machine (not one core).
    pub cpu: f64,
    /// Memory usage in percent of total.
    pub mem: f64,
}

/// Top-N processes by CPU and by memory, plus the guest OS name.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub os: Option<String>,
    pub cpu_top: Vec<TopProcess>,
    pub mem_top: Vec<TopProcess>,
}

const PS_TIMEOUT: Duration = Duration::from_secs(8);

/// `ps` invocation listing the top `n` processes by the given sort key
/// ("cpu" or "mem"). Output lines are `pid comm %cpu %mem`.
pub(crate) fn ps_command(sort: &str, n: usize) -> String {
    format!("ps -eo pid,comm,%cpu,%mem --no-headers --sort=-%{sort} | head -n {n}")
}

/// Parse one `pid comm %cpu %mem` line. Lines that do not fit the
/// shape (e.g. a comm containing spaces) are skipped by callers.
pub(crate) fn parse_ps_line(line: &str) -> Option<TopProcess> {
    let mut parts = line.split_whitespace();
    let pid = parts.next()?.parse().ok()?;
    let name = parts.next()?.to_string();
    let cpu = parts.next()?.parse().ok()?;
    let mem = parts.next()?.parse().ok()?;
    Some(TopProcess {
        pid,
        name,
        cpu,
        mem,
    })
}

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Guest-side diagnostics over the agent exec channel.
pub struct GuestDiagnostics {
    api: Arc<dyn ClusterApi>,
    executor: RemoteExecutor,
}

impl GuestDiagnostics {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        let executor = RemoteExecutor::new(api.clone());
        Self { api, executor }
    }

    /// Sample the guest: OS name plus top-N processes by CPU and by
    /// memory. `%cpu` from `ps` is per-core and is left as reported;
    /// the live cache normalizes its single-process capture instead.
    pub async fn diagnose(&self, identity: &VmIdentity, top_n: usize) -> Result<DiagnosticReport> {
        let os = match self.api.agent_os_info(&identity.node, identity.vmid).await {
            Ok(info) => info.pretty_name.or(info.name),
            Err(err) => {
                debug!(vm = %identity, error = %err, "os info unavailable");
                None
            }
        };

        let cpu_top = self.run_ps(identity, "cpu", top_n).await?;
        let mem_top = self.run_ps(identity, "mem", top_n).await?;
        Ok(DiagnosticReport {
            os,
            cpu_top,
            mem_top,
        })
    }

    /// One-line summary of the busiest process, or `None` when the
    /// guest cannot be sampled.
    pub async fn capture_top_process(&self, identity: &VmIdentity) -> Option<String> {
        let top = self
            .run_ps(identity, "cpu", 1)
            .await
            .ok()?
            .into_iter()
            .next()?;
        Some(format!(
            "{} (pid {}) cpu {:.1}% mem {:.1}%",
            top.name, top.pid, top.cpu, top.mem
        ))
    }

    async fn run_ps(
        &self,
        identity: &VmIdentity,
        sort: &str,
        top_n: usize,
    ) -> Result<Vec<TopProcess>> {
        let outcome = self
            .executor
            .execute(
                identity,
                "/bin/sh",
                &["-lc".to_string(), ps_command(sort, top_n)],
                None,
                Some(PS_TIMEOUT),
            )
            .await?;
        if outcome.exit_code != 0 {
            debug!(vm = %identity, exit_code = outcome.exit_code, sort, "ps failed in guest");
            return Ok(Vec::new());
        }
        Ok(outcome.stdout.lines().filter_map(parse_ps_line).collect())
    }
}

/// Diagnostics for hosts that are the daemon's own machine.
pub struct LocalDiagnostics {
    local_hosts: Vec<String>,
}

impl LocalDiagnostics {
    /// `local_hosts` are hostnames to treat as this machine, in
    /// addition to the machine's own hostname.
    pub fn new(local_hosts: Vec<String>) -> Self {
        Self { local_hosts }
    }

    /// Whether the hostname refers to the machine the daemon runs on.
    pub fn is_local_host(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        if self
            .local_hosts
            .iter()
            .any(|h| h.trim().eq_ignore_ascii_case(candidate))
        {
            return true;
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .is_some_and(|h| h.eq_ignore_ascii_case(candidate))
    }

    /// Sample local processes: top-N by CPU and by memory.
    ///
    /// CPU percentages need two refreshes with a delay in between, so
    /// this takes at least [`MINIMUM_CPU_UPDATE_INTERVAL`].
    pub async fn sample(&self, top_n: usize) -> (Vec<TopProcess>, Vec<TopProcess>) {
        let process_refresh = ProcessRefreshKind::everything();
        let mut system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything())
                .with_processes(process_refresh),
        );
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_processes_specifics(process_refresh);

        let cores = system.cpus().len().max(1) as f64;
        let total_mem = system.total_memory().max(1) as f64;
        let mut processes: Vec<TopProcess> = system
            .processes()
            .values()
            .map(|p| TopProcess {
                pid: p.pid().as_u32(),
                name: p.name().to_string(),
                cpu: round1(f64::from(p.cpu_usage()) / cores),
                mem: round1(p.memory() as f64 / total_mem * 100.0),
            })
            .collect();

        processes.sort_by(|a, b| b.cpu.total_cmp(&a.cpu));
        let cpu_top: Vec<TopProcess> = processes.iter().take(top_n).cloned().collect();
        processes.sort_by(|a, b| b.mem.total_cmp(&a.mem));
        processes.truncate(top_n);
        (cpu_top, processes)
    }

    /// The single busiest process by CPU, for the live cache.
    pub async fn top_by_cpu(&self) -> Option<TopProcess> {
        let (cpu_top, _) = self.sample(1).await;
        cpu_top.into_iter().next()
    }
}

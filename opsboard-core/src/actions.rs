//! Lifecycle and remote-exec operations addressed by hostname.
//!
//! Every operation resolves the hostname through the inventory, acts
//! on the mapped VM and writes an audit record naming the actor.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use opsboard_proxmox::{ClusterApi, ExecOutcome, RemoteExecutor, VmIdentity};

use crate::error::{CoreError, Result};
use crate::identity::{self, ResolvedIdentity};
use crate::store::{AuditSink, HostStore};

pub struct FleetActions {
    api: Arc<dyn ClusterApi>,
    executor: RemoteExecutor,
    store: Arc<dyn HostStore>,
    audit: Arc<dyn AuditSink>,
    default_node: String,
}

impl FleetActions {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        store: Arc<dyn HostStore>,
        audit: Arc<dyn AuditSink>,
        default_node: impl Into<String>,
    ) -> Self {
        let executor = RemoteExecutor::new(api.clone());
        Self {
            api,
            executor,
            store,
            audit,
            default_node: default_node.into(),
        }
    }

    /// Start the VM behind `hostname`. Returns the cluster task id.
    pub async fn start(&self, actor: &str, hostname: &str) -> Result<String> {
        let identity = self.identity_for(hostname).await?;
        let upid = self.api.start_vm(&identity.node, identity.vmid).await?;
        self.finish(actor, "start", hostname, &identity, &upid).await;
        Ok(upid)
    }

    /// Graceful (ACPI) shutdown.
    pub async fn shutdown(&self, actor: &str, hostname: &str) -> Result<String> {
        let identity = self.identity_for(hostname).await?;
        let upid = self.api.shutdown_vm(&identity.node, identity.vmid).await?;
        self.finish(actor, "shutdown", hostname, &identity, &upid)
            .await;
        Ok(upid)
    }

    /// Hard stop.
    pub async fn stop(&self, actor: &str, hostname: &str) -> Result<String> {
        let identity = self.identity_for(hostname).await?;
        let upid = self.api.stop_vm(&identity.node, identity.vmid).await?;
        self.finish(actor, "stop", hostname, &identity, &upid).await;
        Ok(upid)
    }

    /// Hard reset.
    pub async fn reset(&self, actor: &str, hostname: &str) -> Result<String> {
        let identity = self.identity_for(hostname).await?;
        let upid = self.api.reset_vm(&identity.node, identity.vmid).await?;
        self.finish(actor, "reset", hostname, &identity, &upid).await;
        Ok(upid)
    }

    /// Run a command inside the guest behind `hostname` and wait for
    /// it up to `timeout`. The audit record carries the exit code.
    pub async fn exec(
        &self,
        actor: &str,
        hostname: &str,
        program: &str,
        args: &[String],
        input: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome> {
        let identity = self.identity_for(hostname).await?;
        let outcome = self
            .executor
            .execute(&identity, program, args, input, timeout)
            .await?;
        self.audit
            .record(
                actor,
                "exec",
                hostname,
                &format!("{program} -> exit {}", outcome.exit_code),
            )
            .await;
        Ok(outcome)
    }

    async fn identity_for(&self, hostname: &str) -> Result<VmIdentity> {
        let record = self
            .store
            .find_by_hostname(hostname)
            .await?
            .ok_or_else(|| CoreError::HostNotFound(hostname.to_string()))?;
        match identity::resolve(&record, &self.default_node) {
            ResolvedIdentity::Vm(identity) => Ok(identity),
            ResolvedIdentity::NotAVm => Err(CoreError::NotAVm(record.hostname)),
        }
    }

    async fn finish(
        &self,
        actor: &str,
        action: &str,
        hostname: &str,
        identity: &VmIdentity,
        upid: &str,
    ) {
        info!(actor, action, host = hostname, vm = %identity, upid, "lifecycle action submitted");
        self.audit
            .record(actor, action, hostname, &identity.to_string())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsboard_proxmox::mock::MockCluster;

    use crate::store::{HostRecord, MemoryAudit, MemoryHostStore};

    fn actions(
        mock: Arc<MockCluster>,
        store: Arc<MemoryHostStore>,
    ) -> (FleetActions, Arc<MemoryAudit>) {
        let audit = Arc::new(MemoryAudit::new());
        (
            FleetActions::new(mock, store, audit.clone(), "pve1"),
            audit,
        )
    }

    #[tokio::test]
    async fn start_resolves_mapping_and_audits() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve2", 200, "web1", "stopped");
        let store = Arc::new(MemoryHostStore::with_records([HostRecord {
            node: Some("pve2".into()),
            vmid: Some(200),
            ..HostRecord::new("web1")
        }]));

        let (actions, audit) = actions(mock.clone(), store);
        let upid = actions.start("alice", "web1").await.unwrap();

        assert!(upid.contains("start"));
        assert_eq!(mock.actions(), vec!["start pve2/200".to_string()]);
        assert_eq!(audit.entries(), vec!["alice start web1 pve2/200".to_string()]);
    }

    #[tokio::test]
    async fn hostname_convention_suffices_without_stored_mapping() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new(
            "vm-107-db1",
        )]));

        let (actions, _) = actions(mock.clone(), store);
        actions.shutdown("bob", "vm-107-db1").await.unwrap();
        assert_eq!(mock.actions(), vec!["shutdown pve1/107".to_string()]);
    }

    #[tokio::test]
    async fn unknown_host_is_rejected() {
        let mock = Arc::new(MockCluster::new());
        let (actions, _) = actions(mock, Arc::new(MemoryHostStore::new()));
        let err = actions.stop("alice", "nope").await.unwrap_err();
        assert!(matches!(err, CoreError::HostNotFound(_)));
    }

    #[tokio::test]
    async fn unmapped_host_is_rejected_as_not_a_vm() {
        let mock = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new("bastion")]));
        let (actions, _) = actions(mock, store);
        let err = actions.reset("alice", "bastion").await.unwrap_err();
        assert!(matches!(err, CoreError::NotAVm(_)));
    }

    #[tokio::test]
    async fn exec_returns_outcome_and_audits_exit_code() {
        let mock = Arc::new(MockCluster::new());
        mock.add_vm("pve1", 107, "db1", "running");
        mock.push_exec_result(0, 3, "", "boom\n");
        let store = Arc::new(MemoryHostStore::with_records([HostRecord::new(
            "vm-107-db1",
        )]));

        let (actions, audit) = actions(mock, store);
        let outcome = actions
            .exec(
                "alice",
                "vm-107-db1",
                "/bin/false",
                &[],
                None,
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stderr, "boom\n");
        assert!(audit.entries()[0].contains("exit 3"));
    }
}

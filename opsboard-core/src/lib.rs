//! Fleet logic on top of the Proxmox control API.
//!
//! This crate owns everything above the wire protocol:
//!
//! - [`status::LiveStatusCache`]: periodic refresher publishing
//!   power state, agent reachability, best IPv4 and an optional
//!   top-process sample per tracked host.
//! - [`reconcile::InventoryReconciler`]: compares the cluster's VM
//!   population against the host inventory and proposes, applies,
//!   clears or archives node/vmid mappings.
//! - [`actions::FleetActions`]: lifecycle and remote-exec operations
//!   addressed by hostname, with audit records.
//! - [`diag`]: remote (guest `ps`) and local (sysinfo) process
//!   diagnostics.
//!
//! Storage is abstracted behind [`store::HostStore`] so the daemon can
//! plug in its file-backed store and tests can run fully in memory.

pub mod actions;
pub mod diag;
pub mod error;
pub mod identity;
pub mod reconcile;
pub mod record;
pub mod status;
pub mod store;

pub use actions::FleetActions;
pub use diag::{DiagnosticReport, GuestDiagnostics, LocalDiagnostics, TopProcess};
pub use error::{CoreError, Result};
pub use identity::ResolvedIdentity;
pub use reconcile::{
    DiscoveryProposal, InventoryReconciler, MissingRecord, PreviewResult, UnknownVm,
};
pub use record::{normalize_tags, update_host, HostUpdate};
pub use status::{LiveStatus, LiveStatusCache, StatusSettings};
pub use store::{AuditSink, HostRecord, HostStore, LogAudit, MemoryAudit, MemoryHostStore};

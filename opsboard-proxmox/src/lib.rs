//! # opsboard Proxmox Layer
//!
//! Typed access to the Proxmox VE control API plus remote command
//! execution inside guests via the QEMU guest agent.
//!
//! The crate is split along the same seams as the rest of opsboard:
//!
//! - [`ClusterApi`] - one async operation per remote capability, so the
//!   higher layers (live status cache, inventory reconciler) can be
//!   driven by the real client or by [`mock::MockCluster`] in tests.
//! - [`ProxmoxClient`] - the reqwest implementation: token auth, one
//!   retry with backoff on transient transport errors, structured API
//!   errors, and the array/split schema negotiation for guest exec.
//! - [`RemoteExecutor`] - submits a guest command and polls the
//!   exec-status endpoint until the process exits or a local deadline
//!   passes (exit code 124, process left running remotely).

pub mod client;
pub mod error;
pub mod exec;
pub mod mock;
pub mod traits;
pub mod types;

pub use client::{ProxmoxClient, ProxmoxSettings};
pub use error::{ProxmoxError, Result};
pub use exec::{ExecOutcome, RemoteExecutor, TIMEOUT_EXIT_CODE};
pub use traits::ClusterApi;
pub use types::{
    ClusterResource, ExecStatus, IpAddressEntry, NetworkInterface, NodeListItem, OsInfo,
    VmCurrentStatus, VmIdentity, VmKind, VmListItem,
};

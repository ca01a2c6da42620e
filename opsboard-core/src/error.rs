//! Error types for fleet operations.

use thiserror::Error;

/// Errors surfaced by fleet-level operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// No inventory record exists for the hostname.
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// The record exists but carries no VM id and its hostname does not
    /// encode one, so no cluster VM can be addressed.
    #[error("host '{0}' is not mapped to a managed VM")]
    NotAVm(String),

    /// A control API call failed.
    #[error(transparent)]
    Proxmox(#[from] opsboard_proxmox::ProxmoxError),

    /// The host store failed to read or write.
    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

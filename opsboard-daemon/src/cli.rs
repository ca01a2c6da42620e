//! Command-line argument parsing.

use clap::Parser;

/// opsboard - Proxmox fleet daemon
#[derive(Parser, Debug)]
#[command(name = "opsboard")]
#[command(about = "opsboard - Proxmox fleet status and inventory daemon")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Node assumed for records that store no node
    #[arg(long)]
    pub default_node: Option<String>,

    /// Path to the host inventory file
    #[arg(long)]
    pub store: Option<String>,

    /// Enable development mode (in-memory mock cluster)
    #[arg(long)]
    pub dev: bool,

    /// Run one status sweep and one reconciliation preview, print the
    /// preview as JSON, and exit
    #[arg(long)]
    pub once: bool,
}

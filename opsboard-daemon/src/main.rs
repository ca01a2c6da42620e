//! # opsboard Daemon
//!
//! Tracks a fleet of Proxmox VMs against a host inventory: a live
//! status cache refreshed in the background, plus inventory
//! reconciliation (mapping proposals, unknown VMs, missing records).
//!
//! ## Usage
//! ```bash
//! opsboard --config /etc/opsboard/opsboard.yaml
//! opsboard --dev --once    # mock cluster, one sweep + preview
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod store;

use cli::Args;
use config::Config;
use store::JsonFileStore;

use opsboard_core::{InventoryReconciler, LiveStatusCache, LogAudit};
use opsboard_proxmox::mock::MockCluster;
use opsboard_proxmox::{ClusterApi, ProxmoxClient};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.log_json {
        opsboard_common::init_logging_json(&args.log_level)?;
    } else {
        opsboard_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting opsboard daemon"
    );

    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => {
            let default_path = "/etc/opsboard/opsboard.yaml";
            match Config::load(default_path) {
                Ok(cfg) => {
                    info!(config_path = %default_path, "Configuration loaded from default location");
                    cfg.with_cli_overrides(&args)
                }
                Err(_) => {
                    info!("No config file found, using CLI arguments and defaults");
                    Config::default().with_cli_overrides(&args)
                }
            }
        }
    };

    let api: Arc<dyn ClusterApi> = if args.dev {
        info!("Development mode: using in-memory mock cluster");
        Arc::new(dev_cluster())
    } else {
        Arc::new(ProxmoxClient::new(config.proxmox.to_settings())?)
    };

    let store = Arc::new(JsonFileStore::open(&config.store.path).await?);
    let audit = Arc::new(LogAudit);
    let cache = Arc::new(LiveStatusCache::new(
        api.clone(),
        store.clone(),
        config.status.to_settings(),
    ));

    if args.once {
        cache.refresh_once().await;
        let reconciler = InventoryReconciler::new(api, store, audit);
        let preview = reconciler.preview().await?;
        println!("{}", serde_json::to_string_pretty(&preview)?);
        return Ok(());
    }

    let refresher = cache.clone();
    let handle = tokio::spawn(async move { refresher.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.abort();
    Ok(())
}

/// Small populated cluster for `--dev`.
fn dev_cluster() -> MockCluster {
    let cluster = MockCluster::new();
    cluster.add_vm("pve1", 100, "web1", "running");
    cluster.add_vm("pve1", 107, "db1", "running");
    cluster.add_vm("pve2", 200, "scratch", "stopped");
    cluster.set_agent("pve1", 100, true);
    cluster.set_interfaces(
        "pve1",
        100,
        vec![MockCluster::ipv4_interface("eth0", &["192.168.1.10"])],
    );
    cluster
}

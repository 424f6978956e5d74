use anyhow::{Context, Result};
use prsync_core::{FileSnapshotStore, SyncConfig, SyncLayer};
use std::sync::Arc;

use super::args::{Cli, Command};

pub mod config;
pub mod status;
pub mod watch;

pub async fn dispatch(cli: Cli) -> Result<i32> {
    let config = load_config(&cli)?;
    match cli.cmd {
        Command::Watch(args) => watch::run(args, config).await,
        Command::Status => status::run(config).await,
        Command::Config => config::run(&config),
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    match &cli.config {
        Some(path) => SyncConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(SyncConfig::from_env()),
    }
}

pub(crate) fn build_layer(config: SyncConfig, snapshots: bool) -> Result<SyncLayer> {
    let mut builder = SyncLayer::builder().config(config);
    if snapshots {
        let store = FileSnapshotStore::new().context("failed to open snapshot directory")?;
        tracing::debug!(dir = %store.dir().display(), "snapshot store");
        builder = builder.snapshots(Arc::new(store));
    }
    builder.build().context("failed to build sync layer")
}

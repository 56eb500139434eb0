//! CLI for registry sync operations: discover actions from a source, build
//! a tarball venv, and publish a registry version.
//!
//! A small operator-facing admin binary, separate from the long-running
//! executor process; the "admin" surface here is the registry control
//! plane rather than workflow/resource management.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sentryflow_core::config::Config;
use sentryflow_core::registry::{
    InMemoryVersionStore, RegistrySource, RegistrySyncService, RegistryVersionStore,
};
use sentryflow_core::storage::InMemoryObjectStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "registryctl", about = "Registry sync control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a local package directory into a new registry version.
    SyncLocal {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value = "/tmp/sentryflow/registry-build")]
        build_dir: PathBuf,
    },
    /// Show the currently tracked version for an origin, if any.
    Show {
        #[arg(long)]
        origin: String,
        #[arg(long)]
        version: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;
    let cli = Cli::parse();

    let object_store = Arc::new(InMemoryObjectStore::new(config.object_store.clone()));
    let version_store = Arc::new(InMemoryVersionStore::new());
    let sync_service = RegistrySyncService::new(object_store, version_store.clone(), "sentryflow");

    match cli.command {
        Commands::SyncLocal { path, build_dir } => {
            let source = RegistrySource::Local { path };
            let version = sync_service
                .sync(source, &build_dir, &HashMap::new())
                .await?;
            println!(
                "synced {} actions into {}@{}",
                version.manifest.len(),
                version.repository_id,
                version.version
            );
        }
        Commands::Show { origin, version } => match version_store.get_version(&origin, &version).await {
            Ok(v) => println!("{}@{}: {} actions", origin, version, v.manifest.len()),
            Err(e) => println!("not found: {e}"),
        },
    }

    Ok(())
}

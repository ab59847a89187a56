use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use libvolume::{Config, FileStore, Registry, Volume, VolumeKey, VolumeStub};
use tracing::info;

use crate::cli::{Cli, Commands};

pub async fn run(cli: Cli, out: &mut impl Write) -> Result<()> {
    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => Config::from_env()?.state_dir,
    };
    let registry = open(state_dir).await?;

    match cli.command {
        Commands::List { namespace } => {
            let stubs: Vec<VolumeStub> = registry
                .list(namespace.as_deref())
                .await
                .iter()
                .map(|v| VolumeStub::new(v, None))
                .collect();
            print_json(out, &stubs)?;
        }
        Commands::Info { namespace, id } => {
            let key = VolumeKey::new(namespace, id);
            let volume = registry
                .get(&key)
                .await
                .with_context(|| format!("volume {key} not found"))?;
            print_json(out, &volume)?;
        }
        Commands::Register { file } => {
            let json = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let volume: Volume = serde_json::from_str(&json)
                .with_context(|| format!("failed to parse volume {}", file.display()))?;
            let volume = registry.register(volume).await?;
            info!(volume = %volume.key(), "registered");
            print_json(out, &volume)?;
        }
        Commands::Deregister { namespace, id } => {
            let key = VolumeKey::new(namespace, id);
            registry.remove_unclaimed(&key).await?;
            writeln!(out, "deregistered {key}")?;
        }
    }
    registry.shutdown().await;
    Ok(())
}

async fn open(state_dir: PathBuf) -> Result<Registry> {
    let store = Arc::new(FileStore::new(&state_dir));
    Registry::open(store)
        .await
        .with_context(|| format!("failed to open state dir {}", state_dir.display()))
}

fn print_json<T: serde::Serialize>(out: &mut impl Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

use anyhow::Context;
use clap::{Parser, Subcommand};
use snapvault_common::CellCoord;
use snapvault_live::DirectoryWorld;
use snapvault_persist::RegionStore;
use snapvault_stream::{RegionCache, ServiceConfig, SnapshotService};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "snapvault-cli", about = "Administer per-cell world snapshots")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Service configuration (JSON); defaults apply to missing fields
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Capture a cell's live state into its snapshot slot
    #[command(allow_negative_numbers = true)]
    Save {
        /// World directory
        #[arg(short, long)]
        world: PathBuf,
        x: i32,
        z: i32,
        /// Replace payloads that are already stored
        #[arg(long)]
        overwrite: bool,
    },
    /// Apply a cell's snapshot back to its live state
    #[command(allow_negative_numbers = true)]
    Load {
        /// World directory
        #[arg(short, long)]
        world: PathBuf,
        x: i32,
        z: i32,
        /// Remove the snapshot once applied
        #[arg(long)]
        delete: bool,
    },
    /// Delete every stored snapshot of a world
    Wipe {
        /// World directory
        #[arg(short, long)]
        world: PathBuf,
    },
    /// List stored region files
    List {
        /// World directory
        #[arg(short, long)]
        world: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ServiceConfig> {
    let Some(path) = path else {
        return Ok(ServiceConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

/// Runs `body` against a cache attached to `world_dir`, then shuts the
/// service down so every touched region is flushed before returning.
fn with_cache<T>(
    config: ServiceConfig,
    world_dir: &Path,
    body: impl FnOnce(&RegionCache) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let live = DirectoryWorld::open(world_dir)
        .with_context(|| format!("failed to open world {}", world_dir.display()))?;
    let service = SnapshotService::new(config)?;
    let cache = service.attach("cli", world_dir, Arc::new(live))?;
    let result = body(&cache);
    drop(cache);
    if !service.shutdown() {
        tracing::warn!("some work was cancelled at shutdown");
    }
    result
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => {
            println!("snapvault-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", snapvault_common::crate_info());
            println!("live: {}", snapvault_live::crate_info());
            println!("exec: {}", snapvault_exec::crate_info());
            println!("persist: {}", snapvault_persist::crate_info());
            println!("stream: {}", snapvault_stream::crate_info());
        }
        Commands::Save {
            world,
            x,
            z,
            overwrite,
        } => {
            let cell = CellCoord::new(x, z);
            let stored = with_cache(config, &world, |cache| {
                Ok(cache.capture(cell, overwrite)?.wait()?)
            })?;
            if stored {
                println!("Saved cell {cell}");
            } else {
                println!("Nothing saved for cell {cell}");
            }
        }
        Commands::Load {
            world,
            x,
            z,
            delete,
        } => {
            let cell = CellCoord::new(x, z);
            let applied = with_cache(config, &world, |cache| {
                Ok(cache.restore(cell, delete)?.wait()?)
            })?;
            if applied {
                println!("Loaded cell {cell}");
            } else {
                println!("No snapshot applied for cell {cell}");
            }
        }
        Commands::Wipe { world } => {
            let (wiped, root) = with_cache(config, &world, |cache| {
                Ok((cache.clear(), cache.store().root().to_path_buf()))
            })?;
            if !wiped {
                anyhow::bail!("failed to wipe snapshots in {}", root.display());
            }
            println!("Wiped snapshots in {}", root.display());
        }
        Commands::List { world, json } => {
            let store = RegionStore::new(
                world.join(&config.cache.snapshot_dir),
                config.cache.compression_level,
            );
            let regions = store.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&regions)?);
            } else {
                println!("{} region file(s) in {}", regions.len(), store.root().display());
                for region in &regions {
                    println!(
                        "  region ({}, {}): {} bytes",
                        region.coord.x, region.coord.z, region.compressed_bytes
                    );
                }
            }
        }
    }

    Ok(())
}

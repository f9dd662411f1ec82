#![warn(missing_docs)]
//! dfs-pack: pack files into a deduplicated fblock store

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use dedupfs_store::{BlockLocation, BlockStore, StoreConfig};
use parking_lot::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MANIFEST: &str = "manifest.json";

#[derive(Parser)]
#[command(name = "dfs-pack")]
#[command(about = "Pack files into a deduplicated fblock store", long_about = None)]
struct Cli {
    /// JSON store configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory receiving the fblocks and the manifest
    output: PathBuf,

    /// Files or directories to pack
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let output = cli.output;

    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::default(),
    };
    config.dir = output.clone();
    std::fs::create_dir_all(&output)
        .with_context(|| format!("creating {}", output.display()))?;

    let mut files = Vec::new();
    for input in &cli.inputs {
        collect_files(input, &mut files)?;
    }
    tracing::info!(files = files.len(), output = %output.display(), "packing");

    let store = BlockStore::open(config)?;
    let manifest = pack(&store, &files)?;
    let set_stats = store.finish()?;
    let stats = store.stats();

    let manifest_path = output.join(MANIFEST);
    let manifest_file = File::create(&manifest_path)
        .with_context(|| format!("creating {}", manifest_path.display()))?;
    serde_json::to_writer_pretty(manifest_file, &manifest)?;

    tracing::info!(
        blocks = stats.blocks,
        bytes_in = stats.bytes_in,
        duplicate_blocks = stats.duplicate_blocks,
        overlap_bytes_saved = stats.overlap_bytes_saved,
        bytes_written = stats.bytes_written,
        fblocks = set_stats.fblocks,
        bytes_on_disk = set_stats.bytes_on_disk,
        "done"
    );
    Ok(())
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let meta = std::fs::metadata(path).with_context(|| format!("reading {}", path.display()))?;
    if meta.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }
    if meta.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        entries.sort();
        for entry in entries {
            collect_files(&entry, out)?;
        }
    }
    Ok(())
}

/// Add every file using one worker per core. Returns the block list of each file.
fn pack(
    store: &BlockStore,
    files: &[PathBuf],
) -> anyhow::Result<BTreeMap<String, Vec<BlockLocation>>> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(files.len().max(1));
    let next = Mutex::new(0usize);
    let manifest = Mutex::new(BTreeMap::new());

    std::thread::scope(|scope| -> anyhow::Result<()> {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(|| -> anyhow::Result<()> {
                    loop {
                        let i = {
                            let mut next = next.lock();
                            let i = *next;
                            *next += 1;
                            i
                        };
                        let Some(path) = files.get(i) else {
                            return Ok(());
                        };
                        let file = File::open(path)
                            .with_context(|| format!("opening {}", path.display()))?;
                        let blocks = store
                            .add_reader(BufReader::new(file))
                            .with_context(|| format!("packing {}", path.display()))?;
                        tracing::debug!(path = %path.display(), blocks = blocks.len(), "packed file");
                        manifest.lock().insert(path.display().to_string(), blocks);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("pack worker panicked"))??;
        }
        Ok(())
    })?;

    Ok(manifest.into_inner())
}

use std::fs;
use std::path::PathBuf;
use std::sync::{mpsc as std_mpsc, Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

use focalpoint::consideration::PublicKey;
use focalpoint::consideration_queue::ConsiderationQueueMemory;
use focalpoint::graph::Graph;
use focalpoint::indexer::Indexer;
use focalpoint::ledger::{Ledger, LedgerDisk};
use focalpoint::processor::Processor;
use focalpoint::renderer::{HashrateMonitor, Renderer};
use focalpoint::view::View;
use focalpoint::view_storage::{ViewStorage, ViewStorageDisk};

/// A node on the focal point.
#[derive(Parser, Debug)]
#[command(name = "focalpoint", version, about)]
struct Args {
    /// Location of the focalpoint data directory
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Path to a genesis view JSON file, required on first run
    #[arg(long, value_name = "FILE")]
    genesis_file: Option<PathBuf>,

    /// Number of view rendering threads
    #[arg(long, default_value_t = 0)]
    render_threads: usize,

    /// Base64-encoded public key to credit with rendered viewpoints.
    /// May be repeated; workers rotate through them
    #[arg(long = "pub-key", value_name = "KEY")]
    pub_keys: Vec<String>,

    /// Memo to include in rendered viewpoints
    #[arg(long, default_value = "")]
    memo: String,

    /// Prune consideration and public key consideration indices older than
    /// the previous series
    #[arg(long)]
    prune: bool,

    /// Compress views on disk with zstd
    #[arg(long)]
    compress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .ok_or_else(|| anyhow!("cannot determine home directory; pass --data-dir"))?
            .join(".focalpoint"),
    };
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    info!(data_dir = %data_dir.display(), "focalpoint node starting up");

    // storage, graph, ledger and queue
    let view_store: Arc<dyn ViewStorage> = Arc::new(ViewStorageDisk::new(
        data_dir.join("views"),
        data_dir.join("headers"),
        false,
        args.compress,
    )?);
    let con_graph = Arc::new(RwLock::new(Graph::new()));
    let ledger: Arc<dyn Ledger> = Arc::new(LedgerDisk::new(
        data_dir.join("ledger"),
        view_store.clone(),
        con_graph.clone(),
        args.prune,
    )?);
    let cn_queue = Arc::new(ConsiderationQueueMemory::new(
        ledger.clone(),
        con_graph.clone(),
    ));

    // resolve the genesis view: from the ledger after the first run,
    // otherwise from the supplied file
    let mut genesis_view: Option<View> = None;
    let genesis_id = match ledger.get_view_id_for_height(0)? {
        Some(id) => id,
        None => {
            let path = args
                .genesis_file
                .as_ref()
                .ok_or_else(|| anyhow!("empty ledger and no --genesis-file supplied"))?;
            let bytes = fs::read(path)
                .with_context(|| format!("reading genesis view {}", path.display()))?;
            let view: View = serde_json::from_slice(&bytes)?;
            let id = view.id()?;
            genesis_view = Some(view);
            id
        }
    };
    info!(genesis_id = %genesis_id, "genesis view");

    // the graph participates in consensus: rebuild it from the main branch
    // before processing anything
    let indexer = Arc::new(Indexer::new(
        con_graph.clone(),
        view_store.clone(),
        ledger.clone(),
        genesis_id,
    ));
    indexer
        .catch_up()
        .map_err(|err| anyhow!("indexing the main branch: {err}"))?;

    let (processor, processor_handle) = Processor::spawn(
        genesis_id,
        view_store.clone(),
        cn_queue.clone(),
        ledger.clone(),
        Some(indexer.clone()),
    );

    // connect the genesis view on first run
    if let Some(view) = genesis_view {
        processor
            .process_view(genesis_id, view, "localhost")
            .await
            .map_err(|err| anyhow!("connecting genesis view: {err}"))?;
    }

    // rendering
    let mut renderers = Vec::new();
    let mut monitor = None;
    if args.render_threads > 0 {
        let pub_keys = parse_pub_keys(&args.pub_keys)?;
        if pub_keys.is_empty() {
            return Err(anyhow!("rendering requires at least one --pub-key"));
        }
        let (hash_tx, hash_rx) = std_mpsc::channel();
        monitor = Some(HashrateMonitor::spawn(hash_rx));
        for num in 0..args.render_threads {
            renderers.push(Renderer::spawn(
                pub_keys.clone(),
                args.memo.clone(),
                view_store.clone(),
                cn_queue.clone(),
                ledger.clone(),
                processor.clone(),
                hash_tx.clone(),
                num,
            ));
        }
        info!(threads = args.render_threads, "rendering started");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    for renderer in renderers {
        renderer.shutdown();
    }
    if let Some(monitor) = monitor {
        monitor.shutdown();
    }
    processor.shutdown();
    let _ = processor_handle.await;
    info!("exited cleanly");
    Ok(())
}

fn parse_pub_keys(encoded: &[String]) -> Result<Vec<PublicKey>> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    let mut keys = Vec::with_capacity(encoded.len());
    for s in encoded {
        let bytes = BASE64
            .decode(s.trim())
            .with_context(|| format!("decoding public key {s}"))?;
        if bytes.len() != 32 {
            return Err(anyhow!("public key {s} is not 32 bytes"));
        }
        let mut pk = PublicKey::default();
        pk.0.copy_from_slice(&bytes);
        keys.push(pk);
    }
    Ok(keys)
}

//! cosync simulator (cosync-sim)
//!
//! Runs several editors in one process, each with its own replica, host
//! store, document sync and awareness sync. Editors exchange frames over
//! in-process channels and the run fails unless they all converge.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (3 peers, 40 steps)
//! cosync-sim
//!
//! # Bigger run with chatty logs
//! cosync-sim --peers 8 --steps 200 --log-level debug
//!
//! # With configuration file
//! cosync-sim --config crates/cosync-sim/config/cosync.toml
//! ```

mod config;
mod peer;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::SimConfig;
use cosync_core::ContainerKind;
use peer::{Envelope, Mesh, Peer};

/// Upper bound on delivery rounds before the network counts as stuck
const MAX_ROUNDS: usize = 64;

/// cosync simulator - multi-peer convergence check
#[derive(Parser, Debug)]
#[command(name = "cosync-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "COSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Number of peers
    #[arg(long, env = "COSYNC_PEERS")]
    peers: Option<usize>,

    /// Workload steps
    #[arg(long, env = "COSYNC_STEPS")]
    steps: Option<usize>,

    /// Delay between steps in milliseconds
    #[arg(long, env = "COSYNC_TICK_MS")]
    tick_ms: Option<u64>,

    /// Local change throttle window in milliseconds
    #[arg(long, env = "COSYNC_THROTTLE_MS")]
    throttle_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "COSYNC_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = load_config(&args)?;
    if config.peers < 2 {
        bail!("need at least 2 peers, got {}", config.peers);
    }

    info!(
        peers = config.peers,
        steps = config.steps,
        throttle_ms = config.sync.throttle_ms,
        "Starting simulation"
    );

    let (mesh, mut inboxes) = Mesh::new(config.peers);
    let peers = (0..config.peers)
        .map(|index| Peer::join(index, initial_state(index), &config.sync, mesh.clone()))
        .collect::<Result<Vec<_>>>()?;
    exchange(&peers, &mut inboxes)?;

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));
    for step in 0..config.steps {
        ticker.tick().await;

        for peer in &peers {
            peer.act(step, config.steps)?;
        }

        // publish before ingesting, so no local change is pending while
        // remote patches land in the host
        let now = Instant::now();
        for peer in &peers {
            peer.sync().tick(now)?;
            peer.sync().flush()?;
        }
        exchange(&peers, &mut inboxes)?;
    }

    verify(&peers, &config)?;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "All peers converged"
    );

    for peer in &peers {
        peer.leave();
    }
    deliver(&peers, &mut inboxes)?;
    for peer in &peers {
        let left = peer.presence_entries();
        if left != 0 {
            bail!("peer {} still holds {} presence entries after everyone left", peer.index, left);
        }
    }

    info!("Simulation finished");
    Ok(())
}

fn load_config(args: &Args) -> Result<SimConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            SimConfig::load(path)?
        }
        None => SimConfig::default(),
    };

    if let Some(peers) = args.peers {
        config.peers = peers;
    }
    if let Some(steps) = args.steps {
        config.steps = steps;
    }
    if let Some(tick_ms) = args.tick_ms {
        config.tick_ms = tick_ms;
    }
    if let Some(throttle_ms) = args.throttle_ms {
        config.sync.throttle_ms = throttle_ms;
    }
    config.sync.validate()?;
    Ok(config)
}

/// Only the first peer starts with content; everyone else joins with empty
/// partitions and picks the content up from the network
fn initial_state(index: usize) -> Value {
    if index == 0 {
        json!({
            "document": {
                "nodes": {},
                "scenes": {"main": {"id": "main", "name": "Main"}}
            },
            "selection": []
        })
    } else {
        json!({"document": {"nodes": {}, "scenes": {}}, "selection": []})
    }
}

/// One anti-entropy round: every peer asks for what it misses
fn exchange(peers: &[Peer], inboxes: &mut [mpsc::UnboundedReceiver<Envelope>]) -> Result<()> {
    for peer in peers {
        peer.announce_state_vector()?;
    }
    deliver(peers, inboxes)
}

/// Deliver frames until every inbox stays empty
fn deliver(peers: &[Peer], inboxes: &mut [mpsc::UnboundedReceiver<Envelope>]) -> Result<()> {
    for _ in 0..MAX_ROUNDS {
        let mut delivered = 0usize;
        for (peer, inbox) in peers.iter().zip(inboxes.iter_mut()) {
            while let Ok(envelope) = inbox.try_recv() {
                peer.handle(envelope)?;
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Ok(());
        }
    }
    bail!("network did not settle after {} rounds", MAX_ROUNDS)
}

fn verify(peers: &[Peer], config: &SimConfig) -> Result<()> {
    let reference = peers[0].document();

    for peer in peers {
        let document = peer.document();
        if document != reference {
            bail!(
                "peer {} diverged:\n{}\nexpected:\n{}",
                peer.index,
                document,
                reference
            );
        }

        for partition in &config.sync.partitions {
            let host_side = document
                .get(&partition.key)
                .cloned()
                .unwrap_or_else(|| empty_of(partition.kind));
            if peer.sync().snapshot(&partition.key).as_ref() != Some(&host_side) {
                bail!(
                    "peer {} shadow for {} differs from its host",
                    peer.index,
                    partition.key
                );
            }
        }

        let cursors = peer.cursors();
        if cursors.len() != peers.len() - 1 {
            bail!(
                "peer {} sees {} cursors, expected {}",
                peer.index,
                cursors.len(),
                peers.len() - 1
            );
        }
    }

    info!(
        nodes = reference["nodes"].as_object().map_or(0, |n| n.len()),
        "Documents identical"
    );
    Ok(())
}

fn empty_of(kind: ContainerKind) -> Value {
    match kind {
        ContainerKind::Map => json!({}),
        ContainerKind::Array => json!([]),
    }
}

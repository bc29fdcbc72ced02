// PPSPP Linux: UDP swarm daemon seeding or downloading one file.

mod config;
mod discovery;
mod storage;
mod transport;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use ppspp_core::{
    chunk, dispatch, Bin, Binmap, IntegrityMethod, MerkleTree, OutboundAction, StaticDiscovery,
    Swarm, SwarmError, SwarmId, TrustAnchor,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, Mode};
use storage::FileStorage;
use transport::UdpTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const EVENT_QUEUE: usize = 1024;

/// Everything the swarm task reacts to besides its own timer.
pub enum Event {
    Datagram(SocketAddr, Vec<u8>),
    Discovered(SocketAddr),
}

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("ppspp-linux {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument {other:?}"),
        }
    }

    let cfg = config::load(config_path.as_deref())?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter)),
        )
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let swarm = open_swarm(&cfg, Instant::now())?;
    info!(
        swarm = %hex::encode(swarm.swarm_id().as_bytes()),
        chunks = ?swarm.view().chunk_count(),
        have = swarm.view().verified_count(),
        "swarm ready"
    );

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.listen_port))
        .await
        .with_context(|| format!("binding udp port {}", cfg.listen_port))?;
    let socket = Arc::new(socket);
    let (events_tx, mut events) = mpsc::channel(EVENT_QUEUE);

    let recv_socket = socket.clone();
    let max_datagram = swarm.config().max_datagram_size;
    let recv_tx = events_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = transport::recv_loop(recv_socket, max_datagram, recv_tx).await {
            warn!(error = %e, "udp receive loop stopped");
        }
    });
    if cfg.lan_discovery {
        let swarm_id = swarm.swarm_id().clone();
        let (discovery_port, listen_port) = (cfg.discovery_port, cfg.listen_port);
        let disc_tx = events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                discovery::run_discovery(swarm_id, discovery_port, listen_port, disc_tx).await
            {
                warn!(error = %e, "lan discovery stopped");
            }
        });
    }
    drop(events_tx);

    let mut node = Node {
        swarm,
        transport: UdpTransport::new(socket),
        checkpoint: cfg.checkpoint.clone(),
    };
    let now = Instant::now();
    match node.swarm.bootstrap(now, &mut StaticDiscovery::new(cfg.peers.clone())) {
        Ok(actions) => node.handle(now, actions),
        Err(SwarmError::NoPeers) => info!("no configured peers; waiting for inbound channels"),
        Err(e) => return Err(e).context("bootstrap"),
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::Datagram(from, bytes)) => {
                    let now = Instant::now();
                    let actions = node.swarm.on_datagram(now, from, &bytes);
                    node.handle(now, actions);
                }
                Some(Event::Discovered(peer)) => {
                    let now = Instant::now();
                    match node.swarm.connect(now, peer) {
                        Ok(actions) => node.handle(now, actions),
                        Err(e) => debug!(peer = %peer, error = %e, "not connecting"),
                    }
                }
                None => bail!("udp receive loop stopped"),
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                let actions = node.swarm.tick(now);
                node.handle(now, actions);
            }
            res = &mut shutdown => {
                res.context("signal handler")?;
                break;
            }
        }
    }

    info!("shutting down");
    let now = Instant::now();
    let actions = node.swarm.shutdown(now);
    node.handle(now, actions);
    node.persist()
}

/// The swarm task's state: single owner of the swarm and its storage.
struct Node {
    swarm: Swarm<FileStorage>,
    transport: UdpTransport,
    checkpoint: Option<PathBuf>,
}

impl Node {
    fn handle(&mut self, now: Instant, actions: Vec<OutboundAction>) {
        for action in dispatch(&mut self.swarm, &mut self.transport, now, actions) {
            match action {
                OutboundAction::Send { .. } => {}
                OutboundAction::ChunkVerified(bin) => debug!(bin = %bin, "chunk verified"),
                OutboundAction::ChannelClosed {
                    peer,
                    state,
                    reason,
                } => info!(peer = %peer, state = ?state, reason = %reason, "channel closed"),
                OutboundAction::PeerDiscovered(peer) => debug!(peer = %peer, "peer discovered"),
                OutboundAction::Complete => {
                    info!(chunks = self.swarm.view().verified_count(), "download complete");
                    if let Err(e) = self.persist() {
                        warn!(error = %e, "saving after completion");
                    }
                }
            }
        }
    }

    /// Flush file data and write the hash tree checkpoint, if one is configured.
    fn persist(&mut self) -> anyhow::Result<()> {
        self.swarm.storage_mut().flush().context("flushing content file")?;
        if let Some(path) = &self.checkpoint {
            write_checkpoint(path, &self.swarm.checkpoint()?)?;
        }
        Ok(())
    }
}

fn open_swarm(cfg: &Config, now: Instant) -> anyhow::Result<Swarm<FileStorage>> {
    if cfg.protocol.integrity != IntegrityMethod::MerkleHashTree {
        bail!("the daemon serves merkle_hash_tree content only");
    }
    match cfg.mode {
        Mode::Seed => open_seed(cfg, now),
        Mode::Leech => open_leech(cfg, now),
    }
}

fn open_seed(cfg: &Config, now: Instant) -> anyhow::Result<Swarm<FileStorage>> {
    let protocol = cfg.protocol.clone();
    let mut storage = FileStorage::open(&cfg.file, protocol.chunk_size)
        .with_context(|| format!("opening {}", cfg.file.display()))?;
    let count = chunk::chunk_count(storage.len()?, protocol.chunk_size);
    if count == 0 {
        bail!("{} is empty", cfg.file.display());
    }
    let mut have = Binmap::new();
    have.insert_range(0, count);

    if let (Some(id), Some(bytes)) = (cfg.swarm_id()?, read_checkpoint(cfg.checkpoint.as_deref())?)
    {
        let anchor = TrustAnchor::root(id.as_bytes().to_vec(), count);
        match MerkleTree::restore(&bytes, anchor, protocol.max_pending_chunks) {
            Ok(tree) => {
                info!("hash tree restored from checkpoint");
                return Ok(Swarm::new(id, tree, storage, protocol, now)?.with_verified(have));
            }
            Err(e) => warn!(error = %e, "checkpoint ignored; rehashing"),
        }
    }

    let content = storage.read_all()?;
    let chunks = chunk::split_into_chunks(&content, protocol.chunk_size);
    let tree = MerkleTree::from_chunks(
        protocol.hash_function,
        &chunks,
        protocol.max_pending_chunks,
    )?;
    let id = SwarmId(tree.root_hash().context("hash tree has no root")?.to_vec());
    if let Some(want) = cfg.swarm_id()? {
        if want != id {
            bail!("{} does not hash to the configured swarm_id", cfg.file.display());
        }
    }
    let swarm = Swarm::new(id, tree, storage, protocol, now)?.with_verified(have);
    if let Some(path) = &cfg.checkpoint {
        write_checkpoint(path, &swarm.checkpoint()?)?;
    }
    Ok(swarm)
}

fn open_leech(cfg: &Config, now: Instant) -> anyhow::Result<Swarm<FileStorage>> {
    let protocol = cfg.protocol.clone();
    let id = cfg.swarm_id()?.context("leech mode needs swarm_id")?;
    let count = cfg.chunk_count.context("leech mode needs chunk_count")?;
    let storage = FileStorage::create(&cfg.file, protocol.chunk_size)
        .with_context(|| format!("creating {}", cfg.file.display()))?;

    if let Some(bytes) = read_checkpoint(cfg.checkpoint.as_deref())? {
        let anchor = TrustAnchor::root(id.as_bytes().to_vec(), count);
        match MerkleTree::restore(&bytes, anchor, protocol.max_pending_chunks) {
            Ok(tree) => {
                let have = verified_leaves(&tree, count);
                info!(chunks = have.len(), "resuming download");
                return Ok(Swarm::new(id, tree, storage, protocol, now)?.with_verified(have));
            }
            Err(e) => warn!(error = %e, "checkpoint ignored"),
        }
    }
    Ok(Swarm::for_content(id, count, storage, protocol, now)?)
}

fn verified_leaves(tree: &MerkleTree, count: u64) -> Binmap {
    let mut have = Binmap::new();
    for i in (0..count).filter(|i| tree.is_verified(Bin::chunk(*i))) {
        have.insert_chunk(i);
    }
    have
}

fn read_checkpoint(path: Option<&Path>) -> anyhow::Result<Option<Vec<u8>>> {
    match path {
        Some(p) if p.exists() => Ok(Some(
            std::fs::read(p).with_context(|| format!("reading {}", p.display()))?,
        )),
        _ => Ok(None),
    }
}

/// Write beside the target, then rename over it.
fn write_checkpoint(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
    debug!(path = %path.display(), len = bytes.len(), "checkpoint written");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

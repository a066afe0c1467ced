use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rx_dispatch::{
    BufferChain, Delivery, DeliveryFn, DeliveryResolver, Dispatcher, DispatcherConfig, PacketBatch,
    PacketBuffer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rx-dispatch",
    about = "Run synthetic rx traffic through the dispatcher and dump per-thread stats"
)]
struct Args {
    /// JSON dispatcher config; command line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of rx threads (one producer per ring)
    #[arg(long)]
    threads: Option<u8>,

    /// CPU affinity mask for rx threads
    #[arg(long)]
    affinity_mask: Option<u8>,

    /// Batches each producer enqueues
    #[arg(long, default_value_t = 10_000)]
    batches: u32,

    /// Packets per batch
    #[arg(long, default_value_t = 32)]
    chain_len: u32,

    /// Payload bytes per packet
    #[arg(long, default_value_t = 64)]
    packet_size: usize,

    /// Distinct peers; batches cycle through them
    #[arg(long, default_value_t = 8)]
    peers: u32,

    /// Peers with ids at or above this value have no device and get dropped
    #[arg(long)]
    known_peers: Option<u32>,

    /// Suspend and resume the pool once halfway through
    #[arg(long)]
    suspend_cycle: bool,
}

/// Peer `n` maps to device `n`; every device counts what it receives.
struct CountingResolver {
    known_peers: u32,
    deliver: DeliveryFn<Arc<AtomicU64>>,
    delivered: Arc<AtomicU64>,
}

impl CountingResolver {
    fn new(known_peers: u32) -> Self {
        let deliver: DeliveryFn<Arc<AtomicU64>> =
            Arc::new(|counter: &Arc<AtomicU64>, chain: BufferChain| {
                counter.fetch_add(chain.len() as u64, Ordering::Relaxed);
            });
        Self {
            known_peers,
            deliver,
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl DeliveryResolver for CountingResolver {
    type Peer = u32;
    type Device = u32;
    type Handle = Arc<AtomicU64>;

    fn resolve_peer(&self, peer_local_id: u32) -> Option<u32> {
        Some(peer_local_id)
    }

    fn resolve_device(&self, peer: &u32) -> Option<u32> {
        (*peer < self.known_peers).then_some(*peer)
    }

    fn resolve_delivery(&self, _device: &u32) -> Option<Delivery<Arc<AtomicU64>>> {
        Some(Delivery::new(self.deliver.clone(), self.delivered.clone()))
    }
}

fn load_config(args: &Args) -> Result<DispatcherConfig> {
    let mut config = match &args.config {
        Some(path) => DispatcherConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => DispatcherConfig::default(),
    };
    if let Some(threads) = args.threads {
        config.thread_count = threads;
    }
    if let Some(mask) = args.affinity_mask {
        config.cpu_affinity_mask = mask;
    }
    config.validate()?;
    Ok(config)
}

fn produce(
    dispatcher: &Dispatcher<CountingResolver>,
    ring_id: u8,
    args: &Args,
    batches: BatchSpan,
) {
    for n in batches.0..batches.1 {
        let chain: BufferChain = (0..args.chain_len)
            .map(|_| PacketBuffer::new(vec![ring_id; args.packet_size]))
            .collect();
        let peer = (n + u32::from(ring_id)) % args.peers.max(1);
        dispatcher.enqueue(PacketBatch::new(ring_id, peer, chain));
    }
}

/// Half-open range of batch numbers
#[derive(Clone, Copy)]
struct BatchSpan(u32, u32);

fn run_phase(dispatcher: &Dispatcher<CountingResolver>, args: &Args, batches: BatchSpan) {
    thread::scope(|s| {
        for ring_id in 0..dispatcher.thread_count() {
            s.spawn(move || produce(dispatcher, ring_id, args, batches));
        }
    });
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let resolver = Arc::new(CountingResolver::new(args.known_peers.unwrap_or(args.peers)));

    info!(
        threads = config.thread_count,
        batches = args.batches,
        chain_len = args.chain_len,
        peers = args.peers,
        "Starting synthetic rx load"
    );

    let dispatcher = Dispatcher::init(config, resolver.clone())?;
    let started = Instant::now();

    if args.suspend_cycle {
        let half = args.batches / 2;
        run_phase(&dispatcher, &args, BatchSpan(0, half));
        dispatcher.suspend_all();
        dispatcher.log_stats();
        dispatcher.resume_all()?;
        run_phase(&dispatcher, &args, BatchSpan(half, args.batches));
    } else {
        run_phase(&dispatcher, &args, BatchSpan(0, args.batches));
    }

    dispatcher.shutdown_all();
    let elapsed = started.elapsed();

    let stats = dispatcher.dump_stats();
    let queued: u64 = stats.iter().map(|s| s.total_queued()).sum();
    let delivered = resolver.delivered.load(Ordering::Relaxed);
    let accounted: u64 = stats.iter().map(|s| s.total_accounted()).sum();
    if accounted != queued {
        warn!(queued, accounted, "Packet accounting mismatch");
    }

    info!(
        queued,
        delivered,
        elapsed_ms = elapsed.as_millis() as u64,
        "Synthetic rx load finished"
    );

    println!("{}", serde_json::to_string_pretty(&stats)?);
    dispatcher.deinit();
    Ok(())
}

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rx_dispatch::test_util::{StaticResolver, chain_of, wait_until};
use rx_dispatch::{
    DispatchError, Dispatcher, DispatcherConfig, PacketBatch, PoolState, WorkerState,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn start(
    threads: u8,
    resolver: StaticResolver,
) -> (Dispatcher<StaticResolver>, Arc<StaticResolver>) {
    let resolver = Arc::new(resolver);
    let dispatcher = Dispatcher::init(DispatcherConfig::with_threads(threads), resolver.clone())
        .expect("Failed to start dispatcher");
    (dispatcher, resolver)
}

#[test]
fn test_suspend_resume_delivers_exactly_once() {
    let _ = tracing_subscriber::fmt::try_init();

    const BATCHES: u64 = 300;

    let resolver = StaticResolver::new().with_peer(1, 10).with_peer(2, 20);
    let (dispatcher, resolver) = start(2, resolver);

    thread::scope(|s| {
        for ring in 0..2u8 {
            let dispatcher = &dispatcher;
            s.spawn(move || {
                let base = u64::from(ring) * 1_000_000;
                for n in 0..BATCHES {
                    let start = base + n * 2;
                    dispatcher.enqueue(PacketBatch::new(
                        ring,
                        u32::from(ring) + 1,
                        chain_of(start..start + 2),
                    ));
                }
            });
        }

        for _ in 0..5 {
            dispatcher.suspend_all();
            assert_eq!(dispatcher.state(), PoolState::Suspended);
            dispatcher.resume_all().expect("Pool should be suspended");
        }
    });

    let rx = resolver.receiver();
    let mut tags = Vec::new();
    while tags.len() < (2 * BATCHES * 2) as usize {
        let chain = rx.recv_timeout(RECV_TIMEOUT).expect("Missing deliveries");
        tags.extend(chain.tags);
    }

    dispatcher.shutdown_all();
    assert!(resolver.drain().is_empty(), "Duplicate deliveries");

    let unique: BTreeSet<u64> = tags.iter().copied().collect();
    assert_eq!(unique.len(), tags.len());
    for ring in 0..2u64 {
        let base = ring * 1_000_000;
        assert!((base..base + BATCHES * 2).all(|tag| unique.contains(&tag)));
    }

    for snap in dispatcher.dump_stats() {
        assert_eq!(snap.delivered, BATCHES * 2);
        assert_eq!(snap.flushed, 0);
    }
}

#[test]
fn test_suspended_threads_hold_batches() {
    let _ = tracing_subscriber::fmt::try_init();

    let (dispatcher, resolver) = start(2, StaticResolver::new().with_peer(1, 10));
    let rx = resolver.receiver();

    dispatcher.suspend_all();
    for snap in dispatcher.dump_stats() {
        assert_eq!(snap.state, WorkerState::Suspended);
    }

    dispatcher.enqueue(PacketBatch::new(1, 1, chain_of(0..4)));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(dispatcher.dump_stats()[1].queue_len, 1);

    // Suspending again while suspended is harmless.
    dispatcher.suspend_all();
    dispatcher.resume_all().expect("Pool should be suspended");

    let chain = rx.recv_timeout(RECV_TIMEOUT).expect("Batch lost across suspend");
    assert_eq!(chain.tags, vec![0, 1, 2, 3]);
    assert!(matches!(
        dispatcher.resume_all(),
        Err(DispatchError::NotSuspended)
    ));
}

/// Delivery outlasts the suspend timeout by a wide margin
const SLOW_DELIVERY: Duration = Duration::from_millis(300);

fn start_slow(resolver: StaticResolver) -> (Dispatcher<StaticResolver>, Arc<StaticResolver>) {
    let resolver = Arc::new(resolver);
    let config = DispatcherConfig {
        suspend_timeout_ms: 20,
        ..DispatcherConfig::default()
    };
    let dispatcher = Dispatcher::init(config, resolver.clone())
        .expect("Failed to start dispatcher");
    (dispatcher, resolver)
}

#[test]
fn test_suspend_timeout_during_delivery() {
    let _ = tracing_subscriber::fmt::try_init();

    let (dispatcher, resolver) =
        start_slow(StaticResolver::new().with_slow_peer(1, 10, SLOW_DELIVERY));
    let rx = resolver.receiver();

    dispatcher.enqueue(PacketBatch::new(0, 1, chain_of(0..2)));
    assert!(wait_until(RECV_TIMEOUT, || dispatcher.dump_stats()[0].dequeued == 2));

    // The thread is inside the callback and can't acknowledge in time.
    dispatcher.suspend_all();
    assert_eq!(dispatcher.state(), PoolState::Suspended);

    dispatcher.enqueue(PacketBatch::new(0, 1, chain_of(2..3)));
    dispatcher.resume_all().expect("Pool should be suspended");
    assert_eq!(dispatcher.state(), PoolState::Running);

    let first = rx.recv_timeout(RECV_TIMEOUT).expect("In-flight batch lost");
    assert_eq!(first.tags, vec![0, 1]);
    let second = rx.recv_timeout(RECV_TIMEOUT).expect("Later batch lost");
    assert_eq!(second.tags, vec![2]);

    dispatcher.shutdown_all();
    assert!(resolver.drain().is_empty(), "Duplicate deliveries");
    let snap = &dispatcher.dump_stats()[0];
    assert_eq!(snap.delivered, 3);
    assert_eq!(snap.flushed, 0);
}

#[test]
fn test_shutdown_after_suspend_timeout() {
    let _ = tracing_subscriber::fmt::try_init();

    let (dispatcher, resolver) =
        start_slow(StaticResolver::new().with_slow_peer(1, 10, SLOW_DELIVERY));

    dispatcher.enqueue(PacketBatch::new(0, 1, chain_of(0..2)));
    assert!(wait_until(RECV_TIMEOUT, || dispatcher.dump_stats()[0].dequeued == 2));

    dispatcher.suspend_all();
    assert_eq!(dispatcher.state(), PoolState::Suspended);
    dispatcher.enqueue(PacketBatch::new(0, 1, chain_of(2..5)));
    dispatcher.shutdown_all();

    assert_eq!(dispatcher.state(), PoolState::ShutDown);
    let snap = &dispatcher.dump_stats()[0];
    assert_eq!(snap.state, WorkerState::Terminated);
    assert_eq!(snap.total_queued(), 5);
    assert_eq!(snap.total_accounted(), 5);
    assert!(snap.delivered >= 2);
    let reported: u64 = resolver.drain().iter().map(|c| c.packets as u64).sum();
    assert_eq!(reported, snap.delivered);
}

#[test]
fn test_shutdown_accounts_for_every_packet() {
    let _ = tracing_subscriber::fmt::try_init();

    let (dispatcher, _resolver) = start(4, StaticResolver::new().with_peer(1, 10));

    thread::scope(|s| {
        for ring in 0..4u8 {
            let dispatcher = &dispatcher;
            s.spawn(move || {
                for n in 0..500u64 {
                    dispatcher.enqueue(PacketBatch::new(ring, 1, chain_of(n..n + 3)));
                }
            });
        }
    });
    dispatcher.shutdown_all();

    for snap in dispatcher.dump_stats() {
        assert_eq!(snap.state, WorkerState::Terminated);
        assert_eq!(snap.total_queued(), 1500);
        assert_eq!(snap.total_accounted(), 1500);
        assert_eq!(snap.queue_len, 0);
    }
}

#[test]
fn test_shutdown_while_suspended() {
    let _ = tracing_subscriber::fmt::try_init();

    let (dispatcher, resolver) = start(2, StaticResolver::new().with_peer(1, 10));

    dispatcher.suspend_all();
    dispatcher.enqueue(PacketBatch::new(0, 1, chain_of(0..3)));
    dispatcher.shutdown_all();

    assert_eq!(dispatcher.state(), PoolState::ShutDown);
    assert!(resolver.drain().is_empty());
    let stats = dispatcher.dump_stats();
    assert_eq!(stats[0].flushed, 3);
    assert!(stats.iter().all(|s| s.state == WorkerState::Terminated));
}

#[test]
fn test_shutdown_is_idempotent() {
    let _ = tracing_subscriber::fmt::try_init();

    let (dispatcher, _resolver) = start(3, StaticResolver::new());
    dispatcher.shutdown_all();
    dispatcher.shutdown_all();
    dispatcher.deinit();

    // Dropping a running pool shuts it down too.
    let (dispatcher, _resolver) = start(1, StaticResolver::new());
    drop(dispatcher);
}

#[test]
fn test_enqueue_after_shutdown_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let (dispatcher, resolver) = start(1, StaticResolver::new().with_peer(1, 10));
    dispatcher.shutdown_all();

    dispatcher.enqueue(PacketBatch::new(0, 1, chain_of(0..3)));

    let snap = &dispatcher.dump_stats()[0];
    assert_eq!(snap.enqueue_rejected, 3);
    assert_eq!(snap.total_queued(), 0);
    assert_eq!(snap.queue_len, 0);
    assert!(resolver.drain().is_empty());
}

#[test]
fn test_flush_by_peer() {
    let _ = tracing_subscriber::fmt::try_init();

    let resolver = StaticResolver::new().with_peer(1, 10).with_peer(2, 20);
    let (dispatcher, resolver) = start(2, resolver);

    dispatcher.suspend_all();
    dispatcher.enqueue(PacketBatch::new(0, 1, chain_of(0..3)));
    dispatcher.enqueue(PacketBatch::new(0, 2, chain_of(10..12)));
    dispatcher.enqueue(PacketBatch::new(1, 1, chain_of(20..23)));

    assert_eq!(dispatcher.flush_by_peer(1), 6);
    assert_eq!(dispatcher.flush_by_peer(1), 0);
    dispatcher.resume_all().expect("Pool should be suspended");

    let chain = resolver
        .receiver()
        .recv_timeout(RECV_TIMEOUT)
        .expect("Peer 2 batch lost");
    assert_eq!(chain.device, 20);
    assert_eq!(chain.tags, vec![10, 11]);

    dispatcher.shutdown_all();
    assert!(resolver.drain().is_empty());
    let stats = dispatcher.dump_stats();
    assert_eq!(stats[0].flushed, 3);
    assert_eq!(stats[1].flushed, 3);
    assert_eq!(stats[0].delivered, 2);
}

#[test]
fn test_init_rejects_invalid_config() {
    let _ = tracing_subscriber::fmt::try_init();

    let resolver = Arc::new(StaticResolver::new());
    for threads in [0, 5, 255] {
        let result = Dispatcher::init(DispatcherConfig::with_threads(threads), resolver.clone());
        assert!(matches!(result, Err(DispatchError::InvalidConfig(_))));
    }

    let config = DispatcherConfig {
        start_timeout_ms: 0,
        ..DispatcherConfig::default()
    };
    assert!(matches!(
        Dispatcher::init(config, resolver),
        Err(DispatchError::InvalidConfig(_))
    ));
}

#[test]
fn test_init_from_config_file() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"thread_count": 3, "thread_name_prefix": "dp-rx"}}"#).unwrap();

    let config = DispatcherConfig::from_file(file.path()).unwrap();
    assert_eq!(config.suspend_timeout_ms, 200);

    let dispatcher = Dispatcher::init(config, Arc::new(StaticResolver::new())).unwrap();
    assert_eq!(dispatcher.thread_count(), 3);
    assert_eq!(
        dispatcher.get_delivery_context(2).unwrap().thread_name(),
        "dp-rx-2"
    );
    assert!(matches!(
        dispatcher.get_delivery_context(3),
        Err(DispatchError::InvalidRing {
            ring_id: 3,
            thread_count: 3
        })
    ));
    dispatcher.log_stats();
}

//! epstore soak driver
//!
//! Runs a store with its flusher and maintenance tasks against an in-memory
//! persistence layer, drives a mixed workload from a few tokio tasks and
//! reports queue and flush statistics until the duration elapses or Ctrl+C.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use epstore::flusher::EpStore;
use epstore::persistence::{MemoryKVStore, Vbid};
use epstore::storage::Item;
use epstore::tasks::{schedule_maintenance, ExecutorPool};
use epstore::StoreConfig;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Soak-test an eventually-persistent store.
#[derive(Debug, Parser)]
#[command(name = "epstore", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Executor worker threads (overrides the config file)
    #[arg(long)]
    threads: Option<usize>,

    /// Number of distinct keys the workload touches
    #[arg(long, default_value_t = 10_000)]
    keys: u64,

    /// Number of concurrent writer tasks
    #[arg(long, default_value_t = 4)]
    writers: usize,

    /// Run time in seconds (0 = until Ctrl+C)
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Value size in bytes
    #[arg(long, default_value_t = 256)]
    value_size: usize,

    /// Expiry in seconds given to one write in ten (0 = none)
    #[arg(long, default_value_t = 5)]
    ttl_secs: u32,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "EPSTORE_LOG", default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default)]
struct WorkloadStats {
    sets: AtomicU64,
    gets: AtomicU64,
    misses: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
}

fn load_config(args: &Args) -> anyhow::Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StoreConfig::default(),
    };
    if let Some(threads) = args.threads {
        config.executor.threads = threads;
    }
    config.validate()?;
    Ok(config)
}

fn key_for(n: u64, keys: u64) -> Bytes {
    let mut hasher = DefaultHasher::new();
    n.hash(&mut hasher);
    Bytes::from(format!("key:{:08}", hasher.finish() % keys.max(1)))
}

async fn writer_loop(
    id: usize,
    store: Arc<EpStore>,
    args: Arc<Args>,
    stats: Arc<WorkloadStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let value = Bytes::from(vec![b'x'; args.value_size]);
    let mut n = id as u64;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        for _ in 0..100 {
            let key = key_for(n, args.keys);
            match n % 10 {
                0..=4 => {
                    store.set(&Item::new(key, 0, 0, value.clone()));
                    stats.sets.fetch_add(1, Ordering::Relaxed);
                }
                5 => {
                    let exptime = if args.ttl_secs == 0 {
                        0
                    } else {
                        store.table().now() + args.ttl_secs
                    };
                    store.set(&Item::new(key, 0, exptime, value.clone()));
                    stats.sets.fetch_add(1, Ordering::Relaxed);
                }
                6 | 7 => {
                    if store.get(&key).is_err() {
                        stats.misses.fetch_add(1, Ordering::Relaxed);
                    }
                    stats.gets.fetch_add(1, Ordering::Relaxed);
                }
                8 => {
                    if store.del(&key, 0).is_ok() {
                        stats.deletes.fetch_add(1, Ordering::Relaxed);
                    }
                }
                _ => {
                    if store.evict_key(&key) {
                        stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            n += args.writers as u64;
        }

        tokio::select! {
            _ = tokio::task::yield_now() => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

async fn report_loop(
    store: Arc<EpStore>,
    stats: Arc<WorkloadStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_rx.changed() => return,
        }
        let snapshot = store.stats();
        info!(
            items = snapshot.table.num_items,
            deleted = snapshot.table.num_deleted_items,
            non_resident = snapshot.table.num_non_resident_items,
            ht_size = snapshot.table.size,
            queue = snapshot.queue_size,
            todo = snapshot.flush.flusher_todo,
            flushed = snapshot.flush.items_flushed + snapshot.flush.deletes_flushed,
            commits = snapshot.flush.commits,
            dirty_age_ms = snapshot.flush.dirty_age.as_millis() as u64,
            mem_used = snapshot.mem_used,
            sets = stats.sets.load(Ordering::Relaxed),
            gets = stats.gets.load(Ordering::Relaxed),
            "store stats"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arc::new(Args::parse());

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log filter")?;
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = load_config(&args)?;
    info!(
        version = epstore::VERSION,
        ht_size = config.ht_size,
        ht_locks = config.ht_locks,
        threads = config.executor.threads,
        eviction = ?config.eviction_policy,
        "starting epstore soak"
    );

    let pool = ExecutorPool::new(&config.executor).context("starting executor pool")?;
    let kv = MemoryKVStore::new(Vbid(config.vbucket));
    let store = Arc::new(EpStore::new(config, Box::new(kv.clone())));
    store.start_flusher(&pool.handle());
    let maintenance = schedule_maintenance(&store, &pool.handle());
    info!(tasks = maintenance.len(), "maintenance tasks scheduled");

    let stats = Arc::new(WorkloadStats::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::with_capacity(args.writers);
    for id in 0..args.writers {
        workers.push(tokio::spawn(writer_loop(
            id,
            Arc::clone(&store),
            Arc::clone(&args),
            Arc::clone(&stats),
            shutdown_rx.clone(),
        )));
    }
    let reporter = tokio::spawn(report_loop(
        Arc::clone(&store),
        Arc::clone(&stats),
        shutdown_rx,
    ));

    let run_for = async {
        if args.duration_secs == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;
        }
    };
    tokio::select! {
        _ = run_for => info!("run time elapsed"),
        result = signal::ctrl_c() => {
            result.context("installing Ctrl+C handler")?;
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    for worker in workers {
        worker.await?;
    }
    reporter.await?;

    let drained = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || store.shutdown(Duration::from_secs(30))).await?
    };
    for task in &maintenance {
        pool.cancel(task);
    }
    pool.shutdown();

    let snapshot = store.stats();
    if !drained {
        warn!(queue = snapshot.queue_size, "store shut down with unflushed documents");
    }
    info!(
        sets = stats.sets.load(Ordering::Relaxed),
        gets = stats.gets.load(Ordering::Relaxed),
        misses = stats.misses.load(Ordering::Relaxed),
        deletes = stats.deletes.load(Ordering::Relaxed),
        evictions = stats.evictions.load(Ordering::Relaxed),
        commits = snapshot.flush.commits,
        persisted = kv.len(),
        "soak complete"
    );
    Ok(())
}

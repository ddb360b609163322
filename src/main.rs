//! # Sardonyx
//!
//! Command-line demo of time-bounded incremental iteration and time-series
//! maintenance over an in-memory versioned store.
//!
//! ## Data layout
//!
//! ```text
//! /tsd/<series>/<slot>                                  sample written at <slot> (wall nanos)
//! /local/range/<id>/queue-last-processed/<queue>        replica bookkeeping
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sdx_core::{Clock, Key, RangeDescriptor, Timestamp};
use sdx_engine::{Engine, MemEngine};
use sdx_incremental::{IncrementalIterConfig, IncrementalIterator};
use sdx_maintenance::{
    series_prefix, write_sample, LocalClient, MaintenanceConfig, MemStore, QueueDriver, Store,
    TimeSeriesMaintenanceQueue, TimeSeriesStore, TSD_PREFIX,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HOUR: i64 = 3_600_000_000_000;

// CLI

#[derive(Parser)]
#[command(name = "sardonyx")]
#[command(about = "Incremental MVCC iteration and time-series maintenance demo")]
#[command(version)]
struct Cli {
    /// JSON file with a maintenance configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of time series to seed
    #[arg(long, default_value_t = 12)]
    series: usize,

    /// Days of hourly samples per series
    #[arg(long, default_value_t = 45)]
    days: i64,

    /// Number of replicas splitting the time-series keyspace
    #[arg(long, default_value_t = 4)]
    replicas: usize,

    /// Seed for sample values
    #[arg(long, default_value_t = 7)]
    seed: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed data, run one maintenance pass over every replica, report what changed
    Demo,
    /// Scan a window of the last N hours with and without time-bound cursors
    Scan {
        /// Window start, in hours before now
        #[arg(long, default_value_t = 30)]
        from_hours: i64,

        /// Window end, in hours before now
        #[arg(long, default_value_t = 0)]
        to_hours: i64,
    },
    /// Run the paced queue driver for a while
    Run {
        /// How long to run, in seconds
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

// Setup

struct Cluster {
    engine: Arc<MemEngine>,
    store: Arc<MemStore>,
    queue: Arc<TimeSeriesMaintenanceQueue>,
    driver: Arc<QueueDriver>,
    now: Timestamp,
}

fn load_config(path: Option<&PathBuf>) -> Result<MaintenanceConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(MaintenanceConfig::default()),
    }
}

fn series_name(i: usize) -> String {
    format!("cr.node.metric-{:03}", i)
}

/// Hourly samples for every series, one flushed segment per day.
fn seed(
    engine: &MemEngine,
    cli: &Cli,
    now: Timestamp,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut written = 0;
    let hours = cli.days * 24;
    for h in (1..=hours).rev() {
        let at = now.add(-h * HOUR, 0);
        for s in 0..cli.series {
            let value: f64 = rng.gen_range(0.0..100.0);
            write_sample(engine, &series_name(s), at, format!("{:.3}", value).as_bytes())?;
            written += 1;
        }
        if h % 24 == 0 {
            engine.flush()?;
        }
    }
    engine.flush()?;
    Ok(written)
}

/// Split the time-series keyspace into `count` replicas on series boundaries,
/// plus one replica with no time series at all.
fn add_replicas(store: &MemStore, cli: &Cli) {
    let count = cli.replicas.clamp(1, cli.series.max(1));
    let tsd = Key::new(TSD_PREFIX.to_vec());
    let mut start = tsd.clone();
    for i in 1..=count {
        let end = if i == count {
            tsd.prefix_end()
        } else {
            series_prefix(&series_name(i * cli.series / count))
        };
        store.add_replica(RangeDescriptor::new(i as u64, start.clone(), end.clone()));
        start = end;
    }
    store.add_replica(RangeDescriptor::new(count as u64 + 1, "/db/", "/db0"));
}

fn build(cli: &Cli, config: &MaintenanceConfig) -> Result<Cluster, Box<dyn std::error::Error>> {
    let engine = Arc::new(MemEngine::new());
    let clock = Arc::new(Clock::wall());
    let store = Arc::new(MemStore::new(engine.clone(), clock.clone()));

    let now = clock.now();
    let written = seed(&engine, cli, now)?;
    add_replicas(&store, cli);
    info!(
        samples = written,
        segments = engine.segment_count(),
        replicas = store.replica_count(),
        "seeded store"
    );

    let queue = Arc::new(TimeSeriesMaintenanceQueue::new(
        store.clone(),
        Arc::new(LocalClient::new(engine.clone())),
        Arc::new(TimeSeriesStore::new(config.time_series.clone())),
        config,
    ));
    let driver = Arc::new(
        QueueDriver::new(queue.clone(), store.clone())
            .with_concurrency(config.max_concurrency)
            .with_scan_interval(config.scan_interval),
    );
    Ok(Cluster {
        engine,
        store,
        queue,
        driver,
        now,
    })
}

fn format_ts(ts: Timestamp) -> String {
    let wall = Utc.timestamp_nanos(ts.wall_time).to_rfc3339();
    if ts.logical == 0 {
        wall
    } else {
        format!("{} (+{})", wall, ts.logical)
    }
}

/// Count live and deleted samples as of now.
fn census(
    engine: &MemEngine,
    config: IncrementalIterConfig,
) -> Result<(usize, usize), Box<dyn std::error::Error>> {
    let snapshot = engine.snapshot()?;
    let mut iter =
        IncrementalIterator::with_config(&snapshot, Timestamp::MIN, Timestamp::MAX, &config)?;
    let tsd = Key::new(TSD_PREFIX.to_vec());
    iter.reset(&tsd, &tsd.prefix_end());

    let (mut live, mut deleted) = (0, 0);
    let mut last: Option<Key> = None;
    for kv in iter.collect_kvs()? {
        if last.as_ref() == Some(&kv.key.key) {
            continue;
        }
        if kv.is_tombstone() {
            deleted += 1;
        } else {
            live += 1;
        }
        last = Some(kv.key.key);
    }
    Ok((live, deleted))
}

// Commands

async fn demo(cluster: &Cluster) -> Result<(), Box<dyn std::error::Error>> {
    let (live, _) = census(&cluster.engine, IncrementalIterConfig::default())?;
    println!("{} {} live samples as of {}", "▸".cyan(), live, format_ts(cluster.now));

    let cancel = CancellationToken::new();
    let queued = cluster.driver.scan_once(&cancel);
    println!(
        "{} {} of {} replicas queued for maintenance",
        "▸".cyan(),
        queued,
        cluster.store.replica_count()
    );

    let (ok, failed) = cluster.driver.drain(&cancel).await;
    let (live, deleted) = census(&cluster.engine, IncrementalIterConfig::default())?;
    println!("{} processed {} replicas, {} failed", "✓".green(), ok, failed);
    println!("{} {} live samples, {} pruned", "▸".cyan(), live, deleted);

    // A second pass finds nothing due.
    let requeued = cluster.driver.scan_once(&cancel);
    println!("{} {} replicas due on an immediate rescan", "▸".cyan(), requeued);

    let metrics = cluster.queue.metrics().snapshot();
    println!("\n{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn scan(
    cluster: &Cluster,
    from_hours: i64,
    to_hours: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = cluster.now.add(-from_hours * HOUR, 0);
    let end = cluster.now.add(-to_hours * HOUR, 0);
    println!("{} window ({}, {}]", "▸".cyan(), format_ts(start), format_ts(end));

    let snapshot = cluster.engine.snapshot()?;
    let mut results = Vec::new();
    for time_bound_iterators in [false, true] {
        let config = IncrementalIterConfig { time_bound_iterators };
        let started = std::time::Instant::now();
        let mut iter = IncrementalIterator::with_config(&snapshot, start, end, &config)?;
        iter.reset(&Key::min(), &Key::max());
        let kvs = iter.collect_kvs()?;
        println!(
            "  {:<20} {:>7} versions in {:?}",
            if time_bound_iterators { "time-bound cursors" } else { "full cursors" },
            kvs.len(),
            started.elapsed()
        );
        results.push(kvs);
    }

    if results.windows(2).all(|w| w[0] == w[1]) {
        println!("{} outputs match", "✓".green());
    } else {
        println!("{} outputs differ", "✗".red());
    }
    Ok(())
}

async fn run(cluster: &Cluster, seconds: u64) {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(cluster.driver.clone().run(cancel.clone()));
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    cancel.cancel();
    if let Err(e) = handle.await {
        println!("{} driver task failed: {}", "✗".red(), e);
    }

    let metrics = cluster.queue.metrics().snapshot();
    println!(
        "{} {} succeeded, {} failed, {} still pending",
        "▸".cyan(),
        metrics.successes,
        metrics.failures,
        metrics.pending
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(cli.config.as_ref())?;
    let cluster = build(&cli, &config)?;

    match cli.command {
        Commands::Demo => demo(&cluster).await?,
        Commands::Scan { from_hours, to_hours } => scan(&cluster, from_hours, to_hours)?,
        Commands::Run { seconds } => run(&cluster, seconds).await,
    }
    Ok(())
}

use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use engine::{AllocationEngine, EngineEvent, SystemHeap};
use memory::{MemoryPressureThresholds, SnapshotSampler, TelemetrySampler};
use storage::{JsonFileBackend, ResultStore};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use util::{bytes_to_gib, format_bytes, gib_to_bytes};

mod cli;

use cli::{Cli, Command, RunArgs};

const EVENT_POLL: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let history_path = cli.history_path();
    match &cli.command {
        Command::Run(args) => {
            let store = ResultStore::open(JsonFileBackend::new(&history_path));
            run(args, store)
        }
        Command::History { json } => {
            let mut store = ResultStore::open(JsonFileBackend::new(&history_path));
            let history = store
                .load()
                .with_context(|| format!("reading history from {}", history_path.display()))?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else if history.is_empty() {
                println!("No runs recorded.");
            } else {
                for (index, run) in history.iter().enumerate() {
                    println!(
                        "#{:<3} {:>7.2} GiB  {:<6} {:>4.0} GB RAM  {}",
                        index + 1,
                        run.peak_gb,
                        run.device_class,
                        run.device_ram_gb,
                        run.os_version
                    );
                }
            }
            Ok(())
        }
        Command::ClearHistory => {
            let mut store = ResultStore::open(JsonFileBackend::new(&history_path));
            store
                .clear()
                .with_context(|| format!("clearing history at {}", history_path.display()))?;
            println!("History cleared.");
            Ok(())
        }
        Command::Snapshot { device_class } => {
            let snapshot = SnapshotSampler::system().sample();
            let pressure = snapshot.pressure(&MemoryPressureThresholds::default());
            println!("Device RAM:  {:.0} GB tier", snapshot.ram_tier_gb());
            println!("Free:        {}", format_bytes(snapshot.free_bytes));
            println!("Used:        {}", format_bytes(snapshot.used_bytes()));
            println!("Wired:       {}", format_bytes(snapshot.wired_bytes));
            println!("App:         {}", format_bytes(snapshot.app_resident_bytes));
            println!("Other apps:  {}", format_bytes(snapshot.other_apps_bytes()));
            println!("Pressure:    {pressure:?}");
            println!(
                "First chunk: {} ({device_class})",
                format_bytes(policy::next_chunk_size(*device_class, snapshot.ram_tier_gb(), 0))
            );
            Ok(())
        }
    }
}

fn run(args: &RunArgs, store: ResultStore) -> Result<()> {
    let heap = match args.ceiling_gb {
        Some(gb) => SystemHeap::with_ceiling(gib_to_bytes(gb)),
        None => SystemHeap::new(),
    };
    let engine = AllocationEngine::new(
        args.engine_config(),
        heap,
        SnapshotSampler::system(),
        store,
    );
    let events = engine.subscribe();
    let thresholds = MemoryPressureThresholds::default();

    let (done_tx, done_rx) = mpsc::channel();
    engine.start(move |gb| {
        let _ = done_tx.send(gb);
    });
    info!(history_len = engine.history().len(), "allocating; interrupt to abort");

    loop {
        match events.recv_timeout(EVENT_POLL) {
            Some(EngineEvent::ChunkCommitted {
                chunk_bytes,
                total_bytes,
                snapshot,
                ..
            }) => {
                println!(
                    "{:>12}  +{:<10} free {:>10}  {:?}",
                    format_bytes(total_bytes),
                    format_bytes(chunk_bytes),
                    format_bytes(snapshot.free_bytes),
                    snapshot.pressure(&thresholds)
                );
            }
            Some(EngineEvent::Finalized { .. } | EngineEvent::Cancelled { .. }) => break,
            Some(_) => {}
            None => {
                if let Ok(gb) = done_rx.try_recv() {
                    return finish(&engine, gb);
                }
            }
        }
    }

    let gb = done_rx.recv().context("allocation engine exited without a result")?;
    finish(&engine, gb)
}

fn finish(engine: &AllocationEngine<SystemHeap>, gb: f64) -> Result<()> {
    let total = engine.total_allocated();
    engine.clear();
    engine.join();
    println!("Maximum allocatable memory: {gb:.2} GiB");
    info!(
        total = %format_bytes(total),
        ram_tier_gb = engine.profile().ram_tier_gb,
        share_of_tier = bytes_to_gib(total) / engine.profile().ram_tier_gb,
        "run complete"
    );
    Ok(())
}

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

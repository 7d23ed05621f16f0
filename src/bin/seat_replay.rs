//! seat_replay - replay recorded seat observations into the store
//!
//! Reads a per-frame records file (JSONL) written by `seatwatch`, runs the
//! observations through the seat state machine again and stores the
//! resulting events, snapshots and alerts. Malformed lines are skipped.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use seatwatch::records::{read_records, replay_into};
use seatwatch::{AlertPolicy, OccupancyStateMachine, SeatCatalog, SeatStore, SqliteSeatStore};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "seat_replay", about = "Replay recorded seat observations into the database")]
struct Args {
    /// Records file written by seatwatch
    #[arg(long, env = "SEATWATCH_STATES_PATH", default_value = "runtime/seat_states.jsonl")]
    records: PathBuf,

    /// SQLite database
    #[arg(long, env = "SEATWATCH_DB_PATH", default_value = "seatwatch.db")]
    db: String,

    /// Seat catalog to record in the seats table
    #[arg(long)]
    seats: Option<PathBuf>,

    /// Seconds of object-only occupancy before an anomaly alert
    #[arg(long, env = "SEATWATCH_ANOMALY_SECS", default_value_t = 120.0)]
    anomaly_secs: f64,

    /// Alert policy (once_per_episode|every_frame)
    #[arg(long, default_value = "once_per_episode")]
    alert_policy: String,

    /// Save a checkpoint every N replayed frames (0 disables)
    #[arg(long, default_value_t = 500)]
    checkpoint_every: u64,

    /// Continue from the latest replay checkpoint, skipping records it already covers
    #[arg(long)]
    resume: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = ui::Ui::for_terminal(&args.ui);

    let policy: AlertPolicy = args.alert_policy.parse()?;
    if !(args.anomaly_secs > 0.0) {
        anyhow::bail!("--anomaly-secs must be greater than zero");
    }

    let mut store = {
        let _stage = ui.stage("Open database");
        SqliteSeatStore::open(&args.db)?
    };
    if let Some(path) = &args.seats {
        let catalog = SeatCatalog::load(path)?;
        for seat in catalog.seats() {
            store.insert_seat(seat)?;
        }
    }

    let batch = {
        let _stage = ui.stage("Read records");
        read_records(&args.records)?
    };

    let mut machine = OccupancyStateMachine::new(args.anomaly_secs, policy);
    let report = {
        let _stage = ui.stage("Replay observations");
        replay_into(&batch, &mut machine, &mut store, args.checkpoint_every, args.resume)?
    };

    println!("seat_replay: {}", args.records.display());
    println!("  resumed past:    {}", report.resumed_past);
    println!("  replayed frames: {}", report.replayed);
    println!("  skipped lines:   {}", batch.skipped_lines);
    println!("  skipped items:   {}", batch.skipped_items);
    println!("  store errors:    {}", report.store_errors);
    println!("  seat events:     {}", report.events);
    println!("  anomaly alerts:  {}", report.alerts);
    let pending = store.pending_alerts()?;
    if !pending.is_empty() {
        println!("  pending alerts:");
        for alert in pending {
            println!("    {} seat={} {}", alert.alert_id, alert.seat_id, alert.description);
        }
    }
    Ok(())
}

//! seatwatch - seat occupancy monitor
//!
//! Processes one video (or directory of frame images) against a seat catalog:
//! 1. Samples frames under a bounded sampling plan
//! 2. Detects people and objects, estimates foreground motion
//! 3. Classifies every seat per frame and tracks seat status over time
//! 4. Appends per-frame records (JSONL) and stores events, snapshots and alerts
//!
//! A run summary is always printed unless setup fails.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use seatwatch::config::{SeatwatchConfig, TraversalMode};
use seatwatch::ingest::{FileSource, FrameSource, ImageDirectory};
use seatwatch::traversal::{ExtractOptions, StopToken};
use seatwatch::{
    OccupancyClassifier, OccupancyStateMachine, Pipeline, RecordWriter, RunSummary, SamplePlan,
    SamplingRate, SeatCatalog, SqliteSeatStore,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "seatwatch", about = "Track seat occupancy in a video or image directory")]
struct Args {
    /// TOML config file
    #[arg(long, env = "SEATWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Video file, `stub://` source, or directory of images
    #[arg(long, short = 'i')]
    input: Option<String>,

    /// Seat catalog JSON
    #[arg(long)]
    seats: Option<PathBuf>,

    /// Traversal mode (auto|stream|extract|images)
    #[arg(long)]
    mode: Option<String>,

    /// Frames per second to sample from video
    #[arg(long)]
    target_fps: Option<f64>,

    /// Samples per 100 images in image mode
    #[arg(long)]
    per100: Option<i32>,

    /// First source index to visit
    #[arg(long)]
    start: Option<u64>,

    /// Last source index to visit (inclusive)
    #[arg(long)]
    end: Option<u64>,

    /// Stop after this many processed frames
    #[arg(long = "max")]
    max_frames: Option<u64>,

    /// Detection script for the stub backend
    #[arg(long, value_name = "PATH")]
    detections: Option<PathBuf>,

    /// ONNX model; selects the tract backend
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// SQLite database
    #[arg(long)]
    db: Option<String>,

    /// Per-frame records file (JSONL, appended)
    #[arg(long)]
    states: Option<PathBuf>,

    /// Seconds of object-only occupancy before an anomaly alert
    #[arg(long)]
    anomaly_secs: Option<f64>,

    /// Alert policy (once_per_episode|every_frame)
    #[arg(long)]
    alert_policy: Option<String>,

    /// Disable the foreground (motion) fallback
    #[arg(long)]
    no_foreground: bool,

    /// Resume seat state from the latest checkpoint in the database
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

    let cfg = {
        let _stage = ui.stage("Load configuration");
        load_config(&args)?
    };
    let input = cfg
        .source
        .input
        .clone()
        .ok_or_else(|| anyhow!("no input given (use --input or SEATWATCH_INPUT)"))?;

    let catalog = {
        let _stage = ui.stage("Load seat catalog");
        SeatCatalog::load(&cfg.seats_path)?
    };

    let stop = StopToken::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        log::info!("interrupt received, stopping after the current frame");
        handler_stop.stop();
    })
    .map_err(|e| anyhow!("failed to set Ctrl-C handler: {}", e))?;

    let mut pipeline = {
        let _stage = ui.stage("Prepare pipeline");
        let detectors = cfg.detector.build_registry()?;
        let classifier = OccupancyClassifier::new(cfg.classifier)?;
        let machine =
            OccupancyStateMachine::new(cfg.state.anomaly_threshold_secs, cfg.state.alert_policy);
        let store = SqliteSeatStore::open(&cfg.output.db_path)?;
        let writer = RecordWriter::open(&cfg.output.states_path, Some(&cfg.output.latest_path))?;
        let mut pipeline = Pipeline::new(catalog, classifier, detectors, machine)
            .with_store(Box::new(store))?
            .with_writer(writer)
            .with_max_frames(cfg.source.max_frames)
            .with_checkpoint_every(cfg.state.checkpoint_every)
            .with_stop_token(stop);
        if let Some(estimator) = cfg.foreground.build() {
            pipeline = pipeline.with_foreground(estimator);
        }
        if args.resume {
            pipeline.resume_from_store()?;
        }
        pipeline
    };

    let mode = match cfg.source.mode {
        TraversalMode::Auto if Path::new(&input).is_dir() => TraversalMode::Images,
        TraversalMode::Auto => TraversalMode::Stream,
        mode => mode,
    };

    let summary = match mode {
        TraversalMode::Images => {
            let dir = ImageDirectory::scan(Path::new(&input))?;
            let total = dir.len() as u64;
            let plan = SamplePlan::new(
                total,
                cfg.source.start,
                cfg.source.end,
                SamplingRate::PerHundred(cfg.source.sample_per_100),
            );
            let bar = ui.frames(plan.len());
            let progress = bar.clone();
            pipeline = pipeline.on_progress(move |s| progress.set_position(s.processed + s.errors));
            let summary = pipeline.run_image_dir(&dir, &plan, cfg.source.image_fps);
            bar.finish_and_clear();
            summary
        }
        TraversalMode::Stream | TraversalMode::Extract | TraversalMode::Auto => {
            let mut source = FileSource::open(&input)?;
            let rate = SamplingRate::Fps {
                target: cfg.source.target_fps,
                source: source.fps().unwrap_or(0.0),
            };
            let plan = SamplePlan::new(source.frame_count(), cfg.source.start, cfg.source.end, rate);
            let bar = ui.frames(plan.len());
            let progress = bar.clone();
            pipeline = pipeline.on_progress(move |s| progress.set_position(s.processed + s.errors));
            let summary = if mode == TraversalMode::Extract {
                let options = ExtractOptions {
                    jpeg_quality: cfg.output.jpeg_quality,
                    file_prefix: cfg.output.file_prefix.clone(),
                };
                pipeline.run_extracted(&mut source, &plan, &cfg.output.frames_root, &options)?
            } else {
                pipeline.run_stream(&mut source, &plan)
            };
            bar.finish_and_clear();
            summary
        }
    };

    print_summary(&summary);
    Ok(())
}

fn load_config(args: &Args) -> Result<SeatwatchConfig> {
    let mut cfg = SeatwatchConfig::load_from(args.config.as_deref())?;
    if let Some(input) = &args.input {
        cfg.source.input = Some(input.clone());
    }
    if let Some(seats) = &args.seats {
        cfg.seats_path = seats.clone();
    }
    if let Some(mode) = &args.mode {
        cfg.source.mode = mode.parse()?;
    }
    if let Some(fps) = args.target_fps {
        cfg.source.target_fps = fps;
    }
    if let Some(per100) = args.per100 {
        cfg.source.sample_per_100 = per100;
    }
    if let Some(start) = args.start {
        cfg.source.start = start;
    }
    if args.end.is_some() {
        cfg.source.end = args.end;
    }
    if args.max_frames.is_some() {
        cfg.source.max_frames = args.max_frames;
    }
    if let Some(script) = &args.detections {
        cfg.detector.backend = "stub".to_string();
        cfg.detector.script_path = Some(script.clone());
    }
    if let Some(model) = &args.model {
        cfg.detector.backend = "tract".to_string();
        cfg.detector.model_path = Some(model.clone());
    }
    if let Some(db) = &args.db {
        cfg.output.db_path = db.clone();
    }
    if let Some(states) = &args.states {
        cfg.output.states_path = states.clone();
    }
    if let Some(secs) = args.anomaly_secs {
        cfg.state.anomaly_threshold_secs = secs;
    }
    if let Some(policy) = &args.alert_policy {
        cfg.state.alert_policy = policy.parse()?;
    }
    if args.no_foreground {
        cfg.foreground.enabled = false;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn print_summary(summary: &RunSummary) {
    println!("seatwatch: run finished ({})", summary.stop_reason);
    println!("  processed frames: {}", summary.processed);
    println!("  frame errors:     {}", summary.errors);
    println!("  sink failures:    {}", summary.sink_failures);
    println!("  seat events:      {}", summary.events);
    println!("  anomaly alerts:   {}", summary.alerts);
    println!("  flagged frames:   {}", summary.flagged_frames.len());
    match &summary.last_output {
        Some(path) => println!("  last output:      {}", path.display()),
        None => println!("  last output:      (none)"),
    }
}

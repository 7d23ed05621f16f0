//! frame_refetch - re-read sampled frames from the original video
//!
//! Maps sample ordinals (or original frame indices) back to the source video
//! and writes the decoded frames as JPEG files, for re-annotation of exactly
//! the frames a run looked at. Unreadable frames are reported and skipped.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use seatwatch::ingest::{FileSource, FrameSource};
use seatwatch::traversal::{
    fetch_by_original_indices, fetch_by_sample_indices, DEFAULT_FILE_PREFIX, DEFAULT_JPEG_QUALITY,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "frame_refetch", about = "Re-fetch sampled frames from the original video")]
struct Args {
    /// Original video (or `stub://` source)
    #[arg(long, short = 'i')]
    input: String,

    /// Comma-separated sample ordinals
    #[arg(long, value_delimiter = ',', conflicts_with = "original")]
    samples: Vec<i64>,

    /// Rate the samples were taken at
    #[arg(long, default_value_t = 2.0)]
    sample_fps: f64,

    /// Override the source frame rate
    #[arg(long)]
    original_fps: Option<f64>,

    /// Comma-separated original frame indices
    #[arg(long, value_delimiter = ',')]
    original: Vec<u64>,

    /// Output directory
    #[arg(long, default_value = "refetched")]
    out: PathBuf,

    /// JPEG quality (1-100)
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY)]
    quality: u8,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = ui::Ui::for_terminal(&args.ui);

    if args.samples.is_empty() && args.original.is_empty() {
        return Err(anyhow!("give --samples or --original"));
    }

    let mut source = {
        let _stage = ui.stage("Open source");
        FileSource::open(&args.input)?
    };
    let fetched = {
        let _stage = ui.stage("Fetch frames");
        if args.original.is_empty() {
            fetch_by_sample_indices(&mut source, &args.samples, args.sample_fps, args.original_fps)
        } else {
            fetch_by_original_indices(&mut source, &args.original)
        }
    };

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let (mut written, mut missing) = (0usize, 0usize);
    {
        let _stage = ui.stage("Write images");
        for item in &fetched {
            let Some(frame) = &item.frame else {
                missing += 1;
                println!("  frame {}: unavailable", item.original_index);
                continue;
            };
            let path = args
                .out
                .join(format!("{}{:06}.jpg", DEFAULT_FILE_PREFIX, item.original_index));
            frame.save_jpeg(&path, args.quality)?;
            written += 1;
        }
    }

    println!(
        "frame_refetch: {} written, {} unavailable ({} at {:?} fps)",
        written,
        missing,
        source.describe(),
        source.fps()
    );
    Ok(())
}

//! Traversal modes over a sampling plan.
//!
//! - `StreamFrames`: seek and decode one sampled index at a time, no files.
//! - `extract_to_dir` + `ImageDirFrames`: write sampled frames into a
//!   versioned directory, then iterate the written files.
//! - `ImageDirFrames::new`: iterate images already on disk.
//!
//! All iterators are lazy, finite and stop early once their `StopToken` is
//! triggered.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::Frame;
use crate::ingest::{index_timestamp_ms, FrameSource, ImageDirectory, ImageEntry};
use crate::sampler::{map_sample_to_original, SampleIndices, SamplePlan};

/// Consecutive write failures that abort a bulk extraction.
pub const MAX_CONSECUTIVE_WRITE_FAILURES: u32 = 3;
pub const DEFAULT_FILE_PREFIX: &str = "frame_";
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Cooperative cancellation flag shared between a traversal and its owner.
#[derive(Clone, Debug, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A frame selected by the sampling plan.
#[derive(Clone, Debug)]
pub struct SampledFrame {
    /// Position within the sampled sequence (0, 1, 2, ...).
    pub ordinal: u64,
    /// File the frame was read from, for directory traversals.
    pub image_path: Option<PathBuf>,
    /// Decoded pixels. `frame.index` is the source index.
    pub frame: Frame,
}

impl SampledFrame {
    pub fn source_index(&self) -> u64 {
        self.frame.index
    }
}

// ----------------------------------------------------------------------------
// Streaming mode
// ----------------------------------------------------------------------------

/// Streams sampled frames straight from a source.
///
/// A read failure is treated as end of stream: it is logged and the iterator
/// finishes. It is not retried.
pub struct StreamFrames<'a, S: FrameSource + ?Sized> {
    source: &'a mut S,
    indices: SampleIndices,
    ordinal: u64,
    stop: StopToken,
    done: bool,
}

impl<'a, S: FrameSource + ?Sized> StreamFrames<'a, S> {
    pub fn new(source: &'a mut S, plan: &SamplePlan, stop: StopToken) -> Self {
        Self {
            source,
            indices: plan.indices(),
            ordinal: 0,
            stop,
            done: false,
        }
    }
}

impl<S: FrameSource + ?Sized> Iterator for StreamFrames<'_, S> {
    type Item = SampledFrame;

    fn next(&mut self) -> Option<SampledFrame> {
        if self.done {
            return None;
        }
        if self.stop.is_stopped() {
            log::info!("traversal stopped after {} frames", self.ordinal);
            self.done = true;
            return None;
        }
        let index = self.indices.next()?;
        match self.source.read_at(index) {
            Ok(frame) => {
                let ordinal = self.ordinal;
                self.ordinal += 1;
                Some(SampledFrame {
                    ordinal,
                    image_path: None,
                    frame,
                })
            }
            Err(err) => {
                log::warn!(
                    "{}: read failed at frame {}, ending traversal: {:#}",
                    self.source.describe(),
                    index,
                    err
                );
                self.done = true;
                None
            }
        }
    }
}

/// Callback-style traversal: invoke `on_frame` until it returns `false` or
/// the frames run out. Returns the number of frames handed to the callback.
pub fn for_each_until<I, F>(frames: I, mut on_frame: F) -> u64
where
    I: IntoIterator<Item = SampledFrame>,
    F: FnMut(&SampledFrame) -> bool,
{
    let mut visited = 0;
    for sampled in frames {
        visited += 1;
        if !on_frame(&sampled) {
            break;
        }
    }
    visited
}

// ----------------------------------------------------------------------------
// Bulk extraction
// ----------------------------------------------------------------------------

/// Create and return `root/frames_vNNN`, one past the highest existing version.
pub fn next_version_dir(root: &Path) -> Result<PathBuf> {
    static VERSION_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = VERSION_RE
        .get_or_init(|| Regex::new(r"^frames_v(\d+)$").ok())
        .as_ref()
        .ok_or_else(|| anyhow!("version pattern failed to compile"))?;

    std::fs::create_dir_all(root)
        .with_context(|| format!("failed to create {}", root.display()))?;
    let mut max_version = 0u32;
    for entry in std::fs::read_dir(root).with_context(|| format!("failed to list {}", root.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(caps) = name.to_str().and_then(|n| re.captures(n)) else {
            continue;
        };
        if let Some(v) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
            max_version = max_version.max(v);
        }
    }
    let dir = root.join(format!("frames_v{:03}", max_version + 1));
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir)
}

#[derive(Clone, Debug)]
pub struct ExtractOptions {
    pub jpeg_quality: u8,
    pub file_prefix: String,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExtractReport {
    pub out_dir: PathBuf,
    pub saved: Vec<ImageEntry>,
    pub write_failures: u32,
    /// Extraction stopped on consecutive write failures.
    pub aborted: bool,
}

impl ExtractReport {
    /// Listing of the written files, in extraction order.
    pub fn directory(&self) -> ImageDirectory {
        ImageDirectory::from_entries(self.out_dir.clone(), self.saved.clone())
    }
}

/// Write each sampled frame as `<prefix><6-digit index>.jpg` into `out_dir`.
pub fn extract_to_dir<S: FrameSource + ?Sized>(
    source: &mut S,
    plan: &SamplePlan,
    out_dir: &Path,
    options: &ExtractOptions,
    stop: StopToken,
) -> Result<ExtractReport> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let mut report = ExtractReport {
        out_dir: out_dir.to_path_buf(),
        ..ExtractReport::default()
    };
    let mut consecutive = 0u32;

    for sampled in StreamFrames::new(source, plan, stop) {
        let index = sampled.source_index();
        let path = out_dir.join(format!("{}{:06}.jpg", options.file_prefix, index));
        match sampled.frame.save_jpeg(&path, options.jpeg_quality) {
            Ok(()) => {
                consecutive = 0;
                report.saved.push(ImageEntry {
                    path,
                    index: Some(index),
                });
            }
            Err(err) => {
                consecutive += 1;
                report.write_failures += 1;
                log::warn!("write failed for frame {}: {:#}", index, err);
                if consecutive >= MAX_CONSECUTIVE_WRITE_FAILURES {
                    log::error!(
                        "{} consecutive write failures in {}, aborting extraction",
                        consecutive,
                        out_dir.display()
                    );
                    report.aborted = true;
                    break;
                }
            }
        }
    }
    log::info!(
        "extracted {} frames into {}",
        report.saved.len(),
        out_dir.display()
    );
    Ok(report)
}

// ----------------------------------------------------------------------------
// Directory-of-images mode
// ----------------------------------------------------------------------------

/// Iterates sampled images of a directory listing.
///
/// Decode failures are yielded as `Err` items; the iterator keeps going.
pub struct ImageDirFrames {
    entries: Vec<ImageEntry>,
    indices: SampleIndices,
    ordinal: u64,
    fps: Option<f64>,
    last_ts_ms: i64,
    stop: StopToken,
    done: bool,
}

impl ImageDirFrames {
    /// Sample a directory listing with `plan` (built over `dir.len()` items).
    ///
    /// With `fps`, timestamps follow the embedded frame index; without it they
    /// follow the wall clock, clamped to be non-decreasing.
    pub fn new(dir: &ImageDirectory, plan: &SamplePlan, fps: Option<f64>, stop: StopToken) -> Self {
        Self {
            entries: dir.entries().to_vec(),
            indices: plan.indices(),
            ordinal: 0,
            fps,
            last_ts_ms: i64::MIN,
            stop,
            done: false,
        }
    }

    /// Visit every listed file (used after bulk extraction).
    pub fn all(dir: &ImageDirectory, fps: Option<f64>, stop: StopToken) -> Self {
        Self::new(dir, &SamplePlan::exhaustive(dir.len() as u64), fps, stop)
    }

    fn timestamp_for(&mut self, source_index: u64) -> i64 {
        let ts = match self.fps {
            Some(fps) if fps > 0.0 => index_timestamp_ms(source_index, Some(fps)),
            _ => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        };
        let ts = ts.max(self.last_ts_ms);
        self.last_ts_ms = ts;
        ts
    }
}

impl Iterator for ImageDirFrames {
    type Item = Result<SampledFrame>;

    fn next(&mut self) -> Option<Result<SampledFrame>> {
        if self.done {
            return None;
        }
        if self.stop.is_stopped() {
            log::info!("traversal stopped after {} images", self.ordinal);
            self.done = true;
            return None;
        }
        let position = self.indices.next()?;
        let entry = self.entries.get(position as usize)?.clone();
        let source_index = entry.index.unwrap_or(position);
        let ordinal = self.ordinal;
        self.ordinal += 1;
        let timestamp_ms = self.timestamp_for(source_index);
        Some(
            Frame::open(&entry.path, source_index, timestamp_ms).map(|frame| SampledFrame {
                ordinal,
                image_path: Some(entry.path),
                frame,
            }),
        )
    }
}

// ----------------------------------------------------------------------------
// Batch re-fetch
// ----------------------------------------------------------------------------

/// Result of re-fetching one frame. `frame` is `None` when the read failed.
#[derive(Clone, Debug)]
pub struct FetchedFrame {
    pub original_index: u64,
    pub frame: Option<Frame>,
}

/// Re-read frames by original index. Reads happen in ascending index order;
/// results come back in the caller's order.
pub fn fetch_by_original_indices<S: FrameSource + ?Sized>(
    source: &mut S,
    original_indices: &[u64],
) -> Vec<FetchedFrame> {
    let mut order: Vec<usize> = (0..original_indices.len()).collect();
    order.sort_by_key(|&i| original_indices[i]);

    let mut fetched: Vec<Option<Frame>> = vec![None; original_indices.len()];
    for i in order {
        let index = original_indices[i];
        match source.read_at(index) {
            Ok(frame) => fetched[i] = Some(frame),
            Err(err) => log::warn!("re-fetch failed at original frame {}: {:#}", index, err),
        }
    }

    original_indices
        .iter()
        .zip(fetched)
        .map(|(&original_index, frame)| FetchedFrame {
            original_index,
            frame,
        })
        .collect()
}

/// Re-read frames by sample ordinal, mapping each to its original index at
/// `sample_fps`. `original_fps` defaults to the source's reported rate.
pub fn fetch_by_sample_indices<S: FrameSource + ?Sized>(
    source: &mut S,
    sample_indices: &[i64],
    sample_fps: f64,
    original_fps: Option<f64>,
) -> Vec<FetchedFrame> {
    let original_fps = original_fps
        .filter(|fps| *fps > 0.0)
        .or_else(|| source.fps())
        .unwrap_or(0.0);
    let originals: Vec<u64> = sample_indices
        .iter()
        .map(|&si| map_sample_to_original(si, original_fps, sample_fps))
        .collect();
    fetch_by_original_indices(source, &originals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SyntheticSource;
    use crate::sampler::SamplingRate;

    #[test]
    fn stream_follows_plan_and_ordinals() {
        let mut source = SyntheticSource::new(30, 10.0, 4, 4);
        let plan = SamplePlan::new(30, 0, None, SamplingRate::Fps { target: 2.0, source: 10.0 });
        let frames: Vec<SampledFrame> = StreamFrames::new(&mut source, &plan, StopToken::new()).collect();
        let indices: Vec<u64> = frames.iter().map(|f| f.source_index()).collect();
        assert_eq!(indices, vec![0, 5, 10, 15, 20, 25]);
        assert_eq!(frames[3].ordinal, 3);
        assert_eq!(frames[3].frame.timestamp_ms, 1500);
    }

    #[test]
    fn read_failure_ends_stream() {
        let mut source = SyntheticSource::new(20, 10.0, 4, 4).failing_at([6]);
        let plan = SamplePlan::new(20, 0, None, SamplingRate::Fps { target: 5.0, source: 10.0 });
        let indices: Vec<u64> = StreamFrames::new(&mut source, &plan, StopToken::new())
            .map(|f| f.source_index())
            .collect();
        assert_eq!(indices, vec![0, 2, 4]);
    }

    #[test]
    fn stop_token_ends_traversal() {
        let mut source = SyntheticSource::new(50, 10.0, 4, 4);
        let plan = SamplePlan::new(50, 0, None, SamplingRate::Every);
        let stop = StopToken::new();
        let mut seen = 0;
        for sampled in StreamFrames::new(&mut source, &plan, stop.clone()) {
            seen += 1;
            if sampled.ordinal == 4 {
                stop.stop();
            }
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn callback_false_stops_early() {
        let mut source = SyntheticSource::new(50, 10.0, 4, 4);
        let plan = SamplePlan::new(50, 0, None, SamplingRate::Every);
        let visited = for_each_until(StreamFrames::new(&mut source, &plan, StopToken::new()), |f| {
            f.ordinal < 2
        });
        assert_eq!(visited, 3);
    }

    #[test]
    fn version_dirs_increment_past_max() -> Result<()> {
        let root = tempfile::tempdir()?;
        std::fs::create_dir(root.path().join("frames_v002"))?;
        std::fs::create_dir(root.path().join("frames_vx"))?;
        std::fs::create_dir(root.path().join("other"))?;
        std::fs::write(root.path().join("frames_v009"), b"not a dir")?;

        let first = next_version_dir(root.path())?;
        assert_eq!(first.file_name().and_then(|n| n.to_str()), Some("frames_v003"));
        assert!(first.is_dir());
        let second = next_version_dir(root.path())?;
        assert_eq!(second.file_name().and_then(|n| n.to_str()), Some("frames_v004"));

        let fresh = root.path().join("new_root");
        assert!(next_version_dir(&fresh)?.ends_with("frames_v001"));
        Ok(())
    }

    #[test]
    fn extract_then_iterate_written_files() -> Result<()> {
        let root = tempfile::tempdir()?;
        let mut source = SyntheticSource::new(12, 4.0, 8, 8);
        let plan = SamplePlan::new(12, 0, None, SamplingRate::Fps { target: 1.0, source: 4.0 });
        let out = next_version_dir(root.path())?;
        let report = extract_to_dir(&mut source, &plan, &out, &ExtractOptions::default(), StopToken::new())?;
        assert_eq!(report.saved.len(), 3);
        assert!(out.join("frame_000008.jpg").is_file());
        assert!(!report.aborted);

        let frames: Vec<SampledFrame> = ImageDirFrames::all(&report.directory(), Some(4.0), StopToken::new())
            .collect::<Result<_>>()?;
        let indices: Vec<u64> = frames.iter().map(|f| f.source_index()).collect();
        assert_eq!(indices, vec![0, 4, 8]);
        assert_eq!(frames[2].frame.timestamp_ms, 2000);
        assert!(frames[1].image_path.is_some());
        Ok(())
    }

    #[test]
    fn repeated_write_failures_abort_extraction() -> Result<()> {
        let root = tempfile::tempdir()?;
        let out = root.path().join("frames");
        let mut source = SyntheticSource::new(10, 10.0, 4, 4);
        let plan = SamplePlan::new(10, 0, None, SamplingRate::Every);
        let options = ExtractOptions {
            // Prefix with a missing subdirectory makes every write fail.
            file_prefix: "missing/frame_".to_string(),
            ..ExtractOptions::default()
        };
        let report = extract_to_dir(&mut source, &plan, &out, &options, StopToken::new())?;
        assert!(report.aborted);
        assert_eq!(report.write_failures, MAX_CONSECUTIVE_WRITE_FAILURES);
        assert!(report.saved.is_empty());
        Ok(())
    }

    #[test]
    fn image_dir_reports_bad_files_and_continues() -> Result<()> {
        let dir = tempfile::tempdir()?;
        Frame::filled(4, 4, [1, 2, 3], 0, 0).save(&dir.path().join("img_001.png"))?;
        std::fs::write(dir.path().join("img_002.png"), b"garbage")?;
        Frame::filled(4, 4, [1, 2, 3], 0, 0).save(&dir.path().join("img_003.png"))?;

        let listing = ImageDirectory::scan(dir.path())?;
        let plan = SamplePlan::new(listing.len() as u64, 0, None, SamplingRate::Every);
        let results: Vec<Result<SampledFrame>> =
            ImageDirFrames::new(&listing, &plan, None, StopToken::new()).collect();
        assert_eq!(results.len(), 3);
        assert!(results[1].is_err());
        let first = results[0].as_ref().map_err(|e| anyhow!("{e}"))?;
        let last = results[2].as_ref().map_err(|e| anyhow!("{e}"))?;
        assert_eq!(last.source_index(), 3);
        assert!(last.frame.timestamp_ms >= first.frame.timestamp_ms);
        Ok(())
    }

    #[test]
    fn refetch_restores_caller_order_with_placeholders() {
        let mut source = SyntheticSource::new(100, 25.0, 4, 4).failing_at([40]);
        let fetched = fetch_by_original_indices(&mut source, &[60, 10, 40, 10]);
        let got: Vec<(u64, Option<u64>)> = fetched
            .iter()
            .map(|f| (f.original_index, f.frame.as_ref().map(|fr| fr.index)))
            .collect();
        assert_eq!(got, vec![(60, Some(60)), (10, Some(10)), (40, None), (10, Some(10))]);
    }

    #[test]
    fn refetch_by_sample_index_maps_through_rates() {
        let mut source = SyntheticSource::new(200, 25.0, 4, 4);
        let fetched = fetch_by_sample_indices(&mut source, &[2, 0], 5.0, None);
        assert_eq!(fetched[0].original_index, 10);
        assert_eq!(fetched[1].original_index, 0);
        assert!(fetched.iter().all(|f| f.frame.is_some()));
    }
}

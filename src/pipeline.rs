//! Per-source processing pipeline.
//!
//! Frames flow through detection, foreground estimation, classification and
//! the state machine in order. Per-frame failures are logged and counted; the
//! run continues with the next sampled frame. Only setup failures (catalog,
//! source, output sinks) abort a run.

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::catalog::SeatCatalog;
use crate::classify::{FrameMeta, OccupancyClassifier};
use crate::detect::{BackendRegistry, ForegroundEstimator};
use crate::ingest::{FrameSource, ImageDirectory};
use crate::records::{FrameRecord, RecordWriter};
use crate::sampler::SamplePlan;
use crate::state_machine::{OccupancyStateMachine, SeatUpdate};
use crate::storage::{SeatStore, PIPELINE_CHECKPOINTS};
use crate::traversal::{
    extract_to_dir, next_version_dir, ExtractOptions, ImageDirFrames, SampledFrame, StopToken,
    StreamFrames,
};

/// A progress line is logged every this many processed frames.
pub const PROGRESS_EVERY: u64 = 100;

/// Why a run ended. None of these is an error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopReason {
    #[default]
    EndOfStream,
    MaxFrames,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndOfStream => f.write_str("end of stream"),
            StopReason::MaxFrames => f.write_str("max frames reached"),
            StopReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub processed: u64,
    pub errors: u64,
    /// Processed frames whose output could not be fully persisted.
    pub sink_failures: u64,
    pub events: u64,
    pub alerts: u64,
    /// Records file the run appended to.
    pub last_output: Option<PathBuf>,
    /// Frames where a seat changed status, alerted, or was occupied.
    pub flagged_frames: Vec<u64>,
    pub stop_reason: StopReason,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} errors={} sink_failures={} events={} alerts={} flagged={} stop={}",
            self.processed,
            self.errors,
            self.sink_failures,
            self.events,
            self.alerts,
            self.flagged_frames.len(),
            self.stop_reason
        )?;
        if let Some(path) = &self.last_output {
            write!(f, " output={}", path.display())?;
        }
        Ok(())
    }
}

/// Outcome of one successfully processed frame.
#[derive(Clone, Debug)]
pub struct FrameOutcome {
    pub frame_index: u64,
    pub updates: Vec<SeatUpdate>,
    /// Store or record-writer failures for this frame.
    pub sink_failures: u64,
}

impl FrameOutcome {
    pub fn needs_store(&self) -> bool {
        self.updates.iter().any(SeatUpdate::needs_store)
    }
}

type ProgressFn = Box<dyn FnMut(&RunSummary) + Send>;

pub struct Pipeline {
    catalog: SeatCatalog,
    classifier: OccupancyClassifier,
    detectors: BackendRegistry,
    foreground: Option<Box<dyn ForegroundEstimator>>,
    machine: OccupancyStateMachine,
    store: Option<Box<dyn SeatStore>>,
    writer: Option<RecordWriter>,
    max_frames: Option<u64>,
    checkpoint_every: u64,
    stop: StopToken,
    on_progress: Option<ProgressFn>,
}

impl Pipeline {
    pub fn new(
        catalog: SeatCatalog,
        classifier: OccupancyClassifier,
        detectors: BackendRegistry,
        machine: OccupancyStateMachine,
    ) -> Self {
        Self {
            catalog,
            classifier,
            detectors,
            foreground: None,
            machine,
            store: None,
            writer: None,
            max_frames: None,
            checkpoint_every: 0,
            stop: StopToken::new(),
            on_progress: None,
        }
    }

    pub fn with_foreground(mut self, estimator: Box<dyn ForegroundEstimator>) -> Self {
        self.foreground = Some(estimator);
        self
    }

    /// Attach a store and record the catalog's seats in it.
    pub fn with_store(mut self, mut store: Box<dyn SeatStore>) -> Result<Self> {
        for seat in self.catalog.seats() {
            store.insert_seat(seat)?;
        }
        self.store = Some(store);
        Ok(self)
    }

    pub fn with_writer(mut self, writer: RecordWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
        self.max_frames = max_frames.filter(|m| *m > 0);
        self
    }

    /// Save a state-machine checkpoint to the store every `every` frames.
    pub fn with_checkpoint_every(mut self, every: u64) -> Self {
        self.checkpoint_every = every;
        self
    }

    pub fn with_stop_token(mut self, stop: StopToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(&RunSummary) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn machine(&self) -> &OccupancyStateMachine {
        &self.machine
    }

    pub fn catalog(&self) -> &SeatCatalog {
        &self.catalog
    }

    pub fn store_mut(&mut self) -> Option<&mut (dyn SeatStore + 'static)> {
        self.store.as_deref_mut()
    }

    /// Restore the state machine from the store's latest checkpoint.
    /// Returns the frame index the checkpoint was taken at.
    pub fn resume_from_store(&mut self) -> Result<Option<u64>> {
        let Some(store) = self.store.as_mut() else {
            return Ok(None);
        };
        let Some((frame_index, checkpoint)) = store.latest_checkpoint(PIPELINE_CHECKPOINTS)? else {
            return Ok(None);
        };
        log::info!(
            "resuming {} seats from checkpoint at frame {}",
            checkpoint.seats.len(),
            frame_index
        );
        self.machine.restore(checkpoint);
        Ok(Some(frame_index))
    }

    /// Detect, estimate foreground, classify and update seat state for one frame.
    ///
    /// Once the state machine has consumed the frame the outcome is always
    /// returned: store and record-writer failures are logged and counted in
    /// `FrameOutcome::sink_failures` instead of discarding the updates.
    pub fn process_frame(&mut self, sampled: &SampledFrame) -> Result<FrameOutcome> {
        let frame = &sampled.frame;
        let detections = self.detectors.detect(frame)?;
        let mask = match self.foreground.as_mut() {
            Some(estimator) => Some(estimator.apply(frame)?),
            None => None,
        };
        let observations =
            self.classifier
                .classify(&self.catalog, FrameMeta::of(frame), &detections, mask.as_ref())?;
        let updates = self.machine.update_frame(&observations);

        let mut sink_failures = 0;
        if let Some(store) = self.store.as_mut() {
            if let Err(err) = store.store_frame(&updates) {
                sink_failures += 1;
                log::warn!("frame {}: store failed: {:#}", frame.index, err);
            }
        }
        if let Some(writer) = self.writer.as_mut() {
            let image_path = sampled
                .image_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let record = FrameRecord::from_observations(
                frame.index,
                frame.timestamp_ms,
                image_path,
                &self.catalog,
                &observations,
            );
            if let Err(err) = writer.write(&record) {
                sink_failures += 1;
                log::warn!("frame {}: record write failed: {:#}", frame.index, err);
            }
        }

        Ok(FrameOutcome {
            frame_index: frame.index,
            updates,
            sink_failures,
        })
    }

    /// Drive the pipeline over any frame sequence. Item errors count as
    /// per-frame errors.
    pub fn run<I>(&mut self, frames: I) -> RunSummary
    where
        I: IntoIterator<Item = Result<SampledFrame>>,
    {
        let mut summary = RunSummary {
            last_output: self.writer.as_ref().map(|w| w.states_path().to_path_buf()),
            ..RunSummary::default()
        };

        for item in frames {
            if self.stop.is_stopped() {
                summary.stop_reason = StopReason::Cancelled;
                log::info!("stop requested, ending run");
                break;
            }
            if self.max_frames.is_some_and(|max| summary.processed >= max) {
                summary.stop_reason = StopReason::MaxFrames;
                log::info!("reached max frames ({}), ending run", summary.processed);
                break;
            }

            let sampled = match item {
                Ok(sampled) => sampled,
                Err(err) => {
                    summary.errors += 1;
                    log::warn!("skipping unreadable frame: {:#}", err);
                    continue;
                }
            };
            match self.process_frame(&sampled) {
                Ok(outcome) => {
                    summary.processed += 1;
                    summary.sink_failures += outcome.sink_failures;
                    for update in &outcome.updates {
                        summary.events += u64::from(update.event.is_some());
                        summary.alerts += u64::from(update.alert.is_some());
                    }
                    if outcome.needs_store() {
                        summary.flagged_frames.push(outcome.frame_index);
                    }
                    self.maybe_checkpoint(summary.processed, outcome.frame_index, &mut summary);
                }
                Err(err) => {
                    summary.errors += 1;
                    log::warn!("frame {} failed: {:#}", sampled.source_index(), err);
                }
            }

            if summary.processed > 0 && summary.processed % PROGRESS_EVERY == 0 {
                log::info!(
                    "processed={} errors={} sink_failures={}",
                    summary.processed,
                    summary.errors,
                    summary.sink_failures
                );
            }
            if let Some(callback) = self.on_progress.as_mut() {
                callback(&summary);
            }
        }

        if summary.stop_reason == StopReason::EndOfStream && self.stop.is_stopped() {
            summary.stop_reason = StopReason::Cancelled;
        }
        log::info!("run finished: {}", summary);
        summary
    }

    fn maybe_checkpoint(&mut self, processed: u64, frame_index: u64, summary: &mut RunSummary) {
        if self.checkpoint_every == 0 || processed % self.checkpoint_every != 0 {
            return;
        }
        let Some(store) = self.store.as_mut() else {
            return;
        };
        let checkpoint = self.machine.checkpoint();
        if let Err(err) = store.save_checkpoint(PIPELINE_CHECKPOINTS, frame_index, &checkpoint) {
            summary.sink_failures += 1;
            log::warn!("checkpoint at frame {} failed: {:#}", frame_index, err);
        }
    }

    /// Streaming mode: decode sampled frames straight from the source.
    pub fn run_stream<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        plan: &SamplePlan,
    ) -> RunSummary {
        log::info!(
            "streaming {} (step {}, up to {} frames)",
            source.describe(),
            plan.step,
            plan.len()
        );
        let stop = self.stop.clone();
        self.run(StreamFrames::new(source, plan, stop).map(Ok))
    }

    /// Bulk-extract mode: write sampled frames into a fresh versioned
    /// directory under `frames_root`, then process the written files.
    pub fn run_extracted<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        plan: &SamplePlan,
        frames_root: &Path,
        options: &ExtractOptions,
    ) -> Result<RunSummary> {
        let out_dir = next_version_dir(frames_root)?;
        let report = extract_to_dir(source, plan, &out_dir, options, self.stop.clone())?;
        if report.aborted {
            log::warn!(
                "extraction aborted after {} write failures; processing {} saved frames",
                report.write_failures,
                report.saved.len()
            );
        }
        let dir = report.directory();
        let stop = self.stop.clone();
        let mut summary = self.run(ImageDirFrames::all(&dir, source.fps(), stop));
        summary.errors += u64::from(report.write_failures);
        Ok(summary)
    }

    /// Directory-of-images mode.
    pub fn run_image_dir(
        &mut self,
        dir: &ImageDirectory,
        plan: &SamplePlan,
        fps: Option<f64>,
    ) -> RunSummary {
        log::info!(
            "reading {} images from {} (step {})",
            plan.len(),
            dir.root().display(),
            plan.step
        );
        let stop = self.stop.clone();
        self.run(ImageDirFrames::new(dir, plan, fps, stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SeatDefinition;
    use crate::classify::ClassifierConfig;
    use crate::detect::{RawDetection, StubBackend};
    use crate::geometry::{Rect, SeatRegion};
    use crate::ingest::SyntheticSource;
    use crate::sampler::SamplingRate;
    use crate::state_machine::{AlertPolicy, SeatStatus};
    use crate::storage::InMemorySeatStore;

    fn pipeline(stub: StubBackend) -> Result<Pipeline> {
        let catalog = SeatCatalog::new(vec![
            SeatDefinition::new(1, SeatRegion::Rect(Rect::new(0, 0, 32, 48))),
            SeatDefinition::new(2, SeatRegion::Rect(Rect::new(32, 0, 32, 48))),
        ])?;
        let mut detectors = BackendRegistry::new();
        detectors.register(stub);
        Ok(Pipeline::new(
            catalog,
            OccupancyClassifier::new(ClassifierConfig::default())?,
            detectors,
            OccupancyStateMachine::new(120.0, AlertPolicy::OncePerEpisode),
        ))
    }

    #[test]
    fn streams_and_counts_frames() -> Result<()> {
        let stub = StubBackend::new().with_default(vec![RawDetection::person(Rect::new(0, 0, 30, 48), 0.9)]);
        let mut pipeline = pipeline(stub)?;
        let mut source = SyntheticSource::new(50, 10.0, 64, 48);
        let plan = SamplePlan::new(50, 0, None, SamplingRate::Fps { target: 2.0, source: 10.0 });
        let summary = pipeline.run_stream(&mut source, &plan);
        assert_eq!(summary.processed, 10);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.stop_reason, StopReason::EndOfStream);
        // First frame: both seats get their initial event.
        assert_eq!(summary.events, 2);
        assert_eq!(summary.flagged_frames.len(), 10);
        assert_eq!(
            pipeline.machine().state(1).map(|s| s.current_status),
            Some(SeatStatus::Seated)
        );
        Ok(())
    }

    #[test]
    fn bad_detections_are_per_frame_errors() -> Result<()> {
        let stub = StubBackend::new().with_frame(5, vec![RawDetection::object(3, Rect::new(0, 0, 0, 10), 0.9)]);
        let mut pipeline = pipeline(stub)?;
        let mut source = SyntheticSource::new(10, 10.0, 64, 48);
        let summary = pipeline.run_stream(&mut source, &SamplePlan::new(10, 0, None, SamplingRate::Every));
        assert_eq!(summary.processed, 9);
        assert_eq!(summary.errors, 1);
        Ok(())
    }

    #[test]
    fn max_frames_is_a_normal_stop() -> Result<()> {
        let mut pipeline = pipeline(StubBackend::new())?.with_max_frames(Some(3));
        let mut source = SyntheticSource::new(10, 10.0, 64, 48);
        let summary = pipeline.run_stream(&mut source, &SamplePlan::new(10, 0, None, SamplingRate::Every));
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.stop_reason, StopReason::MaxFrames);
        Ok(())
    }

    #[test]
    fn stop_token_cancels_between_frames() -> Result<()> {
        let stop = StopToken::new();
        let trigger = stop.clone();
        let mut pipeline = pipeline(StubBackend::new())?
            .with_stop_token(stop)
            .on_progress(move |summary| {
                if summary.processed == 4 {
                    trigger.stop();
                }
            });
        let mut source = SyntheticSource::new(10, 10.0, 64, 48);
        let summary = pipeline.run_stream(&mut source, &SamplePlan::new(10, 0, None, SamplingRate::Every));
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        Ok(())
    }

    #[test]
    fn store_receives_events_and_checkpoints() -> Result<()> {
        let stub = StubBackend::new().with_default(vec![RawDetection::object(24, Rect::new(34, 2, 20, 20), 0.8)]);
        let mut pipeline = pipeline(stub)?
            .with_store(Box::new(InMemorySeatStore::new()))?
            .with_checkpoint_every(5);
        // 1 fps so the object crosses the 120 s threshold quickly in frame terms.
        let mut source = SyntheticSource::new(200, 1.0, 64, 48);
        let summary = pipeline.run_stream(&mut source, &SamplePlan::new(200, 0, None, SamplingRate::Every));
        assert_eq!(summary.processed, 200);
        assert_eq!(summary.alerts, 1);
        assert_eq!(
            pipeline.machine().state(2).map(|s| s.current_status),
            Some(SeatStatus::AnomalyOccupied)
        );

        assert_eq!(pipeline.resume_from_store()?, Some(199));
        Ok(())
    }

    #[test]
    fn record_write_failures_keep_store_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let latest = dir.path().join("latest_is_a_dir");
        std::fs::create_dir(&latest)?;
        let writer = RecordWriter::open(&dir.path().join("states.jsonl"), Some(&latest))?;

        let stub = StubBackend::new().with_default(vec![RawDetection::object(24, Rect::new(34, 2, 20, 20), 0.8)]);
        let mut pipeline = pipeline(stub)?
            .with_store(Box::new(InMemorySeatStore::new()))?
            .with_writer(writer);
        let mut source = SyntheticSource::new(200, 1.0, 64, 48);
        let summary = pipeline.run_stream(&mut source, &SamplePlan::new(200, 0, None, SamplingRate::Every));

        assert_eq!(summary.processed, 200);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.sink_failures, 200);
        assert_eq!(summary.alerts, 1);

        let store = pipeline.store_mut().expect("store attached");
        let pending = store.pending_alerts()?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seat_id, 2);
        let statuses: Vec<(u32, SeatStatus)> = store
            .current_seat_status()?
            .into_iter()
            .map(|row| (row.seat_id, row.status))
            .collect();
        assert_eq!(
            statuses,
            vec![(1, SeatStatus::Unseated), (2, SeatStatus::AnomalyOccupied)]
        );
        Ok(())
    }
}

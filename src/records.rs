//! Newline-delimited per-frame records.
//!
//! Each processed frame becomes one JSON line appended to the states file. A
//! companion "latest" file is truncated and rewritten with the most recent
//! line so dashboards can poll a single small file.
//!
//! Replay reads the states file back into observations. Malformed lines,
//! seats and boxes are skipped with a warning instead of failing the batch.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::catalog::SeatCatalog;
use crate::detect::RawDetection;
use crate::geometry::{Point, Polygon, Rect};
use crate::observation::{OccupancyState, SeatFrameObservation};
use crate::state_machine::OccupancyStateMachine;
use crate::storage::{SeatStore, REPLAY_CHECKPOINTS};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub conf: f32,
    pub cls_id: i32,
    pub cls_name: String,
}

impl From<&RawDetection> for BoxRecord {
    fn from(det: &RawDetection) -> Self {
        Self {
            x: det.bbox.x,
            y: det.bbox.y,
            w: det.bbox.w,
            h: det.bbox.h,
            conf: det.confidence,
            cls_id: det.class_id,
            cls_name: det.class.as_str().to_string(),
        }
    }
}

impl BoxRecord {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.w, self.h)
    }

    pub fn to_detection(&self) -> RawDetection {
        RawDetection::new(self.cls_id, self.rect(), self.conf)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeatRecord {
    pub seat_id: u32,
    pub seat_roi: Rect,
    pub seat_poly: Vec<Point>,
    pub has_person: bool,
    pub has_object: bool,
    pub person_conf: f32,
    pub object_conf: f32,
    pub person_count: usize,
    pub object_count: usize,
    pub occupancy_state: OccupancyState,
    pub person_boxes: Vec<BoxRecord>,
    pub object_boxes: Vec<BoxRecord>,
    pub fg_ratio: f32,
}

impl SeatRecord {
    fn to_observation(&self, frame_index: u64, ts_ms: i64) -> SeatFrameObservation {
        SeatFrameObservation {
            seat_id: self.seat_id,
            frame_index,
            timestamp_ms: ts_ms,
            person_boxes: self.person_boxes.iter().map(BoxRecord::to_detection).collect(),
            object_boxes: self.object_boxes.iter().map(BoxRecord::to_detection).collect(),
            has_person: self.has_person,
            has_object: self.has_object,
            person_conf_max: self.person_conf,
            object_conf_max: self.object_conf,
            foreground_ratio: self.fg_ratio,
            occupancy_state: self.occupancy_state,
        }
    }
}

/// One line of the states file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_index: u64,
    pub ts_ms: i64,
    pub image_path: String,
    pub seats: Vec<SeatRecord>,
}

impl FrameRecord {
    /// Build a record from one frame's observations. Seat geometry comes from
    /// the catalog; observations for unknown seats are dropped.
    pub fn from_observations(
        frame_index: u64,
        ts_ms: i64,
        image_path: impl Into<String>,
        catalog: &SeatCatalog,
        observations: &[SeatFrameObservation],
    ) -> Self {
        let seats = observations
            .iter()
            .filter_map(|obs| {
                let seat = catalog.get(obs.seat_id)?;
                Some(SeatRecord {
                    seat_id: obs.seat_id,
                    seat_roi: seat.rect,
                    seat_poly: seat
                        .polygon()
                        .map(|p| p.points().to_vec())
                        .unwrap_or_default(),
                    has_person: obs.has_person,
                    has_object: obs.has_object,
                    person_conf: obs.person_conf_max,
                    object_conf: obs.object_conf_max,
                    person_count: obs.person_count(),
                    object_count: obs.object_count(),
                    occupancy_state: obs.occupancy_state,
                    person_boxes: obs.person_boxes.iter().map(BoxRecord::from).collect(),
                    object_boxes: obs.object_boxes.iter().map(BoxRecord::from).collect(),
                    fg_ratio: obs.foreground_ratio,
                })
            })
            .collect();
        Self {
            frame_index,
            ts_ms,
            image_path: image_path.into(),
            seats,
        }
    }

    pub fn observations(&self) -> Vec<SeatFrameObservation> {
        self.seats
            .iter()
            .map(|seat| seat.to_observation(self.frame_index, self.ts_ms))
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

/// Appends frame records and mirrors the last one into the latest file.
pub struct RecordWriter {
    states_path: PathBuf,
    latest_path: Option<PathBuf>,
    states: File,
    written: u64,
}

impl RecordWriter {
    pub fn open(states_path: &Path, latest_path: Option<&Path>) -> Result<Self> {
        for path in std::iter::once(states_path).chain(latest_path) {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let states = OpenOptions::new()
            .create(true)
            .append(true)
            .open(states_path)
            .with_context(|| format!("failed to open states file {}", states_path.display()))?;
        Ok(Self {
            states_path: states_path.to_path_buf(),
            latest_path: latest_path.map(Path::to_path_buf),
            states,
            written: 0,
        })
    }

    pub fn write(&mut self, record: &FrameRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serialize frame record")?;
        writeln!(self.states, "{}", line)
            .with_context(|| format!("failed to append to {}", self.states_path.display()))?;
        self.states.flush()?;
        if let Some(latest) = &self.latest_path {
            fs::write(latest, format!("{}\n", line))
                .with_context(|| format!("failed to write {}", latest.display()))?;
        }
        self.written += 1;
        Ok(())
    }

    pub fn states_path(&self) -> &Path {
        &self.states_path
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

// ----------------------------------------------------------------------------
// Replay
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
struct LooseFrame {
    frame_index: Option<u64>,
    ts_ms: Option<i64>,
    image_path: Option<String>,
    seats: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct LooseSeat {
    seat_id: Option<u32>,
    seat_roi: Option<Rect>,
    #[serde(default)]
    seat_poly: Vec<Point>,
    #[serde(default)]
    has_person: bool,
    #[serde(default)]
    has_object: bool,
    #[serde(default)]
    person_conf: f32,
    #[serde(default)]
    object_conf: f32,
    occupancy_state: Option<OccupancyState>,
    #[serde(default)]
    person_boxes: Vec<Value>,
    #[serde(default)]
    object_boxes: Vec<Value>,
    #[serde(default)]
    fg_ratio: f32,
}

/// Records read back from a states file.
#[derive(Debug, Default)]
pub struct ReplayBatch {
    pub records: Vec<FrameRecord>,
    /// Lines dropped entirely.
    pub skipped_lines: u64,
    /// Seats or boxes dropped from otherwise valid lines.
    pub skipped_items: u64,
}

impl ReplayBatch {
    /// All observations in file order.
    pub fn observations(&self) -> impl Iterator<Item = SeatFrameObservation> + '_ {
        self.records.iter().flat_map(FrameRecord::observations)
    }
}

pub fn read_records(path: &Path) -> Result<ReplayBatch> {
    let file =
        File::open(path).with_context(|| format!("failed to open records {}", path.display()))?;
    let mut batch = ReplayBatch::default();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line, n + 1, &mut batch.skipped_items) {
            Some(record) => batch.records.push(record),
            None => batch.skipped_lines += 1,
        }
    }
    log::info!(
        "read {} records from {} ({} lines skipped)",
        batch.records.len(),
        path.display(),
        batch.skipped_lines
    );
    Ok(batch)
}

fn parse_line(line: &str, line_no: usize, skipped_items: &mut u64) -> Option<FrameRecord> {
    let loose: LooseFrame = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("line {}: not a frame record: {}", line_no, e);
            return None;
        }
    };
    let (Some(frame_index), Some(ts_ms), Some(image_path), Some(seats)) =
        (loose.frame_index, loose.ts_ms, loose.image_path, loose.seats)
    else {
        log::warn!(
            "line {}: missing frame_index, ts_ms, image_path or seats",
            line_no
        );
        return None;
    };

    let seats = seats
        .into_iter()
        .filter_map(|v| {
            let seat = parse_seat(v, line_no, skipped_items);
            if seat.is_none() {
                *skipped_items += 1;
            }
            seat
        })
        .collect();
    Some(FrameRecord {
        frame_index,
        ts_ms,
        image_path,
        seats,
    })
}

fn parse_seat(value: Value, line_no: usize, skipped_items: &mut u64) -> Option<SeatRecord> {
    let loose: LooseSeat = match serde_json::from_value(value) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("line {}: malformed seat: {}", line_no, e);
            return None;
        }
    };
    let (Some(seat_id), Some(mut roi)) = (loose.seat_id, loose.seat_roi) else {
        log::warn!("line {}: seat missing seat_id or seat_roi", line_no);
        return None;
    };
    if roi.w == 0 && roi.h == 0 && loose.seat_poly.len() >= 3 {
        roi = Polygon::new(loose.seat_poly.clone()).bounding_rect();
    }
    if roi.is_empty() {
        log::warn!("line {}: seat {} has a non-positive roi", line_no, seat_id);
        return None;
    }

    let mut boxes = |values: Vec<Value>| -> Vec<BoxRecord> {
        values
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<BoxRecord>(v) {
                Ok(b) if b.w > 0 && b.h > 0 => Some(b),
                _ => {
                    log::warn!("line {}: dropping invalid box in seat {}", line_no, seat_id);
                    *skipped_items += 1;
                    None
                }
            })
            .collect()
    };
    let person_boxes = boxes(loose.person_boxes);
    let object_boxes = boxes(loose.object_boxes);

    let occupancy_state = loose.occupancy_state.unwrap_or(if loose.has_person {
        OccupancyState::Person
    } else if loose.has_object {
        OccupancyState::ObjectOnly
    } else {
        OccupancyState::Free
    });

    Some(SeatRecord {
        seat_id,
        seat_roi: roi,
        seat_poly: loose.seat_poly,
        has_person: loose.has_person,
        has_object: loose.has_object,
        person_conf: loose.person_conf,
        object_conf: loose.object_conf,
        person_count: person_boxes.len(),
        object_count: object_boxes.len(),
        occupancy_state,
        person_boxes,
        object_boxes,
        fg_ratio: loose.fg_ratio,
    })
}

/// Counters from one `replay_into` call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Records already covered by the resumed checkpoint.
    pub resumed_past: u64,
    pub replayed: u64,
    pub events: u64,
    pub alerts: u64,
    pub store_errors: u64,
}

/// Feed `batch` through `machine` into `store`.
///
/// Checkpoints record how many records of the batch have been consumed, so a
/// resumed replay continues at the same position of an append-only states
/// file regardless of the frame indices in it. Every `checkpoint_every`
/// records (0 disables) and at the end a checkpoint is saved.
pub fn replay_into(
    batch: &ReplayBatch,
    machine: &mut OccupancyStateMachine,
    store: &mut dyn SeatStore,
    checkpoint_every: u64,
    resume: bool,
) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();
    if resume {
        if let Some((consumed, checkpoint)) = store.latest_checkpoint(REPLAY_CHECKPOINTS)? {
            if consumed > batch.records.len() as u64 {
                bail!(
                    "checkpoint covers {} records but the file has {}; was it truncated or replaced?",
                    consumed,
                    batch.records.len()
                );
            }
            log::info!("resuming replay after {} records", consumed);
            machine.restore(checkpoint);
            report.resumed_past = consumed;
        }
    }

    for (position, record) in batch
        .records
        .iter()
        .enumerate()
        .skip(report.resumed_past as usize)
    {
        let updates = machine.update_frame(&record.observations());
        report.events += updates.iter().filter(|u| u.event.is_some()).count() as u64;
        report.alerts += updates.iter().filter(|u| u.alert.is_some()).count() as u64;
        if let Err(err) = store.store_frame(&updates) {
            report.store_errors += 1;
            log::warn!("record {} (frame {}): store failed: {:#}", position + 1, record.frame_index, err);
        }
        report.replayed += 1;
        if checkpoint_every > 0 && report.replayed % checkpoint_every == 0 {
            store.save_checkpoint(REPLAY_CHECKPOINTS, position as u64 + 1, &machine.checkpoint())?;
        }
    }
    if report.replayed > 0 {
        store.save_checkpoint(REPLAY_CHECKPOINTS, batch.records.len() as u64, &machine.checkpoint())?;
    }
    Ok(report)
}

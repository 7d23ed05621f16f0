//! Seat occupancy monitoring for shared workspaces.
//!
//! Turns a video or an image sequence of a study hall into a time series of
//! per-seat occupancy states, with debounced transitions, unattended-object
//! alerts and structured event/alert/snapshot records.
//!
//! # Pipeline
//!
//! 1. **Sampling** (`sampler`, `traversal`): choose which frames of a source
//!    are visited. The number of samples is capped by source length so long
//!    videos stay bounded in decode and inference cost.
//! 2. **Classification** (`classify`): bind detector boxes and a foreground
//!    mask to seat regions and label every seat `FREE`, `OBJECT_ONLY` or
//!    `PERSON` for the frame.
//! 3. **Temporal state** (`state_machine`): fold observations into seat
//!    status, durations and anomaly accumulation; emit events, alerts and
//!    snapshots.
//!
//! # Module Structure
//!
//! - `geometry`, `catalog`: seat regions and the seat catalog
//! - `frame`, `ingest`: decoded frames and seekable frame sources
//! - `detect`: detector backends and foreground estimators
//! - `records`, `storage`: JSONL frame records and the relational store
//! - `config`, `pipeline`: run configuration and orchestration

pub mod catalog;
pub mod classify;
pub mod config;
pub mod detect;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod observation;
pub mod pipeline;
pub mod records;
pub mod sampler;
pub mod state_machine;
pub mod storage;
pub mod traversal;

pub use catalog::{SeatCatalog, SeatDefinition};
pub use classify::{ClassifierConfig, ClassifyError, FrameMeta, OccupancyClassifier};
pub use config::{SeatwatchConfig, TraversalMode};
pub use detect::{
    BackendRegistry, DetectionClass, DetectorBackend, ForegroundEstimator,
    ForegroundMask, NoForeground, RawDetection, RunningAverageBackground, StubBackend,
};
#[cfg(feature = "backend-tract")]
pub use detect::TractBackend;
pub use frame::Frame;
pub use geometry::{Point, Polygon, Rect, SeatRegion};
pub use ingest::{FileSource, FrameSource, ImageDirectory, SyntheticSource};
pub use observation::{OccupancyState, SeatFrameObservation};
pub use pipeline::{Pipeline, RunSummary, StopReason};
pub use records::{FrameRecord, RecordWriter};
pub use sampler::{SamplePlan, SamplingRate};
pub use state_machine::{
    AlertPolicy, OccupancyStateMachine, SeatAlert, SeatEvent, SeatSnapshot, SeatStatus,
};
pub use storage::{InMemorySeatStore, SeatStore, SqliteSeatStore};
pub use traversal::StopToken;

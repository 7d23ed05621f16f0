//! Detector and foreground-estimator seams.
//!
//! Both collaborators are black boxes to the classifier: detectors turn a
//! frame into boxes, foreground estimators turn a frame into a binary mask.

mod backend;
mod backends;
pub mod foreground;
pub mod postprocess;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use foreground::{ForegroundEstimator, ForegroundMask, NoForeground, RunningAverageBackground};
pub use registry::BackendRegistry;
pub use result::{DetectionClass, RawDetection, PERSON_CLASS_ID};

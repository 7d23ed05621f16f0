//! Frame sources.
//!
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Synthetic `stub://` sources (testing and dry runs)
//! - Directories of already-extracted images
//!
//! Sources expose random access by frame index; the traversal layer decides
//! which indices to read.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod image_dir;

use anyhow::Result;

use crate::frame::Frame;

pub use file::{FileSource, SyntheticSource};
pub use image_dir::{ImageDirectory, ImageEntry};

/// Seekable, finite frame source.
pub trait FrameSource {
    /// Human-readable source name for logs.
    fn describe(&self) -> String;

    /// Number of frames the source reports. May be an estimate for some containers.
    fn frame_count(&self) -> u64;

    /// Native frame rate, when known.
    fn fps(&self) -> Option<f64>;

    /// Decode the frame at `index`. Returned frames carry `index` and a
    /// capture timestamp derived from the source clock.
    fn read_at(&mut self, index: u64) -> Result<Frame>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn frame_count(&self) -> u64 {
        (**self).frame_count()
    }

    fn fps(&self) -> Option<f64> {
        (**self).fps()
    }

    fn read_at(&mut self, index: u64) -> Result<Frame> {
        (**self).read_at(index)
    }
}

/// Timestamp of frame `index` at `fps`, in milliseconds.
pub fn index_timestamp_ms(index: u64, fps: Option<f64>) -> i64 {
    match fps {
        Some(fps) if fps > 0.0 => (index as f64 * 1000.0 / fps).round() as i64,
        _ => 0,
    }
}

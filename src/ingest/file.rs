//! Local file frame source.
//!
//! `FileSource` opens either a local video (FFmpeg, behind the
//! `ingest-file-ffmpeg` feature) or a synthetic `stub://` source. Synthetic
//! sources accept query parameters:
//! `stub://hall?frames=300&fps=25&width=64&height=48`.

use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;

use super::{index_timestamp_ms, FrameSource};
#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use crate::frame::Frame;

const SYNTHETIC_FRAMES: u64 = 300;
const SYNTHETIC_FPS: f64 = 25.0;
const SYNTHETIC_WIDTH: u32 = 64;
const SYNTHETIC_HEIGHT: u32 = 48;

/// Local file frame source.
pub struct FileSource {
    path: String,
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    /// Open a source. Failure here is fatal for the traversal.
    pub fn open(path: &str) -> Result<Self> {
        if !is_local_file_path(path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        let backend = if let Some(rest) = path.strip_prefix("stub://") {
            FileBackend::Synthetic(SyntheticSource::from_query(rest)?)
        } else {
            #[cfg(feature = "ingest-file-ffmpeg")]
            {
                FileBackend::Ffmpeg(FfmpegFileSource::open(path)?)
            }
            #[cfg(not(feature = "ingest-file-ffmpeg"))]
            {
                return Err(anyhow!(
                    "video ingestion requires the ingest-file-ffmpeg feature"
                ));
            }
        };
        let source = Self {
            path: path.to_string(),
            backend,
        };
        log::info!(
            "FileSource: opened {} ({} frames, fps {:?})",
            source.path,
            source.frame_count(),
            source.fps()
        );
        Ok(source)
    }

    fn inner(&self) -> &dyn FrameSource {
        match &self.backend {
            FileBackend::Synthetic(source) => source,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn FrameSource {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source,
        }
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        self.path.clone()
    }

    fn frame_count(&self) -> u64 {
        self.inner().frame_count()
    }

    fn fps(&self) -> Option<f64> {
        self.inner().fps()
    }

    fn read_at(&mut self, index: u64) -> Result<Frame> {
        self.inner_mut().read_at(index)
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

/// Deterministic generated frames. Each frame is a solid color derived from
/// its index, so consecutive frames differ.
#[derive(Clone, Debug)]
pub struct SyntheticSource {
    frame_count: u64,
    fps: f64,
    width: u32,
    height: u32,
    failing: HashSet<u64>,
}

impl SyntheticSource {
    pub fn new(frame_count: u64, fps: f64, width: u32, height: u32) -> Self {
        Self {
            frame_count,
            fps,
            width,
            height,
            failing: HashSet::new(),
        }
    }

    /// Make `read_at(index)` fail for the given indices.
    pub fn failing_at(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.failing.extend(indices);
        self
    }

    fn from_query(rest: &str) -> Result<Self> {
        let mut source = Self::new(
            SYNTHETIC_FRAMES,
            SYNTHETIC_FPS,
            SYNTHETIC_WIDTH,
            SYNTHETIC_HEIGHT,
        );
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(source);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub parameter '{}' needs a value", pair))?;
            match key {
                "frames" => source.frame_count = value.parse().context("stub frames")?,
                "fps" => source.fps = value.parse().context("stub fps")?,
                "width" => source.width = value.parse().context("stub width")?,
                "height" => source.height = value.parse().context("stub height")?,
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        Ok(source)
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("synthetic {}x{} @ {}fps", self.width, self.height, self.fps)
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn fps(&self) -> Option<f64> {
        (self.fps > 0.0).then_some(self.fps)
    }

    fn read_at(&mut self, index: u64) -> Result<Frame> {
        if index >= self.frame_count {
            return Err(anyhow!(
                "frame {} is past the end ({} frames)",
                index,
                self.frame_count
            ));
        }
        if self.failing.contains(&index) {
            return Err(anyhow!("synthetic read failure at frame {}", index));
        }
        let shade = (index % 256) as u8;
        Ok(Frame::filled(
            self.width,
            self.height,
            [shade, shade.wrapping_mul(3), 255 - shade],
            index,
            index_timestamp_ms(index, self.fps()),
        ))
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_query_overrides_defaults() -> Result<()> {
        let source = FileSource::open("stub://hall?frames=40&fps=10&width=8&height=6")?;
        assert_eq!(source.frame_count(), 40);
        assert_eq!(source.fps(), Some(10.0));

        let plain = FileSource::open("stub://hall")?;
        assert_eq!(plain.frame_count(), SYNTHETIC_FRAMES);
        Ok(())
    }

    #[test]
    fn rejects_remote_urls_and_bad_stub_params() {
        assert!(FileSource::open("rtsp://camera/stream").is_err());
        assert!(FileSource::open("").is_err());
        assert!(FileSource::open("stub://x?bogus=1").is_err());
        assert!(FileSource::open("stub://x?frames").is_err());
    }

    #[test]
    fn synthetic_frames_carry_index_and_timestamp() -> Result<()> {
        let mut source = SyntheticSource::new(10, 4.0, 4, 4).failing_at([3]);
        let frame = source.read_at(6)?;
        assert_eq!(frame.index, 6);
        assert_eq!(frame.timestamp_ms, 1500);
        assert!(source.read_at(3).is_err());
        assert!(source.read_at(10).is_err());
        Ok(())
    }
}

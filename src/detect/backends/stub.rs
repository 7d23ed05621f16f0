use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;
use crate::frame::Frame;
use crate::geometry::Rect;

/// Stub backend for testing and dry runs.
///
/// Returns scripted detections keyed by frame index. Frames without a script
/// entry get the default list (empty unless set).
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    frames: HashMap<u64, Vec<RawDetection>>,
    fallback: Vec<RawDetection>,
}

#[derive(Debug, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    default: Vec<ScriptedBox>,
    #[serde(default)]
    frames: HashMap<u64, Vec<ScriptedBox>>,
}

#[derive(Debug, Deserialize)]
struct ScriptedBox {
    class_id: i32,
    #[serde(rename = "box")]
    bbox: Rect,
    confidence: f32,
}

impl From<ScriptedBox> for RawDetection {
    fn from(b: ScriptedBox) -> Self {
        RawDetection::new(b.class_id, b.bbox, b.confidence)
    }
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a script of the form
    /// `{"default": [...], "frames": {"12": [{"class_id":0,"box":{...},"confidence":0.9}]}}`.
    pub fn from_script_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detection script {}", path.display()))?;
        let script: ScriptFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid detection script {}", path.display()))?;
        Ok(Self {
            frames: script
                .frames
                .into_iter()
                .map(|(index, boxes)| (index, boxes.into_iter().map(Into::into).collect()))
                .collect(),
            fallback: script.default.into_iter().map(Into::into).collect(),
        })
    }

    pub fn with_frame(mut self, index: u64, detections: Vec<RawDetection>) -> Self {
        self.frames.insert(index, detections);
        self
    }

    pub fn with_default(mut self, detections: Vec<RawDetection>) -> Self {
        self.fallback = detections;
        self
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        Ok(self
            .frames
            .get(&frame.index)
            .unwrap_or(&self.fallback)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn scripted_frames_override_default() -> Result<()> {
        let mut backend = StubBackend::new()
            .with_default(vec![RawDetection::object(3, Rect::new(0, 0, 2, 2), 0.7)])
            .with_frame(5, vec![RawDetection::person(Rect::new(1, 1, 3, 3), 0.9)]);

        let f0 = Frame::filled(4, 4, [0, 0, 0], 0, 0);
        let f5 = Frame::filled(4, 4, [0, 0, 0], 5, 0);
        assert_eq!(backend.detect(&f0)?[0].class_id, 3);
        assert!(backend.detect(&f5)?[0].is_person());
        Ok(())
    }

    #[test]
    fn loads_script_from_json() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"frames": {{"2": [{{"class_id": 0, "box": {{"x": 1, "y": 2, "w": 3, "h": 4}}, "confidence": 0.8}}]}}}}"#
        )?;
        let mut backend = StubBackend::from_script_file(file.path())?;
        let hits = backend.detect(&Frame::filled(4, 4, [0, 0, 0], 2, 0))?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].bbox, Rect::new(1, 2, 3, 4));
        assert!(backend
            .detect(&Frame::filled(4, 4, [0, 0, 0], 3, 0))?
            .is_empty());
        Ok(())
    }
}

//! Model-agnostic pre/post-processing for single-shot detectors.
//!
//! Kept free of any inference runtime so the box math is testable without
//! loading a model.

use crate::detect::result::RawDetection;
use crate::geometry::Rect;

/// Aspect-preserving resize into a square model input with centered padding.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub input_size: u32,
}

impl Letterbox {
    pub fn fit(src_width: u32, src_height: u32, input_size: u32) -> Self {
        if src_width == 0 || src_height == 0 {
            return Self {
                scale: 1.0,
                pad_x: 0.0,
                pad_y: 0.0,
                input_size,
            };
        }
        let scale = (input_size as f32 / src_width as f32).min(input_size as f32 / src_height as f32);
        let new_w = (src_width as f32 * scale).round();
        let new_h = (src_height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((input_size as f32 - new_w) / 2.0).floor(),
            pad_y: ((input_size as f32 - new_h) / 2.0).floor(),
            input_size,
        }
    }

    /// Source pixel sampled for model input pixel `(x, y)`, or `None` in padding.
    pub fn source_pixel(&self, x: u32, y: u32, src_width: u32, src_height: u32) -> Option<(u32, u32)> {
        let sx = (x as f32 - self.pad_x) / self.scale;
        let sy = (y as f32 - self.pad_y) / self.scale;
        if sx < 0.0 || sy < 0.0 {
            return None;
        }
        let (sx, sy) = (sx.floor() as u32, sy.floor() as u32);
        if sx >= src_width || sy >= src_height {
            return None;
        }
        Some((sx, sy))
    }

    /// Map a center-format box from model space back to a clipped source rect.
    pub fn unproject(&self, cx: f32, cy: f32, w: f32, h: f32, src_width: u32, src_height: u32) -> Rect {
        let x0 = ((cx - w / 2.0 - self.pad_x) / self.scale).clamp(0.0, src_width as f32);
        let y0 = ((cy - h / 2.0 - self.pad_y) / self.scale).clamp(0.0, src_height as f32);
        let x1 = ((cx + w / 2.0 - self.pad_x) / self.scale).clamp(0.0, src_width as f32);
        let y1 = ((cy + h / 2.0 - self.pad_y) / self.scale).clamp(0.0, src_height as f32);
        Rect::new(
            x0.round() as i32,
            y0.round() as i32,
            (x1 - x0).round() as i32,
            (y1 - y0).round() as i32,
        )
    }
}

/// Decode a YOLOv8 head laid out as `[4 + classes, anchors]` (batch already
/// stripped). Rows 0..4 are `cx, cy, w, h`; the rest are per-class scores.
pub fn decode_yolov8(
    output: &[f32],
    num_classes: usize,
    anchors: usize,
    conf_threshold: f32,
    letterbox: &Letterbox,
    src_width: u32,
    src_height: u32,
) -> Vec<RawDetection> {
    let rows = 4 + num_classes;
    if output.len() < rows * anchors {
        log::warn!(
            "detector output has {} values, expected {}",
            output.len(),
            rows * anchors
        );
        return Vec::new();
    }
    let at = |row: usize, a: usize| output[row * anchors + a];

    let mut detections = Vec::new();
    for a in 0..anchors {
        let mut best_class = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for c in 0..num_classes {
            let score = at(4 + c, a);
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }
        if !best_score.is_finite() || best_score < conf_threshold {
            continue;
        }
        let bbox = letterbox.unproject(at(0, a), at(1, a), at(2, a), at(3, a), src_width, src_height);
        if bbox.is_empty() {
            continue;
        }
        detections.push(RawDetection::new(best_class as i32, bbox, best_score.min(1.0)));
    }
    detections
}

/// Greedy per-class non-maximum suppression. Output is sorted by confidence.
pub fn non_max_suppression(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

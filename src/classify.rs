//! Detection-to-seat binding and per-seat occupancy classification.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::{SeatCatalog, SeatDefinition};
use crate::detect::{ForegroundMask, RawDetection};
use crate::frame::Frame;
use crate::observation::{OccupancyState, SeatFrameObservation};

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.1;
pub const DEFAULT_CONF_THRES_PERSON: f32 = 0.5;
pub const DEFAULT_CONF_THRES_OBJECT: f32 = 0.4;
pub const DEFAULT_FG_RATIO_THRESHOLD: f32 = 0.25;

/// Position and size of the frame being classified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameMeta {
    pub frame_index: u64,
    pub timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
}

impl FrameMeta {
    pub fn of(frame: &Frame) -> Self {
        Self {
            frame_index: frame.index,
            timestamp_ms: frame.timestamp_ms,
            width: frame.width,
            height: frame.height,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Rect seats bind a box when IoU is strictly above this.
    pub iou_threshold: f32,
    pub conf_thres_person: f32,
    pub conf_thres_object: f32,
    /// Foreground fraction at or above which an undetected seat is OBJECT_ONLY.
    pub fg_ratio_threshold: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            conf_thres_person: DEFAULT_CONF_THRES_PERSON,
            conf_thres_object: DEFAULT_CONF_THRES_OBJECT,
            fg_ratio_threshold: DEFAULT_FG_RATIO_THRESHOLD,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<(), ClassifyError> {
        for (name, value) in [
            ("iou_threshold", self.iou_threshold),
            ("conf_thres_person", self.conf_thres_person),
            ("conf_thres_object", self.conf_thres_object),
            ("fg_ratio_threshold", self.fg_ratio_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ClassifyError::InvalidThreshold { name, value });
            }
        }
        Ok(())
    }
}

/// Per-frame classification failure. The frame is skipped, the run continues.
#[derive(Clone, Debug, PartialEq)]
pub enum ClassifyError {
    InvalidThreshold {
        name: &'static str,
        value: f32,
    },
    InvalidConfidence {
        frame_index: u64,
        value: f32,
    },
    DegenerateBox {
        frame_index: u64,
        w: i32,
        h: i32,
    },
    MaskSizeMismatch {
        frame_index: u64,
        frame: (u32, u32),
        mask: (u32, u32),
    },
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifyError::InvalidThreshold { name, value } => {
                write!(f, "{name} must be within [0, 1], got {value}")
            }
            ClassifyError::InvalidConfidence { frame_index, value } => {
                write!(f, "frame {frame_index}: detection confidence {value} outside [0, 1]")
            }
            ClassifyError::DegenerateBox { frame_index, w, h } => {
                write!(f, "frame {frame_index}: detection box has non-positive size {w}x{h}")
            }
            ClassifyError::MaskSizeMismatch {
                frame_index,
                frame,
                mask,
            } => write!(
                f,
                "frame {frame_index}: foreground mask {}x{} does not match frame {}x{}",
                mask.0, mask.1, frame.0, frame.1
            ),
        }
    }
}

impl std::error::Error for ClassifyError {}

/// Stateless per-frame classifier. Identical inputs give identical output.
#[derive(Clone, Debug, Default)]
pub struct OccupancyClassifier {
    config: ClassifierConfig,
}

impl OccupancyClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self, ClassifyError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Produce exactly one observation per catalog seat, in catalog order.
    ///
    /// `foreground` may be `None` when no estimator runs; every seat then
    /// reports a foreground ratio of 0.
    pub fn classify(
        &self,
        catalog: &SeatCatalog,
        meta: FrameMeta,
        detections: &[RawDetection],
        foreground: Option<&ForegroundMask>,
    ) -> Result<Vec<SeatFrameObservation>, ClassifyError> {
        for det in detections {
            if !det.confidence.is_finite() || !(0.0..=1.0).contains(&det.confidence) {
                return Err(ClassifyError::InvalidConfidence {
                    frame_index: meta.frame_index,
                    value: det.confidence,
                });
            }
            if det.bbox.is_empty() {
                return Err(ClassifyError::DegenerateBox {
                    frame_index: meta.frame_index,
                    w: det.bbox.w,
                    h: det.bbox.h,
                });
            }
        }
        if let Some(mask) = foreground {
            if (mask.width(), mask.height()) != (meta.width, meta.height) {
                return Err(ClassifyError::MaskSizeMismatch {
                    frame_index: meta.frame_index,
                    frame: (meta.width, meta.height),
                    mask: (mask.width(), mask.height()),
                });
            }
        }

        Ok(catalog
            .seats()
            .par_iter()
            .map(|seat| self.classify_seat(seat, meta, detections, foreground))
            .collect())
    }

    fn classify_seat(
        &self,
        seat: &SeatDefinition,
        meta: FrameMeta,
        detections: &[RawDetection],
        foreground: Option<&ForegroundMask>,
    ) -> SeatFrameObservation {
        let mut person_boxes = Vec::new();
        let mut object_boxes = Vec::new();
        for det in detections
            .iter()
            .filter(|d| seat.region.binds(&d.bbox, self.config.iou_threshold))
        {
            if det.is_person() {
                person_boxes.push(det.clone());
            } else {
                object_boxes.push(det.clone());
            }
        }
        let max_conf = |boxes: &[RawDetection]| boxes.iter().map(|d| d.confidence).fold(0.0f32, f32::max);
        let person_conf_max = max_conf(&person_boxes);
        let object_conf_max = max_conf(&object_boxes);
        let foreground_ratio = foreground.map_or(0.0, |mask| mask.ratio_in(&seat.region));

        let has_person = !person_boxes.is_empty() && person_conf_max >= self.config.conf_thres_person;
        let has_object = !object_boxes.is_empty() && object_conf_max >= self.config.conf_thres_object;
        let occupancy_state = if has_person {
            OccupancyState::Person
        } else if has_object || foreground_ratio >= self.config.fg_ratio_threshold {
            OccupancyState::ObjectOnly
        } else {
            OccupancyState::Free
        };

        SeatFrameObservation {
            seat_id: seat.seat_id,
            frame_index: meta.frame_index,
            timestamp_ms: meta.timestamp_ms,
            person_boxes,
            object_boxes,
            has_person,
            has_object,
            person_conf_max,
            object_conf_max,
            foreground_ratio,
            occupancy_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::foreground::MASK_ON;
    use crate::geometry::{Point, Polygon, Rect, SeatRegion};

    fn catalog() -> SeatCatalog {
        SeatCatalog::new(vec![
            SeatDefinition::new(1, SeatRegion::Rect(Rect::new(0, 0, 50, 50))),
            SeatDefinition::new(
                2,
                SeatRegion::Polygon(Polygon::new(vec![
                    Point::new(60, 0),
                    Point::new(100, 0),
                    Point::new(100, 50),
                    Point::new(60, 50),
                ])),
            ),
        ])
        .unwrap()
    }

    fn meta() -> FrameMeta {
        FrameMeta {
            frame_index: 7,
            timestamp_ms: 7_000,
            width: 100,
            height: 50,
        }
    }

    fn classify(dets: &[RawDetection], mask: Option<&ForegroundMask>) -> Vec<SeatFrameObservation> {
        OccupancyClassifier::default()
            .classify(&catalog(), meta(), dets, mask)
            .unwrap()
    }

    #[test]
    fn one_observation_per_seat_in_catalog_order() {
        let obs = classify(&[], None);
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].seat_id, 1);
        assert_eq!(obs[1].seat_id, 2);
        assert!(obs.iter().all(|o| o.occupancy_state == OccupancyState::Free));
        assert!(obs.iter().all(|o| o.frame_index == 7 && o.timestamp_ms == 7_000));
    }

    #[test]
    fn person_takes_precedence_over_object() {
        let dets = [
            RawDetection::object(63, Rect::new(5, 5, 40, 40), 0.95),
            RawDetection::person(Rect::new(0, 0, 48, 48), 0.8),
        ];
        let obs = classify(&dets, None);
        assert_eq!(obs[0].occupancy_state, OccupancyState::Person);
        assert!(obs[0].has_person && obs[0].has_object);
        assert_eq!(obs[0].person_count(), 1);
        assert_eq!(obs[0].object_count(), 1);
        assert!((obs[0].object_conf_max - 0.95).abs() < 1e-6);
        assert_eq!(obs[1].occupancy_state, OccupancyState::Free);
    }

    #[test]
    fn low_confidence_person_does_not_count() {
        let dets = [RawDetection::person(Rect::new(0, 0, 50, 50), 0.3)];
        let obs = classify(&dets, None);
        assert!(!obs[0].has_person);
        assert_eq!(obs[0].person_count(), 1);
        assert_eq!(obs[0].occupancy_state, OccupancyState::Free);
    }

    #[test]
    fn confident_object_is_object_only() {
        // Center (80, 25) lies inside the polygon seat.
        let dets = [RawDetection::object(24, Rect::new(70, 15, 20, 20), 0.6)];
        let obs = classify(&dets, None);
        assert_eq!(obs[1].occupancy_state, OccupancyState::ObjectOnly);
        assert_eq!(obs[0].occupancy_state, OccupancyState::Free);
    }

    #[test]
    fn foreground_recovers_missed_objects() -> anyhow::Result<()> {
        // Foreground everywhere in the rect seat, nothing in the polygon seat.
        let mut data = vec![0u8; 100 * 50];
        for y in 0..50 {
            for x in 0..50 {
                data[y * 100 + x] = MASK_ON;
            }
        }
        let mask = ForegroundMask::new(100, 50, data)?;
        let obs = classify(&[], Some(&mask));
        assert_eq!(obs[0].occupancy_state, OccupancyState::ObjectOnly);
        assert!(!obs[0].has_object);
        assert!(obs[0].foreground_ratio > 0.99);
        assert_eq!(obs[1].occupancy_state, OccupancyState::Free);
        Ok(())
    }

    #[test]
    fn rejects_bad_frames() {
        let classifier = OccupancyClassifier::default();
        let bad_conf = [RawDetection::person(Rect::new(0, 0, 5, 5), 1.5)];
        assert!(matches!(
            classifier.classify(&catalog(), meta(), &bad_conf, None),
            Err(ClassifyError::InvalidConfidence { frame_index: 7, .. })
        ));
        let nan = [RawDetection::person(Rect::new(0, 0, 5, 5), f32::NAN)];
        assert!(classifier.classify(&catalog(), meta(), &nan, None).is_err());
        let flat = [RawDetection::person(Rect::new(0, 0, 0, 5), 0.9)];
        assert!(matches!(
            classifier.classify(&catalog(), meta(), &flat, None),
            Err(ClassifyError::DegenerateBox { .. })
        ));
        let small_mask = ForegroundMask::empty(10, 10);
        let err = classifier
            .classify(&catalog(), meta(), &[], Some(&small_mask))
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let config = ClassifierConfig {
            conf_thres_person: 1.2,
            ..ClassifierConfig::default()
        };
        assert!(OccupancyClassifier::new(config).is_err());
    }

    #[test]
    fn reclassification_is_idempotent() -> anyhow::Result<()> {
        let dets = [
            RawDetection::person(Rect::new(10, 10, 20, 20), 0.7),
            RawDetection::object(41, Rect::new(65, 5, 10, 10), 0.45),
        ];
        let first = serde_json::to_string(&classify(&dets, None))?;
        let second = serde_json::to_string(&classify(&dets, None))?;
        assert_eq!(first, second);
        Ok(())
    }
}

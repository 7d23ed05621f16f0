use serde::{Deserialize, Serialize};

use crate::geometry::Rect;

/// Class id the detector vocabulary reserves for people.
pub const PERSON_CLASS_ID: i32 = 0;

/// Coarse detection class used for seat classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionClass {
    Person,
    Object,
}

impl DetectionClass {
    pub fn from_class_id(class_id: i32) -> Self {
        if class_id == PERSON_CLASS_ID {
            DetectionClass::Person
        } else {
            DetectionClass::Object
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionClass::Person => "person",
            DetectionClass::Object => "object",
        }
    }
}

/// One detector output box in source-frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub class: DetectionClass,
    /// Detector-native class id. Only `PERSON_CLASS_ID` carries meaning here.
    pub class_id: i32,
    #[serde(rename = "box")]
    pub bbox: Rect,
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(class_id: i32, bbox: Rect, confidence: f32) -> Self {
        Self {
            class: DetectionClass::from_class_id(class_id),
            class_id,
            bbox,
            confidence,
        }
    }

    pub fn person(bbox: Rect, confidence: f32) -> Self {
        Self::new(PERSON_CLASS_ID, bbox, confidence)
    }

    pub fn object(class_id: i32, bbox: Rect, confidence: f32) -> Self {
        debug_assert_ne!(class_id, PERSON_CLASS_ID);
        Self::new(class_id, bbox, confidence)
    }

    pub fn is_person(&self) -> bool {
        self.class == DetectionClass::Person
    }
}

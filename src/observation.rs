use serde::{Deserialize, Serialize};

use crate::detect::RawDetection;

/// Per-frame classification of one seat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccupancyState {
    Free,
    ObjectOnly,
    Person,
}

impl OccupancyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OccupancyState::Free => "FREE",
            OccupancyState::ObjectOnly => "OBJECT_ONLY",
            OccupancyState::Person => "PERSON",
        }
    }
}

impl std::fmt::Display for OccupancyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One seat's classified state for one processed frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeatFrameObservation {
    pub seat_id: u32,
    pub frame_index: u64,
    pub timestamp_ms: i64,
    pub person_boxes: Vec<RawDetection>,
    pub object_boxes: Vec<RawDetection>,
    /// A bound person box reached the person confidence threshold.
    pub has_person: bool,
    /// A bound object box reached the object confidence threshold.
    pub has_object: bool,
    pub person_conf_max: f32,
    pub object_conf_max: f32,
    pub foreground_ratio: f32,
    pub occupancy_state: OccupancyState,
}

impl SeatFrameObservation {
    pub fn person_count(&self) -> usize {
        self.person_boxes.len()
    }

    pub fn object_count(&self) -> usize {
        self.object_boxes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_match_record_format() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&OccupancyState::ObjectOnly)?, "\"OBJECT_ONLY\"");
        assert_eq!(OccupancyState::Person.to_string(), "PERSON");
        let parsed: OccupancyState = serde_json::from_str("\"FREE\"")?;
        assert_eq!(parsed, OccupancyState::Free);
        Ok(())
    }
}

//! Seat catalog: the static set of monitored seat regions.
//!
//! Loaded once from a JSON array of
//! `{"seat_id": 1, "rect": {"x":..,"y":..,"w":..,"h":..}}` and/or
//! `{"seat_id": 2, "poly": [[x, y], ...]}` entries. A polygon with at least
//! three points takes precedence over the rectangle for containment.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::geometry::{Polygon, Rect, SeatRegion};

#[derive(Debug, Deserialize)]
struct SeatEntry {
    seat_id: u32,
    #[serde(default)]
    rect: Option<Rect>,
    #[serde(default)]
    poly: Option<Polygon>,
}

/// One monitored seat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeatDefinition {
    pub seat_id: u32,
    /// Axis-aligned region. For polygon seats this is the polygon's bounding box
    /// unless an explicit rect was given.
    pub rect: Rect,
    pub region: SeatRegion,
}

impl SeatDefinition {
    pub fn new(seat_id: u32, region: SeatRegion) -> Self {
        Self {
            seat_id,
            rect: region.bounding_rect(),
            region,
        }
    }

    pub fn polygon(&self) -> Option<&Polygon> {
        match &self.region {
            SeatRegion::Polygon(poly) => Some(poly),
            SeatRegion::Rect(_) => None,
        }
    }

    fn from_entry(entry: SeatEntry) -> Result<Self> {
        let poly = entry.poly.filter(|p| !p.points().is_empty());
        match (entry.rect, poly) {
            (_, Some(poly)) if !poly.is_valid() => Err(anyhow!(
                "seat {} polygon needs at least 3 points, got {}",
                entry.seat_id,
                poly.points().len()
            )),
            (rect, Some(poly)) => Ok(Self {
                seat_id: entry.seat_id,
                rect: rect.filter(|r| !r.is_empty()).unwrap_or_else(|| poly.bounding_rect()),
                region: SeatRegion::Polygon(poly),
            }),
            (Some(rect), None) if rect.is_empty() => Err(anyhow!(
                "seat {} rect must have positive width and height",
                entry.seat_id
            )),
            (Some(rect), None) => Ok(Self::new(entry.seat_id, SeatRegion::Rect(rect))),
            (None, None) => Err(anyhow!("seat {} has neither rect nor poly", entry.seat_id)),
        }
    }
}

/// Immutable, validated set of seats. Seat ids are unique.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeatCatalog {
    seats: Vec<SeatDefinition>,
}

impl SeatCatalog {
    pub fn new(seats: Vec<SeatDefinition>) -> Result<Self> {
        if seats.is_empty() {
            return Err(anyhow!("seat catalog is empty"));
        }
        let mut seen = HashSet::new();
        for seat in &seats {
            if !seen.insert(seat.seat_id) {
                return Err(anyhow!("duplicate seat_id {}", seat.seat_id));
            }
        }
        Ok(Self { seats })
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: Vec<SeatEntry> = serde_json::from_str(raw).context("invalid seat catalog JSON")?;
        let seats = entries
            .into_iter()
            .map(SeatDefinition::from_entry)
            .collect::<Result<Vec<_>>>()?;
        Self::new(seats)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read seat catalog {}", path.display()))?;
        let catalog =
            Self::from_json(&raw).with_context(|| format!("in seat catalog {}", path.display()))?;
        log::info!("loaded {} seats from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn seats(&self) -> &[SeatDefinition] {
        &self.seats
    }

    pub fn get(&self, seat_id: u32) -> Option<&SeatDefinition> {
        self.seats.iter().find(|s| s.seat_id == seat_id)
    }

    pub fn len(&self) -> usize {
        self.seats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seats.is_empty()
    }
}

//! Foreground (motion) estimation.
//!
//! An estimator is stateful across frames: it keeps a background model and
//! returns a binary mask (0 or 255 per pixel) the same size as the input.

use anyhow::{anyhow, Result};

use crate::frame::Frame;
use crate::geometry::{Point, SeatRegion};

pub const MASK_ON: u8 = 255;

/// Binary foreground mask in row-major order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForegroundMask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl ForegroundMask {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if data.len() != width as usize * height as usize {
            return Err(anyhow!(
                "mask has {} values, expected {}x{}",
                data.len(),
                width,
                height
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.data[y as usize * self.width as usize + x as usize] != 0
    }

    /// Fraction of the region's in-frame pixels that are foreground.
    ///
    /// Regions entirely outside the mask report 0.
    pub fn ratio_in(&self, region: &SeatRegion) -> f32 {
        let bounds = region.bounding_rect().clamp_to(self.width, self.height);
        if bounds.is_empty() {
            return 0.0;
        }
        let mut total = 0u64;
        let mut on = 0u64;
        for y in bounds.y..bounds.bottom() {
            for x in bounds.x..bounds.right() {
                if let SeatRegion::Polygon(poly) = region {
                    if !poly.contains_point(Point::new(x, y)) {
                        continue;
                    }
                }
                total += 1;
                if self.is_set(x as u32, y as u32) {
                    on += 1;
                }
            }
        }
        if total == 0 {
            return 0.0;
        }
        on as f32 / total as f32
    }
}

/// Stateful background model producing a foreground mask per frame.
pub trait ForegroundEstimator: Send {
    fn name(&self) -> &'static str;

    fn apply(&mut self, frame: &Frame) -> Result<ForegroundMask>;
}

/// Estimator that never reports foreground.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoForeground;

impl ForegroundEstimator for NoForeground {
    fn name(&self) -> &'static str {
        "none"
    }

    fn apply(&mut self, frame: &Frame) -> Result<ForegroundMask> {
        Ok(ForegroundMask::empty(frame.width, frame.height))
    }
}

/// Exponential running-average background on luma.
///
/// A pixel is foreground when it differs from the background by more than
/// `threshold`. The first frame (or a frame of a new size) seeds the model and
/// yields an empty mask.
#[derive(Clone, Debug)]
pub struct RunningAverageBackground {
    alpha: f32,
    threshold: f32,
    background: Option<Vec<f32>>,
    dims: (u32, u32),
}

impl RunningAverageBackground {
    pub const DEFAULT_ALPHA: f32 = 0.05;
    pub const DEFAULT_THRESHOLD: u8 = 25;

    pub fn new(alpha: f32, threshold: u8) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            threshold: threshold as f32,
            background: None,
            dims: (0, 0),
        }
    }
}

impl Default for RunningAverageBackground {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ALPHA, Self::DEFAULT_THRESHOLD)
    }
}

fn luma(px: &[u8]) -> f32 {
    0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32
}

impl ForegroundEstimator for RunningAverageBackground {
    fn name(&self) -> &'static str {
        "running-average"
    }

    fn apply(&mut self, frame: &Frame) -> Result<ForegroundMask> {
        let dims = (frame.width, frame.height);
        let lumas = frame.pixels().chunks_exact(3).map(luma);

        if self.background.is_none() || self.dims != dims {
            self.background = Some(lumas.collect());
            self.dims = dims;
            return Ok(ForegroundMask::empty(frame.width, frame.height));
        }
        let Some(background) = self.background.as_mut() else {
            return Ok(ForegroundMask::empty(frame.width, frame.height));
        };

        let mut data = Vec::with_capacity(background.len());
        for (bg, l) in background.iter_mut().zip(lumas) {
            data.push(if (l - *bg).abs() > self.threshold { MASK_ON } else { 0 });
            *bg += self.alpha * (l - *bg);
        }
        ForegroundMask::new(frame.width, frame.height, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Polygon, Rect};

    #[test]
    fn first_frame_seeds_background() -> Result<()> {
        let mut est = RunningAverageBackground::default();
        let mask = est.apply(&Frame::filled(4, 4, [200, 200, 200], 0, 0))?;
        assert_eq!(mask.ratio_in(&SeatRegion::Rect(Rect::new(0, 0, 4, 4))), 0.0);
        Ok(())
    }

    #[test]
    fn changed_pixels_become_foreground() -> Result<()> {
        let mut est = RunningAverageBackground::default();
        est.apply(&Frame::filled(4, 4, [0, 0, 0], 0, 0))?;
        let mask = est.apply(&Frame::filled(4, 4, [255, 255, 255], 1, 100))?;
        assert!(mask.is_set(0, 0));

        // Same frame again: background has only moved by alpha, still foreground.
        let mask = est.apply(&Frame::filled(4, 4, [255, 255, 255], 2, 200))?;
        assert!(mask.is_set(3, 3));
        Ok(())
    }

    #[test]
    fn static_scene_stays_background() -> Result<()> {
        let mut est = RunningAverageBackground::default();
        for i in 0..5 {
            let mask = est.apply(&Frame::filled(4, 4, [90, 90, 90], i, i as i64 * 100))?;
            assert!(!mask.is_set(1, 1));
        }
        Ok(())
    }

    #[test]
    fn ratio_counts_rect_and_polygon_pixels() -> Result<()> {
        // Left half of a 4x4 mask is on.
        let mut data = vec![0u8; 16];
        for y in 0..4 {
            data[y * 4] = MASK_ON;
            data[y * 4 + 1] = MASK_ON;
        }
        let mask = ForegroundMask::new(4, 4, data)?;
        let rect = SeatRegion::Rect(Rect::new(0, 0, 4, 4));
        assert!((mask.ratio_in(&rect) - 0.5).abs() < 1e-6);

        // Partially off-frame rect is clipped before counting.
        let clipped = SeatRegion::Rect(Rect::new(-2, 0, 4, 4));
        assert!((mask.ratio_in(&clipped) - 1.0).abs() < 1e-6);

        let poly = SeatRegion::Polygon(Polygon::new(vec![
            Point::new(0, 0),
            Point::new(1, 0),
            Point::new(1, 3),
            Point::new(0, 3),
        ]));
        assert!((mask.ratio_in(&poly) - 1.0).abs() < 1e-6);

        let outside = SeatRegion::Rect(Rect::new(10, 10, 3, 3));
        assert_eq!(mask.ratio_in(&outside), 0.0);
        Ok(())
    }

    #[test]
    fn mask_rejects_wrong_length() {
        assert!(ForegroundMask::new(2, 2, vec![0; 3]).is_err());
    }
}

//! Decoded frame container.
//!
//! - `Frame`: RGB8 pixels plus source position (index, capture timestamp).
//! - JPEG/PNG helpers used by bulk extraction and re-fetch.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// One decoded frame in packed RGB8 layout (`width * height * 3` bytes).
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Position of this frame in its source (video frame number or image ordinal).
    pub index: u64,
    /// Capture time in milliseconds. Non-decreasing within one source.
    pub timestamp_ms: i64,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, index: u64, timestamp_ms: i64) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer has {} bytes, expected {} for {}x{} RGB",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            index,
            timestamp_ms,
        })
    }

    /// Solid-color frame. Used by synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], index: u64, timestamp_ms: i64) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            pixels,
            width,
            height,
            index,
            timestamp_ms,
        }
    }

    pub fn from_image(img: RgbImage, index: u64, timestamp_ms: i64) -> Self {
        let (width, height) = img.dimensions();
        Self {
            pixels: img.into_raw(),
            width,
            height,
            index,
            timestamp_ms,
        }
    }

    /// Decode an image file from disk.
    pub fn open(path: &Path, index: u64, timestamp_ms: i64) -> Result<Self> {
        let img = image::open(path)
            .with_context(|| format!("failed to decode image {}", path.display()))?
            .to_rgb8();
        Ok(Self::from_image(img, index, timestamp_ms))
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        let px = self.pixels.get(offset..offset + 3)?;
        Some([px[0], px[1], px[2]])
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Write as baseline JPEG. `quality` is clamped to `1..=100`.
    pub fn save_jpeg(&self, path: &Path, quality: u8) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality.clamp(1, 100));
        encoder
            .encode(&self.pixels, self.width, self.height, ExtendedColorType::Rgb8)
            .with_context(|| format!("failed to encode {}", path.display()))?;
        Ok(())
    }

    /// Lossless write. Format follows the file extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        let img = RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))?;
        img.save(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

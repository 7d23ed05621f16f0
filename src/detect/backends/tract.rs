#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::postprocess::{decode_yolov8, non_max_suppression, Letterbox};
use crate::detect::result::RawDetection;
use crate::frame::Frame;

const LETTERBOX_FILL: f32 = 114.0 / 255.0;

/// Tract-based YOLOv8 backend for ONNX inference.
///
/// Loads a local model with a square `[1, 3, S, S]` input and a
/// `[1, 4 + C, A]` output head.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    confidence_threshold: f32,
    nms_iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_size as usize, input_size as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "TractBackend: loaded {} ({}x{})",
            model_path.display(),
            input_size,
            input_size
        );
        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.25,
            nms_iou_threshold: 0.45,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_nms_threshold(mut self, threshold: f32) -> Self {
        self.nms_iou_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame, letterbox: &Letterbox) -> Result<Tensor> {
        if frame.is_empty() {
            return Err(anyhow!("cannot run detection on an empty frame"));
        }
        let size = self.input_size as usize;
        let (src_w, src_h) = (frame.width, frame.height);
        let pixels = frame.pixels();
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            match letterbox.source_pixel(x as u32, y as u32, src_w, src_h) {
                Some((sx, sy)) => {
                    let idx = (sy as usize * src_w as usize + sx as usize) * 3 + channel;
                    pixels[idx] as f32 / 255.0
                }
                None => LETTERBOX_FILL,
            }
        });
        Ok(input.into_tensor())
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let letterbox = Letterbox::fit(frame.width, frame.height, self.input_size);
        let input = self.build_input(frame, &letterbox)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let (rows, anchors) = (shape[1], shape[2]);
        let flat: Vec<f32> = view.iter().copied().collect();
        let raw = decode_yolov8(
            &flat[..rows * anchors],
            rows - 4,
            anchors,
            self.confidence_threshold,
            &letterbox,
            frame.width,
            frame.height,
        );
        Ok(non_max_suppression(raw, self.nms_iou_threshold))
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::filled(self.input_size, self.input_size, [0, 0, 0], 0, 0);
        self.detect(&blank).map(|_| ())
    }
}

#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::PlateDetector;
use crate::detect::result::{non_max_suppression, PlateBox};
use crate::frame::Frame;

const CXYWH_OFFSET: usize = 4;
const LETTERBOX_FILL: f32 = 114.0 / 255.0;

/// YOLOv8-style plate detector running an ONNX model through tract.
///
/// The model takes a `1x3xHxW` RGB tensor in `0..1` and emits
/// `1x(4+classes)xanchors` rows of `cx, cy, w, h, class scores...` in input
/// pixel space. Frames are letterboxed into the input (scaled to fit, padded
/// right and bottom) and boxes are scaled back to frame coordinates.
pub struct YoloPlateDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl YoloPlateDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "YoloPlateDetector: loaded {} ({}x{})",
            model_path.display(),
            width,
            height
        );
        Ok(Self {
            model,
            width,
            height,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Scale from frame to model input space.
    fn ratio(&self, frame: &Frame) -> f32 {
        (self.width as f32 / frame.width as f32).min(self.height as f32 / frame.height as f32)
    }

    fn build_input(&self, frame: &Frame, ratio: f32) -> Result<Tensor> {
        let scaled_width = ((frame.width as f32 * ratio).round() as u32).clamp(1, self.width);
        let scaled_height = ((frame.height as f32 * ratio).round() as u32).clamp(1, self.height);
        let resized = imageops::resize(
            &frame.to_rgb_image()?,
            scaled_width,
            scaled_height,
            FilterType::Triangle,
        );

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| {
                if (x as u32) < scaled_width && (y as u32) < scaled_height {
                    resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
                } else {
                    LETTERBOX_FILL
                }
            },
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame, ratio: f32) -> Result<Vec<PlateBox>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[1] <= CXYWH_OFFSET {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let rows = shape[1];
        let anchors = shape[2];
        let frame_width = frame.width as f32;
        let frame_height = frame.height as f32;

        let mut boxes = Vec::new();
        for anchor in 0..anchors {
            let (class_id, confidence) = (CXYWH_OFFSET..rows)
                .map(|row| (row - CXYWH_OFFSET, preds[[0, row, anchor]]))
                .fold((0, f32::NEG_INFINITY), |best, candidate| {
                    if candidate.1 > best.1 {
                        candidate
                    } else {
                        best
                    }
                });
            if !(confidence >= self.confidence_threshold) {
                continue;
            }
            let cx = preds[[0, 0, anchor]] / ratio;
            let cy = preds[[0, 1, anchor]] / ratio;
            let w = preds[[0, 2, anchor]] / ratio;
            let h = preds[[0, 3, anchor]] / ratio;
            let x = (cx - w / 2.0).clamp(0.0, frame_width);
            let y = (cy - h / 2.0).clamp(0.0, frame_height);
            boxes.push(PlateBox::new(x, y, w, h, confidence, class_id));
        }
        non_max_suppression(&mut boxes, self.iou_threshold);
        Ok(boxes)
    }
}

impl PlateDetector for YoloPlateDetector {
    fn name(&self) -> &'static str {
        "yolo-tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<PlateBox>> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(Vec::new());
        }
        let ratio = self.ratio(frame);
        let input = self.build_input(frame, ratio)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame, ratio)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::new(
            vec![0; (self.width * self.height * 3) as usize],
            self.width,
            self.height,
            0,
        )?;
        self.detect(&blank).map(|_| ())
    }
}

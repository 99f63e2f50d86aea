use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::detect::backend::PlateDetector;
use crate::detect::result::PlateBox;
use crate::frame::Frame;

/// Treats the whole sampled frame as one plate region.
///
/// Useful when the capture ROI is already tight around the plate position,
/// and as the default when no detection model is configured.
#[derive(Default)]
pub struct WholeFrameDetector;

impl WholeFrameDetector {
    pub fn new() -> Self {
        Self
    }
}

impl PlateDetector for WholeFrameDetector {
    fn name(&self) -> &'static str {
        "whole-frame"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<PlateBox>> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![PlateBox::new(
            0.0,
            0.0,
            frame.width as f32,
            frame.height as f32,
            1.0,
            0,
        )])
    }
}

/// Scripted result for one `detect` call.
#[derive(Clone, Debug)]
pub enum ScriptedDetection {
    Boxes(Vec<PlateBox>),
    Fail(String),
}

/// Detector replaying queued results; falls back to the whole frame once the
/// script is exhausted. Clones share the script.
#[derive(Clone, Default)]
pub struct ScriptedDetector {
    script: Arc<Mutex<VecDeque<ScriptedDetection>>>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_boxes(&self, boxes: Vec<PlateBox>) {
        self.lock().push_back(ScriptedDetection::Boxes(boxes));
    }

    pub fn push_failure(&self, message: &str) {
        self.lock()
            .push_back(ScriptedDetection::Fail(message.to_string()));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ScriptedDetection>> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PlateDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<PlateBox>> {
        let next = self.lock().pop_front();
        match next {
            Some(ScriptedDetection::Boxes(boxes)) => Ok(boxes),
            Some(ScriptedDetection::Fail(message)) => Err(anyhow!(message)),
            None => WholeFrameDetector.detect(frame),
        }
    }
}

//! Codec-free stand-ins for `VideoEncoder` and `Transcoder`.
//!
//! `PlaceholderEncoder` writes a small text file per segment that records how
//! many frames were appended. `FixedDurationTranscoder` reports a configured
//! duration and "re-times" by copying the file. Both keep a log of calls so the
//! pipeline's bookkeeping can be checked without a real codec.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{retime_temp_path, FourCc, SegmentWriter, Transcoder, VideoEncoder};
use crate::frame::Frame;

/// Segment as seen by `PlaceholderEncoder` once closed.
#[derive(Clone, Debug, PartialEq)]
pub struct ClosedSegment {
    pub path: PathBuf,
    pub fps: f64,
    pub frames: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PlaceholderEncoder {
    closed: Arc<Mutex<Vec<ClosedSegment>>>,
}

impl PlaceholderEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closed_segments(&self) -> Vec<ClosedSegment> {
        self.closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl VideoEncoder for PlaceholderEncoder {
    fn open_writer(
        &self,
        path: &Path,
        fourcc: FourCc,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn SegmentWriter>> {
        let mut file =
            File::create(path).with_context(|| format!("create segment {}", path.display()))?;
        writeln!(file, "{} {}x{} @ {:.3}", fourcc.as_str(), width, height, fps)?;
        Ok(Box::new(PlaceholderWriter {
            path: path.to_path_buf(),
            fps,
            file,
            frames: 0,
            closed: self.closed.clone(),
        }))
    }
}

struct PlaceholderWriter {
    path: PathBuf,
    fps: f64,
    file: File,
    frames: u64,
    closed: Arc<Mutex<Vec<ClosedSegment>>>,
}

impl SegmentWriter for PlaceholderWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.frames += 1;
        writeln!(self.file, "frame {}", frame.ordinal)
            .with_context(|| format!("append to {}", self.path.display()))
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.file.flush()?;
        self.closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ClosedSegment {
                path: self.path.clone(),
                fps: self.fps,
                frames: self.frames,
            });
        Ok(())
    }
}

/// A recorded `Transcoder::retime` invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetimeCall {
    pub path: PathBuf,
    pub pts_scale: f64,
    pub target_fps: f64,
}

/// Transcoder that reports a fixed probed duration.
#[derive(Clone, Debug)]
pub struct FixedDurationTranscoder {
    duration_secs: f64,
    fail_retime: bool,
    calls: Arc<Mutex<Vec<RetimeCall>>>,
}

impl FixedDurationTranscoder {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            fail_retime: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make every `retime` call fail.
    pub fn failing(mut self) -> Self {
        self.fail_retime = true;
        self
    }

    pub fn calls(&self) -> Vec<RetimeCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Transcoder for FixedDurationTranscoder {
    fn probe_duration(&self, path: &Path) -> Result<f64> {
        if !path.is_file() {
            return Err(anyhow!("file not found: {}", path.display()));
        }
        Ok(self.duration_secs)
    }

    fn retime(&self, path: &Path, pts_scale: f64, target_fps: f64) -> Result<PathBuf> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RetimeCall {
                path: path.to_path_buf(),
                pts_scale,
                target_fps,
            });
        if self.fail_retime {
            return Err(anyhow!("re-time failed on {}", path.display()));
        }
        let temp = retime_temp_path(path);
        std::fs::copy(path, &temp)
            .with_context(|| format!("copy {} to {}", path.display(), temp.display()))?;
        let mut file = std::fs::OpenOptions::new().append(true).open(&temp)?;
        writeln!(file, "retimed setpts={:.6} fps={:.6}", pts_scale, target_fps)?;
        Ok(temp)
    }
}

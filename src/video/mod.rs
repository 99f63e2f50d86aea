//! Video segments and the encoder/transcoder collaborators.
//!
//! The capture stage writes frames through a `VideoEncoder`; the segment
//! finisher probes and re-times closed files through a `Transcoder`.
//! Production implementations drive the `ffmpeg`/`ffprobe` executables
//! (`ffmpeg` module); `memory` holds lightweight stand-ins that write
//! placeholder files so the pipeline can run without a codec toolchain.

mod ffmpeg;
pub mod memory;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::frame::Frame;

pub use ffmpeg::{FfmpegEncoder, FfmpegTranscoder};

/// Container four-character code requested when opening a writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const MP4V: FourCc = FourCc(*b"mp4v");

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

/// A closed, fixed-length recording.
///
/// Created by the capture stage, re-timed in place by the finisher, deleted by
/// the publisher.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoSegment {
    pub path: PathBuf,
    /// Frame rate measured over the segment's capture interval.
    pub declared_fps: f64,
    /// Wall-clock length the segment was recorded for.
    pub declared_duration_secs: f64,
    /// Frames actually written; may fall short of `fps * duration` under load.
    pub true_frame_count: u64,
}

/// Append-only writer for one open segment.
pub trait SegmentWriter: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close the file. The writer is unusable afterwards.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Opens segment writers.
pub trait VideoEncoder: Send + Sync {
    fn open_writer(
        &self,
        path: &Path,
        fourcc: FourCc,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn SegmentWriter>>;
}

/// Container probing and timestamp rescaling.
pub trait Transcoder: Send + Sync {
    /// Real playback duration of the file in seconds.
    fn probe_duration(&self, path: &Path) -> Result<f64>;

    /// Write a copy of `path` with presentation timestamps multiplied by
    /// `pts_scale` and output rate `target_fps`. Returns the new file's path;
    /// the input is left untouched.
    fn retime(&self, path: &Path, pts_scale: f64, target_fps: f64) -> Result<PathBuf>;
}

/// Sibling path used for the re-timed copy of `path`.
pub fn retime_temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "segment.mp4".to_string());
    path.with_file_name(format!("temp_{}", name))
}

//! `ffmpeg`/`ffprobe` executables as encoder and transcoder.
//!
//! Frames are streamed to an `ffmpeg` child as raw RGB24 on stdin. Probing and
//! re-timing run one child process per call and check its exit status.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use super::{retime_temp_path, FourCc, SegmentWriter, Transcoder, VideoEncoder};
use crate::frame::Frame;

const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_FFPROBE: &str = "ffprobe";
const RETIME_THREADS: u32 = 16;

/// Encoder that pipes frames into an `ffmpeg` child process.
#[derive(Clone, Debug)]
pub struct FfmpegEncoder {
    ffmpeg: String,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self {
            ffmpeg: DEFAULT_FFMPEG.to_string(),
        }
    }

    pub fn with_binary(mut self, ffmpeg: impl Into<String>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn open_writer(
        &self,
        path: &Path,
        fourcc: FourCc,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn SegmentWriter>> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(anyhow!("writer fps must be positive, got {}", fps));
        }
        let codec_args = codec_args_for(fourcc)?;
        let mut child = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{}x{}", width, height))
            .arg("-r")
            .arg(format!("{:.3}", fps))
            .args(["-i", "-"])
            .args(codec_args)
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn {} for {}", self.ffmpeg, path.display()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdin was not captured"))?;
        Ok(Box::new(FfmpegSegmentWriter {
            path: path.to_path_buf(),
            width,
            height,
            child: Some(child),
            stdin: Some(stdin),
        }))
    }
}

fn codec_args_for(fourcc: FourCc) -> Result<[&'static str; 4]> {
    match &fourcc.0 {
        b"mp4v" => Ok(["-c:v", "mpeg4", "-tag:v", "mp4v"]),
        b"avc1" | b"h264" => Ok(["-c:v", "libx264", "-pix_fmt", "yuv420p"]),
        _ => Err(anyhow!("unsupported fourcc '{}'", fourcc.as_str())),
    }
}

struct FfmpegSegmentWriter {
    path: PathBuf,
    width: u32,
    height: u32,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl SegmentWriter for FfmpegSegmentWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match writer {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("writer for {} already closed", self.path.display()))?;
        stdin
            .write_all(frame.pixels())
            .with_context(|| format!("write frame to {}", self.path.display()))
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        // Closing stdin signals end of stream.
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .with_context(|| format!("wait for ffmpeg writing {}", self.path.display()))?;
        if !status.success() {
            return Err(anyhow!(
                "ffmpeg exited with {} while writing {}",
                status,
                self.path.display()
            ));
        }
        Ok(())
    }
}

impl Drop for FfmpegSegmentWriter {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Transcoder backed by `ffprobe` and `ffmpeg`.
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegTranscoder {
    pub fn new() -> Self {
        Self {
            ffmpeg: DEFAULT_FFMPEG.to_string(),
            ffprobe: DEFAULT_FFPROBE.to_string(),
        }
    }

    pub fn with_binaries(mut self, ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder for FfmpegTranscoder {
    fn probe_duration(&self, path: &Path) -> Result<f64> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .output()
            .with_context(|| format!("spawn {} for {}", self.ffprobe, path.display()))?;
        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed on {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        parse_probe_duration(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("could not retrieve duration from {}", path.display()))
    }

    fn retime(&self, path: &Path, pts_scale: f64, target_fps: f64) -> Result<PathBuf> {
        let temp = retime_temp_path(path);
        let filter = format!("setpts={:.6}*PTS,fps={:.6}", pts_scale, target_fps);
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(path)
            .args(["-vf", filter.as_str()])
            .args(["-c:v", "libx264", "-c:a", "aac", "-shortest"])
            .arg("-threads")
            .arg(RETIME_THREADS.to_string())
            .arg(&temp)
            .output()
            .with_context(|| format!("spawn {} for {}", self.ffmpeg, path.display()))?;
        if !output.status.success() {
            let _ = std::fs::remove_file(&temp);
            return Err(anyhow!(
                "ffmpeg re-time failed on {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(temp)
    }
}

fn parse_probe_duration(stdout: &str) -> Result<f64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("ffprobe printed no duration"))?;
    let seconds: f64 = line
        .parse()
        .map_err(|_| anyhow!("ffprobe duration '{}' is not a number", line))?;
    if !(seconds.is_finite() && seconds > 0.0) {
        return Err(anyhow!("ffprobe duration {} is not positive", seconds));
    }
    Ok(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_output() {
        assert_eq!(parse_probe_duration("59.733333\n").unwrap(), 59.733333);
        assert!(parse_probe_duration("N/A\n").is_err());
        assert!(parse_probe_duration("\n").is_err());
        assert!(parse_probe_duration("0.000000").is_err());
    }

    #[test]
    fn maps_fourcc_to_codec() {
        assert_eq!(codec_args_for(FourCc::MP4V).unwrap()[1], "mpeg4");
        assert!(codec_args_for(FourCc(*b"XVID")).is_err());
    }

    #[test]
    fn missing_binary_is_an_error() {
        let transcoder = FfmpegTranscoder::new()
            .with_binaries("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        assert!(transcoder
            .probe_duration(Path::new("recording.mp4"))
            .is_err());
    }
}

//! Segment finisher.
//!
//! Closed segments are declared to be `segment_length` long, but under load
//! the camera delivers fewer frames than the nominal rate. The finisher
//! probes each file's real playback duration, rescales its timestamps so it
//! plays for the wall-clock time it covers, and re-encodes at the rate that
//! was actually achieved. The re-timed copy replaces the original by rename.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::queue::{BlockingQueue, EvictingQueue};
use crate::signal::StopSignal;
use crate::video::{Transcoder, VideoSegment};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timing correction for one segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetimePlan {
    /// Frames per second the device really delivered.
    pub actual_fps: f64,
    /// Factor applied to presentation timestamps.
    pub duration_ratio: f64,
}

impl RetimePlan {
    /// `measured_secs` is the probed playback duration of the closed file.
    pub fn compute(segment: &VideoSegment, measured_secs: f64) -> Result<Self> {
        if !(measured_secs.is_finite() && measured_secs > 0.0) {
            return Err(anyhow!(
                "measured duration {} of {} is not positive",
                measured_secs,
                segment.path.display()
            ));
        }
        if segment.true_frame_count == 0 {
            return Err(anyhow!("segment {} has no frames", segment.path.display()));
        }
        Ok(Self {
            actual_fps: segment.true_frame_count as f64 / measured_secs,
            duration_ratio: segment.declared_duration_secs / measured_secs,
        })
    }
}

pub struct SegmentFinisher {
    transcoder: Arc<dyn Transcoder>,
    input: BlockingQueue<VideoSegment>,
    output: EvictingQueue<PathBuf>,
    stop: StopSignal,
}

impl SegmentFinisher {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        input: BlockingQueue<VideoSegment>,
        output: EvictingQueue<PathBuf>,
        stop: StopSignal,
    ) -> Self {
        Self {
            transcoder,
            input,
            output,
            stop,
        }
    }

    pub fn run(self) -> Result<()> {
        log::info!("segment finisher is running");
        while !self.stop.is_stopped() {
            let Some(segment) = self.input.recv_timeout(POLL_INTERVAL) else {
                continue;
            };
            match self.finish(&segment) {
                Ok(plan) => {
                    log::debug!(
                        "re-timed {} (fps {:.3}, ratio {:.4})",
                        segment.path.display(),
                        plan.actual_fps,
                        plan.duration_ratio
                    );
                    let evicted_before = self.output.evicted();
                    self.output.push(segment.path.clone());
                    if self.output.evicted() > evicted_before {
                        log::warn!("publish backlog full, dropped oldest finished segment");
                    }
                }
                Err(err) => {
                    log::error!("could not re-time {}: {:#}", segment.path.display(), err);
                }
            }
        }
        log::info!("segment finisher is stopped");
        Ok(())
    }

    /// Re-time `segment` in place. On error the original file is untouched.
    pub fn finish(&self, segment: &VideoSegment) -> Result<RetimePlan> {
        let measured = self
            .transcoder
            .probe_duration(&segment.path)
            .with_context(|| format!("probe {}", segment.path.display()))?;
        let plan = RetimePlan::compute(segment, measured)?;
        let temp = self
            .transcoder
            .retime(&segment.path, plan.duration_ratio, plan.actual_fps)?;
        if let Err(err) = std::fs::rename(&temp, &segment.path) {
            let _ = std::fs::remove_file(&temp);
            return Err(anyhow::Error::new(err).context(format!(
                "replace {} with {}",
                segment.path.display(),
                temp.display()
            )));
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::memory::FixedDurationTranscoder;
    use crate::video::retime_temp_path;

    fn segment(dir: &std::path::Path, frames: u64, declared_secs: f64) -> VideoSegment {
        let path = dir.join("recording_20240101120000.mp4");
        std::fs::write(&path, "original\n").unwrap();
        VideoSegment {
            path,
            declared_fps: frames as f64 / declared_secs,
            declared_duration_secs: declared_secs,
            true_frame_count: frames,
        }
    }

    fn finisher(transcoder: FixedDurationTranscoder) -> (SegmentFinisher, EvictingQueue<PathBuf>) {
        let output = EvictingQueue::new(4);
        let finisher = SegmentFinisher::new(
            Arc::new(transcoder),
            BlockingQueue::new(4),
            output.clone(),
            StopSignal::new(),
        );
        (finisher, output)
    }

    #[test]
    fn correct_segment_keeps_its_timing() {
        let dir = tempfile::tempdir().unwrap();
        let plan = RetimePlan::compute(&segment(dir.path(), 300, 10.0), 10.0).unwrap();
        assert_eq!(plan.duration_ratio, 1.0);
        assert_eq!(plan.actual_fps, 30.0);
    }

    #[test]
    fn short_segment_is_stretched() {
        let dir = tempfile::tempdir().unwrap();
        // 60 s of wall time, only 1200 frames: the file plays 40 s at 30 fps.
        let plan = RetimePlan::compute(&segment(dir.path(), 1200, 60.0), 40.0).unwrap();
        assert_eq!(plan.actual_fps, 30.0);
        assert_eq!(plan.duration_ratio, 1.5);
    }

    #[test]
    fn rejects_degenerate_measurements() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RetimePlan::compute(&segment(dir.path(), 10, 1.0), 0.0).is_err());
        assert!(RetimePlan::compute(&segment(dir.path(), 10, 1.0), f64::NAN).is_err());
        assert!(RetimePlan::compute(&segment(dir.path(), 0, 1.0), 1.0).is_err());
    }

    #[test]
    fn finish_replaces_original_by_rename() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = FixedDurationTranscoder::new(40.0);
        let (finisher, _) = finisher(transcoder.clone());
        let seg = segment(dir.path(), 1200, 60.0);

        finisher.finish(&seg).unwrap();

        let contents = std::fs::read_to_string(&seg.path).unwrap();
        assert!(contents.starts_with("original"));
        assert!(contents.contains("retimed setpts=1.500000 fps=30.000000"));
        assert!(!retime_temp_path(&seg.path).exists());
        assert_eq!(transcoder.calls().len(), 1);
    }

    #[test]
    fn failed_retime_leaves_original_and_is_not_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = FixedDurationTranscoder::new(40.0).failing();
        let (finisher, output) = finisher(transcoder);
        let input = finisher.input.clone();
        let stop = finisher.stop.clone();
        let seg = segment(dir.path(), 1200, 60.0);
        input.try_push(seg.clone()).unwrap();

        let handle = std::thread::spawn(move || finisher.run());
        std::thread::sleep(Duration::from_millis(300));
        stop.stop();
        handle.join().unwrap().unwrap();

        assert!(output.is_empty());
        assert_eq!(std::fs::read_to_string(&seg.path).unwrap(), "original\n");
    }

    #[test]
    fn finished_segments_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let (finisher, output) = finisher(FixedDurationTranscoder::new(10.0));
        let input = finisher.input.clone();
        let stop = finisher.stop.clone();
        let seg = segment(dir.path(), 300, 10.0);
        input.try_push(seg.clone()).unwrap();

        let handle = std::thread::spawn(move || finisher.run());
        let forwarded = output.recv_timeout(Duration::from_secs(2));
        stop.stop();
        handle.join().unwrap().unwrap();
        assert_eq!(forwarded, Some(seg.path));
    }
}

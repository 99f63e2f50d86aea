use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{CameraDevice, CameraOpener};
use crate::frame::{Frame, Roi};
use crate::queue::{BlockingQueue, FrameSlot};
use crate::signal::{RecognitionWindow, StopSignal};
use crate::video::{FourCc, SegmentWriter, VideoEncoder, VideoSegment};

const READ_FAILURE_BACKOFF: Duration = Duration::from_millis(10);
const SEGMENT_OPEN_BACKOFF: Duration = Duration::from_millis(500);

/// Capture stage settings.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Nominal device rate; segment writers are opened at this rate.
    pub fps: f64,
    /// Wall-clock length of each segment.
    pub segment_length: Duration,
    /// Directory receiving `recording_<timestamp>.mp4` files.
    pub output_dir: PathBuf,
    /// Region published to the recognition stage. Full frame when `None`.
    pub roi: Option<Roi>,
    pub fourcc: FourCc,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            segment_length: Duration::from_secs(60),
            output_dir: PathBuf::from("."),
            roi: Some(Roi::new(320, 300, 250, 170)),
            fourcc: FourCc::MP4V,
        }
    }
}

/// Counters shared with the supervisor for health logging.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames_written: AtomicU64,
    pub read_failures: AtomicU64,
    pub segments_closed: AtomicU64,
    pub frames_sampled: AtomicU64,
}

/// Continuous recorder.
///
/// Every frame is appended to the open segment. While the recognition window
/// is asserted, a sample (ROI crop) also goes to the frame slot, overwriting
/// any unconsumed one. Closed segments are handed to the finisher through a
/// blocking queue: capture stalls rather than drop a segment.
pub struct CaptureStage {
    opener: Option<CameraOpener>,
    encoder: Arc<dyn VideoEncoder>,
    config: CaptureConfig,
    window: RecognitionWindow,
    frames: FrameSlot<Frame>,
    raw_segments: BlockingQueue<VideoSegment>,
    stop: StopSignal,
    stats: Arc<CaptureStats>,
}

impl CaptureStage {
    pub fn new(
        opener: CameraOpener,
        encoder: Arc<dyn VideoEncoder>,
        config: CaptureConfig,
        window: RecognitionWindow,
        frames: FrameSlot<Frame>,
        raw_segments: BlockingQueue<VideoSegment>,
        stop: StopSignal,
    ) -> Self {
        Self {
            opener: Some(opener),
            encoder,
            config,
            window,
            frames,
            raw_segments,
            stop,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }

    /// Run until the stop signal is observed.
    ///
    /// Returns an error only when the camera cannot be opened. Segment
    /// writer failures are logged; the affected segment is dropped and
    /// recording continues with a new one.
    pub fn run(mut self) -> Result<()> {
        if self.stop.is_stopped() {
            return Ok(());
        }
        let opener = self
            .opener
            .take()
            .context("capture stage already ran")?;
        let mut camera = match opener() {
            Ok(camera) => camera,
            Err(err) => {
                log::error!("could not open camera: {:#}", err);
                return Err(err);
            }
        };
        log::info!("camera recording is running on {}", camera.name());

        self.record(camera.as_mut());
        log::info!(
            "camera recording is stopped ({} frames, {} segments, {} read failures)",
            self.stats.frames_written.load(Ordering::Relaxed),
            self.stats.segments_closed.load(Ordering::Relaxed),
            self.stats.read_failures.load(Ordering::Relaxed)
        );
        Ok(())
    }

    fn record(&self, camera: &mut dyn CameraDevice) {
        let size = (camera.frame_width(), camera.frame_height());
        let mut open = self.try_open_segment(size);
        let mut next_open_attempt = Instant::now() + SEGMENT_OPEN_BACKOFF;

        while !self.stop.is_stopped() {
            let frame = match camera.read_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("could not read frame: {:#}", err);
                    std::thread::sleep(READ_FAILURE_BACKOFF);
                    continue;
                }
            };

            if self.window.is_active() {
                self.frames.push(frame.sample(self.config.roi.as_ref()));
                self.stats.frames_sampled.fetch_add(1, Ordering::Relaxed);
            }

            if open.is_none() && Instant::now() >= next_open_attempt {
                open = self.try_open_segment(size);
                next_open_attempt = Instant::now() + SEGMENT_OPEN_BACKOFF;
            }
            let Some(current) = open.as_mut() else {
                continue;
            };

            match current.writer.write_frame(&frame) {
                Ok(()) => {
                    current.frames += 1;
                    self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => log::warn!("could not write frame {}: {:#}", frame.ordinal, err),
            }

            if current.started.elapsed() < self.config.segment_length {
                continue;
            }
            let Some(closing) = open.take() else {
                continue;
            };
            let path = closing.path.clone();
            match closing.finish(self.config.segment_length) {
                Ok(segment) => {
                    self.stats.segments_closed.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "stopped recording: {} ({} frames, {:.2} fps)",
                        segment.path.display(),
                        segment.true_frame_count,
                        segment.declared_fps
                    );
                    if let Err(segment) = self.raw_segments.push_blocking(segment, &self.stop) {
                        log::debug!(
                            "stopping with unqueued segment, removing {}",
                            segment.path.display()
                        );
                        remove_quietly(&segment.path);
                        return;
                    }
                }
                Err(err) => {
                    log::error!("dropping segment {}: {:#}", path.display(), err);
                    remove_quietly(&path);
                }
            }
            open = self.try_open_segment(size);
            next_open_attempt = Instant::now() + SEGMENT_OPEN_BACKOFF;
        }

        if let Some(unfinished) = open {
            unfinished.abandon();
        }
    }

    fn try_open_segment(&self, size: (u32, u32)) -> Option<OpenSegment> {
        match self.open_segment(size) {
            Ok(segment) => Some(segment),
            Err(err) => {
                log::error!(
                    "could not start a new segment, retrying in {:?}: {:#}",
                    SEGMENT_OPEN_BACKOFF,
                    err
                );
                None
            }
        }
    }

    fn open_segment(&self, (width, height): (u32, u32)) -> Result<OpenSegment> {
        let path = segment_path(&self.config.output_dir);
        let writer = match self.encoder.open_writer(
            &path,
            self.config.fourcc,
            self.config.fps,
            width,
            height,
        ) {
            Ok(writer) => writer,
            Err(err) => {
                remove_quietly(&path);
                return Err(err.context(format!("open segment writer {}", path.display())));
            }
        };
        log::debug!("started new file: {}", path.display());
        Ok(OpenSegment {
            path,
            writer,
            frames: 0,
            started: Instant::now(),
        })
    }
}

struct OpenSegment {
    path: PathBuf,
    writer: Box<dyn SegmentWriter>,
    frames: u64,
    started: Instant,
}

impl OpenSegment {
    fn finish(self, declared: Duration) -> Result<VideoSegment> {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.writer
            .close()
            .with_context(|| format!("close segment {}", self.path.display()))?;
        let declared_fps = if elapsed > 0.0 {
            self.frames as f64 / elapsed
        } else {
            0.0
        };
        Ok(VideoSegment {
            path: self.path,
            declared_fps,
            declared_duration_secs: declared.as_secs_f64(),
            true_frame_count: self.frames,
        })
    }

    /// Close and delete an unfinished segment.
    fn abandon(self) {
        if let Err(err) = self.writer.close() {
            log::debug!("closing unfinished segment {}: {:#}", self.path.display(), err);
        }
        log::debug!("removing unfinished video: {}", self.path.display());
        remove_quietly(&self.path);
    }
}

/// `recording_<YYYYmmddHHMMSS>.mp4`, suffixed when a file with that name exists.
fn segment_path(dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
    let mut path = dir.join(format!("recording_{}.mp4", stamp));
    let mut suffix = 1;
    while path.exists() {
        path = dir.join(format!("recording_{}_{}.mp4", stamp, suffix));
        suffix += 1;
    }
    path
}

fn remove_quietly(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("could not remove {}: {}", path.display(), err);
        }
    }
}

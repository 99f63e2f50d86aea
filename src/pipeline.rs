//! Pipeline wiring and supervision.
//!
//! `Pipeline::start` builds the queues and signals, moves every stage onto
//! its own named thread, and returns a `PipelineHandle` that owns the
//! validation gateway and the stage threads.
//!
//! ```text
//! capture --raw (block)--> finisher --finished (evict+delete)--> publisher
//!    |
//!    +--frame slot (latest wins)--> recognition --candidates (evict)--> gateway
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::capture::{CameraOpener, CaptureConfig, CaptureStage, CaptureStats};
use crate::detect::PlateDetector;
use crate::finisher::SegmentFinisher;
use crate::frame::Frame;
use crate::gateway::{ValidationGateway, DEFAULT_POLL_INTERVAL};
use crate::ocr::TextRecognizer;
use crate::plate::PlateGrammar;
use crate::publish::{finished_segment_queue, PublishStage, UploadSink};
use crate::queue::{frame_slot, BlockingQueue, EvictingQueue};
use crate::recognition::RecognitionStage;
use crate::registry::PlateRegistry;
use crate::signal::{RecognitionWindow, StopSignal};
use crate::video::{Transcoder, VideoEncoder, VideoSegment};

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Capacities of the hand-off queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub raw_segments: usize,
    pub finished_segments: usize,
    pub candidates: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            raw_segments: 10,
            finished_segments: 10,
            candidates: 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub capture: CaptureConfig,
    pub queues: QueueSettings,
    pub grammar: PlateGrammar,
    /// Keep local segment files after upload.
    pub retain_videos: bool,
    pub gateway_poll: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            queues: QueueSettings::default(),
            grammar: PlateGrammar::default(),
            retain_videos: false,
            gateway_poll: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// External capabilities the stages are built on.
pub struct Collaborators {
    pub camera: CameraOpener,
    pub encoder: Arc<dyn VideoEncoder>,
    pub transcoder: Arc<dyn Transcoder>,
    pub detector: Box<dyn PlateDetector>,
    pub recognizer: Box<dyn TextRecognizer>,
    pub upload: Box<dyn UploadSink>,
    pub registry: Option<Arc<dyn PlateRegistry>>,
}

pub struct Pipeline;

impl Pipeline {
    pub fn start(
        settings: PipelineSettings,
        collaborators: Collaborators,
    ) -> Result<PipelineHandle> {
        std::fs::create_dir_all(&settings.capture.output_dir).with_context(|| {
            format!(
                "create output directory {}",
                settings.capture.output_dir.display()
            )
        })?;

        let stop = StopSignal::new();
        let window = RecognitionWindow::new();
        let frames = frame_slot::<Frame>();
        let raw_segments = BlockingQueue::<VideoSegment>::new(settings.queues.raw_segments);
        let finished: EvictingQueue<PathBuf> =
            finished_segment_queue(settings.queues.finished_segments);
        let candidates = EvictingQueue::<String>::new(settings.queues.candidates);

        let gateway = Arc::new(
            ValidationGateway::new(window.clone(), candidates.clone(), collaborators.registry)
                .with_poll_interval(settings.gateway_poll),
        );

        let capture = CaptureStage::new(
            collaborators.camera,
            collaborators.encoder,
            settings.capture,
            window.clone(),
            frames.clone(),
            raw_segments.clone(),
            stop.clone(),
        );
        let capture_stats = capture.stats();
        let finisher = SegmentFinisher::new(
            collaborators.transcoder,
            raw_segments,
            finished.clone(),
            stop.clone(),
        );
        let recognition = RecognitionStage::new(
            collaborators.detector,
            collaborators.recognizer,
            settings.grammar,
            window.clone(),
            frames,
            candidates,
            stop.clone(),
        );
        let publisher = PublishStage::new(
            collaborators.upload,
            finished,
            settings.retain_videos,
            stop.clone(),
        );

        let mut handle = PipelineHandle {
            stop,
            window,
            gateway,
            capture_stats,
            stages: Vec::new(),
        };
        let spawned = handle
            .spawn_stage("capture", move || capture.run())
            .and_then(|h| h.spawn_stage("segment-finisher", move || finisher.run()))
            .and_then(|h| h.spawn_stage("plate-recognition", move || recognition.run()))
            .and_then(|h| h.spawn_stage("video-publisher", move || publisher.run()))
            .map(|_| ());
        if let Err(err) = spawned {
            handle.stop.stop();
            return Err(err);
        }
        log::info!("pipeline started with {} stages", handle.stages.len());
        Ok(handle)
    }
}

struct StageThread {
    name: &'static str,
    handle: JoinHandle<Result<()>>,
}

/// Outcome of `PipelineHandle::shutdown`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Stages still running when their join timeout expired.
    pub stuck: Vec<String>,
    /// Stages that exited with an error or panicked.
    pub failed: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.stuck.is_empty() && self.failed.is_empty()
    }
}

pub struct PipelineHandle {
    stop: StopSignal,
    window: RecognitionWindow,
    gateway: Arc<ValidationGateway>,
    capture_stats: Arc<CaptureStats>,
    stages: Vec<StageThread>,
}

impl PipelineHandle {
    fn spawn_stage(
        &mut self,
        name: &'static str,
        run: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<&mut Self> {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = run();
                if let Err(err) = &result {
                    log::error!("{} stage failed: {:#}", name, err);
                }
                result
            })
            .with_context(|| format!("spawn {} thread", name))?;
        self.stages.push(StageThread { name, handle });
        Ok(self)
    }

    pub fn gateway(&self) -> Arc<ValidationGateway> {
        self.gateway.clone()
    }

    pub fn window(&self) -> RecognitionWindow {
        self.window.clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn capture_stats(&self) -> Arc<CaptureStats> {
        self.capture_stats.clone()
    }

    /// Names of stages whose threads have exited.
    pub fn exited_stages(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .filter(|stage| stage.handle.is_finished())
            .map(|stage| stage.name)
            .collect()
    }

    /// Assert the stop signal and join every stage, waiting at most
    /// `join_timeout` for each. Stuck threads are detached and reported.
    pub fn shutdown(self, join_timeout: Duration) -> ShutdownReport {
        log::info!("stopping pipeline");
        self.stop.stop();
        let mut report = ShutdownReport::default();
        for stage in self.stages {
            let deadline = Instant::now() + join_timeout;
            while !stage.handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(JOIN_POLL);
            }
            if !stage.handle.is_finished() {
                log::error!(
                    "{} stage did not stop within {:?}",
                    stage.name,
                    join_timeout
                );
                report.stuck.push(stage.name.to_string());
                continue;
            }
            match stage.handle.join() {
                Ok(Ok(())) => log::debug!("{} stage joined", stage.name),
                Ok(Err(_)) => report.failed.push(stage.name.to_string()),
                Err(_) => {
                    log::error!("{} stage panicked", stage.name);
                    report.failed.push(stage.name.to_string());
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::camera_opener;
    use crate::detect::WholeFrameDetector;
    use crate::frame::Roi;
    use crate::ocr::ScriptedRecognizer;
    use crate::publish::MemoryUploadSink;
    use crate::video::memory::{FixedDurationTranscoder, PlaceholderEncoder};
    use crate::video::FourCc;

    fn collaborators(camera: CameraOpener) -> Collaborators {
        Collaborators {
            camera,
            encoder: Arc::new(PlaceholderEncoder::new()),
            transcoder: Arc::new(FixedDurationTranscoder::new(1.0)),
            detector: Box::new(WholeFrameDetector::new()),
            recognizer: Box::new(ScriptedRecognizer::new()),
            upload: Box::new(MemoryUploadSink::new()),
            registry: None,
        }
    }

    fn settings(dir: &std::path::Path) -> PipelineSettings {
        PipelineSettings {
            capture: CaptureConfig {
                fps: 100.0,
                segment_length: Duration::from_secs(60),
                output_dir: dir.join("videos"),
                roi: Some(Roi::new(0, 0, 8, 8)),
                fourcc: FourCc::MP4V,
            },
            ..PipelineSettings::default()
        }
    }

    #[test]
    fn starts_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Pipeline::start(
            settings(dir.path()),
            collaborators(camera_opener("stub://test", 16, 16, 100.0)),
        )
        .unwrap();
        assert!(dir.path().join("videos").is_dir());
        std::thread::sleep(Duration::from_millis(100));
        assert!(handle.exited_stages().is_empty());

        let report = handle.shutdown(DEFAULT_JOIN_TIMEOUT);
        assert!(report.is_clean(), "{report:?}");
    }

    #[test]
    fn camera_failure_stops_only_capture() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Pipeline::start(
            settings(dir.path()),
            collaborators(Box::new(|| Err(anyhow::anyhow!("no camera")))),
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.exited_stages().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.exited_stages(), vec!["capture"]);

        let report = handle.shutdown(DEFAULT_JOIN_TIMEOUT);
        assert_eq!(report.failed, vec!["capture".to_string()]);
        assert!(report.stuck.is_empty());
    }

    #[test]
    fn stuck_stage_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        // The camera open blocks until released, ignoring the stop signal.
        let camera: CameraOpener = Box::new(move || {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            Err(anyhow::anyhow!("released"))
        });
        let handle = Pipeline::start(settings(dir.path()), collaborators(camera)).unwrap();
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("camera open started");

        let report = handle.shutdown(Duration::from_millis(100));
        assert_eq!(report.stuck, vec!["capture".to_string()]);
        release_tx.send(()).unwrap();
    }
}

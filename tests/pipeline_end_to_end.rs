use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gatecam::capture::{camera_opener, CaptureConfig};
use gatecam::detect::WholeFrameDetector;
use gatecam::ocr::ScriptedRecognizer;
use gatecam::publish::MemoryUploadSink;
use gatecam::video::memory::{FixedDurationTranscoder, PlaceholderEncoder};
use gatecam::video::FourCc;
use gatecam::{
    Collaborators, Pipeline, PipelineSettings, Roi, ValidationRequest, ValidationVerdict,
};

fn settings(dir: &Path) -> PipelineSettings {
    PipelineSettings {
        capture: CaptureConfig {
            fps: 50.0,
            segment_length: Duration::from_millis(300),
            output_dir: dir.to_path_buf(),
            roi: Some(Roi::new(4, 4, 16, 8)),
            fourcc: FourCc::MP4V,
        },
        gateway_poll: Duration::from_millis(5),
        ..PipelineSettings::default()
    }
}

fn local_segments(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".mp4"))
        .count()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn records_uploads_and_validates() {
    let dir = tempfile::tempdir().unwrap();
    let encoder = PlaceholderEncoder::new();
    let transcoder = FixedDurationTranscoder::new(0.3);
    let recognizer = ScriptedRecognizer::new();
    let uploads = MemoryUploadSink::new();

    let handle = Pipeline::start(
        settings(dir.path()),
        Collaborators {
            camera: camera_opener("stub://gate", 32, 24, 50.0),
            encoder: Arc::new(encoder.clone()),
            transcoder: Arc::new(transcoder.clone()),
            detector: Box::new(WholeFrameDetector::new()),
            recognizer: Box::new(recognizer.clone()),
            upload: Box::new(uploads.clone()),
            registry: None,
        },
    )
    .unwrap();

    // Segments are closed, re-timed, uploaded and removed.
    assert!(wait_until(Duration::from_secs(5), || uploads.uploads().len() >= 2));
    let published = uploads.uploads();
    for upload in &published {
        assert!(upload.file_name.starts_with("recording_"), "{upload:?}");
        assert!(upload.file_name.ends_with(".mp4"), "{upload:?}");
        assert_eq!(upload.content_type, "video/mp4");
        assert!(upload.size > 0);
    }
    // Uploaded segments are removed, so only in-flight files stay on disk.
    assert!(wait_until(Duration::from_secs(2), || {
        local_segments(dir.path()) <= 4
    }));
    assert!(!transcoder.calls().is_empty());
    assert!(encoder.closed_segments().iter().all(|segment| segment.frames > 0));

    // Nothing is recognised while no request is in flight.
    assert_eq!(recognizer.calls(), 0);

    let gateway = handle.gateway();
    for _ in 0..3 {
        recognizer.push_texts(&["garbage", "12a-34567"]);
    }
    let verdict = gateway.validate(&ValidationRequest::plate(
        "12A34567",
        "entrance",
        Duration::from_secs(3),
    ));
    assert_eq!(verdict, ValidationVerdict::VALID);
    assert!(recognizer.calls() > 0);

    let verdict = gateway.validate(&ValidationRequest::plate(
        "99B99999",
        "entrance",
        Duration::from_millis(200),
    ));
    assert_eq!(verdict, ValidationVerdict::INVALID);

    let window = handle.window();
    assert!(!window.is_active());
    assert_eq!(window.activations(), 2);
    assert_eq!(window.deactivations(), 2);

    let stats = handle.capture_stats();
    assert!(stats.frames_sampled.load(std::sync::atomic::Ordering::Relaxed) > 0);

    let report = handle.shutdown(Duration::from_secs(5));
    assert!(report.is_clean(), "{report:?}");
}

#[test]
fn failed_retime_is_not_uploaded() {
    let dir = tempfile::tempdir().unwrap();
    let transcoder = FixedDurationTranscoder::new(0.3).failing();
    let uploads = MemoryUploadSink::new();

    let handle = Pipeline::start(
        settings(dir.path()),
        Collaborators {
            camera: camera_opener("stub://gate", 32, 24, 50.0),
            encoder: Arc::new(PlaceholderEncoder::new()),
            transcoder: Arc::new(transcoder.clone()),
            detector: Box::new(WholeFrameDetector::new()),
            recognizer: Box::new(ScriptedRecognizer::new()),
            upload: Box::new(uploads.clone()),
            registry: None,
        },
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || transcoder.calls().len() >= 2));
    assert!(uploads.uploads().is_empty());

    let report = handle.shutdown(Duration::from_secs(5));
    assert!(report.is_clean(), "{report:?}");
}

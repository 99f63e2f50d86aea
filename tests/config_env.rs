use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use gatecam::config::GatecamConfig;
use gatecam::Roi;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "GATECAM_CONFIG",
        "VIDEO_PUBLISH_URL",
        "API_ROUTE",
        "VERSION",
        "TITLE",
        "DESCRIPTION",
        "DEBUG",
        "FETCH_CARD_VEHICLE_URL",
        "GATECAM_API_ADDR",
        "GATECAM_CAMERA",
        "GATECAM_OUTPUT_DIR",
        "GATECAM_SEGMENT_SECS",
        "GATECAM_RETAIN_VIDEOS",
    ] {
        std::env::remove_var(key);
    }
}

fn set_required_env() {
    std::env::set_var("VIDEO_PUBLISH_URL", "http://uploads.local/videos");
    std::env::set_var("API_ROUTE", "api/v1/");
    std::env::set_var("VERSION", "1.4.2");
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "api": { "addr": "127.0.0.1:9000" },
        "capture": {
            "device": "stub://gate",
            "fps": 15,
            "width": 800,
            "height": 600,
            "segment_secs": 30,
            "output_dir": "/var/lib/gatecam",
            "roi": { "x": 10, "y": 20, "width": 200, "height": 100 }
        },
        "queues": { "raw_segments": 4, "candidates": 50 },
        "publish": { "retain": true },
        "recognition": { "ocr_command": "/opt/tesseract/bin/tesseract", "grammar": "LLDDDD" }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("GATECAM_CONFIG", file.path());
    set_required_env();
    std::env::set_var("TITLE", "Gate 3");
    std::env::set_var("GATECAM_SEGMENT_SECS", "45");
    std::env::set_var("FETCH_CARD_VEHICLE_URL", "https://cards.local/records");

    let cfg = GatecamConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "127.0.0.1:9000");
    assert_eq!(cfg.api_route, "/api/v1");
    assert_eq!(cfg.title, "Gate 3");
    assert_eq!(cfg.version, "1.4.2");
    assert_eq!(cfg.camera.device, "stub://gate");
    assert_eq!(cfg.camera.fps, 15.0);
    assert_eq!((cfg.camera.width, cfg.camera.height), (800, 600));
    assert_eq!(cfg.segment_length, Duration::from_secs(45));
    assert_eq!(cfg.output_dir, PathBuf::from("/var/lib/gatecam"));
    assert_eq!(cfg.roi, Some(Roi::new(10, 20, 200, 100)));
    assert_eq!(cfg.queues.raw_segments, 4);
    assert_eq!(cfg.queues.finished_segments, 10);
    assert_eq!(cfg.queues.candidates, 50);
    assert!(cfg.retain_videos);
    assert_eq!(cfg.ocr_command, "/opt/tesseract/bin/tesseract");
    assert_eq!(cfg.grammar.to_string(), "LLDDDD");
    assert_eq!(
        cfg.card_registry_url.as_deref(),
        Some("https://cards.local/records")
    );

    let api = cfg.api_config();
    assert_eq!(api.route_prefix, "/api/v1");
    assert_eq!(api.title, "Gate 3");
    let settings = cfg.pipeline_settings();
    assert_eq!(settings.capture.fps, 15.0);
    assert_eq!(settings.capture.segment_length, Duration::from_secs(45));
    assert!(settings.retain_videos);

    clear_env();
}

#[test]
fn defaults_apply_without_a_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    set_required_env();

    let cfg = GatecamConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "0.0.0.0:8000");
    assert_eq!(cfg.title, "API");
    assert_eq!(cfg.description, "API description");
    assert!(!cfg.debug);
    assert_eq!(cfg.camera.device, "/dev/video0");
    assert_eq!(cfg.segment_length, Duration::from_secs(60));
    assert_eq!(cfg.roi, Some(Roi::new(320, 300, 250, 170)));
    assert_eq!(cfg.grammar.to_string(), "DDLDDDDD");
    assert!(cfg.card_registry_url.is_none());
    assert!(!cfg.retain_videos);

    std::env::set_var("DEBUG", "1");
    let cfg = GatecamConfig::load().expect("load config");
    assert!(cfg.debug);

    clear_env();
}

#[test]
fn missing_required_settings_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = GatecamConfig::load().unwrap_err();
    assert!(err.to_string().contains("VIDEO_PUBLISH_URL"), "{err}");

    set_required_env();
    std::env::remove_var("VERSION");
    let err = GatecamConfig::load().unwrap_err();
    assert!(err.to_string().contains("VERSION"), "{err}");

    clear_env();
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    set_required_env();

    std::env::set_var("VIDEO_PUBLISH_URL", "ftp://uploads.local");
    assert!(GatecamConfig::load().is_err());
    std::env::set_var("VIDEO_PUBLISH_URL", "http://uploads.local/videos");

    std::env::set_var("GATECAM_SEGMENT_SECS", "0");
    assert!(GatecamConfig::load().is_err());
    std::env::set_var("GATECAM_SEGMENT_SECS", "ten");
    assert!(GatecamConfig::load().is_err());
    std::env::remove_var("GATECAM_SEGMENT_SECS");

    std::env::set_var("GATECAM_RETAIN_VIDEOS", "maybe");
    assert!(GatecamConfig::load().is_err());
    std::env::remove_var("GATECAM_RETAIN_VIDEOS");

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "queues": { "candidates": 0 } }"#)
        .expect("write config");
    assert!(GatecamConfig::load_from(Some(file.path())).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "recognition": { "grammar": "DDX" } }"#)
        .expect("write config");
    assert!(GatecamConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

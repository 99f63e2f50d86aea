use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::capture::CaptureConfig;
use crate::frame::Roi;
use crate::pipeline::{PipelineSettings, QueueSettings};
use crate::plate::PlateGrammar;
use crate::video::FourCc;

const DEFAULT_API_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_CAMERA: &str = "/dev/video0";
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_SEGMENT_SECS: u64 = 60;
const DEFAULT_OUTPUT_DIR: &str = ".";
const DEFAULT_OCR_COMMAND: &str = "tesseract";
const DEFAULT_TITLE: &str = "API";
const DEFAULT_DESCRIPTION: &str = "API description";
const DEFAULT_ROI: Roi = Roi {
    x: 320,
    y: 300,
    width: 250,
    height: 170,
};

#[derive(Debug, Deserialize, Default)]
struct GatecamConfigFile {
    api: Option<ApiConfigFile>,
    capture: Option<CaptureConfigFile>,
    queues: Option<QueueConfigFile>,
    publish: Option<PublishConfigFile>,
    recognition: Option<RecognitionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    fps: Option<f64>,
    width: Option<u32>,
    height: Option<u32>,
    segment_secs: Option<u64>,
    output_dir: Option<PathBuf>,
    roi: Option<Roi>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    raw_segments: Option<usize>,
    finished_segments: Option<usize>,
    candidates: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PublishConfigFile {
    retain: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    model_path: Option<PathBuf>,
    ocr_command: Option<String>,
    grammar: Option<String>,
}

/// Daemon configuration: optional JSON file, then environment.
#[derive(Debug, Clone)]
pub struct GatecamConfig {
    pub api_addr: String,
    /// Normalised: leading `/`, no trailing `/`.
    pub api_route: String,
    pub title: String,
    pub description: String,
    pub version: String,
    pub debug: bool,
    pub video_publish_url: String,
    /// Enables the card-validation endpoint.
    pub card_registry_url: Option<String>,
    pub camera: CameraSettings,
    pub output_dir: PathBuf,
    pub segment_length: Duration,
    pub roi: Option<Roi>,
    pub queues: QueueSettings,
    pub retain_videos: bool,
    pub model_path: Option<PathBuf>,
    pub ocr_command: String,
    pub grammar: PlateGrammar,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    /// `stub://...` or a V4L2 device path.
    pub device: String,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl GatecamConfig {
    /// Load from the file named by `GATECAM_CONFIG`, if set, and the environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GATECAM_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => GatecamConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GatecamConfigFile) -> Result<Self> {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let capture = file.capture.unwrap_or_default();
        let queues = file.queues.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        let defaults = QueueSettings::default();
        let grammar = match recognition.grammar {
            Some(grammar) => grammar.parse()?,
            None => PlateGrammar::default(),
        };
        Ok(Self {
            api_addr,
            api_route: String::new(),
            title: DEFAULT_TITLE.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            version: String::new(),
            debug: false,
            video_publish_url: String::new(),
            card_registry_url: None,
            camera: CameraSettings {
                device: capture.device.unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
                fps: capture.fps.unwrap_or(DEFAULT_FPS),
                width: capture.width.unwrap_or(DEFAULT_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_HEIGHT),
            },
            output_dir: capture
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            segment_length: Duration::from_secs(
                capture.segment_secs.unwrap_or(DEFAULT_SEGMENT_SECS),
            ),
            roi: Some(capture.roi.unwrap_or(DEFAULT_ROI)),
            queues: QueueSettings {
                raw_segments: queues.raw_segments.unwrap_or(defaults.raw_segments),
                finished_segments: queues
                    .finished_segments
                    .unwrap_or(defaults.finished_segments),
                candidates: queues.candidates.unwrap_or(defaults.candidates),
            },
            retain_videos: file.publish.and_then(|p| p.retain).unwrap_or(false),
            model_path: recognition.model_path,
            ocr_command: recognition
                .ocr_command
                .unwrap_or_else(|| DEFAULT_OCR_COMMAND.to_string()),
            grammar,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        self.video_publish_url = required_env("VIDEO_PUBLISH_URL")?;
        self.api_route = required_env("API_ROUTE")?;
        self.version = required_env("VERSION")?;

        if let Some(title) = optional_env("TITLE") {
            self.title = title;
        }
        if let Some(description) = optional_env("DESCRIPTION") {
            self.description = description;
        }
        self.debug = optional_env("DEBUG").is_some();
        if let Some(url) = optional_env("FETCH_CARD_VEHICLE_URL") {
            self.card_registry_url = Some(url);
        }
        if let Some(addr) = optional_env("GATECAM_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(device) = optional_env("GATECAM_CAMERA") {
            self.camera.device = device;
        }
        if let Some(dir) = optional_env("GATECAM_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(secs) = optional_env("GATECAM_SEGMENT_SECS") {
            let seconds: u64 = secs.parse().map_err(|_| {
                anyhow!("GATECAM_SEGMENT_SECS must be an integer number of seconds")
            })?;
            self.segment_length = Duration::from_secs(seconds);
        }
        if let Some(retain) = optional_env("GATECAM_RETAIN_VIDEOS") {
            self.retain_videos = parse_flag("GATECAM_RETAIN_VIDEOS", &retain)?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        validate_http_url("VIDEO_PUBLISH_URL", &self.video_publish_url)?;
        if let Some(url) = &self.card_registry_url {
            validate_http_url("FETCH_CARD_VEHICLE_URL", url)?;
        }
        self.api_route = normalize_route(&self.api_route);

        if self.segment_length.is_zero() {
            return Err(anyhow!("segment length must be greater than zero"));
        }
        if !(self.camera.fps.is_finite() && self.camera.fps > 0.0) {
            return Err(anyhow!("capture fps must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        for (name, capacity) in [
            ("queues.raw_segments", self.queues.raw_segments),
            ("queues.finished_segments", self.queues.finished_segments),
            ("queues.candidates", self.queues.candidates),
        ] {
            if capacity == 0 {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        Ok(())
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.api_addr.clone(),
            route_prefix: self.api_route.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            capture: CaptureConfig {
                fps: self.camera.fps,
                segment_length: self.segment_length,
                output_dir: self.output_dir.clone(),
                roi: self.roi,
                fourcc: FourCc::MP4V,
            },
            queues: self.queues,
            grammar: self.grammar.clone(),
            retain_videos: self.retain_videos,
            ..PipelineSettings::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<GatecamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required_env(name: &str) -> Result<String> {
    optional_env(name).ok_or_else(|| anyhow!("{} must be set", name))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be true or false, got '{}'", name, value)),
    }
}

fn validate_http_url(name: &str, value: &str) -> Result<()> {
    let url = url::Url::parse(value).with_context(|| format!("{} is not a valid URL", name))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(anyhow!("{} must be http or https, got '{}'", name, scheme)),
    }
}

fn normalize_route(route: &str) -> String {
    let trimmed = route.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

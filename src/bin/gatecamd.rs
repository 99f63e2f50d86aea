//! gatecamd - gate camera daemon
//!
//! This daemon:
//! 1. Records fixed-length video segments from the gate camera
//! 2. Re-times and uploads finished segments
//! 3. Serves the plate validation API, running recognition on demand

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use gatecam::api::ApiServer;
use gatecam::capture::camera_opener;
use gatecam::config::GatecamConfig;
use gatecam::detect::{PlateDetector, WholeFrameDetector};
use gatecam::ocr::TesseractRecognizer;
use gatecam::pipeline::DEFAULT_JOIN_TIMEOUT;
use gatecam::publish::HttpUploadSink;
use gatecam::registry::{HttpPlateRegistry, PlateRegistry};
use gatecam::video::{FfmpegEncoder, FfmpegTranscoder};
use gatecam::{Collaborators, Pipeline};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);
/// Square input of the plate detection model.
const MODEL_INPUT_SIZE: u32 = 640;

#[derive(Parser, Debug)]
#[command(author, version, about = "Gate camera recording and plate validation daemon")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "GATECAM_CONFIG")]
    config: Option<PathBuf>,

    /// API listen address, overriding the configuration.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = GatecamConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let default_filter = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let collaborators = build_collaborators(&config)?;
    let pipeline = Pipeline::start(config.pipeline_settings(), collaborators)?;

    let api_handle = match ApiServer::new(config.api_config(), pipeline.gateway()).spawn() {
        Ok(handle) => handle,
        Err(err) => {
            pipeline.shutdown(DEFAULT_JOIN_TIMEOUT);
            return Err(err);
        }
    };
    log::info!(
        "{} {} running: {} (routes under '{}', api on {})",
        config.title,
        config.version,
        config.description,
        config.api_route,
        api_handle.addr
    );
    if config.card_registry_url.is_some() {
        log::info!("card validation enabled");
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    log::info!("gatecamd waiting for shutdown signal (Ctrl-C)...");
    let stats = pipeline.capture_stats();
    while let Err(mpsc::RecvTimeoutError::Timeout) = rx.recv_timeout(HEALTH_LOG_INTERVAL) {
        log::info!(
            "health: {} frames recorded, {} segments closed, {} read failures",
            stats.frames_written.load(Ordering::Relaxed),
            stats.segments_closed.load(Ordering::Relaxed),
            stats.read_failures.load(Ordering::Relaxed)
        );
        let exited = pipeline.exited_stages();
        if !exited.is_empty() {
            log::warn!("stages no longer running: {}", exited.join(", "));
        }
    }

    log::info!("shutdown signal received, stopping...");
    if let Err(err) = api_handle.stop() {
        log::error!("api server did not stop cleanly: {:#}", err);
    }
    let report = pipeline.shutdown(DEFAULT_JOIN_TIMEOUT);
    if !report.stuck.is_empty() {
        log::error!(
            "forcing exit, stages still running: {}",
            report.stuck.join(", ")
        );
        std::process::exit(1);
    }
    if !report.failed.is_empty() {
        return Err(anyhow!("stages failed: {}", report.failed.join(", ")));
    }
    log::info!("gatecamd stopped");
    Ok(())
}

fn build_collaborators(config: &GatecamConfig) -> Result<Collaborators> {
    let registry = config
        .card_registry_url
        .as_ref()
        .map(|url| Arc::new(HttpPlateRegistry::new(url.clone())) as Arc<dyn PlateRegistry>);
    Ok(Collaborators {
        camera: camera_opener(
            &config.camera.device,
            config.camera.width,
            config.camera.height,
            config.camera.fps,
        ),
        encoder: Arc::new(FfmpegEncoder::new()),
        transcoder: Arc::new(FfmpegTranscoder::new()),
        detector: build_detector(config)?,
        recognizer: Box::new(TesseractRecognizer::new().with_command(config.ocr_command.clone())),
        upload: Box::new(HttpUploadSink::new(config.video_publish_url.clone())),
        registry,
    })
}

fn build_detector(config: &GatecamConfig) -> Result<Box<dyn PlateDetector>> {
    let Some(model_path) = &config.model_path else {
        log::info!("no plate model configured, reading the whole region of interest");
        return Ok(Box::new(WholeFrameDetector::new()));
    };
    #[cfg(feature = "backend-tract")]
    {
        let detector = gatecam::detect::YoloPlateDetector::new(
            model_path,
            MODEL_INPUT_SIZE,
            MODEL_INPUT_SIZE,
        )?;
        Ok(Box::new(detector))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        let _ = MODEL_INPUT_SIZE;
        Err(anyhow!(
            "plate model {} requires the backend-tract feature",
            model_path.display()
        ))
    }
}

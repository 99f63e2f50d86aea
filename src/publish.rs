//! Publish stage.
//!
//! Uploads finished segments to the remote video store and removes the
//! local copies. Delivery is best effort: a failed upload is logged and the
//! segment is still dropped, unless local copies are retained.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::queue::EvictingQueue;
use crate::signal::StopSignal;

pub const VIDEO_CONTENT_TYPE: &str = "video/mp4";
const VIDEO_FIELD: &str = "video";
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted,
    Rejected { status: u16, body: String },
}

/// Remote video store.
pub trait UploadSink: Send {
    /// A transport failure is an error; a non-200 response is `Rejected`.
    fn upload(&mut self, file_name: &str, bytes: &[u8], content_type: &str)
        -> Result<UploadOutcome>;
}

/// Multipart/form-data POST of one `video` part.
pub struct HttpUploadSink {
    url: String,
    agent: ureq::Agent,
}

impl HttpUploadSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new().timeout(UPLOAD_TIMEOUT).build(),
        }
    }
}

impl UploadSink for HttpUploadSink {
    fn upload(
        &mut self,
        file_name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<UploadOutcome> {
        let boundary = multipart_boundary();
        let body = multipart_body(&boundary, VIDEO_FIELD, file_name, content_type, bytes);
        let result = self
            .agent
            .post(&self.url)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send_bytes(&body);
        match result {
            Ok(response) if response.status() == 200 => Ok(UploadOutcome::Accepted),
            Ok(response) => {
                let status = response.status();
                Ok(UploadOutcome::Rejected {
                    status,
                    body: response.into_string().unwrap_or_default(),
                })
            }
            Err(ureq::Error::Status(status, response)) => Ok(UploadOutcome::Rejected {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(err) => Err(anyhow::Error::new(err).context(format!("POST {}", self.url))),
        }
    }
}

fn multipart_boundary() -> String {
    let token: u64 = rand::thread_rng().gen();
    format!("gatecam-{:016x}", token)
}

fn multipart_body(
    boundary: &str,
    field: &str,
    file_name: &str,
    content_type: &str,
    bytes: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field,
            file_name.replace('"', "")
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

/// Upload recorded by `MemoryUploadSink`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedUpload {
    pub file_name: String,
    pub content_type: String,
    pub size: usize,
}

/// In-memory sink that records uploads. Clones share the record.
#[derive(Clone, Default)]
pub struct MemoryUploadSink {
    uploads: Arc<Mutex<Vec<RecordedUpload>>>,
    reject_with: Option<u16>,
}

impl MemoryUploadSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every upload with `status` instead of accepting it.
    pub fn rejecting(mut self, status: u16) -> Self {
        self.reject_with = Some(status);
        self
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl UploadSink for MemoryUploadSink {
    fn upload(
        &mut self,
        file_name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<UploadOutcome> {
        self.uploads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedUpload {
                file_name: file_name.to_string(),
                content_type: content_type.to_string(),
                size: bytes.len(),
            });
        Ok(match self.reject_with {
            Some(status) => UploadOutcome::Rejected {
                status,
                body: "rejected".to_string(),
            },
            None => UploadOutcome::Accepted,
        })
    }
}

/// Bounded queue of finished segments. When full, the oldest queued segment
/// is dropped and its file deleted to admit the new one.
pub fn finished_segment_queue(capacity: usize) -> EvictingQueue<PathBuf> {
    EvictingQueue::new(capacity).with_evict_hook(|path: PathBuf| {
        log::warn!("dropping unpublished video: {}", path.display());
        remove_video(&path);
    })
}

pub struct PublishStage {
    sink: Box<dyn UploadSink>,
    input: EvictingQueue<PathBuf>,
    retain: bool,
    stop: StopSignal,
}

impl PublishStage {
    pub fn new(
        sink: Box<dyn UploadSink>,
        input: EvictingQueue<PathBuf>,
        retain: bool,
        stop: StopSignal,
    ) -> Self {
        Self {
            sink,
            input,
            retain,
            stop,
        }
    }

    pub fn run(mut self) -> Result<()> {
        log::info!("video publishing is running");
        while !self.stop.is_stopped() {
            if let Some(path) = self.input.recv_timeout(POLL_INTERVAL) {
                self.publish(&path);
            }
        }
        log::info!("video publishing is stopped");
        Ok(())
    }

    /// Upload one segment, then drop it unless retained. Never fails.
    pub fn publish(&mut self, path: &Path) {
        match self.upload(path) {
            Ok(UploadOutcome::Accepted) => log::info!("video published: {}", path.display()),
            Ok(UploadOutcome::Rejected { status, body }) => {
                log::error!(
                    "failed to publish video {}: HTTP {}: {}",
                    path.display(),
                    status,
                    body.trim()
                );
            }
            Err(err) => log::error!("failed to publish video {}: {:#}", path.display(), err),
        }
        if !self.retain {
            remove_video(path);
            log::info!("dropped video: {}", path.display());
        }
    }

    fn upload(&mut self, path: &Path) -> Result<UploadOutcome> {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
        self.sink.upload(&file_name, &bytes, VIDEO_CONTENT_TYPE)
    }
}

fn remove_video(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("could not remove {}: {}", path.display(), err);
        }
    }
}

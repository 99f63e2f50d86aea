//! Gate camera service (gatecam)
//!
//! This crate implements an unattended vehicle-gate camera: continuous
//! segment recording with upload, and on-demand license-plate validation
//! over HTTP.
//!
//! # Architecture
//!
//! Four long-lived stages run on their own threads and hand work downstream
//! through bounded queues:
//!
//! 1. **Capture**: records fixed-length segments and, while the recognition
//!    window is open, samples the region of interest into a latest-wins slot.
//! 2. **Segment finisher**: re-times each closed segment to the frame rate
//!    that was actually achieved.
//! 3. **Publisher**: uploads finished segments and removes local copies.
//! 4. **Recognition**: detection, OCR and the plate grammar, active only
//!    while the window is open.
//!
//! The validation gateway runs on API request threads. It opens the window,
//! polls plate candidates until a match or its deadline, and always closes
//! the window again.
//!
//! # Module Structure
//!
//! - `signal`, `queue`: shared stop/window state and the hand-off queues
//! - `frame`, `capture`, `video`, `finisher`, `publish`: the recording path
//! - `detect`, `ocr`, `plate`, `recognition`: the recognition path
//! - `gateway`, `registry`, `api`: request handling
//! - `pipeline`, `config`: wiring and daemon configuration

pub mod api;
pub mod capture;
pub mod config;
pub mod detect;
pub mod finisher;
pub mod frame;
pub mod gateway;
pub mod ocr;
pub mod pipeline;
pub mod plate;
pub mod publish;
pub mod queue;
pub mod recognition;
pub mod registry;
pub mod signal;
pub mod video;

pub use frame::{Frame, Roi};
pub use gateway::{
    MatchPolicy, ValidationGateway, ValidationRequest, ValidationStatus, ValidationVerdict,
};
pub use pipeline::{
    Collaborators, Pipeline, PipelineHandle, PipelineSettings, QueueSettings, ShutdownReport,
};
pub use plate::PlateGrammar;
pub use signal::{ActivationGuard, RecognitionWindow, StopSignal};
pub use video::VideoSegment;

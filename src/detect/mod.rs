//! Plate detection.
//!
//! A `PlateDetector` finds plate-shaped regions in a sampled frame. The
//! recognition stage crops each `PlateBox` and hands the crop to OCR.

mod backend;
mod backends;
mod result;

pub use backend::PlateDetector;
pub use backends::{ScriptedDetection, ScriptedDetector, WholeFrameDetector};
#[cfg(feature = "backend-tract")]
pub use backends::YoloPlateDetector;
pub use result::{non_max_suppression, PlateBox};

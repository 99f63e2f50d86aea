pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{ScriptedDetection, ScriptedDetector, WholeFrameDetector};

#[cfg(feature = "backend-tract")]
pub use tract::YoloPlateDetector;

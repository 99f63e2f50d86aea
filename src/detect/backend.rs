use anyhow::Result;

use crate::detect::result::PlateBox;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Implementations run on the recognition thread only, so `detect` takes
/// `&mut self` and may keep scratch buffers between calls.
pub trait PlateDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Plate regions in `frame` pixel coordinates, best first.
    ///
    /// An error is scoped to this frame; the caller logs it and moves on.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<PlateBox>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

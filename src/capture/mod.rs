//! Camera capture.
//!
//! This module provides camera devices and the capture stage:
//! - Synthetic camera (`stub://` device names, testing and demos)
//! - USB/V4L2 devices (feature: capture-v4l2)
//! - `CaptureStage`: continuous segment recording plus frame sampling
//!
//! Devices produce `Frame` instances at their native rate. The capture stage is
//! the only producer for both the raw-segment queue and the sampled-frame slot.

mod stage;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

use anyhow::Result;

use crate::frame::Frame;

pub use stage::{CaptureConfig, CaptureStage, CaptureStats};
pub use synthetic::{SyntheticCamera, SyntheticConfig};
#[cfg(feature = "capture-v4l2")]
pub use v4l2::{V4l2Camera, V4l2Config};

/// An opened capture device.
pub trait CameraDevice: Send {
    /// Device identifier for logs.
    fn name(&self) -> &str;

    fn frame_width(&self) -> u32;

    fn frame_height(&self) -> u32;

    /// Block until the next frame is available. Errors are per-frame and
    /// transient unless the device is gone.
    fn read_frame(&mut self) -> Result<Frame>;
}

/// Deferred device open, run on the capture thread.
pub type CameraOpener = Box<dyn FnOnce() -> Result<Box<dyn CameraDevice>> + Send>;

/// Build an opener for `device`.
///
/// `stub://...` selects the synthetic camera; any other value is a V4L2 device
/// path and requires the capture-v4l2 feature.
pub fn camera_opener(device: &str, width: u32, height: u32, fps: f64) -> CameraOpener {
    let device = device.to_string();
    Box::new(move || open_camera(&device, width, height, fps))
}

pub fn open_camera(
    device: &str,
    width: u32,
    height: u32,
    fps: f64,
) -> Result<Box<dyn CameraDevice>> {
    if device.starts_with("stub://") {
        let camera = SyntheticCamera::new(SyntheticConfig {
            name: device.to_string(),
            width,
            height,
            fps,
            ..SyntheticConfig::default()
        });
        return Ok(Box::new(camera));
    }
    #[cfg(feature = "capture-v4l2")]
    {
        let camera = V4l2Camera::open(V4l2Config {
            device: device.to_string(),
            width,
            height,
            target_fps: fps.round().max(1.0) as u32,
        })?;
        Ok(Box::new(camera))
    }
    #[cfg(not(feature = "capture-v4l2"))]
    {
        anyhow::bail!(
            "camera device '{}' requires the capture-v4l2 feature",
            device
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_device_opens_synthetic_camera() -> Result<()> {
        let mut camera = open_camera("stub://gate", 64, 48, 1000.0)?;
        assert_eq!(camera.name(), "stub://gate");
        assert_eq!((camera.frame_width(), camera.frame_height()), (64, 48));
        let frame = camera.read_frame()?;
        assert_eq!(frame.ordinal, 1);
        Ok(())
    }

    #[cfg(not(feature = "capture-v4l2"))]
    #[test]
    fn device_path_requires_feature() {
        let opener = camera_opener("/dev/video0", 640, 480, 30.0);
        assert!(opener().is_err());
    }
}

//! V4L2 camera.
//!
//! Opens a local device node (e.g. /dev/video0), negotiates RGB24 at the
//! requested size and rate, and streams frames through memory-mapped buffers.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::CameraDevice;
use crate::frame::Frame;

/// Configuration for a V4L2 device.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Requested frame rate.
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

const RGB24_FOURCC: &[u8; 4] = b"RGB3";

/// Frames are read as packed RGB24; any other negotiated pixel format would
/// fail every read.
fn ensure_rgb24(device: &str, fourcc: &[u8; 4]) -> Result<()> {
    if fourcc == RGB24_FOURCC {
        return Ok(());
    }
    Err(anyhow!(
        "v4l2 device {} does not support RGB3 capture (negotiated {})",
        device,
        String::from_utf8_lossy(fourcc)
    ))
}

pub struct V4l2Camera {
    config: V4l2Config,
    state: V4l2State,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Camera {
    /// Open and configure the device. Fails when the node is missing or busy.
    pub fn open(config: V4l2Config) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&config.device)
            .with_context(|| format!("open v4l2 device {}", config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(RGB24_FOURCC);

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Camera: failed to set format on {}: {}",
                    config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        ensure_rgb24(&config.device, &format.fourcc.repr)?;

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Camera: failed to set fps on {}: {}", config.device, err);
            }
        }

        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Camera: opened {} ({}x{})",
            config.device,
            format.width,
            format.height
        );
        Ok(Self {
            active_width: format.width,
            active_height: format.height,
            config,
            state,
            frame_count: 0,
        })
    }
}

impl CameraDevice for V4l2Camera {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn frame_width(&self) -> u32 {
        self.active_width
    }

    fn frame_height(&self) -> u32 {
        self.active_height
    }

    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let pixels = self
            .state
            .with_stream_mut(|stream| stream.next().map(|(buf, _meta)| buf.to_vec()))
            .context("capture v4l2 frame")?;
        self.frame_count += 1;
        Frame::new(pixels, self.active_width, self.active_height, self.frame_count)
    }
}

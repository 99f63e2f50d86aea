//! Synthetic camera for `stub://` devices.
//!
//! Generates a moving pattern paced at the configured frame rate. Optional
//! fault injection makes every Nth read fail, to exercise the capture stage's
//! transient-failure path.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::CameraDevice;
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Pacing rate. Reads sleep so frames are not produced faster than this.
    pub fps: f64,
    /// When set, every Nth read returns an error instead of a frame.
    pub fail_every: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://camera".to_string(),
            width: 640,
            height: 480,
            fps: 30.0,
            fail_every: None,
        }
    }
}

pub struct SyntheticCamera {
    config: SyntheticConfig,
    reads: u64,
    frame_count: u64,
    scene_state: u8,
    next_due: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new(config: SyntheticConfig) -> Self {
        log::info!(
            "SyntheticCamera: opened {} ({}x{} @ {:.1} fps)",
            config.name,
            config.width,
            config.height,
            config.fps
        );
        Self {
            config,
            reads: 0,
            frame_count: 0,
            scene_state: 0,
            next_due: None,
        }
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame_count
    }

    fn frame_interval(&self) -> Duration {
        if self.config.fps.is_finite() && self.config.fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.config.fps)
        } else {
            Duration::ZERO
        }
    }

    fn pace(&mut self) {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.frame_interval());
    }

    /// Moving gradient with a scene change every 50 frames.
    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize;
        if self.frame_count.is_multiple_of(50) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl CameraDevice for SyntheticCamera {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn frame_width(&self) -> u32 {
        self.config.width
    }

    fn frame_height(&self) -> u32 {
        self.config.height
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.pace();
        self.reads += 1;
        if let Some(every) = self.config.fail_every {
            if every > 0 && self.reads.is_multiple_of(every) {
                return Err(anyhow!("synthetic read failure on read {}", self.reads));
            }
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(pixels, self.config.width, self.config.height, self.frame_count)
    }
}

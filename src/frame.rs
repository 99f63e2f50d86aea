//! Captured frames and regions of interest.
//!
//! - `Frame`: owned RGB24 raster with its capture instant and ordinal.
//! - `Roi`: rectangular region of interest in pixel coordinates.
//!
//! Frames are moved between stages, never shared. The recognition stage receives
//! a cropped copy; the recording path keeps the full frame.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::time::Instant;

const RGB_CHANNELS: usize = 3;

/// Owned RGB24 frame.
#[derive(Clone)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Per-device sequence number, starting at 1.
    pub ordinal: u64,
    captured_at: Instant,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, ordinal: u64) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            ordinal,
            captured_at: Instant::now(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Copy out the `roi` region. The capture instant and ordinal are preserved.
    pub fn crop(&self, roi: &Roi) -> Result<Frame> {
        if !roi.fits(self.width, self.height) {
            return Err(anyhow!(
                "roi {}x{}+{}+{} does not fit frame {}x{}",
                roi.width,
                roi.height,
                roi.x,
                roi.y,
                self.width,
                self.height
            ));
        }
        let row_bytes = roi.width as usize * RGB_CHANNELS;
        let stride = self.width as usize * RGB_CHANNELS;
        let mut pixels = Vec::with_capacity(row_bytes * roi.height as usize);
        for row in roi.y as usize..(roi.y + roi.height) as usize {
            let start = row * stride + roi.x as usize * RGB_CHANNELS;
            pixels.extend_from_slice(&self.pixels[start..start + row_bytes]);
        }
        Ok(Frame {
            pixels,
            width: roi.width,
            height: roi.height,
            ordinal: self.ordinal,
            captured_at: self.captured_at,
        })
    }

    /// Crop to `roi` when it fits, otherwise return a full copy.
    pub fn sample(&self, roi: Option<&Roi>) -> Frame {
        match roi {
            Some(roi) if roi.fits(self.width, self.height) => match self.crop(roi) {
                Ok(cropped) => cropped,
                Err(_) => self.clone(),
            },
            _ => self.clone(),
        }
    }

    pub fn to_rgb_image(&self) -> Result<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }
}

/// Region of interest in pixel coordinates.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn fits(&self, frame_width: u32, frame_height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.checked_add(self.width).is_some_and(|r| r <= frame_width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= frame_height)
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}

//! Raw float pixel buffers handed over by the graph engine.

use crate::error::{SinkError, SinkResult};

/// One image of a batch: `height x width x channels` samples in `[0, 1]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    channels: u8,
    data: Vec<f32>,
}

impl Frame {
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<f32>) -> SinkResult<Self> {
        if !(channels == 3 || channels == 4) {
            return Err(SinkError::InvalidInput(format!("unsupported channel count {channels}")));
        }
        if width == 0 || height == 0 {
            return Err(SinkError::InvalidInput("frame has zero width or height".into()));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(SinkError::InvalidInput(format!(
                "frame buffer holds {} samples, expected {expected}",
                data.len()
            )));
        }
        Ok(Self { width, height, channels, data })
    }

    /// Build a frame from 8-bit pixels decoded by the `image` crate.
    pub fn from_dynamic(img: &image::DynamicImage) -> SinkResult<Self> {
        let (width, height, channels, raw) = if img.color().has_alpha() {
            let rgba = img.to_rgba8();
            (rgba.width(), rgba.height(), 4u8, rgba.into_raw())
        } else {
            let rgb = img.to_rgb8();
            (rgb.width(), rgb.height(), 3u8, rgb.into_raw())
        };
        let data = raw.into_iter().map(|v| v as f32 / 255.0).collect();
        Self::new(width, height, channels, data)
    }

    pub fn width(&self) -> u32 { self.width }
    pub fn height(&self) -> u32 { self.height }
    pub fn channels(&self) -> u8 { self.channels }

    /// Clamp to `[0, 1]`, scale to 255 and round.
    pub fn to_u8(&self) -> Vec<u8> {
        self.data
            .iter()
            .map(|&v| {
                let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
                (v * 255.0).round() as u8
            })
            .collect()
    }
}

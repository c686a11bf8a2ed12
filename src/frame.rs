//! Raw samples and preprocessed frames.
//!
//! - `Sample`: packed pixel data pulled from a branch tap (RGB, RGBA or BGR).
//! - `Frame`: model-ready frame, RGB `f32` in `[0, 1]`, HWC layout.
//!
//! Preprocessing resizes to the model input size, normalises the colour space
//! to RGB and scales pixel values to `[0, 1]`.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Pixel layout of a raw sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
    Rgba,
    Bgr,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb | PixelFormat::Bgr => 3,
            PixelFormat::Rgba => 4,
        }
    }

    /// Parse a raw video format name (`RGB`, `RGBA`, `BGR`, `RGBx`).
    pub fn from_format_name(name: &str) -> Option<Self> {
        match name {
            "RGB" => Some(PixelFormat::Rgb),
            "RGBA" | "RGBx" => Some(PixelFormat::Rgba),
            "BGR" => Some(PixelFormat::Bgr),
            _ => None,
        }
    }
}

/// Raw sample pulled from a tap. Rows are tightly packed.
#[derive(Clone, Debug)]
pub struct Sample {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Sample {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(format.channels()))
            .ok_or_else(|| anyhow!("sample dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} bytes for {}x{} {:?}, received {}",
                expected,
                width,
                height,
                format,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Repack as RGB bytes, dropping alpha and swapping BGR.
    fn to_rgb_bytes(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Rgb => self.data.clone(),
            PixelFormat::Rgba => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            PixelFormat::Bgr => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
        }
    }
}

/// Model input dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreprocessTarget {
    pub width: u32,
    pub height: u32,
}

/// Preprocessed frame tagged with its capture sequence.
#[derive(Clone, Debug)]
pub struct Frame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pixels: Vec<f32>,
}

impl Frame {
    pub fn from_pixels(sequence: u64, width: u32, height: u32, pixels: Vec<f32>) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} values for {}x{} RGB frame, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            sequence,
            width,
            height,
            pixels,
        })
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }
}

/// Resize, convert to RGB and normalise one sample.
pub fn preprocess(sample: &Sample, sequence: u64, target: PreprocessTarget) -> Result<Frame> {
    if target.width == 0 || target.height == 0 {
        return Err(anyhow!("model input size must be non-zero"));
    }
    let rgb = RgbImage::from_raw(sample.width, sample.height, sample.to_rgb_bytes())
        .ok_or_else(|| anyhow!("sample buffer does not match its dimensions"))?;
    let resized = if sample.width == target.width && sample.height == target.height {
        rgb
    } else {
        imageops::resize(&rgb, target.width, target.height, FilterType::Triangle)
    };
    let pixels = resized
        .into_raw()
        .into_iter()
        .map(|v| f32::from(v) / 255.0)
        .collect();
    Frame::from_pixels(sequence, target.width, target.height, pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rejects_short_buffer() {
        assert!(Sample::new(vec![0u8; 5], 2, 1, PixelFormat::Rgb).is_err());
    }

    #[test]
    fn rgba_is_converted_to_normalised_rgb() -> Result<()> {
        let sample = Sample::new(vec![255, 0, 51, 9, 0, 255, 102, 9], 2, 1, PixelFormat::Rgba)?;
        let frame = preprocess(
            &sample,
            4,
            PreprocessTarget {
                width: 2,
                height: 1,
            },
        )?;
        assert_eq!(frame.sequence, 4);
        assert_eq!(frame.pixels(), &[1.0, 0.0, 0.2, 0.0, 1.0, 0.4]);
        Ok(())
    }

    #[test]
    fn bgr_channels_are_swapped() -> Result<()> {
        let sample = Sample::new(vec![0, 0, 255], 1, 1, PixelFormat::Bgr)?;
        let frame = preprocess(
            &sample,
            0,
            PreprocessTarget {
                width: 1,
                height: 1,
            },
        )?;
        assert_eq!(frame.pixels(), &[1.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn frames_are_resized_to_model_input() -> Result<()> {
        let sample = Sample::new(vec![128u8; 64 * 48 * 3], 64, 48, PixelFormat::Rgb)?;
        let frame = preprocess(
            &sample,
            0,
            PreprocessTarget {
                width: 16,
                height: 8,
            },
        )?;
        assert_eq!((frame.width, frame.height), (16, 8));
        assert_eq!(frame.pixels().len(), 16 * 8 * 3);
        assert!(frame.pixels().iter().all(|v| (0.0..=1.0).contains(v)));
        Ok(())
    }
}

//! Frame formats accepted by the detector.
//!
//! The module only understands 8-bit grayscale. Colour frames are reduced to
//! the plain channel mean `(r + g + b) / 3`, which is what camera hosts feed
//! it; luma weighting makes no measurable difference to tag decoding.

use std::borrow::Cow;

use image::{GrayImage, Luma, RgbaImage};

use crate::error::{Error, Result};

/// Supported pixel layouts for input frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// Grayscale 8-bit
    #[default]
    Gray8,
    /// RGB with 8 bits per channel
    Rgb8,
    /// RGBA with 8 bits per channel (canvas pixel data)
    Rgba8,
    /// BGR with 8 bits per channel
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            FrameFormat::Gray8 => 1,
            FrameFormat::Rgb8 | FrameFormat::Bgr8 => 3,
            FrameFormat::Rgba8 => 4,
        }
    }

    /// Byte length of a `width` x `height` frame in this format, or `None`
    /// if it does not fit in `usize`.
    pub fn frame_len(&self, width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(self.bytes_per_pixel())
    }
}

/// Reduce a frame to grayscale. Gray input is borrowed as is.
pub fn to_gray(data: &[u8], width: u32, height: u32, format: FrameFormat) -> Result<Cow<'_, [u8]>> {
    let expected = format.frame_len(width, height).ok_or_else(|| {
        Error::InvalidFrame(format!("{:?} frame of {}x{} is too large", format, width, height))
    })?;
    if data.len() != expected {
        return Err(Error::InvalidFrame(format!(
            "{:?} frame of {}x{} needs {} bytes, got {}",
            format,
            width,
            height,
            expected,
            data.len()
        )));
    }

    let gray: Vec<u8> = match format {
        FrameFormat::Gray8 => return Ok(Cow::Borrowed(data)),
        // Channel order does not matter for a mean.
        FrameFormat::Rgb8 | FrameFormat::Bgr8 | FrameFormat::Rgba8 => data
            .chunks_exact(format.bytes_per_pixel())
            .map(|px| channel_mean(px[0], px[1], px[2]))
            .collect(),
    };
    Ok(Cow::Owned(gray))
}

/// Reduce an RGBA image to grayscale by channel mean. Alpha is ignored.
pub fn gray_from_rgba(image: &RgbaImage) -> GrayImage {
    let mut gray = GrayImage::new(image.width(), image.height());
    for (x, y, px) in image.enumerate_pixels() {
        let [r, g, b, _] = px.0;
        gray.put_pixel(x, y, Luma([channel_mean(r, g, b)]));
    }
    gray
}

#[inline]
fn channel_mean(r: u8, g: u8, b: u8) -> u8 {
    ((r as u16 + g as u16 + b as u16) / 3) as u8
}

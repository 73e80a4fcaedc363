//! Thermal background preparation
//!
//! Backgrounds are normalized to the printer's dot width before they reach
//! the editor, so the editor's canvas height is simply the image height.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

use crate::THERMAL_WIDTH;

const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum ThermalError {
    #[error("Could not decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Could not read image: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crop rectangle {0:?} is outside the {1}x{2} image")]
    CropOutOfBounds(CropRect, u32, u32),
}

/// Region of the source image to keep, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Natural `(width, height)` without decoding pixel data.
pub fn image_dimensions(data: &[u8]) -> Result<(u32, u32), ThermalError> {
    let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
    Ok(reader.into_dimensions()?)
}

pub fn decode(data: &[u8]) -> Result<DynamicImage, ThermalError> {
    Ok(image::load_from_memory(data)?)
}

/// Crop (optionally), resize to the thermal width and re-encode as JPEG.
pub fn prepare_background(data: &[u8], crop: Option<CropRect>) -> Result<Vec<u8>, ThermalError> {
    let mut img = decode(data)?;

    if let Some(rect) = crop {
        let (w, h) = (img.width(), img.height());
        let fits = rect.width > 0
            && rect.height > 0
            && rect.x.saturating_add(rect.width) <= w
            && rect.y.saturating_add(rect.height) <= h;
        if !fits {
            return Err(ThermalError::CropOutOfBounds(rect, w, h));
        }
        img = img.crop_imm(rect.x, rect.y, rect.width, rect.height);
    }

    let scale = THERMAL_WIDTH as f64 / img.width() as f64;
    let height = ((img.height() as f64 * scale).round() as u32).max(1);
    let resized = img.resize_exact(THERMAL_WIDTH, height, FilterType::Lanczos3);

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    DynamicImage::ImageRgb8(resized.to_rgb8()).write_with_encoder(encoder)?;

    log::debug!(
        "prepared background {}x{} -> {}x{} ({} bytes)",
        img.width(),
        img.height(),
        THERMAL_WIDTH,
        height,
        out.len()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 10, 10]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_resize_keeps_aspect_ratio() {
        let prepared = prepare_background(&png(1152, 1600), None).unwrap();
        assert_eq!(image_dimensions(&prepared).unwrap(), (576, 800));
    }

    #[test]
    fn test_crop_then_resize() {
        let crop = CropRect { x: 100, y: 0, width: 288, height: 144 };
        let prepared = prepare_background(&png(400, 400), Some(crop)).unwrap();
        assert_eq!(image_dimensions(&prepared).unwrap(), (576, 288));
    }

    #[test]
    fn test_crop_outside_image_rejected() {
        let crop = CropRect { x: 300, y: 0, width: 200, height: 10 };
        assert!(matches!(
            prepare_background(&png(400, 400), Some(crop)),
            Err(ThermalError::CropOutOfBounds(..))
        ));
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(prepare_background(b"not an image", None).is_err());
        assert!(image_dimensions(b"nope").is_err());
    }
}

//! Resizing and encoding of image renditions.

use crate::models::image::VariantSize;
use anyhow::{Context, Result};
use image::{DynamicImage, ExtendedColorType, GenericImageView, codecs::jpeg::JpegEncoder, imageops::FilterType};

/// Every rendition is re-encoded as JPEG at this quality.
pub const OUTPUT_QUALITY: u8 = 80;
pub const OUTPUT_CONTENT_TYPE: &str = "image/jpeg";
pub const OUTPUT_EXTENSION: &str = "jpg";

/// One encoded rendition, ready to upload.
#[derive(Debug, Clone)]
pub struct EncodedVariant {
    pub size: VariantSize,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// Decode an uploaded image.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("decode uploaded image")
}

/// Resize `source` to the preset's width and encode it.
///
/// Sources narrower than the preset keep their dimensions.
pub fn render(source: &DynamicImage, size: VariantSize) -> Result<EncodedVariant> {
    let (width, height) = source.dimensions();
    let (target_width, target_height) = match size.width() {
        Some(max_width) => target_dimensions(width, height, max_width),
        None => (width, height),
    };

    let resized = if (target_width, target_height) == (width, height) {
        source.to_rgb8()
    } else {
        source
            .resize_exact(target_width, target_height, FilterType::Lanczos3)
            .to_rgb8()
    };

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, OUTPUT_QUALITY)
        .encode(
            resized.as_raw(),
            resized.width(),
            resized.height(),
            ExtendedColorType::Rgb8,
        )
        .with_context(|| format!("encode {} variant", size))?;

    Ok(EncodedVariant {
        size,
        width: resized.width(),
        height: resized.height(),
        bytes,
    })
}

/// Scale to `max_width`, keeping the aspect ratio and never enlarging.
fn target_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width {
        return (width, height);
    }
    let scaled_height = ((height as f64) * (max_width as f64) / (width as f64)).round() as u32;
    (max_width, scaled_height.max(1))
}

//! Image encoding: RGB bitmaps → base64 PNG.
//!
//! Used twice: each normalized page is sent to the model backend as a PNG
//! data URI, and each figure crop is attached to the response as base64 PNG.
//! PNG is lossless, and text crispness matters far more than payload size
//! for OCR accuracy.

use crate::error::OcrError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, RgbImage};
use std::io::Cursor;
use tracing::debug;

pub const PNG_MIME: &str = "image/png";

/// Encode an RGB bitmap as PNG bytes.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, OcrError> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| OcrError::Internal(format!("PNG encoding failed: {e}")))?;
    Ok(buf)
}

/// Encode an RGB bitmap as base64 PNG.
pub fn encode_png_base64(img: &RgbImage) -> Result<String, OcrError> {
    let b64 = STANDARD.encode(encode_png(img)?);
    debug!(
        "Encoded {}x{} image → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );
    Ok(b64)
}

/// `data:image/png;base64,...` URI for chat-completions image parts.
pub fn png_data_uri(img: &RgbImage) -> Result<String, OcrError> {
    Ok(format!("data:{PNG_MIME};base64,{}", encode_png_base64(img)?))
}

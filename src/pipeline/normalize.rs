//! Image normalisation: decode the payload into canonical RGB8 pages.
//!
//! Every page handed to the model has its longest side at or below the
//! configured ceiling (2048 px by default). Oversized pages dominate both
//! forward-pass latency and accelerator memory, so they are downscaled with
//! Lanczos3 and the aspect ratio preserved. Pages already within bounds are
//! passed through at their original size.

use crate::config::PageRange;
use crate::error::OcrError;
use crate::pipeline::input::MediaType;
use crate::pipeline::render::PdfRasterizer;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::sync::Arc;
use tracing::debug;

/// A page ready for the model.
#[derive(Debug, Clone)]
pub struct NormalizedPage {
    /// 0-based index in the source document.
    pub index: usize,
    pub image: RgbImage,
    /// Size of the page before normalisation.
    pub original_size: (u32, u32),
    /// Byte size of the payload the page came from.
    pub source_bytes: usize,
}

impl NormalizedPage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn was_resized(&self) -> bool {
        self.original_size != (self.width(), self.height())
    }
}

/// All selected pages of one request, in ascending index order.
#[derive(Debug)]
pub struct NormalizedDocument {
    pub total_pages: usize,
    pub pages: Vec<NormalizedPage>,
}

/// Target size for a `width × height` page under a longest-side ceiling.
///
/// Within bounds the size is returned unchanged. Otherwise the longest side
/// becomes exactly `max_dimension` and the short side is rounded, never
/// below 1 px.
pub fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension {
        return (width, height);
    }
    let ratio = max_dimension as f64 / longest as f64;
    let scale = |side: u32| ((side as f64 * ratio).round() as u32).max(1);
    if width >= height {
        (max_dimension, scale(height))
    } else {
        (scale(width), max_dimension)
    }
}

/// Convert one decoded image into a [`NormalizedPage`].
pub fn normalize_image(
    index: usize,
    image: DynamicImage,
    max_dimension: u32,
    source_bytes: usize,
) -> NormalizedPage {
    let original_size = (image.width(), image.height());
    let (w, h) = fit_within(original_size.0, original_size.1, max_dimension);
    let image = if (w, h) == original_size {
        image.to_rgb8()
    } else {
        debug!(
            "Resizing page {} from {}x{} to {}x{}",
            index, original_size.0, original_size.1, w, h
        );
        image.resize_exact(w, h, FilterType::Lanczos3).to_rgb8()
    };
    NormalizedPage {
        index,
        image,
        original_size,
        source_bytes,
    }
}

/// Decode `content` and normalise the selected pages.
///
/// Runs on the blocking pool: PDF rasterisation, image decoding and Lanczos
/// resampling are all CPU-bound. An image payload is a one-page document;
/// page selection applies to PDFs only.
pub async fn normalize(
    content: Vec<u8>,
    media_type: MediaType,
    selection: Option<PageRange>,
    dpi: u32,
    max_dimension: u32,
    rasterizer: Arc<dyn PdfRasterizer>,
) -> Result<NormalizedDocument, OcrError> {
    tokio::task::spawn_blocking(move || {
        normalize_blocking(
            &content,
            media_type,
            selection.as_ref(),
            dpi,
            max_dimension,
            rasterizer.as_ref(),
        )
    })
    .await
    .map_err(|e| OcrError::Internal(format!("Normalize task panicked: {e}")))?
}

fn normalize_blocking(
    content: &[u8],
    media_type: MediaType,
    selection: Option<&PageRange>,
    dpi: u32,
    max_dimension: u32,
    rasterizer: &dyn PdfRasterizer,
) -> Result<NormalizedDocument, OcrError> {
    let source_bytes = content.len();
    match media_type {
        MediaType::Image => {
            if let Some(range) = selection {
                debug!(%range, "Ignoring page selection for image payload");
            }
            let image = image::load_from_memory(content)
                .map_err(|e| OcrError::malformed(format!("could not decode image: {e}")))?;
            Ok(NormalizedDocument {
                total_pages: 1,
                pages: vec![normalize_image(0, image, max_dimension, source_bytes)],
            })
        }
        MediaType::Pdf => {
            let doc = rasterizer.rasterize(content, selection, dpi, max_dimension)?;
            let pages = doc
                .pages
                .into_iter()
                .map(|(idx, img)| normalize_image(idx, img, max_dimension, source_bytes))
                .collect();
            Ok(NormalizedDocument {
                total_pages: doc.total_pages,
                pages,
            })
        }
    }
}

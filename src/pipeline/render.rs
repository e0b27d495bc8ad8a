//! PDF rasterisation: render selected pages to `DynamicImage` via pdfium.
//!
//! [`PdfRasterizer`] is the seam between the pipeline and the native
//! library: production uses [`PdfiumRasterizer`], tests substitute a fake
//! that produces synthetic pages.
//!
//! pdfium is not safe to call from async contexts. Callers run
//! [`PdfRasterizer::rasterize`] inside `tokio::task::spawn_blocking` (see
//! [`crate::pipeline::normalize`]).
//!
//! Renders are capped at the page ceiling as well as scaled by DPI, so an
//! A0 poster never materialises as a 25,000 px bitmap.

use crate::config::PageRange;
use crate::error::OcrError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};

/// PDF user-space units per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// The pages of one PDF that were selected for processing.
#[derive(Debug)]
pub struct RasterizedDocument {
    /// Pages in the whole document.
    pub total_pages: usize,
    /// `(page_index_0based, image)` in ascending index order.
    pub pages: Vec<(usize, DynamicImage)>,
}

/// Turns PDF bytes into page bitmaps. Blocking; call from `spawn_blocking`.
pub trait PdfRasterizer: Send + Sync {
    /// Render the pages selected by `selection` (all pages when `None`).
    ///
    /// Each bitmap is rendered at `dpi` with either edge capped at
    /// `max_dimension`. Returns `EmptyDocument` when the selection resolves
    /// to no pages and `MalformedInput` when the bytes are not a readable PDF.
    fn rasterize(
        &self,
        pdf: &[u8],
        selection: Option<&PageRange>,
        dpi: u32,
        max_dimension: u32,
    ) -> Result<RasterizedDocument, OcrError>;
}

/// Resolve a page selection against a document's page count.
///
/// `None` selects every page; indices beyond the document are dropped.
pub fn resolve_selection(
    selection: Option<&PageRange>,
    total_pages: usize,
) -> Result<Vec<usize>, OcrError> {
    let indices = match selection {
        Some(range) => range.resolve(total_pages),
        None => (0..total_pages).collect(),
    };
    if indices.is_empty() {
        return Err(OcrError::EmptyDocument { total: total_pages });
    }
    Ok(indices)
}

/// [`PdfRasterizer`] backed by the pdfium native library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    lib_path: Option<PathBuf>,
}

impl PdfiumRasterizer {
    /// `lib_path` may name the library file or the directory containing it.
    /// `None` tries the working directory, then the system library.
    pub fn new(lib_path: Option<PathBuf>) -> Self {
        Self { lib_path }
    }

    fn bind(&self) -> Result<Pdfium, OcrError> {
        let bindings = match &self.lib_path {
            Some(p) if p.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(p))
            }
            Some(p) => Pdfium::bind_to_library(p),
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| OcrError::Internal(format!("Failed to bind pdfium library: {e:?}")))?;
        Ok(Pdfium::new(bindings))
    }
}

impl PdfRasterizer for PdfiumRasterizer {
    fn rasterize(
        &self,
        pdf: &[u8],
        selection: Option<&PageRange>,
        dpi: u32,
        max_dimension: u32,
    ) -> Result<RasterizedDocument, OcrError> {
        let pdfium = self.bind()?;

        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| OcrError::malformed(format!("could not open PDF: {e:?}")))?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        info!("PDF loaded: {} pages", total_pages);

        let indices = resolve_selection(selection, total_pages)?;

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(dpi as f32 / POINTS_PER_INCH)
            .set_maximum_width(max_dimension as i32)
            .set_maximum_height(max_dimension as i32);

        let mut results = Vec::with_capacity(indices.len());
        for idx in indices {
            let page = pages
                .get(idx as u16)
                .map_err(|e| OcrError::malformed(format!("page {idx}: {e:?}")))?;

            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| OcrError::malformed(format!("page {idx} failed to render: {e:?}")))?;

            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                idx,
                image.width(),
                image.height()
            );
            results.push((idx, image));
        }

        Ok(RasterizedDocument {
            total_pages,
            pages: results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_selection_means_all_pages() {
        assert_eq!(resolve_selection(None, 3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn selection_drops_out_of_range() {
        let range: PageRange = "2-3,8".parse().unwrap();
        assert_eq!(resolve_selection(Some(&range), 5).unwrap(), vec![2, 3]);
    }

    #[test]
    fn empty_resolution_is_empty_document() {
        let range: PageRange = "7".parse().unwrap();
        let err = resolve_selection(Some(&range), 5).unwrap_err();
        assert!(matches!(err, OcrError::EmptyDocument { total: 5 }), "got: {err}");
        assert!(resolve_selection(None, 0).is_err());
    }
}

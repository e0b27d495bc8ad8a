//! Batch scheduling: split a request's pages into forward-pass batches.
//!
//! Batches preserve page order, never mix documents, and are dispatched one
//! after another. The final batch may be shorter than the limit; it is never
//! padded with blank pages.
//!
//! ## Memory estimate
//!
//! The vision encoder sees a page as 28 × 28 px patches, so a page whose
//! longest side is `d` costs at most `ceil(d / 28)²` vision tokens. Each
//! token's worst-case activation and KV-cache footprint is budgeted at
//! 192 KiB. The estimate is deliberately pessimistic: it assumes square
//! pages at the full ceiling.

use crate::error::OcrError;
use crate::pipeline::normalize::NormalizedPage;

/// Edge length of one vision patch in pixels.
pub const PATCH_PIXELS: u32 = 28;

/// Worst-case accelerator bytes per vision token.
pub const BYTES_PER_VISION_TOKEN: u64 = 192 * 1024;

const MIB: u64 = 1024 * 1024;

/// Pages sent to the model in one forward pass.
#[derive(Debug, Clone)]
pub struct Batch {
    pub pages: Vec<NormalizedPage>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Source page indices, in batch order.
    pub fn indices(&self) -> Vec<usize> {
        self.pages.iter().map(|p| p.index).collect()
    }
}

/// Split `pages` into consecutive batches of at most `max_batch_size` pages.
///
/// A `max_batch_size` of zero is treated as one.
pub fn partition(pages: Vec<NormalizedPage>, max_batch_size: usize) -> Vec<Batch> {
    let size = max_batch_size.max(1);
    let mut batches = Vec::with_capacity(pages.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(pages.len()));
    for page in pages {
        current.push(page);
        if current.len() == size {
            batches.push(Batch {
                pages: std::mem::take(&mut current),
            });
        }
    }
    if !current.is_empty() {
        batches.push(Batch { pages: current });
    }
    batches
}

/// Worst-case vision tokens for a page whose longest side is `max_dimension`.
pub fn vision_tokens(max_dimension: u32) -> u64 {
    let per_side = max_dimension.div_ceil(PATCH_PIXELS) as u64;
    per_side * per_side
}

/// Worst-case accelerator bytes for one page at `max_dimension`.
pub fn estimate_page_bytes(max_dimension: u32) -> u64 {
    vision_tokens(max_dimension) * BYTES_PER_VISION_TOKEN
}

/// Worst-case accelerator bytes for a full batch.
pub fn estimate_batch_bytes(batch_size: usize, max_dimension: u32) -> u64 {
    estimate_page_bytes(max_dimension).saturating_mul(batch_size as u64)
}

/// Reject a batch size whose worst-case estimate exceeds `memory_budget_mb`.
///
/// Called once at configuration time so an over-ambitious batch size fails
/// at startup rather than as an out-of-memory error under load.
pub fn validate_batch_budget(
    batch_size: usize,
    max_dimension: u32,
    memory_budget_mb: u64,
) -> Result<(), OcrError> {
    if batch_size == 0 {
        return Err(OcrError::InvalidConfig(
            "max_batch_size must be ≥ 1".into(),
        ));
    }
    let needed = estimate_batch_bytes(batch_size, max_dimension);
    let budget = memory_budget_mb.saturating_mul(MIB);
    if needed > budget {
        let per_page_mb = estimate_page_bytes(max_dimension).div_ceil(MIB);
        return Err(OcrError::InvalidConfig(format!(
            "max_batch_size {batch_size} needs up to {} MiB at {max_dimension} px \
             ({per_page_mb} MiB per page) but the memory budget is {memory_budget_mb} MiB",
            needed.div_ceil(MIB)
        )));
    }
    Ok(())
}

//! Pipeline stages for layout OCR inference.
//!
//! Each submodule implements exactly one transformation step, so each is
//! independently testable and the model or rasteriser can be swapped without
//! touching the other stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ normalize ──▶ batch ──▶ executor ──▶ format
//! (wire)    (pdfium,      (size     (lifecycle,  (html → md,
//!            resize)       limit)    deadline)    crops)
//! ```
//!
//! 1. [`input`]     decode the wire request and settle the media type
//! 2. [`render`]    rasterise selected PDF pages; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`normalize`] cap each page at the maximum dimension, convert to RGB8
//! 4. [`batch`]     split pages into forward-pass batches; memory estimate
//! 5. [`lifecycle`] the single model instance and its readiness state
//! 6. [`executor`]  one bounded forward pass per batch
//! 7. [`encode`]    PNG + base64 for backend requests and figure crops
//! 8. [`format`]    raw model HTML to markdown, HTML, layout and crops
//! 9. [`postprocess`] deterministic markdown cleanup rules

pub mod batch;
pub mod encode;
pub mod executor;
pub mod format;
pub mod input;
pub mod lifecycle;
pub mod normalize;
pub mod postprocess;
pub mod render;

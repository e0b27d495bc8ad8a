//! # layout-ocr-serve
//!
//! Serve a layout-aware OCR vision-language model behind a managed
//! inference endpoint.
//!
//! A request carries one document image or a PDF. Each page is rasterised,
//! fitted within the model's input size, run through the model in
//! memory-bounded batches, and the model's layout HTML is turned into
//! Markdown, cleaned HTML, a list of labelled layout elements and cropped
//! figure images.
//!
//! ## Pipeline Overview
//!
//! ```text
//! request
//!  │
//!  ├─ 1. Input      decode wire JSON, sniff image vs PDF, validate options
//!  ├─ 2. Normalise  rasterise PDF pages via pdfium, fit within max_dimension
//!  ├─ 3. Batch      partition pages into batches that fit the memory budget
//!  ├─ 4. Lifecycle  load the model once (single-flight), cold-start aware
//!  ├─ 5. Execute    one deadline-bounded forward pass per batch
//!  ├─ 6. Format     layout HTML → Markdown / HTML / elements / crops
//!  └─ 7. Envelope   ordered pages + aggregate metadata, or a typed error
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use layout_ocr_serve::{OcrService, RawRequest, RequestOptions, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::builder().max_batch_size(1).build()?;
//!     let service = OcrService::from_config(config)?;
//!
//!     let bytes = std::fs::read("scan.png")?;
//!     let envelope = service
//!         .handle(RawRequest::new(bytes, None, RequestOptions::default()))
//!         .await;
//!     for page in envelope.pages.values() {
//!         println!("{}", page.markdown);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `server` | on      | HTTP surface and the `ocr-serve` binary (axum + clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod error;
#[cfg(feature = "server")]
pub mod http;
pub mod output;
pub mod pipeline;
pub mod prompts;
pub mod receiver;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ActivationStrategy, PageRange, Precision, RequestOptions, ServiceConfig, ServiceConfigBuilder,
};
pub use error::{ErrorKind, OcrError};
pub use output::{
    EmbeddedImage, ErrorBody, LayoutElement, PageResult, ResponseEnvelope, ResponseMetadata,
};
pub use pipeline::input::{MediaType, RawRequest};
pub use pipeline::lifecycle::{
    AcceleratorInfo, AcceleratorProbe, LoadSettings, ModelLifecycle, ModelLoader, ModelState,
    OcrModel,
};
pub use pipeline::render::{PdfRasterizer, PdfiumRasterizer, RasterizedDocument};
pub use receiver::OcrService;

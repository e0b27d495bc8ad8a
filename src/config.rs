//! Configuration types for the inference service.
//!
//! Two structs carry every knob:
//!
//! * [`ServiceConfig`]: process-wide settings fixed at startup (page size
//!   ceiling, batch size, deadlines, model and backend selection). Built via
//!   [`ServiceConfigBuilder`], which validates cross-field constraints such
//!   as the batch memory budget once, before the first request.
//! * [`RequestOptions`]: per-request output options, validated once at the
//!   receiver boundary.

use crate::error::OcrError;
use crate::pipeline::batch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Longest page edge the model is fed, in pixels.
pub const DEFAULT_MAX_DIMENSION: u32 = 2048;

/// Upper bound accepted for `max_output_tokens` on a single request.
pub const MAX_OUTPUT_TOKENS_CEILING: usize = 32_768;

/// Configuration for the inference service.
///
/// # Example
/// ```rust
/// use layout_ocr_serve::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .max_batch_size(2)
///     .inference_timeout_ms(30_000)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_batch_size, 2);
/// ```
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Longest edge of a normalized page in pixels. Default: 2048.
    ///
    /// Larger pages are downscaled with aspect ratio preserved; smaller pages
    /// are passed through untouched.
    pub max_dimension: u32,

    /// DPI used when rasterising PDF pages. Range: 72–400. Default: 192.
    ///
    /// The rendered bitmap is still capped at `max_dimension`.
    pub pdf_dpi: u32,

    /// Maximum pages per forward pass. Default: 1.
    pub max_batch_size: usize,

    /// Worst-case accelerator memory a single batch may claim, in MiB. Default: 8192.
    pub memory_budget_mb: u64,

    /// Wall-clock budget for one forward pass, in milliseconds. Default: 55 000.
    ///
    /// Zero is accepted and rejects every forward pass; useful for drills.
    pub inference_timeout_ms: u64,

    /// `max_output_tokens` applied when a request does not set one. Default: 4096.
    pub default_max_output_tokens: usize,

    /// Scale the model's bounding boxes are normalized to. Default: 1024.
    pub bbox_scale: u32,

    /// Model checkpoint identifier. Default: `datalab-to/chandra`.
    pub model_id: String,

    /// Numeric format the weights are loaded in. Default: bf16.
    pub precision: Precision,

    /// Activation memory strategy. Default: gradient checkpointing.
    pub activation: ActivationStrategy,

    /// Load the model at startup instead of on the first request. Default: false.
    pub preload: bool,

    /// Base URL of the OpenAI-compatible model server. Default: `http://localhost:8000/v1`.
    pub backend_url: String,

    /// Model name the backend serves the checkpoint under. Default: `chandra`.
    pub served_model_name: String,

    /// Bearer token for the backend, if it requires one.
    pub backend_api_key: Option<String>,

    /// How long a load may wait for the backend to come up, in seconds. Default: 1800.
    ///
    /// First loads download tens of GB of weights; the hosting supervisor
    /// allows a startup health-check window of the same order.
    pub load_timeout_secs: u64,

    /// Explicit path to libpdfium. `None` tries `./` and then the system library.
    pub pdfium_lib_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            pdf_dpi: 192,
            max_batch_size: 1,
            memory_budget_mb: 8192,
            inference_timeout_ms: 55_000,
            default_max_output_tokens: 4096,
            bbox_scale: 1024,
            model_id: "datalab-to/chandra".to_string(),
            precision: Precision::default(),
            activation: ActivationStrategy::default(),
            preload: false,
            backend_url: "http://localhost:8000/v1".to_string(),
            served_model_name: "chandra".to_string(),
            backend_api_key: None,
            load_timeout_secs: 1800,
            pdfium_lib_path: None,
        }
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn max_dimension(mut self, px: u32) -> Self {
        self.config.max_dimension = px;
        self
    }

    pub fn pdf_dpi(mut self, dpi: u32) -> Self {
        self.config.pdf_dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_batch_size(mut self, n: usize) -> Self {
        self.config.max_batch_size = n;
        self
    }

    pub fn memory_budget_mb(mut self, mb: u64) -> Self {
        self.config.memory_budget_mb = mb;
        self
    }

    pub fn inference_timeout_ms(mut self, ms: u64) -> Self {
        self.config.inference_timeout_ms = ms;
        self
    }

    pub fn default_max_output_tokens(mut self, n: usize) -> Self {
        self.config.default_max_output_tokens = n;
        self
    }

    pub fn bbox_scale(mut self, scale: u32) -> Self {
        self.config.bbox_scale = scale;
        self
    }

    pub fn model_id(mut self, id: impl Into<String>) -> Self {
        self.config.model_id = id.into();
        self
    }

    pub fn precision(mut self, p: Precision) -> Self {
        self.config.precision = p;
        self
    }

    pub fn activation(mut self, a: ActivationStrategy) -> Self {
        self.config.activation = a;
        self
    }

    pub fn preload(mut self, v: bool) -> Self {
        self.config.preload = v;
        self
    }

    pub fn backend_url(mut self, url: impl Into<String>) -> Self {
        self.config.backend_url = url.into();
        self
    }

    pub fn served_model_name(mut self, name: impl Into<String>) -> Self {
        self.config.served_model_name = name.into();
        self
    }

    pub fn backend_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.backend_api_key = Some(key.into());
        self
    }

    pub fn load_timeout_secs(mut self, secs: u64) -> Self {
        self.config.load_timeout_secs = secs;
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    /// Build the configuration, validating constraints.
    ///
    /// Rejects a batch size whose worst-case memory estimate at
    /// `max_dimension` exceeds `memory_budget_mb`.
    pub fn build(self) -> Result<ServiceConfig, OcrError> {
        let c = &self.config;
        if c.max_dimension < batch::PATCH_PIXELS {
            return Err(OcrError::InvalidConfig(format!(
                "max_dimension must be ≥ {}, got {}",
                batch::PATCH_PIXELS,
                c.max_dimension
            )));
        }
        if c.default_max_output_tokens == 0
            || c.default_max_output_tokens > MAX_OUTPUT_TOKENS_CEILING
        {
            return Err(OcrError::InvalidConfig(format!(
                "default_max_output_tokens must be 1–{}, got {}",
                MAX_OUTPUT_TOKENS_CEILING, c.default_max_output_tokens
            )));
        }
        if c.bbox_scale == 0 {
            return Err(OcrError::InvalidConfig("bbox_scale must be ≥ 1".into()));
        }
        batch::validate_batch_budget(c.max_batch_size, c.max_dimension, c.memory_budget_mb)?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Numeric format for the model weights. Defaults to bf16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Bf16,
    Fp16,
    Fp32,
}

impl Precision {
    /// Name understood by the model server's `--dtype` flag.
    pub fn as_dtype(self) -> &'static str {
        match self {
            Precision::Bf16 => "bfloat16",
            Precision::Fp16 => "float16",
            Precision::Fp32 => "float32",
        }
    }
}

impl FromStr for Precision {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "fp16" | "float16" => Ok(Precision::Fp16),
            "fp32" | "float32" => Ok(Precision::Fp32),
            other => Err(OcrError::InvalidConfig(format!("unknown precision '{other}'"))),
        }
    }
}

/// How activations are kept during the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStrategy {
    /// Recompute activations instead of storing them.
    #[default]
    GradientCheckpointing,
    /// Keep every activation resident.
    Full,
}

/// Per-request output options.
///
/// Every field is documented by its effect on the response; unknown fields
/// are rejected on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Generation ceiling per page. Default: the service's
    /// `default_max_output_tokens`.
    pub max_output_tokens: usize,

    /// Attach figure/image crops and keep figure blocks in the output. Default: true.
    pub include_images: bool,

    /// Keep `Page-Header` / `Page-Footer` blocks in markdown and HTML. Default: false.
    pub include_headers_footers: bool,

    /// Pages to process. `None` means every page.
    pub page_range: Option<PageRange>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_output_tokens: 4096,
            include_images: true,
            include_headers_footers: false,
            page_range: None,
        }
    }
}

impl RequestOptions {
    pub fn validate(&self) -> Result<(), OcrError> {
        if self.max_output_tokens == 0 || self.max_output_tokens > MAX_OUTPUT_TOKENS_CEILING {
            return Err(OcrError::malformed(format!(
                "max_output_tokens must be 1–{}, got {}",
                MAX_OUTPUT_TOKENS_CEILING, self.max_output_tokens
            )));
        }
        Ok(())
    }
}

/// A set of 0-based page indices, kept sorted and deduplicated.
///
/// Parsed from strings such as `"2-3"` or `"0,2,5-7"`. Ranges are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PageRange(Vec<usize>);

impl PageRange {
    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        let mut v: Vec<usize> = indices.into_iter().collect();
        v.sort_unstable();
        v.dedup();
        PageRange(v)
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Indices that exist in a document of `total_pages` pages, ascending.
    pub fn resolve(&self, total_pages: usize) -> Vec<usize> {
        self.0.iter().copied().filter(|&p| p < total_pages).collect()
    }
}

impl FromStr for PageRange {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pages = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some((start, end)) = part.split_once('-') {
                let start = parse_index(start, s)?;
                let end = parse_index(end, s)?;
                if start > end {
                    return Err(OcrError::malformed(format!(
                        "invalid page range '{s}': {start} > {end}"
                    )));
                }
                pages.extend(start..=end);
            } else {
                pages.push(parse_index(part, s)?);
            }
        }
        if pages.is_empty() {
            return Err(OcrError::malformed(format!("page range '{s}' selects nothing")));
        }
        Ok(PageRange::from_indices(pages))
    }
}

fn parse_index(raw: &str, whole: &str) -> Result<usize, OcrError> {
    let raw = raw.trim();
    raw.parse::<usize>()
        .map_err(|_| OcrError::malformed(format!("invalid page number '{raw}' in '{whole}'")))
}

impl TryFrom<String> for PageRange {
    type Error = OcrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PageRange> for String {
    fn from(range: PageRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

//! Result and envelope types returned by the service.
//!
//! A [`ResponseEnvelope`] carries either per-page results plus aggregated
//! [`ResponseMetadata`], or a single [`ErrorBody`]. Never both.

use crate::error::{ErrorKind, OcrError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One top-level layout block of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutElement {
    /// `data-label` of the block, or `block` when the model omitted it.
    pub label: String,
    /// `[x0, y0, x1, y1]` in page pixels, clamped to the page.
    pub bbox: [u32; 4],
    /// Inner HTML of the block as the model produced it.
    pub content: String,
    /// Name of the attached crop, for figure blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// A figure crop attached to a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedImage {
    pub mime_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
    pub bbox: [u32; 4],
}

/// The formatted result for a single page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based index of the page in the source document.
    pub page: usize,
    pub markdown: String,
    pub html: String,
    pub layout: Vec<LayoutElement>,
    /// Figure crops keyed by the name referenced from `html` and `layout`.
    #[serde(default)]
    pub images: BTreeMap<String, EmbeddedImage>,
    /// `[0, 0, width, height]` of the normalized page.
    pub page_box: [u32; 4],
    pub completion_tokens: usize,
    pub prompt_tokens: usize,
    /// Raw model output before formatting.
    pub raw: String,
}

/// Request-level metadata aggregated over every returned page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub page_count: usize,
    /// Pages in the source document, before range selection.
    pub total_pages: usize,
    pub completion_tokens: usize,
    pub prompt_tokens: usize,
    pub image_count: usize,
    /// Number of layout elements per label, across all pages.
    pub element_counts: BTreeMap<String, usize>,
    /// The model was not resident when the request arrived.
    pub cold_start: bool,
    pub model_id: String,
    pub inference_ms: u64,
    pub total_ms: u64,
}

/// Machine-readable failure description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_hint: Option<String>,
}

impl From<&OcrError> for ErrorBody {
    fn from(err: &OcrError) -> Self {
        let kind = err.kind();
        ErrorBody {
            kind,
            message: err.to_string(),
            retry_hint: kind.retry_hint().map(str::to_string),
        }
    }
}

/// What every request returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Page results keyed by 0-based source page index. Empty on failure.
    pub pages: BTreeMap<usize, PageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseEnvelope {
    pub fn success(pages: Vec<PageResult>, metadata: ResponseMetadata) -> Self {
        Self {
            pages: pages.into_iter().map(|p| (p.page, p)).collect(),
            metadata: Some(metadata),
            error: None,
        }
    }

    pub fn failure(err: &OcrError) -> Self {
        Self {
            pages: BTreeMap::new(),
            metadata: None,
            error: Some(ErrorBody::from(err)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

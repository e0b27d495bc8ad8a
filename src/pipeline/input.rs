//! Request intake: decode the wire request and settle the media type.
//!
//! ## Media type sniffing
//!
//! When `content_type` is absent the payload is classified by its leading
//! bytes: `%PDF` or a recognised image container signature. Anything else
//! is `malformed_input` before any decoding starts.

use crate::config::{PageRange, RequestOptions};
use crate::error::OcrError;
use base64::Engine;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// What the payload bytes contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    /// A single raster image (PNG, JPEG, TIFF, WebP).
    Image,
    Pdf,
}

impl MediaType {
    /// Guess the media type from leading bytes. `None` when unrecognised.
    pub fn sniff(bytes: &[u8]) -> Option<MediaType> {
        if bytes.starts_with(b"%PDF") {
            return Some(MediaType::Pdf);
        }
        image::guess_format(bytes).ok().map(|_| MediaType::Image)
    }
}

impl FromStr for MediaType {
    type Err = OcrError;

    /// Accepts the short names `image` / `pdf` and MIME types.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "pdf" | "application/pdf" => Ok(MediaType::Pdf),
            "image" => Ok(MediaType::Image),
            _ if s.starts_with("image/") => Ok(MediaType::Image),
            _ => Err(OcrError::malformed(format!("unsupported content type '{s}'"))),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Image => f.write_str("image"),
            MediaType::Pdf => f.write_str("pdf"),
        }
    }
}

/// An accepted request: payload bytes, declared media type and options.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub content: Vec<u8>,
    /// `None` means "sniff from the bytes".
    pub media_type: Option<MediaType>,
    pub options: RequestOptions,
}

impl RawRequest {
    pub fn new(content: Vec<u8>, media_type: Option<MediaType>, options: RequestOptions) -> Self {
        Self {
            content,
            media_type,
            options,
        }
    }

    /// The declared media type, or the sniffed one when none was declared.
    ///
    /// A declared type is trusted; decoding will fail later if it is wrong.
    pub fn resolve_media_type(&self) -> Result<MediaType, OcrError> {
        if self.content.is_empty() {
            return Err(OcrError::malformed("payload is empty"));
        }
        if let Some(declared) = self.media_type {
            return Ok(declared);
        }
        MediaType::sniff(&self.content).ok_or_else(|| {
            OcrError::malformed("could not recognise payload as a PDF or a supported image format")
        })
    }
}

/// JSON body accepted by the invocation endpoint.
///
/// `image` is the legacy name of `content`; exactly one of the two must be set.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub max_output_tokens: Option<usize>,
    #[serde(default)]
    pub include_images: Option<bool>,
    #[serde(default)]
    pub include_headers_footers: Option<bool>,
    #[serde(default)]
    pub page_range: Option<String>,
}

/// Decode a JSON wire request into a [`RawRequest`].
///
/// Every failure here is `malformed_input`.
pub fn decode_wire(body: &[u8], default_max_output_tokens: usize) -> Result<RawRequest, OcrError> {
    let wire: WireRequest = serde_json::from_slice(body)
        .map_err(|e| OcrError::malformed(format!("invalid request JSON: {e}")))?;

    let encoded = match (wire.content, wire.image) {
        (Some(c), None) | (None, Some(c)) => c,
        (Some(_), Some(_)) => {
            return Err(OcrError::malformed("set either 'content' or 'image', not both"))
        }
        (None, None) => return Err(OcrError::malformed("missing 'content' field")),
    };
    let content = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| OcrError::malformed(format!("content is not valid base64: {e}")))?;

    let media_type = wire
        .content_type
        .as_deref()
        .map(MediaType::from_str)
        .transpose()?;

    let page_range = wire
        .page_range
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(PageRange::from_str)
        .transpose()?;

    let defaults = RequestOptions::default();
    let options = RequestOptions {
        max_output_tokens: wire.max_output_tokens.unwrap_or(default_max_output_tokens),
        include_images: wire.include_images.unwrap_or(defaults.include_images),
        include_headers_footers: wire
            .include_headers_footers
            .unwrap_or(defaults.include_headers_footers),
        page_range,
    };

    debug!(
        bytes = content.len(),
        media_type = ?media_type,
        "Decoded wire request"
    );
    Ok(RawRequest::new(content, media_type, options))
}

//! Error types for the layout-ocr-serve library.
//!
//! Every failure in the request pipeline is an [`OcrError`]. Each variant maps
//! to exactly one machine-readable [`ErrorKind`], which is what callers see in
//! the error envelope (see [`crate::output::ErrorBody`]).
//!
//! The kinds fall into three groups:
//!
//! * **Client input**: [`ErrorKind::MalformedInput`], [`ErrorKind::EmptyDocument`].
//!   Resending the same payload will fail the same way.
//! * **Process condition**: [`ErrorKind::AcceleratorUnavailable`]. The worker
//!   has no usable GPU; it must be restarted on different hardware.
//! * **Resource bound**: [`ErrorKind::ResourceExhausted`],
//!   [`ErrorKind::TimeoutExceeded`]. The caller may retry with a smaller input
//!   or a longer deadline.
//!
//! Nothing inside the pipeline retries. Retrying is the caller's decision.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// All errors produced by the inference pipeline.
///
/// The type is `Clone` because a failed model load is recorded once and
/// re-raised to every request that waits on the lifecycle afterwards.
#[derive(Debug, Clone, Error)]
pub enum OcrError {
    // ── Client input ──────────────────────────────────────────────────────
    /// The payload could not be decoded as the declared media type, or the
    /// wire request itself was malformed.
    #[error("Malformed input: {detail}")]
    MalformedInput { detail: String },

    /// The requested page range resolved to zero pages.
    #[error("Document has no pages in the requested range (document has {total} pages)")]
    EmptyDocument { total: usize },

    // ── Accelerator ───────────────────────────────────────────────────────
    /// No usable GPU at model-load time. Terminal for the process.
    #[error("GPU accelerator unavailable: {detail}\nRestart the worker on a GPU instance.")]
    AcceleratorUnavailable { detail: String },

    /// The accelerator ran out of memory during the forward pass.
    #[error("Accelerator memory exhausted: {detail}\nRetry with fewer pages per batch or a smaller page size.")]
    ResourceExhausted { detail: String },

    /// The forward pass did not finish within its wall-clock budget.
    #[error("Inference exceeded its {budget_ms}ms deadline")]
    TimeoutExceeded { budget_ms: u64 },

    // ── Model ─────────────────────────────────────────────────────────────
    /// Loading the model weights failed for a reason other than a missing GPU.
    #[error("Model load failed: {detail}")]
    ModelLoadFailed { detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OcrError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        OcrError::MalformedInput {
            detail: detail.into(),
        }
    }

    /// Machine-readable kind used in the error envelope.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OcrError::MalformedInput { .. } => ErrorKind::MalformedInput,
            OcrError::EmptyDocument { .. } => ErrorKind::EmptyDocument,
            OcrError::AcceleratorUnavailable { .. } => ErrorKind::AcceleratorUnavailable,
            OcrError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            OcrError::TimeoutExceeded { .. } => ErrorKind::TimeoutExceeded,
            OcrError::ModelLoadFailed { .. }
            | OcrError::InvalidConfig(_)
            | OcrError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// The machine-readable error taxonomy exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedInput,
    EmptyDocument,
    AcceleratorUnavailable,
    ResourceExhausted,
    TimeoutExceeded,
    Internal,
}

impl ErrorKind {
    /// HTTP status the serving surface answers with for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::MalformedInput | ErrorKind::EmptyDocument => 400,
            ErrorKind::AcceleratorUnavailable | ErrorKind::ResourceExhausted => 503,
            ErrorKind::TimeoutExceeded => 504,
            ErrorKind::Internal => 500,
        }
    }

    /// What the caller can do about it. `None` when retrying cannot help.
    pub fn retry_hint(self) -> Option<&'static str> {
        match self {
            ErrorKind::ResourceExhausted => {
                Some("retry with fewer pages per request or smaller page images")
            }
            ErrorKind::TimeoutExceeded => {
                Some("retry with a longer deadline or fewer pages per request")
            }
            ErrorKind::MalformedInput
            | ErrorKind::EmptyDocument
            | ErrorKind::AcceleratorUnavailable
            | ErrorKind::Internal => None,
        }
    }

    pub fn is_client_error(self) -> bool {
        matches!(self, ErrorKind::MalformedInput | ErrorKind::EmptyDocument)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MalformedInput => "malformed_input",
            ErrorKind::EmptyDocument => "empty_document",
            ErrorKind::AcceleratorUnavailable => "accelerator_unavailable",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::TimeoutExceeded => "timeout_exceeded",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display() {
        let e = OcrError::TimeoutExceeded { budget_ms: 5000 };
        assert!(e.to_string().contains("5000ms"), "got: {e}");
        assert_eq!(e.kind(), ErrorKind::TimeoutExceeded);
    }

    #[test]
    fn internal_variants_share_a_kind() {
        assert_eq!(
            OcrError::ModelLoadFailed {
                detail: "weights".into()
            }
            .kind(),
            ErrorKind::Internal
        );
        assert_eq!(OcrError::InvalidConfig("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn kind_serialises_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AcceleratorUnavailable).unwrap();
        assert_eq!(json, "\"accelerator_unavailable\"");
        assert_eq!(ErrorKind::AcceleratorUnavailable.to_string(), "accelerator_unavailable");
    }

    #[test]
    fn retry_hints_only_for_resource_bounds() {
        assert!(ErrorKind::ResourceExhausted.retry_hint().is_some());
        assert!(ErrorKind::TimeoutExceeded.retry_hint().is_some());
        assert!(ErrorKind::MalformedInput.retry_hint().is_none());
        assert!(ErrorKind::AcceleratorUnavailable.retry_hint().is_none());
    }

    #[test]
    fn client_errors_are_400() {
        assert_eq!(ErrorKind::EmptyDocument.http_status(), 400);
        assert!(ErrorKind::EmptyDocument.is_client_error());
        assert_eq!(ErrorKind::TimeoutExceeded.http_status(), 504);
    }

    #[test]
    fn only_bad_requests_are_client_errors() {
        let kinds = [
            ErrorKind::MalformedInput,
            ErrorKind::EmptyDocument,
            ErrorKind::AcceleratorUnavailable,
            ErrorKind::ResourceExhausted,
            ErrorKind::TimeoutExceeded,
            ErrorKind::Internal,
        ];
        for kind in kinds {
            assert_eq!(kind.is_client_error(), kind.http_status() == 400, "{kind}");
        }
        assert!(!OcrError::TimeoutExceeded { budget_ms: 1 }.kind().is_client_error());
        assert!(OcrError::malformed("bad").kind().is_client_error());
    }
}

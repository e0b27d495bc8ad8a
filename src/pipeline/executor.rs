//! Inference execution: one bounded forward pass per batch.
//!
//! The executor is the only stage that touches the model. It enforces the
//! wall-clock deadline, classifies accelerator failures, checks that the
//! model answered once per page, and hands cached accelerator memory back
//! after every pass so fragmentation does not accumulate across requests.
//!
//! Nothing here retries. A timed-out or out-of-memory batch fails its own
//! request; the model stays `Ready` for the next one.

use crate::error::OcrError;
use crate::pipeline::batch::Batch;
use crate::pipeline::lifecycle::ModelLifecycle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Raw model output for one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawGeneration {
    pub text: String,
    pub completion_tokens: usize,
    pub prompt_tokens: usize,
}

/// Whether an error message describes accelerator memory exhaustion.
pub fn is_out_of_memory(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("out of memory") || m.contains("outofmemory") || m.contains("cuda oom")
}

/// Run `batch` through the model within `deadline`.
///
/// Waits for the model to be ready first; the deadline covers only the
/// forward pass. A zero deadline admits no forward pass at all.
pub async fn execute(
    lifecycle: &ModelLifecycle,
    batch: &Batch,
    max_output_tokens: usize,
    deadline: Duration,
) -> Result<Vec<RawGeneration>, OcrError> {
    let model = lifecycle.ensure_ready().await?;
    let budget_ms = deadline.as_millis() as u64;

    if deadline.is_zero() {
        warn!(pages = batch.len(), "Zero inference deadline; rejecting batch");
        return Err(OcrError::TimeoutExceeded { budget_ms });
    }

    let started = Instant::now();
    let outcome = tokio::time::timeout(deadline, model.generate(batch, max_output_tokens)).await;
    model.release_cached_memory().await;

    let generations = match outcome {
        Err(_) => {
            warn!(
                pages = ?batch.indices(),
                budget_ms,
                "Forward pass exceeded deadline"
            );
            return Err(OcrError::TimeoutExceeded { budget_ms });
        }
        Ok(Err(e)) => return Err(classify(e)),
        Ok(Ok(g)) => g,
    };

    if generations.len() != batch.len() {
        return Err(OcrError::Internal(format!(
            "model returned {} generations for a batch of {} pages",
            generations.len(),
            batch.len()
        )));
    }

    debug!(
        pages = ?batch.indices(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        completion_tokens = generations.iter().map(|g| g.completion_tokens).sum::<usize>(),
        "Forward pass complete"
    );
    Ok(generations)
}

fn classify(err: OcrError) -> OcrError {
    match err {
        OcrError::Internal(ref msg) | OcrError::ModelLoadFailed { detail: ref msg }
            if is_out_of_memory(msg) =>
        {
            OcrError::ResourceExhausted {
                detail: msg.clone(),
            }
        }
        other => other,
    }
}

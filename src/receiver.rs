//! Request handling: drive one request through the pipeline.
//!
//! [`OcrService::handle`] is the only externally callable pipeline surface.
//! It never returns an error: every failure is caught exactly once here and
//! turned into an error envelope with a machine-readable kind.
//!
//! ## GPU serialisation
//!
//! One process owns one model on one device. Batches from concurrent
//! requests queue on an async mutex; at most one forward pass runs at a
//! time.

use crate::backend::VllmLoader;
use crate::config::ServiceConfig;
use crate::error::OcrError;
use crate::output::{PageResult, ResponseEnvelope};
use crate::pipeline::batch::{self, Batch};
use crate::pipeline::executor::{self, RawGeneration};
use crate::pipeline::format;
use crate::pipeline::input::{decode_wire, RawRequest};
use crate::pipeline::lifecycle::{ModelLifecycle, NvidiaSmiProbe};
use crate::pipeline::normalize::normalize;
use crate::pipeline::render::{PdfRasterizer, PdfiumRasterizer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// The inference service: configuration, the shared model and a rasteriser.
pub struct OcrService {
    config: Arc<ServiceConfig>,
    lifecycle: Arc<ModelLifecycle>,
    rasterizer: Arc<dyn PdfRasterizer>,
    gpu: Mutex<()>,
    next_request_id: AtomicU64,
}

impl OcrService {
    pub fn new(
        config: ServiceConfig,
        lifecycle: Arc<ModelLifecycle>,
        rasterizer: Arc<dyn PdfRasterizer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            lifecycle,
            rasterizer,
            gpu: Mutex::new(()),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Wire the production collaborators: `nvidia-smi`, vLLM and pdfium.
    pub fn from_config(config: ServiceConfig) -> Result<Self, OcrError> {
        let loader = VllmLoader::new(&config)?;
        let lifecycle = ModelLifecycle::new(&config, Arc::new(NvidiaSmiProbe), Arc::new(loader));
        let rasterizer = PdfiumRasterizer::new(config.pdfium_lib_path.clone());
        Ok(Self::new(config, Arc::new(lifecycle), Arc::new(rasterizer)))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<ModelLifecycle> {
        &self.lifecycle
    }

    /// Decode a JSON wire request and handle it.
    pub async fn handle_wire(&self, body: &[u8]) -> ResponseEnvelope {
        match decode_wire(body, self.config.default_max_output_tokens) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(kind = %e.kind(), "Rejected wire request: {e}");
                ResponseEnvelope::failure(&e)
            }
        }
    }

    /// Handle one request end to end.
    pub async fn handle(&self, request: RawRequest) -> ResponseEnvelope {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("request", id = request_id);
        async move {
            let started = Instant::now();
            match self.run(request, started).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    let kind = e.kind();
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    if kind.is_client_error() {
                        warn!(%kind, elapsed_ms, "Request rejected: {e}");
                    } else {
                        error!(%kind, elapsed_ms, "Request failed: {e}");
                    }
                    ResponseEnvelope::failure(&e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        request: RawRequest,
        started: Instant,
    ) -> Result<ResponseEnvelope, OcrError> {
        let cfg = Arc::clone(&self.config);
        request.options.validate()?;
        let media_type = request.resolve_media_type()?;

        let cold_start = !self.lifecycle.is_ready();
        if cold_start {
            info!(state = ?self.lifecycle.state(), "Cold start: model not resident");
        } else {
            debug!("Warm request");
        }

        // ── Step 1: Normalise ────────────────────────────────────────────
        let RawRequest {
            content, options, ..
        } = request;
        info!(bytes = content.len(), %media_type, "Normalising input");
        let doc = normalize(
            content,
            media_type,
            options.page_range.clone(),
            cfg.pdf_dpi,
            cfg.max_dimension,
            Arc::clone(&self.rasterizer),
        )
        .await?;
        let total_pages = doc.total_pages;
        debug!(
            selected = doc.pages.len(),
            total_pages, "Normalised pages"
        );

        // ── Step 2: Batch ────────────────────────────────────────────────
        let batches = batch::partition(doc.pages, cfg.max_batch_size);

        // ── Step 3: Wait for the model ───────────────────────────────────
        self.lifecycle.ensure_ready().await?;

        // ── Step 4: Execute, one batch at a time ─────────────────────────
        let inference_start = Instant::now();
        let mut executed: Vec<(Batch, Vec<RawGeneration>)> = Vec::with_capacity(batches.len());
        {
            let _gpu = self.gpu.lock().await;
            for batch in batches {
                let generations = executor::execute(
                    &self.lifecycle,
                    &batch,
                    options.max_output_tokens,
                    cfg.inference_timeout(),
                )
                .await?;
                executed.push((batch, generations));
            }
        }
        let inference_ms = inference_start.elapsed().as_millis() as u64;

        // ── Step 5: Format ───────────────────────────────────────────────
        let format_cfg = Arc::clone(&cfg);
        let pages: Vec<PageResult> = tokio::task::spawn_blocking(move || {
            executed
                .iter()
                .flat_map(|(batch, gens)| batch.pages.iter().zip(gens))
                .map(|(page, generation)| {
                    format::format_page(generation, page, &options, format_cfg.bbox_scale)
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| OcrError::Internal(format!("Format task panicked: {e}")))??;

        let total_ms = started.elapsed().as_millis() as u64;
        let metadata = format::aggregate_metadata(
            &pages,
            total_pages,
            cold_start,
            self.lifecycle.model_id(),
            inference_ms,
            total_ms,
        );
        info!(
            pages = metadata.page_count,
            completion_tokens = metadata.completion_tokens,
            inference_ms,
            total_ms,
            cold_start,
            "Request complete"
        );
        Ok(ResponseEnvelope::success(pages, metadata))
    }
}

impl std::fmt::Debug for OcrService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrService")
            .field("config", &self.config)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

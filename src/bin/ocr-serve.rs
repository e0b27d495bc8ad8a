//! Server binary for layout-ocr-serve.
//!
//! A thin shim over the library crate that maps CLI flags and `OCR_*`
//! environment variables to `ServiceConfig` and serves `/ping` and
//! `/invocations` on the managed-endpoint port.

use anyhow::{Context, Result};
use clap::Parser;
use layout_ocr_serve::{http, ActivationStrategy, OcrService, Precision, ServiceConfig};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve on the default port, loading the model on the first request
  ocr-serve

  # Load at startup; /ping answers 503 until the model is ready
  ocr-serve --preload

  # Point at a model server on another host
  ocr-serve --backend-url http://10.0.0.5:8000/v1 --served-model-name chandra

WIRE FORMAT (POST /invocations):
  {"content": "<base64>", "content_type": "pdf", "page_range": "0-2",
   "max_output_tokens": 4096, "include_images": true,
   "include_headers_footers": false}

ENVIRONMENT VARIABLES:
  OCR_LISTEN_ADDR        Listen address (default 0.0.0.0:8080)
  OCR_BACKEND_URL        OpenAI-compatible model server base URL
  OCR_BACKEND_API_KEY    Bearer token for the model server
  OCR_PRELOAD            Load the model at startup
  PDFIUM_LIB_PATH        Path to libpdfium (file or directory)
  RUST_LOG               Log filter, e.g. layout_ocr_serve=debug
"#;

/// Serve a layout OCR model behind a managed inference endpoint.
#[derive(Parser, Debug)]
#[command(
    name = "ocr-serve",
    version,
    about = "Serve a layout OCR vision-language model over HTTP",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "OCR_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Longest page edge fed to the model, in pixels.
    #[arg(long, env = "OCR_MAX_DIMENSION", default_value_t = 2048)]
    max_dimension: u32,

    /// PDF rendering DPI (72–400).
    #[arg(long, env = "OCR_DPI", default_value_t = 192,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Pages per forward pass.
    #[arg(long, env = "OCR_MAX_BATCH_SIZE", default_value_t = 1)]
    max_batch_size: usize,

    /// Worst-case accelerator memory one batch may claim, in MiB.
    #[arg(long, env = "OCR_MEMORY_BUDGET_MB", default_value_t = 8192)]
    memory_budget_mb: u64,

    /// Forward-pass deadline in milliseconds (0 rejects every pass).
    #[arg(long, env = "OCR_INFERENCE_TIMEOUT_MS", default_value_t = 55_000)]
    inference_timeout_ms: u64,

    /// Default max output tokens per page.
    #[arg(long, env = "OCR_MAX_OUTPUT_TOKENS", default_value_t = 4096)]
    max_output_tokens: usize,

    /// Scale the model's bounding boxes are normalized to.
    #[arg(long, env = "OCR_BBOX_SCALE", default_value_t = 1024)]
    bbox_scale: u32,

    /// Model checkpoint.
    #[arg(long, env = "OCR_MODEL_ID", default_value = "datalab-to/chandra")]
    model_id: String,

    /// Weight precision: bf16, fp16, fp32.
    #[arg(long, env = "OCR_PRECISION", default_value = "bf16")]
    precision: Precision,

    /// Keep every activation resident instead of recomputing.
    #[arg(long, env = "OCR_FULL_ACTIVATIONS")]
    full_activations: bool,

    /// Load the model at startup instead of on the first request.
    #[arg(long, env = "OCR_PRELOAD")]
    preload: bool,

    /// OpenAI-compatible model server base URL.
    #[arg(long, env = "OCR_BACKEND_URL", default_value = "http://localhost:8000/v1")]
    backend_url: String,

    /// Name the model server serves the checkpoint under.
    #[arg(long, env = "OCR_SERVED_MODEL_NAME", default_value = "chandra")]
    served_model_name: String,

    /// Bearer token for the model server.
    #[arg(long, env = "OCR_BACKEND_API_KEY", hide_env_values = true)]
    backend_api_key: Option<String>,

    /// Seconds to wait for the model server to come up.
    #[arg(long, env = "OCR_LOAD_TIMEOUT_SECS", default_value_t = 1800)]
    load_timeout_secs: u64,

    /// Path to libpdfium (file or containing directory).
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OCR_VERBOSE")]
    verbose: bool,
}

impl Cli {
    fn to_config(&self) -> Result<ServiceConfig> {
        let mut builder = ServiceConfig::builder()
            .max_dimension(self.max_dimension)
            .pdf_dpi(self.dpi)
            .max_batch_size(self.max_batch_size)
            .memory_budget_mb(self.memory_budget_mb)
            .inference_timeout_ms(self.inference_timeout_ms)
            .default_max_output_tokens(self.max_output_tokens)
            .bbox_scale(self.bbox_scale)
            .model_id(&self.model_id)
            .precision(self.precision)
            .activation(if self.full_activations {
                ActivationStrategy::Full
            } else {
                ActivationStrategy::GradientCheckpointing
            })
            .preload(self.preload)
            .backend_url(&self.backend_url)
            .served_model_name(&self.served_model_name)
            .load_timeout_secs(self.load_timeout_secs);
        if let Some(ref key) = self.backend_api_key {
            builder = builder.backend_api_key(key);
        }
        if let Some(ref path) = self.pdfium_lib_path {
            builder = builder.pdfium_lib_path(path);
        }
        builder.build().context("Invalid configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Service ──────────────────────────────────────────────────────────
    let config = cli.to_config()?;
    info!(
        model_id = %config.model_id,
        backend = %config.backend_url,
        max_batch_size = config.max_batch_size,
        inference_timeout_ms = config.inference_timeout_ms,
        preload = config.preload,
        "Starting ocr-serve"
    );
    let service = Arc::new(OcrService::from_config(config).context("Failed to build service")?);

    if service.config().preload {
        let lifecycle = Arc::clone(service.lifecycle());
        tokio::spawn(async move {
            if let Err(e) = lifecycle.ensure_ready().await {
                error!("Preload failed: {e}");
            }
        });
    }

    // ── Serve ────────────────────────────────────────────────────────────
    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, http::router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;
    Ok(())
}

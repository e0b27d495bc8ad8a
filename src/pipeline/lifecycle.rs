//! Model residency: the single model instance and its readiness state.
//!
//! ```text
//! Unloaded ──▶ Loading ──▶ Ready
//!                  │
//!                  └─────▶ Failed   (terminal)
//! ```
//!
//! ## Single-flight loading
//!
//! The first call to [`ModelLifecycle::ensure_ready`] spawns the load on a
//! detached tokio task that owns its own handles to the probe and loader.
//! Every caller then waits on a `tokio::sync::watch` channel for that task's
//! outcome. The loader runs at most once per lifecycle and every waiter sees
//! the same result, including a failure. A caller dropped mid-load does not
//! touch the running load.
//!
//! There is no unload path: once `Ready`, the model stays resident for the
//! life of the process.

use crate::config::{ActivationStrategy, Precision, ServiceConfig};
use crate::error::OcrError;
use crate::pipeline::batch::Batch;
use crate::pipeline::executor::RawGeneration;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Readiness of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ModelState {
    Unloaded = 0,
    Loading = 1,
    Ready = 2,
    Failed = 3,
}

impl ModelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ModelState::Loading,
            2 => ModelState::Ready,
            3 => ModelState::Failed,
            _ => ModelState::Unloaded,
        }
    }
}

/// The accelerator a model was (or will be) placed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceleratorInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_version: Option<String>,
}

/// Everything a [`ModelLoader`] needs to place the model.
#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub model_id: String,
    pub precision: Precision,
    pub activation: ActivationStrategy,
    pub device: AcceleratorInfo,
}

/// Answers "is there a usable GPU, and which one?".
#[async_trait]
pub trait AcceleratorProbe: Send + Sync {
    /// `None` when no usable accelerator is present.
    async fn detect(&self) -> Option<AcceleratorInfo>;
}

/// Places the model on the accelerator.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, settings: &LoadSettings) -> Result<Arc<dyn OcrModel>, OcrError>;
}

/// A resident model that can run forward passes.
#[async_trait]
pub trait OcrModel: Send + Sync {
    /// Run one forward pass. Must return exactly one generation per page,
    /// in batch order.
    async fn generate(
        &self,
        batch: &Batch,
        max_output_tokens: usize,
    ) -> Result<Vec<RawGeneration>, OcrError>;

    /// Return cached accelerator memory to the allocator. Called after
    /// every forward pass, successful or not.
    async fn release_cached_memory(&self) {}
}

#[derive(Clone)]
struct LoadedModel {
    model: Arc<dyn OcrModel>,
    device: AcceleratorInfo,
}

/// `None` until the load task has finished.
type LoadOutcome = Option<Result<LoadedModel, OcrError>>;

/// Owns the single model instance for the process.
///
/// Shared by every request as `Arc<ModelLifecycle>`.
pub struct ModelLifecycle {
    model_id: String,
    precision: Precision,
    activation: ActivationStrategy,
    probe: Arc<dyn AcceleratorProbe>,
    loader: Arc<dyn ModelLoader>,
    state: Arc<AtomicU8>,
    started: AtomicBool,
    outcome: Arc<watch::Sender<LoadOutcome>>,
}

impl ModelLifecycle {
    pub fn new(
        config: &ServiceConfig,
        probe: Arc<dyn AcceleratorProbe>,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            model_id: config.model_id.clone(),
            precision: config.precision,
            activation: config.activation,
            probe,
            loader,
            state: Arc::new(AtomicU8::new(ModelState::Unloaded as u8)),
            started: AtomicBool::new(false),
            outcome: Arc::new(outcome),
        }
    }

    pub fn state(&self) -> ModelState {
        ModelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The accelerator the model was loaded on, once `Ready`.
    pub fn device(&self) -> Option<AcceleratorInfo> {
        match &*self.outcome.borrow() {
            Some(Ok(loaded)) => Some(loaded.device.clone()),
            _ => None,
        }
    }

    /// Wait until the model is resident and return it.
    ///
    /// The first caller starts the load on a detached task; every caller,
    /// the first included, waits on that task's outcome. Dropping a waiter
    /// never cancels or restarts the load. Once the load has failed, every
    /// call returns the same error without probing or loading again.
    pub async fn ensure_ready(&self) -> Result<Arc<dyn OcrModel>, OcrError> {
        let mut rx = self.outcome.subscribe();
        if !self.started.swap(true, Ordering::AcqRel) {
            self.spawn_load();
        }

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(loaded)) => Ok(loaded.model),
            Some(Err(e)) => Err(e),
            None => Err(OcrError::Internal("model load ended without an outcome".into())),
        }
    }

    fn spawn_load(&self) {
        self.state.store(ModelState::Loading as u8, Ordering::Release);
        let job = LoadJob {
            model_id: self.model_id.clone(),
            precision: self.precision,
            activation: self.activation,
            probe: Arc::clone(&self.probe),
            loader: Arc::clone(&self.loader),
            state: Arc::clone(&self.state),
        };
        let outcome = Arc::clone(&self.outcome);
        let model_id = self.model_id.clone();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let result = match tokio::spawn(job.run()).await {
                Ok(result) => result,
                Err(e) => {
                    state.store(ModelState::Failed as u8, Ordering::Release);
                    error!(model_id = %model_id, "Model load task aborted: {e}");
                    Err(OcrError::ModelLoadFailed {
                        detail: format!("load task aborted: {e}"),
                    })
                }
            };
            outcome.send_replace(Some(result));
        });
    }
}

impl std::fmt::Debug for ModelLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLifecycle")
            .field("model_id", &self.model_id)
            .field("state", &self.state())
            .finish()
    }
}

/// One probe-then-load run, owned by the detached load task.
struct LoadJob {
    model_id: String,
    precision: Precision,
    activation: ActivationStrategy,
    probe: Arc<dyn AcceleratorProbe>,
    loader: Arc<dyn ModelLoader>,
    state: Arc<AtomicU8>,
}

impl LoadJob {
    async fn run(self) -> Result<LoadedModel, OcrError> {
        let started = Instant::now();
        info!(model_id = %self.model_id, "Loading model");

        let result = self.probe_and_load().await;
        match &result {
            Ok(loaded) => {
                self.set_state(ModelState::Ready);
                info!(
                    model_id = %self.model_id,
                    device = %loaded.device.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model ready"
                );
            }
            Err(e) => {
                self.set_state(ModelState::Failed);
                error!(model_id = %self.model_id, "Model load failed: {e}");
            }
        }
        result
    }

    async fn probe_and_load(&self) -> Result<LoadedModel, OcrError> {
        let device = self.probe.detect().await.ok_or_else(|| {
            OcrError::AcceleratorUnavailable {
                detail: "no CUDA-capable GPU detected".into(),
            }
        })?;
        info!(
            "GPU detected: {} ({} MiB)",
            device.name,
            device.memory_mb.map_or("?".to_string(), |m| m.to_string())
        );

        let settings = LoadSettings {
            model_id: self.model_id.clone(),
            precision: self.precision,
            activation: self.activation,
            device: device.clone(),
        };
        debug!(?settings, "Invoking model loader");
        let model = self.loader.load(&settings).await?;
        Ok(LoadedModel { model, device })
    }

    fn set_state(&self, state: ModelState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

// ── nvidia-smi probe ─────────────────────────────────────────────────────

/// [`AcceleratorProbe`] that asks `nvidia-smi` for the first GPU.
#[derive(Debug, Clone, Default)]
pub struct NvidiaSmiProbe;

#[async_trait]
impl AcceleratorProbe for NvidiaSmiProbe {
    async fn detect(&self) -> Option<AcceleratorInfo> {
        let output = tokio::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=name,memory.total,driver_version",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                debug!("nvidia-smi exited with {}", out.status);
                None
            }
            Err(e) => {
                debug!("nvidia-smi not runnable: {e}");
                None
            }
        }
    }
}

/// Parse the first line of `nvidia-smi --query-gpu=name,memory.total,driver_version`.
pub fn parse_nvidia_smi(stdout: &str) -> Option<AcceleratorInfo> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut fields = line.split(',').map(str::trim);
    let name = fields.next().filter(|n| !n.is_empty())?.to_string();
    let memory_mb = fields.next().and_then(|m| m.parse().ok());
    let driver_version = fields.next().filter(|d| !d.is_empty()).map(str::to_string);
    Some(AcceleratorInfo {
        name,
        memory_mb,
        driver_version,
    })
}

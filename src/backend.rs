//! Model backend: a vLLM server speaking the OpenAI chat-completions API.
//!
//! The model itself runs in a separate vLLM process on the same GPU host,
//! launched with the settings [`launch_args`] describes (bf16 weights, 90 %
//! of device memory, served under a short model name). This module is the
//! in-process side of that arrangement:
//!
//! * [`VllmLoader`] implements [`ModelLoader`]: "loading" means waiting until
//!   the server lists the served model under `GET {base}/models`.
//! * [`VllmModel`] implements [`OcrModel`]: one chat-completions request per
//!   page carrying the page as an inline PNG data URI and the layout prompt.
//!
//! Pages of a batch are sent concurrently; vLLM batches them on the device.
//! No request is retried here.

use crate::config::{ActivationStrategy, ServiceConfig};
use crate::error::OcrError;
use crate::pipeline::batch::Batch;
use crate::pipeline::encode::png_data_uri;
use crate::pipeline::executor::{is_out_of_memory, RawGeneration};
use crate::pipeline::lifecycle::{LoadSettings, ModelLoader, OcrModel};
use crate::prompts::layout_prompt;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Fraction of device memory the model server may claim.
pub const GPU_MEMORY_UTILIZATION: f32 = 0.9;

/// Context window the model server is launched with.
pub const MAX_MODEL_LEN: usize = 32_768;

/// `vllm serve` arguments matching `settings` and `served_model_name`.
///
/// Logged while waiting for the server so operators can compare it with
/// how the server was actually started.
pub fn launch_args(settings: &LoadSettings, served_model_name: &str) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        settings.model_id.clone(),
        "--dtype".to_string(),
        settings.precision.as_dtype().to_string(),
        "--max-model-len".to_string(),
        MAX_MODEL_LEN.to_string(),
        "--gpu-memory-utilization".to_string(),
        GPU_MEMORY_UTILIZATION.to_string(),
        "--served-model-name".to_string(),
        served_model_name.to_string(),
    ];
    // No checkpointing switch in vLLM; eager mode skips CUDA-graph memory.
    if settings.activation == ActivationStrategy::GradientCheckpointing {
        args.push("--enforce-eager".to_string());
    }
    args
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    ImageUrl { image_url: ImageUrl },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

fn chat_body(
    model: &str,
    image_data_uri: String,
    prompt: &str,
    max_tokens: usize,
) -> Result<serde_json::Value, OcrError> {
    let request = ChatRequest {
        model,
        messages: vec![ChatMessage {
            role: "user",
            content: vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_data_uri,
                    },
                },
                ContentPart::Text { text: prompt },
            ],
        }],
        max_tokens,
        temperature: 0.0,
        top_p: 0.1,
    };
    serde_json::to_value(&request)
        .map_err(|e| OcrError::Internal(format!("could not serialise chat request: {e}")))
}

// ── Shared HTTP plumbing ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Endpoint {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl Endpoint {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, OcrError> {
        let response = self
            .authorize(self.client.get(self.url("models")))
            .send()
            .await
            .map_err(|e| OcrError::Internal(format!("model server unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(OcrError::Internal(format!(
                "model list returned HTTP {}",
                response.status()
            )));
        }
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| OcrError::Internal(format!("invalid model list: {e}")))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    async fn complete(&self, body: serde_json::Value) -> Result<RawGeneration, OcrError> {
        let response = self
            .authorize(self.client.post(self.url("chat/completions")))
            .json(&body)
            .send()
            .await
            .map_err(|e| OcrError::Internal(format!("chat completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if is_out_of_memory(&text) {
                return Err(OcrError::ResourceExhausted { detail: text });
            }
            return Err(OcrError::Internal(format!(
                "model server returned HTTP {status}: {text}"
            )));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| OcrError::Internal(format!("invalid chat completion: {e}")))?;
        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OcrError::Internal("chat completion has no content".into()))?;
        let usage = completion.usage.unwrap_or_default();
        Ok(RawGeneration {
            text,
            completion_tokens: usage.completion_tokens,
            prompt_tokens: usage.prompt_tokens,
        })
    }
}

// ── Loader ───────────────────────────────────────────────────────────────

/// [`ModelLoader`] that waits for a vLLM server to serve the model.
#[derive(Debug, Clone)]
pub struct VllmLoader {
    endpoint: Endpoint,
    served_model_name: String,
    bbox_scale: u32,
    load_timeout: Duration,
    poll_interval: Duration,
}

impl VllmLoader {
    pub fn new(config: &ServiceConfig) -> Result<Self, OcrError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OcrError::Internal(format!("could not build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: Endpoint {
                client,
                base_url: config.backend_url.clone(),
                api_key: config.backend_api_key.clone(),
            },
            served_model_name: config.served_model_name.clone(),
            bbox_scale: config.bbox_scale,
            load_timeout: config.load_timeout(),
            poll_interval: Duration::from_secs(2),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl ModelLoader for VllmLoader {
    async fn load(&self, settings: &LoadSettings) -> Result<Arc<dyn OcrModel>, OcrError> {
        info!(
            base_url = %self.endpoint.base_url,
            device = %settings.device.name,
            "Waiting for model server: vllm serve {}",
            launch_args(settings, &self.served_model_name).join(" ")
        );

        let started = Instant::now();
        let mut warned = false;
        loop {
            match self.endpoint.list_models().await {
                Ok(ids) if ids.iter().any(|id| id == &self.served_model_name) => break,
                Ok(ids) => {
                    if !warned {
                        warn!(
                            "Model server is up but serves {:?}, not '{}'",
                            ids, self.served_model_name
                        );
                        warned = true;
                    }
                }
                Err(e) => debug!("Model server not ready yet: {e}"),
            }
            if started.elapsed() >= self.load_timeout {
                return Err(OcrError::ModelLoadFailed {
                    detail: format!(
                        "model server at {} did not serve '{}' within {}s",
                        self.endpoint.base_url,
                        self.served_model_name,
                        self.load_timeout.as_secs()
                    ),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        Ok(Arc::new(VllmModel {
            endpoint: self.endpoint.clone(),
            model_name: self.served_model_name.clone(),
            prompt: Arc::from(layout_prompt(self.bbox_scale)),
        }))
    }
}

// ── Model ────────────────────────────────────────────────────────────────

/// [`OcrModel`] backed by vLLM chat completions.
#[derive(Debug, Clone)]
pub struct VllmModel {
    endpoint: Endpoint,
    model_name: String,
    prompt: Arc<str>,
}

#[async_trait]
impl OcrModel for VllmModel {
    async fn generate(
        &self,
        batch: &Batch,
        max_output_tokens: usize,
    ) -> Result<Vec<RawGeneration>, OcrError> {
        let mut tasks = JoinSet::new();
        for (slot, page) in batch.pages.iter().enumerate() {
            let body = chat_body(
                &self.model_name,
                png_data_uri(&page.image)?,
                &self.prompt,
                max_output_tokens,
            )?;
            let endpoint = self.endpoint.clone();
            tasks.spawn(async move { (slot, endpoint.complete(body).await) });
        }

        let mut results: Vec<Option<RawGeneration>> = vec![None; batch.len()];
        while let Some(joined) = tasks.join_next().await {
            let (slot, outcome) = joined
                .map_err(|e| OcrError::Internal(format!("generation task panicked: {e}")))?;
            results[slot] = Some(outcome?);
        }
        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| OcrError::Internal("missing generation for a page".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::pipeline::lifecycle::AcceleratorInfo;

    fn settings() -> LoadSettings {
        LoadSettings {
            model_id: "datalab-to/chandra".into(),
            precision: Precision::Bf16,
            activation: ActivationStrategy::GradientCheckpointing,
            device: AcceleratorInfo {
                name: "NVIDIA A10G".into(),
                memory_mb: Some(23028),
                driver_version: None,
            },
        }
    }

    #[test]
    fn launch_args_reflect_settings() {
        let args = launch_args(&settings(), "chandra").join(" ");
        assert!(args.contains("--dtype bfloat16"), "got: {args}");
        assert!(args.contains("--served-model-name chandra"));
        assert!(args.contains("--gpu-memory-utilization 0.9"));
        assert!(args.contains("--enforce-eager"));
    }

    #[test]
    fn chat_body_shape() {
        let body = chat_body("chandra", "data:image/png;base64,AAAA".into(), "OCR", 512).unwrap();
        assert_eq!(body["model"], "chandra");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["temperature"], 0.0);
        let content = &body["messages"][0]["content"];
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(content[0]["type"], "image_url");
        assert_eq!(content[0]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(content[1]["type"], "text");
        assert_eq!(content[1]["text"], "OCR");
    }

    #[test]
    fn completion_parsing_tolerates_missing_usage() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"<div></div>"}}]}"#;
        let c: ChatCompletion = serde_json::from_str(raw).unwrap();
        assert!(c.usage.is_none());
        assert_eq!(c.choices[0].message.content.as_deref(), Some("<div></div>"));
    }

    #[cfg(feature = "server")]
    mod against_stub_server {
        use super::*;
        use crate::pipeline::normalize::NormalizedPage;
        use axum::http::StatusCode;
        use axum::routing::{get, post};
        use axum::{Json, Router};
        use image::RgbImage;

        async fn spawn_stub(oom: bool) -> String {
            let app = Router::new()
                .route(
                    "/v1/models",
                    get(|| async { Json(serde_json::json!({"data": [{"id": "chandra"}]})) }),
                )
                .route(
                    "/v1/chat/completions",
                    post(move |Json(body): Json<serde_json::Value>| async move {
                        if oom {
                            return (
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "CUDA out of memory".to_string(),
                            );
                        }
                        let max = body["max_tokens"].as_u64().unwrap_or(0);
                        let content = format!("<div data-label=\"Text\">max={max}</div>");
                        let reply = serde_json::json!({
                            "choices": [{"message": {"content": content}}],
                            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
                        });
                        (StatusCode::OK, reply.to_string())
                    }),
                );
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("http://{addr}/v1")
        }

        fn config(base: &str) -> ServiceConfig {
            ServiceConfig::builder()
                .backend_url(base)
                .load_timeout_secs(2)
                .build()
                .unwrap()
        }

        fn batch(n: usize) -> Batch {
            Batch {
                pages: (0..n)
                    .map(|i| NormalizedPage {
                        index: i,
                        image: RgbImage::new(8, 8),
                        original_size: (8, 8),
                        source_bytes: 0,
                    })
                    .collect(),
            }
        }

        #[tokio::test]
        async fn loads_and_generates_in_order() {
            let base = spawn_stub(false).await;
            let loader = VllmLoader::new(&config(&base))
                .unwrap()
                .with_poll_interval(Duration::from_millis(10));
            let model = loader.load(&settings()).await.unwrap();
            let out = model.generate(&batch(3), 99).await.unwrap();
            assert_eq!(out.len(), 3);
            assert!(out.iter().all(|g| g.text.contains("max=99")));
            assert_eq!(out[0].completion_tokens, 3);
            assert_eq!(out[0].prompt_tokens, 7);
        }

        #[tokio::test]
        async fn server_oom_is_resource_exhausted() {
            let base = spawn_stub(true).await;
            let model = VllmLoader::new(&config(&base))
                .unwrap()
                .load(&settings())
                .await
                .unwrap();
            let err = model.generate(&batch(1), 10).await.err().unwrap();
            assert!(matches!(err, OcrError::ResourceExhausted { .. }), "got: {err}");
        }

        #[tokio::test]
        async fn unreachable_server_fails_load() {
            let loader = VllmLoader::new(&config("http://127.0.0.1:9/v1"))
                .unwrap()
                .with_poll_interval(Duration::from_millis(200));
            let err = loader.load(&settings()).await.err().unwrap();
            assert!(matches!(err, OcrError::ModelLoadFailed { .. }), "got: {err}");
        }
    }
}

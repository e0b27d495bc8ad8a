//! End-to-end pipeline tests with in-process fakes.
//!
//! The accelerator probe, model loader, model and PDF rasteriser are all
//! substituted, so these run without a GPU, a model server or libpdfium.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use layout_ocr_serve::pipeline::batch::Batch;
use layout_ocr_serve::pipeline::executor::RawGeneration;
use layout_ocr_serve::pipeline::render::resolve_selection;
use layout_ocr_serve::{
    AcceleratorInfo, AcceleratorProbe, ErrorKind, LoadSettings, MediaType, ModelLifecycle,
    ModelLoader, ModelState, OcrError, OcrModel, OcrService, PageRange, PdfRasterizer,
    RasterizedDocument, RawRequest, RequestOptions, ServiceConfig,
};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── Fakes ────────────────────────────────────────────────────────────────────

const FAKE_PDF: &[u8] = b"%PDF-1.7\n% synthetic\n";

/// Layout output for a page with a running header, body text and a figure.
const PAGE_WITH_FIGURE: &str = r#"<div data-bbox="[0, 0, 1024, 60]" data-label="Page-Header"><p>Internal draft</p></div>
<div data-bbox="[40, 80, 984, 200]" data-label="Text"><p>Quarterly revenue rose.</p></div>
<div data-bbox="[256, 256, 768, 768]" data-label="Figure"><img alt="Revenue by region"></div>"#;

struct Probe {
    available: bool,
    calls: AtomicUsize,
}

impl Probe {
    fn new(available: bool) -> Arc<Self> {
        Arc::new(Self {
            available,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AcceleratorProbe for Probe {
    async fn detect(&self) -> Option<AcceleratorInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.available.then(|| AcceleratorInfo {
            name: "Fake A10G".into(),
            memory_mb: Some(24_576),
            driver_version: None,
        })
    }
}

/// What the fake model produces for each page.
#[derive(Clone, Copy)]
enum Script {
    /// One text block naming the page index.
    PageIndex,
    /// [`PAGE_WITH_FIGURE`] for every page.
    Figure,
}

#[derive(Default)]
struct Observed {
    /// `(page index, width, height)` for every page the model saw.
    pages: Vec<(usize, u32, u32)>,
    batch_sizes: Vec<usize>,
}

struct FakeModel {
    script: Script,
    observed: Arc<Mutex<Observed>>,
}

#[async_trait]
impl OcrModel for FakeModel {
    async fn generate(
        &self,
        batch: &Batch,
        _max_output_tokens: usize,
    ) -> Result<Vec<RawGeneration>, OcrError> {
        {
            let mut seen = self.observed.lock().unwrap();
            seen.batch_sizes.push(batch.len());
            for page in &batch.pages {
                seen.pages.push((page.index, page.width(), page.height()));
            }
        }
        Ok(batch
            .pages
            .iter()
            .map(|page| RawGeneration {
                text: match self.script {
                    Script::PageIndex => format!(
                        r#"<div data-bbox="[0, 0, 1024, 1024]" data-label="Text"><p>page {}</p></div>"#,
                        page.index
                    ),
                    Script::Figure => PAGE_WITH_FIGURE.to_string(),
                },
                completion_tokens: 10,
                prompt_tokens: 100,
            })
            .collect())
    }
}

struct CountingLoader {
    loads: AtomicUsize,
    delay: Duration,
    script: Script,
    observed: Arc<Mutex<Observed>>,
}

impl CountingLoader {
    fn new(script: Script, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            delay,
            script,
            observed: Arc::new(Mutex::new(Observed::default())),
        })
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for CountingLoader {
    async fn load(&self, _settings: &LoadSettings) -> Result<Arc<dyn OcrModel>, OcrError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Arc::new(FakeModel {
            script: self.script,
            observed: Arc::clone(&self.observed),
        }))
    }
}

/// A "PDF" of `pages` letter-sized pages.
struct FakeRasterizer {
    pages: usize,
}

impl PdfRasterizer for FakeRasterizer {
    fn rasterize(
        &self,
        pdf: &[u8],
        selection: Option<&PageRange>,
        _dpi: u32,
        _max_dimension: u32,
    ) -> Result<RasterizedDocument, OcrError> {
        if !pdf.starts_with(b"%PDF") {
            return Err(OcrError::malformed("not a PDF"));
        }
        let pages = resolve_selection(selection, self.pages)?
            .into_iter()
            .map(|idx| {
                let shade = 40 * idx as u8;
                (
                    idx,
                    DynamicImage::ImageRgb8(RgbImage::from_pixel(
                        612,
                        792,
                        Rgb([shade, shade, shade]),
                    )),
                )
            })
            .collect();
        Ok(RasterizedDocument {
            total_pages: self.pages,
            pages,
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Route pipeline logs to the test harness; `RUST_LOG` selects the level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([250, 250, 250])))
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

fn lifecycle(
    config: &ServiceConfig,
    probe: Arc<Probe>,
    loader: Arc<CountingLoader>,
) -> Arc<ModelLifecycle> {
    Arc::new(ModelLifecycle::new(config, probe, loader))
}

fn service_with(config: ServiceConfig, lifecycle: Arc<ModelLifecycle>) -> OcrService {
    OcrService::new(config, lifecycle, Arc::new(FakeRasterizer { pages: 5 }))
}

fn service(script: Script) -> (OcrService, Arc<CountingLoader>) {
    let config = ServiceConfig::default();
    let loader = CountingLoader::new(script, Duration::ZERO);
    let lc = lifecycle(&config, Probe::new(true), Arc::clone(&loader));
    (service_with(config, lc), loader)
}

fn with_range(range: &str) -> RequestOptions {
    RequestOptions {
        page_range: Some(range.parse().unwrap()),
        ..Default::default()
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_image_strips_header_and_crops_figure() {
    init_tracing();
    let (svc, loader) = service(Script::Figure);
    let envelope = svc
        .handle(RawRequest::new(png(800, 600), None, RequestOptions::default()))
        .await;

    assert!(envelope.is_success(), "error: {:?}", envelope.error);
    assert_eq!(envelope.pages.len(), 1);
    let page = &envelope.pages[&0];

    assert!(!page.markdown.contains("Internal draft"), "got: {}", page.markdown);
    assert!(!page.html.contains("Internal draft"));
    assert!(page.markdown.contains("Quarterly revenue rose."));

    assert_eq!(page.images.len(), 1);
    let (name, crop) = page.images.iter().next().unwrap();
    let figure = page.layout.iter().find(|e| e.label == "Figure").unwrap();
    assert_eq!(figure.image.as_deref(), Some(name.as_str()));
    assert_eq!(crop.bbox, figure.bbox);
    assert_eq!(crop.bbox, [200, 150, 600, 450]);
    assert!(page.markdown.contains(&format!("![Revenue by region]({name})")));

    let meta = envelope.metadata.as_ref().unwrap();
    assert_eq!(meta.page_count, 1);
    assert_eq!(meta.total_pages, 1);
    assert_eq!(meta.image_count, 1);
    assert!(meta.cold_start);
    assert_eq!(loader.loads(), 1);
}

#[tokio::test]
async fn pdf_page_range_returns_only_selected_pages_in_order() {
    init_tracing();
    let (svc, _loader) = service(Script::PageIndex);
    let envelope = svc
        .handle(RawRequest::new(FAKE_PDF.to_vec(), None, with_range("2-3")))
        .await;

    assert!(envelope.is_success(), "error: {:?}", envelope.error);
    let keys: Vec<usize> = envelope.pages.keys().copied().collect();
    assert_eq!(keys, vec![2, 3]);
    assert_eq!(envelope.pages[&2].markdown, "page 2\n");
    assert_eq!(envelope.pages[&3].markdown, "page 3\n");
    let meta = envelope.metadata.as_ref().unwrap();
    assert_eq!(meta.page_count, 2);
    assert_eq!(meta.total_pages, 5);
}

#[tokio::test]
async fn zero_deadline_times_out_without_poisoning_the_model() {
    init_tracing();
    let strict = ServiceConfig::builder().inference_timeout_ms(0).build().unwrap();
    let normal = ServiceConfig::default();
    let loader = CountingLoader::new(Script::PageIndex, Duration::ZERO);
    let lc = lifecycle(&normal, Probe::new(true), Arc::clone(&loader));
    let strict_svc = service_with(strict, Arc::clone(&lc));
    let normal_svc = service_with(normal, Arc::clone(&lc));

    let failed = strict_svc
        .handle(RawRequest::new(png(64, 64), None, RequestOptions::default()))
        .await;
    assert_eq!(failed.error_kind(), Some(ErrorKind::TimeoutExceeded));
    assert!(failed.pages.is_empty());
    assert!(failed.metadata.is_none());
    assert_eq!(lc.state(), ModelState::Ready);

    let ok = normal_svc
        .handle(RawRequest::new(png(64, 64), None, RequestOptions::default()))
        .await;
    assert!(ok.is_success(), "error: {:?}", ok.error);
    assert!(!ok.metadata.as_ref().unwrap().cold_start);
    assert_eq!(loader.loads(), 1);
    // The rejected request never reached the model.
    assert_eq!(loader.observed.lock().unwrap().batch_sizes, vec![1]);
}

#[tokio::test]
async fn missing_accelerator_fails_every_request() {
    init_tracing();
    let config = ServiceConfig::default();
    let probe = Probe::new(false);
    let loader = CountingLoader::new(Script::PageIndex, Duration::ZERO);
    let lc = lifecycle(&config, Arc::clone(&probe), Arc::clone(&loader));
    let svc = service_with(config.clone(), lc);

    for _ in 0..3 {
        let envelope = svc
            .handle(RawRequest::new(png(64, 64), None, RequestOptions::default()))
            .await;
        assert_eq!(envelope.error_kind(), Some(ErrorKind::AcceleratorUnavailable));
        assert!(envelope.pages.is_empty());
    }
    assert_eq!(svc.lifecycle().state(), ModelState::Failed);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    assert_eq!(loader.loads(), 0);
}

#[tokio::test]
async fn concurrent_cold_requests_share_one_load() {
    init_tracing();
    let config = ServiceConfig::default();
    let loader = CountingLoader::new(Script::PageIndex, Duration::from_millis(100));
    let lc = lifecycle(&config, Probe::new(true), Arc::clone(&loader));
    let svc = Arc::new(service_with(config, lc));

    let requests = (0..8).map(|_| {
        let svc = Arc::clone(&svc);
        async move {
            svc.handle(RawRequest::new(png(32, 32), None, RequestOptions::default()))
                .await
        }
    });
    let envelopes = futures::future::join_all(requests).await;

    assert_eq!(loader.loads(), 1);
    assert!(envelopes.iter().all(|e| e.is_success()));
    assert!(envelopes
        .iter()
        .all(|e| e.metadata.as_ref().is_some_and(|m| m.cold_start)));
    assert!(svc.lifecycle().is_ready());
}

// ── Properties ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn oversized_pages_are_fitted_and_small_ones_untouched() {
    init_tracing();
    let (svc, loader) = service(Script::PageIndex);

    let big = svc
        .handle(RawRequest::new(png(3000, 1500), None, RequestOptions::default()))
        .await;
    assert!(big.is_success());
    let small = svc
        .handle(RawRequest::new(png(2048, 700), None, RequestOptions::default()))
        .await;
    assert!(small.is_success());

    let seen = &loader.observed.lock().unwrap().pages;
    assert_eq!(seen[0], (0, 2048, 1024));
    assert_eq!(seen[1], (0, 2048, 700));
}

#[tokio::test]
async fn batches_are_consecutive_and_the_last_is_not_padded() {
    init_tracing();
    let config = ServiceConfig::builder().max_batch_size(2).build().unwrap();
    let loader = CountingLoader::new(Script::PageIndex, Duration::ZERO);
    let lc = lifecycle(&config, Probe::new(true), Arc::clone(&loader));
    let svc = service_with(config, lc);

    let envelope = svc
        .handle(RawRequest::new(FAKE_PDF.to_vec(), Some(MediaType::Pdf), RequestOptions::default()))
        .await;
    assert!(envelope.is_success(), "error: {:?}", envelope.error);
    assert_eq!(envelope.pages.len(), 5);

    let observed = loader.observed.lock().unwrap();
    assert_eq!(observed.batch_sizes, vec![2, 2, 1]);
    let order: Vec<usize> = observed.pages.iter().map(|p| p.0).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn formatting_is_deterministic_across_requests() {
    init_tracing();
    let (svc, _loader) = service(Script::Figure);
    let first = svc
        .handle(RawRequest::new(png(800, 600), None, RequestOptions::default()))
        .await;
    let second = svc
        .handle(RawRequest::new(png(800, 600), None, RequestOptions::default()))
        .await;
    assert_eq!(first.pages[&0].markdown, second.pages[&0].markdown);
    assert_eq!(first.pages[&0].html, second.pages[&0].html);
    assert_eq!(first.pages[&0].images, second.pages[&0].images);
}

// ── Client errors ────────────────────────────────────────────────────────────

#[tokio::test]
async fn range_past_the_end_is_an_empty_document() {
    init_tracing();
    let (svc, loader) = service(Script::PageIndex);
    let envelope = svc
        .handle(RawRequest::new(FAKE_PDF.to_vec(), None, with_range("7-9")))
        .await;
    assert_eq!(envelope.error_kind(), Some(ErrorKind::EmptyDocument));
    assert!(envelope.pages.is_empty());
    // Client errors are rejected before the model is touched.
    assert_eq!(loader.loads(), 0);
}

#[tokio::test]
async fn malformed_wire_requests_are_rejected() {
    init_tracing();
    let (svc, loader) = service(Script::PageIndex);

    let bodies: [&[u8]; 5] = [
        b"not json",
        br#"{"content": "%%% not base64 %%%"}"#,
        br#"{"content": "aGVsbG8="}"#,
        br#"{"content": "aGVsbG8=", "surprise": 1}"#,
        br#"{"content": "aGVsbG8=", "page_range": "3-1"}"#,
    ];
    for body in bodies {
        let envelope = svc.handle_wire(body).await;
        assert_eq!(
            envelope.error_kind(),
            Some(ErrorKind::MalformedInput),
            "body: {}",
            String::from_utf8_lossy(body)
        );
        let message = &envelope.error.as_ref().unwrap().message;
        assert!(!message.is_empty());
    }
    assert_eq!(loader.loads(), 0);
}

#[tokio::test]
async fn wire_request_round_trip() {
    init_tracing();
    use base64::Engine;

    let (svc, _loader) = service(Script::PageIndex);
    let body = serde_json::json!({
        "content": base64::engine::general_purpose::STANDARD.encode(FAKE_PDF),
        "content_type": "pdf",
        "page_range": "0,4",
        "max_output_tokens": 512,
    });
    let envelope = svc.handle_wire(body.to_string().as_bytes()).await;

    assert!(envelope.is_success(), "error: {:?}", envelope.error);
    assert_eq!(envelope.pages.keys().copied().collect::<Vec<_>>(), vec![0, 4]);
    let meta = envelope.metadata.unwrap();
    assert_eq!(meta.completion_tokens, 20);
    assert_eq!(meta.prompt_tokens, 200);
    assert_eq!(meta.element_counts["Text"], 2);
}

#[tokio::test]
async fn dropped_cold_request_leaves_load_running() {
    init_tracing();
    let config = ServiceConfig::default();
    let loader = CountingLoader::new(Script::PageIndex, Duration::from_millis(100));
    let lc = lifecycle(&config, Probe::new(true), Arc::clone(&loader));
    let svc = Arc::new(service_with(config, Arc::clone(&lc)));

    let first = {
        let svc = Arc::clone(&svc);
        tokio::spawn(async move {
            svc.handle(RawRequest::new(png(64, 64), None, RequestOptions::default()))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(lc.state(), ModelState::Loading);
    first.abort();
    let _ = first.await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lc.state(), ModelState::Ready);

    let envelope = svc
        .handle(RawRequest::new(png(64, 64), None, RequestOptions::default()))
        .await;
    assert!(envelope.is_success(), "error: {:?}", envelope.error);
    assert!(!envelope.metadata.as_ref().unwrap().cold_start);
    assert_eq!(loader.loads(), 1);
}

#[tokio::test]
async fn image_payload_ignores_page_range() {
    init_tracing();
    let (svc, _loader) = service(Script::PageIndex);
    let envelope = svc
        .handle(RawRequest::new(png(64, 64), None, with_range("2-3")))
        .await;

    assert!(envelope.is_success(), "error: {:?}", envelope.error);
    assert_eq!(envelope.pages.keys().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(envelope.metadata.as_ref().unwrap().total_pages, 1);
}

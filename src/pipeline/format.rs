//! Result formatting: raw model HTML → markdown, HTML, layout and crops.
//!
//! The model answers with a flat sequence of top-level layout blocks:
//!
//! ```html
//! <div data-bbox="[64, 40, 960, 88]" data-label="Section-Header"><h2>Results</h2></div>
//! <div data-bbox="[64, 100, 960, 400]" data-label="Figure"><img alt="Loss curve"></div>
//! ```
//!
//! Bounding boxes are normalized to `0..bbox_scale` regardless of the page's
//! pixel size. Formatting is a pure function of the raw text, the page
//! bitmap and the request options: the same inputs always produce
//! byte-identical output, and image names are derived from a content hash
//! rather than from counters or clocks.

use crate::config::RequestOptions;
use crate::error::OcrError;
use crate::output::{EmbeddedImage, LayoutElement, PageResult, ResponseMetadata};
use crate::pipeline::encode::{encode_png_base64, PNG_MIME};
use crate::pipeline::executor::RawGeneration;
use crate::pipeline::normalize::NormalizedPage;
use crate::pipeline::postprocess::{clean_markdown, strip_outer_fences};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node};
use std::collections::BTreeMap;

const HEADER_FOOTER_LABELS: &[&str] = &["Page-Header", "Page-Footer"];
const IMAGE_LABELS: &[&str] = &["Image", "Figure"];

/// Label given to blocks without `data-label`.
const DEFAULT_LABEL: &str = "block";

/// One top-level `<div>` of the model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// 1-based position among the top-level divs.
    pub index: usize,
    pub label: Option<String>,
    pub bbox: Option<String>,
    pub inner_html: String,
}

impl Block {
    fn label_or_default(&self) -> &str {
        self.label.as_deref().unwrap_or(DEFAULT_LABEL)
    }

    fn has_label(&self, labels: &[&str]) -> bool {
        self.label.as_deref().is_some_and(|l| labels.contains(&l))
    }
}

/// Split model HTML into its top-level layout blocks.
///
/// Output without any top-level `<div>` is treated as a single `Text` block
/// spanning the whole page, so a model that ignores the layout format still
/// yields its text.
pub fn parse_blocks(html: &str, bbox_scale: u32) -> Vec<Block> {
    let fragment = Html::parse_fragment(html);
    let root = fragment.root_element();
    let blocks: Vec<Block> = root
        .child_elements()
        .filter(|el| el.value().name() == "div")
        .enumerate()
        .map(|(i, div)| Block {
            index: i + 1,
            label: div.attr("data-label").map(str::to_string),
            bbox: div.attr("data-bbox").map(str::to_string),
            inner_html: div.inner_html(),
        })
        .collect();

    if blocks.is_empty() && !root.text().all(|t| t.trim().is_empty()) {
        return vec![Block {
            index: 1,
            label: Some("Text".to_string()),
            bbox: Some(format!("[0, 0, {bbox_scale}, {bbox_scale}]")),
            inner_html: root.inner_html(),
        }];
    }
    blocks
}

/// Deterministic name for the crop of block `block_index` of `html`.
pub fn image_name(html: &str, block_index: usize) -> String {
    let hash = blake3::hash(html.as_bytes()).to_hex();
    format!("{}_{}_img.png", &hash[..16], block_index)
}

// ── Bounding boxes ───────────────────────────────────────────────────────

/// Parse a `data-bbox` value: a JSON list, or whitespace/comma separated
/// numbers. Anything else becomes `[0, 0, 1, 1]`.
pub fn parse_bbox(raw: Option<&str>) -> [i64; 4] {
    const FALLBACK: [i64; 4] = [0, 0, 1, 1];
    let Some(raw) = raw else {
        return FALLBACK;
    };
    let values: Option<Vec<f64>> = serde_json::from_str::<Vec<f64>>(raw).ok().or_else(|| {
        raw.split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<f64>().ok())
            .collect()
    });
    match values.as_deref() {
        Some([x0, y0, x1, y1]) if [x0, y0, x1, y1].iter().all(|v| v.is_finite()) => {
            [*x0 as i64, *y0 as i64, *x1 as i64, *y1 as i64]
        }
        _ => FALLBACK,
    }
}

/// Map a normalized bbox onto a `width × height` page, clamped to the page.
pub fn scale_bbox(bbox: [i64; 4], width: u32, height: u32, bbox_scale: u32) -> [u32; 4] {
    let sx = width as f64 / bbox_scale as f64;
    let sy = height as f64 / bbox_scale as f64;
    let clamp = |v: f64, max: u32| -> u32 { (v as i64).clamp(0, max as i64) as u32 };
    [
        clamp(bbox[0] as f64 * sx, width),
        clamp(bbox[1] as f64 * sy, height),
        clamp(bbox[2] as f64 * sx, width),
        clamp(bbox[3] as f64 * sy, height),
    ]
}

// ── HTML filtering ───────────────────────────────────────────────────────

static RE_ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<.+>").unwrap());
static RE_IMG_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<img\b([^>]*?)\s*/?>").unwrap());
static RE_SRC_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\s+src\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).unwrap());

/// Point the block's first `<img>` at `name`. `None` when the block has no
/// `<img>`.
fn attach_image_src(inner_html: &str, name: &str) -> Option<String> {
    let caps = RE_IMG_TAG.captures(inner_html)?;
    let whole = caps.get(0)?.range();
    let attrs = RE_SRC_ATTR.replace_all(&caps[1], "");
    let tag = format!("<img src=\"{name}\"{attrs}>");
    let mut out = String::with_capacity(inner_html.len() + name.len());
    out.push_str(&inner_html[..whole.start]);
    out.push_str(&tag);
    out.push_str(&inner_html[whole.end..]);
    Some(out)
}

/// Figure or image block whose content references an `<img>`.
fn has_embedded_image(block: &Block) -> bool {
    block.has_label(IMAGE_LABELS) && RE_IMG_TAG.is_match(&block.inner_html)
}

/// Inner HTML of a kept block after image and paragraph fix-ups.
fn block_output_html(block: &Block, raw_html: &str) -> String {
    if block.has_label(IMAGE_LABELS) {
        let name = image_name(raw_html, block.index);
        if let Some(html) = attach_image_src(&block.inner_html, &name) {
            return html;
        }
    }
    let trimmed = block.inner_html.trim();
    if block.label.as_deref() == Some("Text") && !RE_ANY_TAG.is_match(trimmed) {
        return format!("<p>{trimmed}</p>");
    }
    block.inner_html.clone()
}

fn keep_block(block: &Block, options: &RequestOptions) -> bool {
    if !options.include_headers_footers && block.has_label(HEADER_FOOTER_LABELS) {
        return false;
    }
    if !options.include_images && block.has_label(IMAGE_LABELS) {
        return false;
    }
    true
}

// ── HTML → Markdown ──────────────────────────────────────────────────────

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").unwrap());

#[derive(Debug, Clone, Copy, Default)]
struct Ctx {
    /// Inside `<pre>`: keep whitespace verbatim.
    preformatted: bool,
    /// Inside `<pre>`, `<code>` or `<math>`: no Markdown escaping.
    literal: bool,
}

/// Render one HTML fragment as Markdown (uncleaned).
pub fn html_to_markdown(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    render_children(fragment.root_element(), Ctx::default())
}

fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '_' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn render_text(text: &str, ctx: Ctx) -> String {
    let text = if ctx.preformatted {
        text.to_string()
    } else {
        RE_WHITESPACE.replace_all(text, " ").into_owned()
    };
    if ctx.literal {
        text
    } else {
        escape_markdown(&text)
    }
}

fn render_children(el: ElementRef<'_>, ctx: Ctx) -> String {
    let mut out = String::new();
    for child in el.children() {
        match child.value() {
            Node::Text(t) => out.push_str(&render_text(t, ctx)),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    out.push_str(&render_element(child_el, ctx));
                }
            }
            _ => {}
        }
    }
    out
}

/// Wrap inline content in `marker`, keeping surrounding spaces outside it.
fn wrap_inline(content: &str, marker: &str) -> String {
    let core = content.trim();
    if core.is_empty() {
        return content.to_string();
    }
    let lead = if content.starts_with(char::is_whitespace) { " " } else { "" };
    let trail = if content.ends_with(char::is_whitespace) { " " } else { "" };
    format!("{lead}{marker}{core}{marker}{trail}")
}

fn render_element(el: ElementRef<'_>, ctx: Ctx) -> String {
    let name = el.value().name();
    match name {
        "p" | "div" | "caption" | "form" | "li" => {
            format!("\n\n{}\n\n", render_children(el, ctx).trim())
        }
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name[1..].parse::<usize>().unwrap_or(1);
            let text = render_children(el, ctx).replace('\n', " ");
            format!("\n\n{} {}\n\n", "#".repeat(level), text.trim())
        }
        "br" => {
            if ctx.preformatted {
                "\n".to_string()
            } else {
                "  \n".to_string()
            }
        }
        "hr" => "\n\n---\n\n".to_string(),
        "b" | "strong" => wrap_inline(&render_children(el, ctx), "**"),
        "i" | "em" => wrap_inline(&render_children(el, ctx), "*"),
        "del" | "s" => wrap_inline(&render_children(el, ctx), "~~"),
        "sup" | "sub" => format!("<{name}>{}</{name}>", render_children(el, ctx)),
        "code" => {
            let inner_ctx = Ctx { literal: true, ..ctx };
            let text = render_children(el, inner_ctx);
            if ctx.preformatted {
                text
            } else {
                format!("`{}`", text.trim())
            }
        }
        "pre" => {
            let inner_ctx = Ctx {
                preformatted: true,
                literal: true,
            };
            let text = render_children(el, inner_ctx);
            format!("\n\n```\n{}\n```\n\n", text.trim_matches('\n'))
        }
        "math" => {
            let inner_ctx = Ctx { literal: true, ..ctx };
            let text = render_children(el, inner_ctx);
            if el.attr("display") == Some("block") {
                format!("\n$${}$$\n", text.trim())
            } else {
                format!(" ${}$ ", text.trim())
            }
        }
        "table" => format!("\n\n{}\n\n", el.html()),
        "ul" => render_list(el, ctx, false),
        "ol" => render_list(el, ctx, true),
        "a" => {
            let text = render_children(el, ctx);
            match el.attr("href") {
                Some(href) if !href.is_empty() => {
                    let label = text.trim().replace('[', "\\[").replace(']', "\\]");
                    format!("[{label}]({href})")
                }
                _ => text,
            }
        }
        "img" => {
            let alt = el.attr("alt").unwrap_or("");
            let src = el.attr("src").unwrap_or("");
            format!("![{alt}]({src})")
        }
        "input" => match el.attr("type") {
            Some("checkbox") | Some("radio") => {
                if el.attr("checked").is_some() {
                    "[x] ".to_string()
                } else {
                    "[ ] ".to_string()
                }
            }
            _ => el.attr("value").unwrap_or("").to_string(),
        },
        _ => render_children(el, ctx),
    }
}

fn render_list(el: ElementRef<'_>, ctx: Ctx, ordered: bool) -> String {
    let start = el
        .attr("start")
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(1);
    let mut out = String::from("\n\n");
    let items = el.child_elements().filter(|c| c.value().name() == "li");
    for (i, li) in items.enumerate() {
        let marker = if ordered {
            format!("{}. ", start + i)
        } else {
            "- ".to_string()
        };
        let body = render_children(li, ctx);
        let body = RE_NEWLINES.replace_all(body.trim(), "\n");
        let pad = " ".repeat(marker.len());
        let mut lines = body.lines();
        out.push_str(&marker);
        out.push_str(lines.next().unwrap_or("").trim_start());
        for line in lines {
            out.push('\n');
            if !line.is_empty() {
                out.push_str(&pad);
            }
            out.push_str(line);
        }
        out.push('\n');
    }
    out.push('\n');
    out
}

// ── Page formatting ──────────────────────────────────────────────────────

/// Format one page's raw generation.
pub fn format_page(
    generation: &RawGeneration,
    page: &NormalizedPage,
    options: &RequestOptions,
    bbox_scale: u32,
) -> Result<PageResult, OcrError> {
    let raw_html = strip_outer_fences(&generation.text);
    let blocks = parse_blocks(&raw_html, bbox_scale);
    let (width, height) = (page.width(), page.height());

    let mut html_parts = Vec::with_capacity(blocks.len());
    let mut markdown_parts = Vec::with_capacity(blocks.len());
    let mut layout = Vec::with_capacity(blocks.len());
    let mut images = BTreeMap::new();

    for block in &blocks {
        let bbox = scale_bbox(parse_bbox(block.bbox.as_deref()), width, height, bbox_scale);
        let mut element = LayoutElement {
            label: block.label_or_default().to_string(),
            bbox,
            content: block.inner_html.clone(),
            image: None,
        };

        if keep_block(block, options) {
            let html = block_output_html(block, &raw_html);
            let md = html_to_markdown(&html);
            if !md.trim().is_empty() {
                markdown_parts.push(md.trim().to_string());
            }
            html_parts.push(html);

            if has_embedded_image(block) {
                if let Some(crop) = crop_block(page, bbox)? {
                    let name = image_name(&raw_html, block.index);
                    element.image = Some(name.clone());
                    images.insert(name, crop);
                }
            }
        }
        layout.push(element);
    }

    Ok(PageResult {
        page: page.index,
        markdown: clean_markdown(&markdown_parts.join("\n\n")),
        html: html_parts.join("\n"),
        layout,
        images,
        page_box: [0, 0, width, height],
        completion_tokens: generation.completion_tokens,
        prompt_tokens: generation.prompt_tokens,
        raw: generation.text.clone(),
    })
}

/// Crop `bbox` out of the page. `None` for an empty box.
fn crop_block(page: &NormalizedPage, bbox: [u32; 4]) -> Result<Option<EmbeddedImage>, OcrError> {
    let [x0, y0, x1, y1] = bbox;
    if x1 <= x0 || y1 <= y0 {
        return Ok(None);
    }
    let crop = image::imageops::crop_imm(&page.image, x0, y0, x1 - x0, y1 - y0).to_image();
    Ok(Some(EmbeddedImage {
        mime_type: PNG_MIME.to_string(),
        data: encode_png_base64(&crop)?,
        bbox,
    }))
}

/// Request-level totals over every formatted page.
pub fn aggregate_metadata(
    pages: &[PageResult],
    total_pages: usize,
    cold_start: bool,
    model_id: &str,
    inference_ms: u64,
    total_ms: u64,
) -> ResponseMetadata {
    let mut element_counts = BTreeMap::new();
    for element in pages.iter().flat_map(|p| &p.layout) {
        *element_counts.entry(element.label.clone()).or_insert(0) += 1;
    }
    ResponseMetadata {
        page_count: pages.len(),
        total_pages,
        completion_tokens: pages.iter().map(|p| p.completion_tokens).sum(),
        prompt_tokens: pages.iter().map(|p| p.prompt_tokens).sum(),
        image_count: pages.iter().map(|p| p.images.len()).sum(),
        element_counts,
        cold_start,
        model_id: model_id.to_string(),
        inference_ms,
        total_ms,
    }
}

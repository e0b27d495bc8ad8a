//! Post-processing: deterministic cleanup of model output and rendered Markdown.
//!
//! ## What gets cleaned
//!
//! The model is prompted to emit bare HTML layout blocks, but it occasionally
//! wraps the whole answer in a ` ```html ... ``` ` fence, emits Windows line
//! endings, or sprinkles zero-width characters copied from the page's text
//! layer. The HTML → Markdown renderer also leaves uneven blank lines where
//! blocks were dropped.
//!
//! Each rule here is a pure `&str → String` function, so the chain is
//! idempotent: cleaning already-clean text returns it unchanged.
//!
//! ## Rule Order
//!
//! Normalise line endings before trimming, and collapse blank lines before
//! heading spacing so a heading never ends up with two blank lines above it.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all Markdown cleanup rules.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens, etc.)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 2+ consecutive blank lines down to 1
/// 5. Ensure heading lines have a blank line before them
/// 6. Ensure the text ends with exactly one newline
pub fn clean_markdown(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = normalise_heading_spacing(&s);
    ensure_final_newline(&s)
}

// ── Rule 0: Strip outer code fences (raw model output) ──────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```(?:html|markdown|md)?[ \t]*\r?\n(.*?)\r?\n?```\s*$").unwrap()
});

/// Remove a fence wrapping the whole model answer, if any.
pub fn strip_outer_fences(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES
        .replace_all(input.trim_start_matches('\n'), "\n\n")
        .to_string()
}

// ── Rule 5: Normalise heading spacing ────────────────────────────────────────

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6} ").unwrap());

fn normalise_heading_spacing(input: &str) -> String {
    let mut result = String::with_capacity(input.len() + 64);
    let mut in_fence = false;
    for line in input.lines() {
        if line.starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence && RE_HEADING.is_match(line) && !result.is_empty() {
            let trimmed = result.trim_end_matches('\n');
            result.truncate(trimmed.len());
            result.push_str("\n\n");
        }
        result.push_str(line);
        result.push('\n');
    }
    result
}

// ── Rule 6: Ensure text ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

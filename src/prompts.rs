//! Prompts sent to the layout OCR model.
//!
//! The model was trained against a fixed prompt; the label list and the tag
//! and attribute whitelist below must stay in step with what the result
//! formatter in [`crate::pipeline::format`] knows how to render.
//!
//! Keeping prompts here means unit tests can inspect them without a model.

/// Block labels the model may assign via `data-label`.
pub const LAYOUT_LABELS: &[&str] = &[
    "Caption",
    "Footnote",
    "Equation-Block",
    "List-Group",
    "Page-Header",
    "Page-Footer",
    "Image",
    "Section-Header",
    "Table",
    "Text",
    "Complex-Block",
    "Code-Block",
    "Form",
    "Table-Of-Contents",
    "Figure",
];

/// HTML tags the model is allowed to emit inside a block.
pub const ALLOWED_TAGS: &[&str] = &[
    "math", "br", "i", "b", "u", "del", "sup", "sub", "table", "tr", "td", "p", "th", "div",
    "pre", "h1", "h2", "h3", "h4", "h5", "ul", "ol", "li", "input", "a", "span", "img", "hr",
    "tbody", "small", "caption", "strong", "thead", "big", "code",
];

/// HTML attributes the model is allowed to emit.
pub const ALLOWED_ATTRIBUTES: &[&str] = &[
    "class", "colspan", "rowspan", "display", "checked", "type", "border", "value", "style",
    "href", "alt", "align",
];

const LAYOUT_PROMPT_HEAD: &str = "OCR this image to HTML, arranged as layout blocks.  Each layout block should be a div with the data-bbox attribute representing the bounding box of the block in [x0, y0, x1, y1] format.  Bboxes are normalized 0-{bbox_scale}. The data-label attribute is the label for the block.";

const GUIDELINES: &str = r#"Guidelines:
* Inline math: Surround math with <math>...</math> tags. Math expressions should be rendered in KaTeX-compatible LaTeX. Use display for block math.
* Tables: Use colspan and rowspan attributes to match table structure.
* Formatting: Maintain consistent formatting with the image, including spacing, indentation, subscripts/superscripts, and special characters.
* Images: Include a description of any images in the alt attribute of an <img> tag. Do not fill out the src property.
* Forms: Mark checkboxes and radio buttons properly.
* Text: join lines together properly into paragraphs using <p>...</p> tags.  Use <br> tags for line breaks within paragraphs, but only when absolutely necessary to maintain meaning.
* Use the simplest possible HTML structure that accurately represents the content of the block.
* Make sure the text is accurate and easy for a human to read and interpret.  Reading order should be correct and natural."#;

/// Build the layout OCR prompt for a given bounding-box scale.
pub fn layout_prompt(bbox_scale: u32) -> String {
    let labels = LAYOUT_LABELS
        .iter()
        .map(|l| format!("- {l}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{head}\n\nUse the following labels:\n{labels}\n\nOnly use these tags {tags}, and these attributes {attrs}.\n\n{GUIDELINES}",
        head = LAYOUT_PROMPT_HEAD.replace("{bbox_scale}", &bbox_scale.to_string()),
        tags = quoted_list(ALLOWED_TAGS),
        attrs = quoted_list(ALLOWED_ATTRIBUTES),
    )
}

fn quoted_list(items: &[&str]) -> String {
    let inner = items
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{inner}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_carries_scale_and_labels() {
        let p = layout_prompt(1024);
        assert!(p.contains("normalized 0-1024"), "got: {p}");
        assert!(!p.contains("{bbox_scale}"));
        for label in LAYOUT_LABELS {
            assert!(p.contains(&format!("- {label}")), "missing label {label}");
        }
    }

    #[test]
    fn prompt_lists_whitelist() {
        let p = layout_prompt(1000);
        assert!(p.contains("'math', 'br'"));
        assert!(p.contains("'href', 'alt', 'align']"));
    }
}

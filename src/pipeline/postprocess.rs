//! Post-processing: deterministic cleanup of model output.
//!
//! DeepSeek-OCR answers the grounding prompt with Markdown interleaved with
//! layout annotations:
//!
//! ```text
//! <|ref|>title<|/ref|><|det|>[[112, 40, 880, 96]]<|/det|>
//! # Quarterly Report
//! ```
//!
//! The annotation names the region type and its box; the Markdown that
//! follows is the content. Annotations are stripped before the generic
//! Markdown rules run, so the whitespace rules see the final layout.
//!
//! Rules (applied in order):
//! 1. Remove layout annotations (`<|ref|>…<|/ref|><|det|>…<|/det|>`)
//! 2. Unwrap stray `<|ref|>text<|/ref|>`, drop stray `<|det|>` spans
//! 3. Remove control tokens (`<|grounding|>`, end-of-sentence markers)
//! 4. Strip outer markdown fences
//! 5. Normalise line endings (CRLF → LF)
//! 6. Trim trailing whitespace per line
//! 7. Collapse 3+ consecutive blank lines down to 2
//! 8. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
//! 9. Ensure the text ends with exactly one newline

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every rule to raw model output.
pub fn clean_output(input: &str) -> String {
    let s = strip_grounding(input);
    let s = strip_markdown_fences(&s);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

// ── Rules 1-3: Grounding markup ──────────────────────────────────────────────

static RE_ANNOTATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<\|ref\|>[^<]*<\|/ref\|>\s*<\|det\|>[^<]*<\|/det\|>[ \t]*\r?\n?").unwrap()
});
static RE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<\|ref\|>(.*?)<\|/ref\|>").unwrap());
static RE_DET: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\|det\|>[^<]*<\|/det\|>").unwrap());
static RE_CONTROL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<\|grounding\|>|<｜end▁of▁sentence｜>|<\|end_of_sentence\|>|<\|endoftext\|>").unwrap()
});

/// Remove DeepSeek grounding annotations and control tokens.
pub fn strip_grounding(input: &str) -> String {
    let s = RE_ANNOTATION.replace_all(input, "");
    let s = RE_REF.replace_all(&s, "$1");
    let s = RE_DET.replace_all(&s, "");
    RE_CONTROL.replace_all(&s, "").into_owned()
}

// ── Rule 4: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rules 5-7: Whitespace ────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").into_owned()
}

// ── Rule 8: Invisible Unicode ────────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

// ── Rule 9: Final newline ────────────────────────────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_are_removed_with_their_line() {
        let input = "<|ref|>title<|/ref|><|det|>[[112, 40, 880, 96]]<|/det|>\n# Report\n\n\
                     <|ref|>text<|/ref|><|det|>[[10, 120, 900, 300]]<|/det|>\nBody text.";
        assert_eq!(strip_grounding(input), "# Report\n\nBody text.");
    }

    #[test]
    fn stray_ref_keeps_text() {
        assert_eq!(strip_grounding("see <|ref|>Figure 2<|/ref|> below"), "see Figure 2 below");
    }

    #[test]
    fn stray_ref_before_annotation_is_not_swallowed() {
        let input = "see <|ref|>Fig 1<|/ref|>\n<|ref|>text<|/ref|><|det|>[[1, 2, 3, 4]]<|/det|>\nBody";
        assert_eq!(strip_grounding(input), "see Fig 1\nBody");
    }

    #[test]
    fn stray_det_and_control_tokens_removed() {
        let input = "<|grounding|>Total<|det|>[[1, 2, 3, 4]]<|/det|>: 42<｜end▁of▁sentence｜>";
        assert_eq!(strip_grounding(input), "Total: 42");
    }

    #[test]
    fn strip_fences() {
        assert_eq!(strip_markdown_fences("```markdown\n# Hello\nWorld\n```"), "# Hello\nWorld");
        assert_eq!(strip_markdown_fences("```\n# Hello\n```"), "# Hello");
        assert_eq!(strip_markdown_fences("# Hello"), "# Hello");
    }

    #[test]
    fn whitespace_rules() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
        assert_eq!(trim_trailing_whitespace("  a   \nb  "), "  a\nb");
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\n\nb");
        assert_eq!(ensure_final_newline("x\n\n\n"), "x\n");
        assert_eq!(ensure_final_newline(""), "\n");
    }

    #[test]
    fn invisible_chars_removed() {
        assert_eq!(remove_invisible_chars("a\u{200B}b\u{FEFF}c\u{00AD}d"), "abcd");
    }

    #[test]
    fn full_pipeline() {
        let input = "<|ref|>title<|/ref|><|det|>[[0, 0, 10, 10]]<|/det|>\r\n# Title   \r\n\r\n\r\n\r\n\r\nText\u{200B}";
        assert_eq!(clean_output(input), "# Title\n\n\nText\n");
    }
}

//! Prompts and resolution presets for DeepSeek-OCR.
//!
//! The model is steered entirely by the prompt text: `<image>` marks where
//! the vision tokens go and `<|grounding|>` asks for layout annotations next
//! to the Markdown. Served endpoints attach images separately, so the
//! placeholder is removed before sending (see [`prompt_text`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Document → Markdown with layout grounding. The default.
pub const DEFAULT_PROMPT: &str = "<image>\n<|grounding|>Convert the document to markdown. ";

/// Plain OCR without layout.
pub const FREE_OCR_PROMPT: &str = "<image>\nFree OCR. ";

/// Figures and charts.
pub const FIGURE_PROMPT: &str = "<image>\nParse the figure. ";

/// Scene description.
pub const DESCRIBE_PROMPT: &str = "<image>\nDescribe this image in detail. ";

const IMAGE_PLACEHOLDER: &str = "<image>";

/// Prompt with the `<image>` placeholder removed, as sent alongside attachments.
pub fn prompt_text(prompt: &str) -> String {
    prompt.replace(IMAGE_PLACEHOLDER, "").trim_start().to_string()
}

/// Named prompt for the CLI `--task` flag.
pub fn task_prompt(task: &str) -> Option<&'static str> {
    match task.to_ascii_lowercase().as_str() {
        "markdown" | "document" => Some(DEFAULT_PROMPT),
        "ocr" | "free" => Some(FREE_OCR_PROMPT),
        "figure" => Some(FIGURE_PROMPT),
        "describe" => Some(DESCRIBE_PROMPT),
        _ => None,
    }
}

/// Resolution presets published with the model.
///
/// | Mode   | base | image | crop |
/// |--------|------|-------|------|
/// | tiny   | 512  | 512   | no   |
/// | small  | 640  | 640   | no   |
/// | base   | 1024 | 1024  | no   |
/// | large  | 1280 | 1280  | no   |
/// | gundam | 1024 | 640   | yes  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    Tiny,
    Small,
    #[default]
    Base,
    Large,
    Gundam,
}

impl ModelMode {
    /// `(base_size, image_size, crop_mode)`.
    pub fn sizes(&self) -> (u32, u32, bool) {
        match self {
            ModelMode::Tiny => (512, 512, false),
            ModelMode::Small => (640, 640, false),
            ModelMode::Base => (1024, 1024, false),
            ModelMode::Large => (1280, 1280, false),
            ModelMode::Gundam => (1024, 640, true),
        }
    }
}

impl fmt::Display for ModelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelMode::Tiny => "tiny",
            ModelMode::Small => "small",
            ModelMode::Base => "base",
            ModelMode::Large => "large",
            ModelMode::Gundam => "gundam",
        };
        f.write_str(s)
    }
}

impl FromStr for ModelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tiny" => Ok(ModelMode::Tiny),
            "small" => Ok(ModelMode::Small),
            "base" => Ok(ModelMode::Base),
            "large" => Ok(ModelMode::Large),
            "gundam" => Ok(ModelMode::Gundam),
            other => Err(format!(
                "unknown mode '{other}' (tiny, small, base, large, gundam)"
            )),
        }
    }
}

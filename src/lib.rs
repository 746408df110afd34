//! # dsocr
//!
//! Run a pretrained OCR vision model (DeepSeek-OCR by default) over images
//! and PDFs, with VRAM-aware batching and a CPU fallback when the GPU runs
//! out of memory.
//!
//! The model itself is served (Ollama, vLLM or any OpenAI-compatible host)
//! and reached through `edgequake-llm`. This crate does everything around
//! it: rasterising PDFs, preparing images, batching, watching device memory,
//! cleaning the model output and recording timings.
//!
//! ## Pipeline Overview
//!
//! ```text
//! image / PDF / directory
//!  │
//!  ├─ 1. Input     classify path (image, PDF, directory of images)
//!  ├─ 2. Rasterise PDF pages → PNG files (pdfium, spawn_blocking)
//!  ├─ 3. Prepare   RGB, fit to the mode's size, optional tiling
//!  ├─ 4. Encode    PNG → base64 ImageData
//!  ├─ 5. Infer     OcrBackend::infer (retry transient, OOM surfaced)
//!  ├─ 6. Polish    strip grounding tags, clean Markdown
//!  ├─ 7. Persist   optional <stem>.md + JSON reports
//!  └─ 8. Bookkeep  VRAM snapshot + performance sample per item
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dsocr::{EngineConfig, OcrEngine};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::builder()
//!         .provider("ollama")
//!         .model("deepseek-ocr")
//!         .build()?;
//!     let mut engine = OcrEngine::from_config(config);
//!     let result = engine
//!         .process_with_fallback(Path::new("scan.png"), None, None)
//!         .await;
//!     println!("{}", result.text);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `dsocr` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ## Resolution modes
//!
//! | Mode | base | image | crop |
//! |------|------|-------|------|
//! | `tiny`   | 512  | 512  | no  |
//! | `small`  | 640  | 640  | no  |
//! | `base`   | 1024 | 1024 | no  |
//! | `large`  | 1280 | 1280 | no  |
//! | `gundam` | 1024 | 640  | yes |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod output;
pub mod perf;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod system;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{Device, InferenceError, InferenceSettings, OcrBackend, VisionLlmBackend};
pub use config::{AppConfig, EngineConfig, EngineConfigBuilder};
pub use engine::{process_image_once, OcrEngine};
pub use error::OcrError;
pub use memory::{DeviceMemory, MemoryManager, MemorySnapshot};
pub use output::{BatchSummary, ModelInfo, OcrReport, OcrResult};
pub use perf::{PerformanceTracker, SystemMonitor};
pub use pipeline::pdf::{PdfConversionResult, PdfConverter, PdfInfo};
pub use progress::{NoopProgressCallback, OcrProgressCallback, ProgressCallback};
pub use prompts::ModelMode;
pub use worker::{BatchHandle, BatchOptions, BatchWorker, WorkerEvent};

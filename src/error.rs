//! Error types for the dsocr library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`OcrError`] — **Fatal** for the operation that raised it (model cannot
//!   be loaded, image unreadable, device ran out of memory). Every variant
//!   carries a remedy available through [`OcrError::suggestion`].
//!
//! * [`crate::backend::InferenceError`] — what a backend reports for a single
//!   inference call. It is classified (out of memory, transient, fatal) so the
//!   engine can retry, fall back to the CPU, or give up.
//!
//! Per-file processing never propagates either type to the caller of
//! [`crate::engine::OcrEngine::process_image`]: failures become an
//! [`crate::output::OcrResult`] with `success == false` and the message in
//! `error`, so one bad file never sinks a batch.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the dsocr library.
#[derive(Debug, Error)]
pub enum OcrError {
    // ── Model errors ──────────────────────────────────────────────────────
    /// The model could not be bound on the requested device.
    #[error("Failed to load model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    /// The backend rejected or failed the inference call.
    #[error("Inference failed: {reason}")]
    Inference { reason: String },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// The file extension is not one of the supported image formats.
    #[error("Unsupported format '{extension}' for '{path}'")]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// The image exists but could not be decoded or transformed.
    #[error("Image processing failed for '{path}': {reason}")]
    ImageProcessing { path: PathBuf, reason: String },

    /// PDF rasterisation failed.
    #[error("PDF conversion failed for '{path}': {reason}")]
    PdfConversion { path: PathBuf, reason: String },

    // ── Device errors ─────────────────────────────────────────────────────
    /// The device ran out of memory during loading or inference.
    #[error("Out of memory: {memory}")]
    OutOfMemory { memory: String },

    /// A GPU was requested but none is usable.
    #[error("No usable GPU found")]
    GpuUnavailable,

    // ── Config errors ─────────────────────────────────────────────────────
    /// A configuration value is missing, malformed or out of range.
    #[error("Invalid configuration '{item}': {issue}")]
    Configuration { item: String, issue: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Control flow ──────────────────────────────────────────────────────
    /// The operation was stopped by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OcrError {
    /// Human-readable remedy for this error category.
    pub fn suggestion(&self) -> &'static str {
        match self {
            OcrError::ModelLoad { .. } => {
                "1. Check the model name and that it is pulled on the server\n\
                 2. Check that the model server is running and reachable\n\
                 3. Check there is enough device memory for the model"
            }
            OcrError::Inference { .. } => {
                "1. Check the model server logs\n\
                 2. Try again with a smaller image or a lighter mode (tiny/small)"
            }
            OcrError::FileNotFound { .. } => "Check the path exists and is readable.",
            OcrError::UnsupportedFormat { .. } => {
                "Supported formats: png, jpg, jpeg, bmp, tiff, webp."
            }
            OcrError::ImageProcessing { .. } => {
                "1. Check that the image file exists\n\
                 2. Check that the format is supported\n\
                 3. Check that the file is not corrupted"
            }
            OcrError::PdfConversion { .. } => {
                "1. Check that the PDF file exists and is readable\n\
                 2. Check that the PDF is not corrupted or encrypted\n\
                 3. Check that the PDFium library is available (PDFIUM_LIB_PATH)"
            }
            OcrError::OutOfMemory { .. } => {
                "1. Reduce the batch size\n\
                 2. Lower the image resolution (base_size / image_size)\n\
                 3. Use the CPU (device.type = \"cpu\" or enable fallback_to_cpu)\n\
                 4. Close other programs using the GPU"
            }
            OcrError::GpuUnavailable => {
                "1. Check that the NVIDIA driver is installed\n\
                 2. Run `nvidia-smi` to confirm the GPU is visible"
            }
            OcrError::Configuration { .. } => {
                "Check the configuration file (dsocr config show) and fix the reported key."
            }
            OcrError::OutputWriteFailed { .. } => {
                "Check that the output directory is writable and the disk is not full."
            }
            OcrError::Cancelled => "The operation was stopped on request.",
            OcrError::Internal(_) => "Re-run with --verbose and report the log output.",
        }
    }

    /// `true` for device memory exhaustion.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, OcrError::OutOfMemory { .. })
    }
}

/// Advice for I/O errors that occur outside the [`OcrError`] hierarchy.
pub fn suggestion_for_io(err: &std::io::Error) -> &'static str {
    match err.kind() {
        std::io::ErrorKind::NotFound => "Check the file path.",
        std::io::ErrorKind::PermissionDenied => "Check the file permissions.",
        _ => "Check the error details in the log.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_load_display() {
        let e = OcrError::ModelLoad {
            model: "deepseek-ocr".into(),
            reason: "connection refused".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("deepseek-ocr"), "got: {msg}");
        assert!(msg.contains("connection refused"), "got: {msg}");
    }

    #[test]
    fn out_of_memory_is_detected() {
        let e = OcrError::OutOfMemory {
            memory: "7.9 GB used".into(),
        };
        assert!(e.is_out_of_memory());
        assert!(e.suggestion().contains("batch size"));
    }

    #[test]
    fn unsupported_format_display() {
        let e = OcrError::UnsupportedFormat {
            path: "scan.gif".into(),
            extension: "gif".into(),
        };
        assert!(e.to_string().contains("gif"));
        assert!(e.suggestion().contains("webp"));
    }

    #[test]
    fn every_category_has_a_suggestion() {
        let errors = [
            OcrError::GpuUnavailable,
            OcrError::Cancelled,
            OcrError::Internal("x".into()),
            OcrError::Configuration {
                item: "memory.vram_threshold".into(),
                issue: "must be in (0, 1]".into(),
            },
            OcrError::PdfConversion {
                path: "a.pdf".into(),
                reason: "bad xref".into(),
            },
        ];
        for e in errors {
            assert!(!e.suggestion().is_empty(), "{e:?}");
        }
    }

    #[test]
    fn io_suggestions_by_kind() {
        let nf = std::io::Error::new(std::io::ErrorKind::NotFound, "x");
        let pd = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "x");
        let other = std::io::Error::other("x");
        assert_eq!(suggestion_for_io(&nf), "Check the file path.");
        assert_eq!(suggestion_for_io(&pd), "Check the file permissions.");
        assert_eq!(suggestion_for_io(&other), "Check the error details in the log.");
    }
}

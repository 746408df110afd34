//! Result records and their persistence.
//!
//! [`OcrResult`] is the per-file outcome and is never an `Err`: a failed file
//! carries `success == false` and the message in `error`, with empty text and
//! a zero image size. Reports aggregate results into JSON documents.

use crate::backend::{Device, InferenceSettings};
use crate::error::OcrError;
use crate::memory::MemoryReport;
use crate::perf::PerformanceSummary;
use crate::pipeline::pdf::PdfConversionResult;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Outcome of OCR on one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub file_path: PathBuf,
    /// Cleaned Markdown. Empty on failure.
    pub text: String,
    pub processing_time_secs: f64,
    pub image_size: (u32, u32),
    pub memory_used_gb: f64,
    pub timestamp: DateTime<Local>,
    /// Settings the model ran with; `None` when it never ran.
    pub settings: Option<InferenceSettings>,
    pub device: Option<Device>,
    pub success: bool,
    pub error: Option<String>,
}

impl OcrResult {
    pub fn failure(
        file_path: impl Into<PathBuf>,
        error: impl Into<String>,
        processing_time_secs: f64,
        device: Option<Device>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            text: String::new(),
            processing_time_secs,
            image_size: (0, 0),
            memory_used_gb: 0.0,
            timestamp: Local::now(),
            settings: None,
            device,
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_path.display().to_string())
    }
}

/// Model binding state for `dsocr info` and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub loaded: bool,
    pub provider: String,
    pub model: String,
    pub device: Option<Device>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vram_used_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vram_total_gb: Option<f64>,
}

/// Counts and timings over a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_time_secs: f64,
    pub average_time_secs: f64,
    /// Percent, 0–100.
    pub success_rate: f64,
    /// `(file, error)` for every failure.
    pub failures: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn from_results(results: &[OcrResult]) -> Self {
        let total = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let total_time_secs: f64 = results.iter().map(|r| r.processing_time_secs).sum();
        let failures = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| (r.file_name(), r.error.clone().unwrap_or_default()))
            .collect();

        Self {
            total_processed: total,
            successful,
            failed: total - successful,
            total_time_secs,
            average_time_secs: if total > 0 { total_time_secs / total as f64 } else { 0.0 },
            success_rate: if total > 0 {
                successful as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            failures,
        }
    }
}

/// The `report.json` written by a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrReport {
    pub generated_at: DateTime<Local>,
    pub input: PathBuf,
    pub summary: BatchSummary,
    pub results: Vec<OcrResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdf: Option<PdfConversionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceSummary>,
}

impl OcrReport {
    pub fn new(input: impl Into<PathBuf>, results: Vec<OcrResult>) -> Self {
        Self {
            generated_at: Local::now(),
            input: input.into(),
            summary: BatchSummary::from_results(&results),
            results,
            pdf: None,
            memory: None,
            performance: None,
        }
    }
}

fn write_err(path: &Path) -> impl Fn(std::io::Error) -> OcrError + '_ {
    move |source| OcrError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `<dir>/<stem>.md` atomically (temp file in `dir`, then rename).
pub fn write_markdown(dir: &Path, stem: &str, text: &str) -> Result<PathBuf, OcrError> {
    std::fs::create_dir_all(dir).map_err(write_err(dir))?;
    let path = dir.join(format!("{stem}.md"));

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err(&path))?;
    tmp.write_all(text.as_bytes()).map_err(write_err(&path))?;
    tmp.persist(&path).map_err(|e| OcrError::OutputWriteFailed {
        path: path.clone(),
        source: e.error,
    })?;

    debug!("Wrote {}", path.display());
    Ok(path)
}

/// Pretty JSON, creating parent directories.
pub fn write_json_report<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), OcrError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err(parent))?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| OcrError::Internal(format!("report serialisation: {e}")))?;
    std::fs::write(path, json).map_err(write_err(path))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(name: &str, secs: f64) -> OcrResult {
        OcrResult {
            file_path: name.into(),
            text: "# Hi\n".into(),
            processing_time_secs: secs,
            image_size: (100, 50),
            memory_used_gb: 0.0,
            timestamp: Local::now(),
            settings: Some(InferenceSettings::default()),
            device: Some(Device::Cpu),
            success: true,
            error: None,
        }
    }

    #[test]
    fn failure_record_invariants() {
        let r = OcrResult::failure("dir/x.png", "File not found", 0.1, None);
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("File not found"));
        assert!(r.text.is_empty());
        assert_eq!(r.image_size, (0, 0));
        assert_eq!(r.file_name(), "x.png");
    }

    #[test]
    fn batch_summary() {
        let results = vec![
            ok("a.png", 1.0),
            ok("b.png", 3.0),
            OcrResult::failure("c.png", "boom", 2.0, None),
        ];
        let s = BatchSummary::from_results(&results);
        assert_eq!(s.total_processed, 3);
        assert_eq!(s.successful, 2);
        assert_eq!(s.failed, 1);
        assert!((s.total_time_secs - 6.0).abs() < 1e-9);
        assert!((s.average_time_secs - 2.0).abs() < 1e-9);
        assert!((s.success_rate - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.failures, vec![("c.png".to_string(), "boom".to_string())]);

        assert_eq!(BatchSummary::from_results(&[]), BatchSummary::default());
    }

    #[test]
    fn markdown_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("md");
        let path = write_markdown(&out, "page_0001", "# Title\n").unwrap();
        assert_eq!(path, out.join("page_0001.md"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# Title\n");
        // Overwrite keeps a single file.
        write_markdown(&out, "page_0001", "v2\n").unwrap();
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 1);
    }

    #[test]
    fn report_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/report.json");
        let report = OcrReport::new("inputs", vec![ok("a.png", 1.0)]);
        write_json_report(&path, &report).unwrap();
        let back: OcrReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.summary.successful, 1);
        assert_eq!(back.results[0].device, Some(Device::Cpu));
        assert!(back.pdf.is_none());
    }
}

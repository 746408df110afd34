//! Performance tracking: per-item timing with VRAM/CPU/RAM context, and the
//! free-running system monitor behind `dsocr monitor`.

use crate::error::OcrError;
use crate::memory::{MemoryManager, MemorySnapshot};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use sysinfo::System;
use tracing::{debug, info};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Started by [`PerformanceTracker::start`], consumed by
/// [`PerformanceTracker::record`].
#[derive(Debug)]
#[must_use = "pass the timer to PerformanceTracker::record"]
pub struct PerfTimer {
    started: Instant,
}

impl PerfTimer {
    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// One processed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Local>,
    pub processing_time_secs: f64,
    pub image_size: (u32, u32),
    pub vram_used_gb: f64,
    pub vram_total_gb: f64,
    pub vram_usage_percent: f64,
    pub gpu_available: bool,
    pub cpu_percent: f32,
    pub ram_used_gb: f64,
    pub ram_total_gb: f64,
    pub file_path: String,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl RangeStats {
    /// `None` for an empty input.
    pub fn of(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut n = 0usize;
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for v in values {
            n += 1;
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        (n > 0).then(|| Self {
            min,
            max,
            avg: sum / n as f64,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<TimeStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vram_usage_gb: Option<RangeStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Local>,
    pub summary: PerformanceSummary,
    pub metrics: Vec<PerformanceSample>,
}

/// Accumulates [`PerformanceSample`]s. Shared behind an `Arc`.
pub struct PerformanceTracker {
    memory: Arc<MemoryManager>,
    device: u32,
    system: Mutex<System>,
    history: Mutex<Vec<PerformanceSample>>,
}

impl PerformanceTracker {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        debug!("Performance tracker ready");
        Self {
            memory,
            device: 0,
            system: Mutex::new(system),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Sample VRAM from `device` instead of 0.
    pub fn with_device(mut self, device: u32) -> Self {
        self.device = device;
        self
    }

    pub fn start(&self) -> PerfTimer {
        PerfTimer {
            started: Instant::now(),
        }
    }

    /// Close `timer`, sample the machine and append to history.
    pub fn record(
        &self,
        timer: PerfTimer,
        image_size: (u32, u32),
        file_path: impl Into<String>,
        success: bool,
    ) -> PerformanceSample {
        let processing_time_secs = timer.elapsed_secs();
        let vram = self.memory.snapshot(self.device);

        let (cpu_percent, ram_used_gb, ram_total_gb) = match self.system.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                (
                    sys.global_cpu_usage(),
                    sys.used_memory() as f64 / GIB,
                    sys.total_memory() as f64 / GIB,
                )
            }
            Err(_) => (0.0, 0.0, 0.0),
        };

        let sample = PerformanceSample {
            timestamp: Local::now(),
            processing_time_secs,
            image_size,
            vram_used_gb: vram.used_gb,
            vram_total_gb: vram.total_gb,
            vram_usage_percent: vram.usage_percent,
            gpu_available: vram.gpu_available,
            cpu_percent,
            ram_used_gb,
            ram_total_gb,
            file_path: file_path.into(),
            success,
        };

        info!(
            "Tracked {}: {:.2}s, VRAM {:.2} GB",
            sample.file_path, processing_time_secs, vram.used_gb
        );
        if let Ok(mut history) = self.history.lock() {
            history.push(sample.clone());
        }
        sample
    }

    pub fn history(&self) -> Vec<PerformanceSample> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn summary(&self) -> PerformanceSummary {
        let history = self.history();
        let successful: Vec<&PerformanceSample> = history.iter().filter(|m| m.success).collect();

        let processing_time = RangeStats::of(successful.iter().map(|m| m.processing_time_secs))
            .map(|r| TimeStats {
                min: r.min,
                max: r.max,
                avg: r.avg,
                total: successful.iter().map(|m| m.processing_time_secs).sum(),
            });
        let vram_usage_gb = RangeStats::of(
            successful
                .iter()
                .filter(|m| m.gpu_available)
                .map(|m| m.vram_used_gb),
        );

        PerformanceSummary {
            total_processed: history.len(),
            successful: successful.len(),
            failed: history.len() - successful.len(),
            processing_time,
            vram_usage_gb,
        }
    }

    pub fn report(&self) -> PerformanceReport {
        PerformanceReport {
            generated_at: Local::now(),
            summary: self.summary(),
            metrics: self.history(),
        }
    }

    /// Write [`PerformanceTracker::report`] as JSON.
    pub fn export_report(&self, path: impl AsRef<Path>) -> Result<PathBuf, OcrError> {
        let path = path.as_ref();
        crate::output::write_json_report(path, &self.report())?;
        info!("Performance report exported to {}", path.display());
        Ok(path.to_path_buf())
    }

    pub fn clear(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
        info!("Performance history cleared");
    }
}

// ── System monitor ───────────────────────────────────────────────────────

/// One tick of the system monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSample {
    pub timestamp: DateTime<Local>,
    pub cpu_percent: f32,
    pub cpu_cores: usize,
    pub ram_used_gb: f64,
    pub ram_total_gb: f64,
    pub ram_available_gb: f64,
    pub ram_percent: f64,
    pub vram: MemorySnapshot,
}

/// CPU/RAM/VRAM sampler for a monitoring loop.
pub struct SystemMonitor {
    memory: Arc<MemoryManager>,
    device: u32,
    system: System,
}

impl SystemMonitor {
    pub fn new(memory: Arc<MemoryManager>, device: u32) -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self {
            memory,
            device,
            system,
        }
    }

    pub fn sample(&mut self) -> SystemSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory() as f64;
        let used = self.system.used_memory() as f64;
        SystemSample {
            timestamp: Local::now(),
            cpu_percent: self.system.global_cpu_usage(),
            cpu_cores: self.system.cpus().len(),
            ram_used_gb: used / GIB,
            ram_total_gb: total / GIB,
            ram_available_gb: self.system.available_memory() as f64 / GIB,
            ram_percent: if total > 0.0 { used / total * 100.0 } else { 0.0 },
            vram: self.memory.snapshot(self.device),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuStats {
    pub name: String,
    pub vram_percent: RangeStats,
}

/// Aggregate of a monitoring session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorReport {
    pub generated_at: DateTime<Local>,
    pub duration_secs: f64,
    pub samples: usize,
    pub cpu: RangeStats,
    pub ram: RangeStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuStats>,
}

impl MonitorReport {
    /// `None` when no samples were taken.
    pub fn from_samples(samples: &[SystemSample]) -> Option<Self> {
        let first = samples.first()?;
        let last = samples.last()?;
        let cpu = RangeStats::of(samples.iter().map(|s| s.cpu_percent as f64))?;
        let ram = RangeStats::of(samples.iter().map(|s| s.ram_percent))?;
        let gpu = if first.vram.gpu_available {
            RangeStats::of(samples.iter().map(|s| s.vram.usage_percent)).map(|vram_percent| {
                GpuStats {
                    name: first.vram.device_name.clone(),
                    vram_percent,
                }
            })
        } else {
            None
        };

        Some(Self {
            generated_at: Local::now(),
            duration_secs: (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0,
            samples: samples.len(),
            cpu,
            ram,
            gpu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NoGpu;

    fn tracker() -> PerformanceTracker {
        PerformanceTracker::new(Arc::new(MemoryManager::new(Arc::new(NoGpu), 0.9)))
    }

    #[test]
    fn empty_summary() {
        let s = tracker().summary();
        assert_eq!(s.total_processed, 0);
        assert!(s.processing_time.is_none());
        assert!(s.vram_usage_gb.is_none());
    }

    #[test]
    fn summary_counts_success_and_failure() {
        let t = tracker();
        let timer = t.start();
        let sample = t.record(timer, (640, 480), "a.png", true);
        assert!(!sample.gpu_available);
        assert_eq!(sample.vram_used_gb, 0.0);
        t.record(t.start(), (0, 0), "b.png", false);

        let s = t.summary();
        assert_eq!(s.total_processed, 2);
        assert_eq!(s.successful, 1);
        assert_eq!(s.failed, 1);
        let time = s.processing_time.unwrap();
        assert!(time.min <= time.avg && time.avg <= time.max);
        assert!(s.vram_usage_gb.is_none(), "CPU samples carry no VRAM stats");

        t.clear();
        assert!(t.history().is_empty());
    }

    #[test]
    fn export_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker();
        t.record(t.start(), (10, 10), "x.png", true);
        let path = t.export_report(dir.path().join("perf/report.json")).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["summary"]["total_processed"], 1);
        assert_eq!(json["metrics"].as_array().unwrap().len(), 1);
        assert!(json["generated_at"].is_string());
    }

    #[test]
    fn range_stats() {
        let r = RangeStats::of([2.0, 4.0, 6.0]).unwrap();
        assert_eq!((r.min, r.max, r.avg), (2.0, 6.0, 4.0));
        assert!(RangeStats::of(std::iter::empty()).is_none());
    }

    #[test]
    fn monitor_report_without_gpu() {
        let mut monitor = SystemMonitor::new(Arc::new(MemoryManager::new(Arc::new(NoGpu), 0.9)), 0);
        let samples = vec![monitor.sample(), monitor.sample()];
        let report = MonitorReport::from_samples(&samples).unwrap();
        assert_eq!(report.samples, 2);
        assert!(report.gpu.is_none());
        assert!(report.cpu.min <= report.cpu.max);
        assert!(MonitorReport::from_samples(&[]).is_none());
    }
}

//! Device memory monitoring and the VRAM heuristics built on it.
//!
//! [`MemoryManager`] never talks to the driver directly: it asks a
//! [`DeviceMemory`] probe. [`NvidiaSmi`] parses `nvidia-smi` CSV output;
//! [`NoGpu`] stands in on machines without one. Tests plug in their own.
//!
//! ## Heuristics
//!
//! | Check | Rule |
//! |-------|------|
//! | critical | `usage / 100 >= vram_threshold` |
//! | batch size | no GPU → 1; usage > 80 % → base/2; > 4 MP → 1; > 1 MP → base/2; else base |
//! | auto-manage | clear the cache when critical, then re-measure |

use crate::error::OcrError;
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB: u64 = 1024 * 1024;

/// Raw reading from a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReading {
    pub name: String,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Source of device memory figures.
pub trait DeviceMemory: Send + Sync {
    /// Number of visible GPUs. Zero means CPU-only.
    fn device_count(&self) -> u32;

    fn read(&self, device: u32) -> Result<DeviceReading, OcrError>;

    /// Ask the device to hand back cached allocations.
    fn release_cache(&self, device: u32) -> Result<(), OcrError>;
}

// ── Probes ───────────────────────────────────────────────────────────────

/// The CPU-only probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGpu;

impl DeviceMemory for NoGpu {
    fn device_count(&self) -> u32 {
        0
    }

    fn read(&self, _device: u32) -> Result<DeviceReading, OcrError> {
        Err(OcrError::GpuUnavailable)
    }

    fn release_cache(&self, _device: u32) -> Result<(), OcrError> {
        debug!("No GPU present, nothing to release");
        Ok(())
    }
}

/// Queries NVIDIA GPUs through the `nvidia-smi` tool.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    binary: String,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".into(),
        }
    }
}

impl NvidiaSmi {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn query(&self) -> Result<Vec<DeviceReading>, OcrError> {
        let output = Command::new(&self.binary)
            .args([
                "--query-gpu=name,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| OcrError::Internal(format!("failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(OcrError::Internal(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_smi_csv(&String::from_utf8_lossy(&output.stdout))
    }
}

impl DeviceMemory for NvidiaSmi {
    fn device_count(&self) -> u32 {
        match self.query() {
            Ok(devices) => devices.len() as u32,
            Err(e) => {
                debug!("GPU query failed: {}", e);
                0
            }
        }
    }

    fn read(&self, device: u32) -> Result<DeviceReading, OcrError> {
        self.query()?
            .into_iter()
            .nth(device as usize)
            .ok_or(OcrError::GpuUnavailable)
    }

    fn release_cache(&self, device: u32) -> Result<(), OcrError> {
        // Allocator caches belong to the serving process; the model server
        // releases them on unload. Nothing to do from outside.
        debug!("cuda:{}: cache release delegated to the model server", device);
        Ok(())
    }
}

/// Parse `name, used_mib, total_mib` lines.
pub fn parse_smi_csv(text: &str) -> Result<Vec<DeviceReading>, OcrError> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.rsplitn(3, ',').map(str::trim).collect();
            let &[total, used, name] = fields.as_slice() else {
                return Err(OcrError::Internal(format!("unexpected nvidia-smi line: '{line}'")));
            };
            let mib = |s: &str| {
                s.parse::<u64>()
                    .map(|v| v * MIB)
                    .map_err(|_| OcrError::Internal(format!("bad memory value '{s}' in '{line}'")))
            };
            Ok(DeviceReading {
                name: name.to_string(),
                used_bytes: mib(used)?,
                total_bytes: mib(total)?,
            })
        })
        .collect()
}

/// `NvidiaSmi` when it answers, otherwise [`NoGpu`].
pub fn detect_probe() -> Arc<dyn DeviceMemory> {
    let smi = NvidiaSmi::default();
    if smi.device_count() > 0 {
        Arc::new(smi)
    } else {
        info!("No NVIDIA GPU detected, running in CPU mode");
        Arc::new(NoGpu)
    }
}

// ── Records ──────────────────────────────────────────────────────────────

/// Point-in-time device memory figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub used_gb: f64,
    pub free_gb: f64,
    pub total_gb: f64,
    pub usage_percent: f64,
    pub gpu_available: bool,
    pub device_name: String,
}

impl MemorySnapshot {
    pub fn unavailable() -> Self {
        Self {
            used_gb: 0.0,
            free_gb: 0.0,
            total_gb: 0.0,
            usage_percent: 0.0,
            gpu_available: false,
            device_name: "CPU".into(),
        }
    }

    fn from_reading(r: &DeviceReading) -> Self {
        let used_gb = r.used_bytes as f64 / GIB;
        let total_gb = r.total_bytes as f64 / GIB;
        let usage_percent = if r.total_bytes > 0 {
            r.used_bytes as f64 / r.total_bytes as f64 * 100.0
        } else {
            0.0
        };
        Self {
            used_gb,
            free_gb: (total_gb - used_gb).max(0.0),
            total_gb,
            usage_percent,
            gpu_available: true,
            device_name: r.name.clone(),
        }
    }
}

/// What [`MemoryManager::auto_manage`] did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MemoryAction {
    Skipped { reason: String },
    Cleared { before_usage_percent: f64, after_usage_percent: f64, freed_gb: f64 },
    None { usage_percent: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdInfo {
    pub warning_percent: f64,
    pub is_critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryReport {
    pub gpu_available: bool,
    pub device_name: String,
    pub device_count: u32,
    pub vram: MemorySnapshot,
    pub threshold: ThresholdInfo,
}

// ── Manager ──────────────────────────────────────────────────────────────

/// VRAM bookkeeping shared by the engine, the tracker and the CLI.
///
/// The device count is read once at construction; afterwards each
/// snapshot is a single probe read.
pub struct MemoryManager {
    probe: Arc<dyn DeviceMemory>,
    vram_threshold: f64,
    device_count: u32,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("probe", &"<dyn DeviceMemory>")
            .field("vram_threshold", &self.vram_threshold)
            .field("device_count", &self.device_count)
            .finish()
    }
}

impl MemoryManager {
    pub fn new(probe: Arc<dyn DeviceMemory>, vram_threshold: f64) -> Self {
        let device_count = probe.device_count();
        let manager = Self {
            probe,
            vram_threshold,
            device_count,
        };
        if manager.gpu_available() {
            let name = manager.snapshot(0).device_name;
            info!("Memory manager ready, GPU: {}", name);
        } else {
            warn!("No GPU available, using CPU mode");
        }
        info!("VRAM threshold: {:.1}%", vram_threshold * 100.0);
        manager
    }

    /// Manager over the auto-detected probe.
    pub fn detect(vram_threshold: f64) -> Self {
        Self::new(detect_probe(), vram_threshold)
    }

    pub fn vram_threshold(&self) -> f64 {
        self.vram_threshold
    }

    pub fn gpu_available(&self) -> bool {
        self.device_count > 0
    }

    pub fn device_count(&self) -> u32 {
        self.device_count
    }

    pub fn snapshot(&self, device: u32) -> MemorySnapshot {
        if !self.gpu_available() {
            return MemorySnapshot::unavailable();
        }
        match self.probe.read(device) {
            Ok(reading) => MemorySnapshot::from_reading(&reading),
            Err(e) => {
                error!("Failed to read VRAM of cuda:{}: {}", device, e);
                MemorySnapshot::unavailable()
            }
        }
    }

    /// Release cached memory and return the GB freed.
    pub fn clear_cache(&self, device: u32) -> f64 {
        if !self.gpu_available() {
            debug!("No GPU available, skipping cache clear");
            return 0.0;
        }
        let before = self.snapshot(device);
        self.finish_clear(device, &before)
    }

    /// Second half of a cache clear whose first half happened elsewhere
    /// (the model server dropping its weights). Releases the probe's cache
    /// and returns the GB freed since `before`.
    pub fn finish_clear(&self, device: u32, before: &MemorySnapshot) -> f64 {
        if !self.gpu_available() {
            return 0.0;
        }
        if let Err(e) = self.probe.release_cache(device) {
            error!("Cache clear failed: {}", e);
        }
        let after = self.snapshot(device);
        let freed = (before.used_gb - after.used_gb).max(0.0);
        info!("Cache cleared, freed {:.2} GB VRAM", freed);
        freed
    }

    pub fn has_free(&self, required_gb: f64, device: u32) -> bool {
        if !self.gpu_available() {
            return false;
        }
        let free = self.snapshot(device).free_gb;
        debug!("VRAM check: need {:.2} GB, free {:.2} GB", required_gb, free);
        free >= required_gb
    }

    pub fn is_critical(&self, device: u32) -> bool {
        if !self.gpu_available() {
            return false;
        }
        self.is_critical_at(&self.snapshot(device))
    }

    fn is_critical_at(&self, snap: &MemorySnapshot) -> bool {
        let critical = snap.gpu_available && snap.usage_percent / 100.0 >= self.vram_threshold;
        if critical {
            warn!(
                "VRAM usage critical: {:.1}% (threshold {:.1}%)",
                snap.usage_percent,
                self.vram_threshold * 100.0
            );
        }
        critical
    }

    /// How many images to prepare ahead for the given image size.
    pub fn optimal_batch_size(&self, base: usize, image_size: (u32, u32), device: u32) -> usize {
        if !self.gpu_available() {
            return 1;
        }

        let snap = self.snapshot(device);
        if snap.usage_percent > 80.0 {
            let size = (base / 2).max(1);
            info!(
                "High VRAM usage ({:.1}%), batch size {} -> {}",
                snap.usage_percent, base, size
            );
            return size;
        }

        let pixels = image_size.0 as u64 * image_size.1 as u64;
        let size = if pixels > 2048 * 2048 {
            1
        } else if pixels > 1024 * 1024 {
            (base / 2).max(1)
        } else {
            base
        };
        debug!("Image {:?}: batch size {}", image_size, size);
        size
    }

    pub fn auto_manage(&self, device: u32) -> MemoryAction {
        if !self.gpu_available() {
            return MemoryAction::Skipped {
                reason: "no GPU available".into(),
            };
        }

        let before = self.snapshot(device);
        if self.is_critical_at(&before) {
            info!("VRAM usage too high, clearing cache");
            self.finish_clear(device, &before);
            let after = self.snapshot(device);
            return MemoryAction::Cleared {
                before_usage_percent: before.usage_percent,
                after_usage_percent: after.usage_percent,
                freed_gb: before.used_gb - after.used_gb,
            };
        }

        MemoryAction::None {
            usage_percent: before.usage_percent,
        }
    }

    pub fn report(&self, device: u32) -> MemoryReport {
        let vram = self.snapshot(device);
        MemoryReport {
            gpu_available: vram.gpu_available,
            device_name: vram.device_name.clone(),
            device_count: self.device_count(),
            threshold: ThresholdInfo {
                warning_percent: self.vram_threshold * 100.0,
                is_critical: self.is_critical_at(&vram),
            },
            vram,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Probe with a settable used/total and a fixed amount freed on release.
    struct FakeGpu {
        state: Mutex<(u64, u64)>,
        release_frees: u64,
    }

    impl FakeGpu {
        fn new(used_gb: u64, total_gb: u64) -> Self {
            Self {
                state: Mutex::new((used_gb << 30, total_gb << 30)),
                release_frees: 0,
            }
        }
    }

    impl DeviceMemory for FakeGpu {
        fn device_count(&self) -> u32 {
            1
        }

        fn read(&self, _device: u32) -> Result<DeviceReading, OcrError> {
            let (used, total) = *self.state.lock().unwrap();
            Ok(DeviceReading {
                name: "Fake RTX".into(),
                used_bytes: used,
                total_bytes: total,
            })
        }

        fn release_cache(&self, _device: u32) -> Result<(), OcrError> {
            let mut s = self.state.lock().unwrap();
            s.0 = s.0.saturating_sub(self.release_frees);
            Ok(())
        }
    }

    fn manager(used: u64, total: u64) -> MemoryManager {
        MemoryManager::new(Arc::new(FakeGpu::new(used, total)), 0.9)
    }

    #[test]
    fn parses_nvidia_smi_csv() {
        let out = "NVIDIA GeForce RTX 3090, 1024, 24576\nTesla T4, 0, 15360\n";
        let devices = parse_smi_csv(out).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "NVIDIA GeForce RTX 3090");
        assert_eq!(devices[0].used_bytes, 1024 * MIB);
        assert_eq!(devices[1].total_bytes, 15360 * MIB);
        assert!(parse_smi_csv("garbage").is_err());
        assert!(parse_smi_csv("").unwrap().is_empty());
    }

    #[test]
    fn no_gpu_snapshot_is_zeroed() {
        let m = MemoryManager::new(Arc::new(NoGpu), 0.9);
        let s = m.snapshot(0);
        assert_eq!(s, MemorySnapshot::unavailable());
        assert_eq!(s.device_name, "CPU");
        assert!(!m.is_critical(0));
        assert!(!m.has_free(0.1, 0));
        assert_eq!(m.clear_cache(0), 0.0);
        assert!(matches!(m.auto_manage(0), MemoryAction::Skipped { .. }));
    }

    #[test]
    fn snapshot_computes_usage() {
        let s = manager(6, 24).snapshot(0);
        assert!(s.gpu_available);
        assert!((s.usage_percent - 25.0).abs() < 1e-9);
        assert!((s.free_gb - 18.0).abs() < 1e-9);
    }

    #[test]
    fn critical_uses_greater_or_equal() {
        // 9/10 = exactly 90 %
        assert!(manager(9, 10).is_critical(0));
        assert!(!manager(8, 10).is_critical(0));
    }

    #[test]
    fn batch_size_heuristic_table() {
        let cpu = MemoryManager::new(Arc::new(NoGpu), 0.9);
        assert_eq!(cpu.optimal_batch_size(4, (640, 480), 0), 1);

        let busy = manager(17, 20); // 85 %
        assert_eq!(busy.optimal_batch_size(4, (640, 480), 0), 2);
        assert_eq!(busy.optimal_batch_size(1, (640, 480), 0), 1);

        let idle = manager(2, 20);
        assert_eq!(idle.optimal_batch_size(4, (4000, 3000), 0), 1);
        assert_eq!(idle.optimal_batch_size(4, (1600, 1200), 0), 2);
        assert_eq!(idle.optimal_batch_size(4, (1024, 1024), 0), 4);
        assert_eq!(idle.optimal_batch_size(4, (800, 600), 0), 4);
    }

    #[test]
    fn auto_manage_clears_only_when_critical() {
        let mut gpu = FakeGpu::new(19, 20);
        gpu.release_frees = 4 << 30;
        let m = MemoryManager::new(Arc::new(gpu), 0.9);
        match m.auto_manage(0) {
            MemoryAction::Cleared { freed_gb, after_usage_percent, .. } => {
                assert!((freed_gb - 4.0).abs() < 1e-9);
                assert!((after_usage_percent - 75.0).abs() < 1e-9);
            }
            other => panic!("expected Cleared, got {other:?}"),
        }
        assert!(matches!(m.auto_manage(0), MemoryAction::None { .. }));
    }

    /// Counts every probe call; reads fail after `fail_after` reads.
    #[derive(Default)]
    struct CountingGpu {
        counts: Mutex<(usize, usize)>,
        fail_after: Option<usize>,
    }

    impl DeviceMemory for CountingGpu {
        fn device_count(&self) -> u32 {
            self.counts.lock().unwrap().0 += 1;
            1
        }

        fn read(&self, _device: u32) -> Result<DeviceReading, OcrError> {
            let mut c = self.counts.lock().unwrap();
            c.1 += 1;
            if self.fail_after.is_some_and(|n| c.1 > n) {
                return Err(OcrError::Internal("query failed".into()));
            }
            Ok(DeviceReading {
                name: "Counting GPU".into(),
                used_bytes: 2 << 30,
                total_bytes: 20 << 30,
            })
        }

        fn release_cache(&self, _device: u32) -> Result<(), OcrError> {
            Ok(())
        }
    }

    #[test]
    fn device_count_is_read_once_and_checks_read_once() {
        let gpu = Arc::new(CountingGpu::default());
        let m = MemoryManager::new(gpu.clone(), 0.9);
        let after_new = gpu.counts.lock().unwrap().1;

        m.snapshot(0);
        m.is_critical(0);
        m.has_free(1.0, 0);
        m.optimal_batch_size(4, (640, 480), 0);
        assert!(m.gpu_available());
        assert_eq!(m.device_count(), 1);

        let (count_calls, reads) = *gpu.counts.lock().unwrap();
        assert_eq!(count_calls, 1);
        assert_eq!(reads - after_new, 4);
    }

    #[test]
    fn failed_read_keeps_gpu_available() {
        let gpu = Arc::new(CountingGpu {
            fail_after: Some(1),
            ..Default::default()
        });
        let m = MemoryManager::new(gpu, 0.9);
        let snap = m.snapshot(0);
        assert!(!snap.gpu_available);
        assert!(m.gpu_available());
        assert_eq!(m.optimal_batch_size(4, (640, 480), 0), 4);
    }

    #[test]
    fn finish_clear_measures_from_given_snapshot() {
        let m = manager(4, 20);
        let mut before = m.snapshot(0);
        before.used_gb = 10.0;
        assert!((m.finish_clear(0, &before) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn report_includes_threshold() {
        let r = manager(19, 20).report(0);
        assert_eq!(r.device_count, 1);
        assert!(r.threshold.is_critical);
        assert!((r.threshold.warning_percent - 90.0).abs() < 1e-9);
    }
}

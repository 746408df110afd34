//! Version and hardware information for `dsocr info`.

use crate::memory::{MemoryManager, MemoryReport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sysinfo::System;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Where the PDFium library was found, if anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfiumStatus {
    pub found: bool,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl PdfiumStatus {
    pub fn detect() -> Self {
        match pdfium_locate::locate() {
            Some(lib) => Self {
                found: true,
                version: pdfium_locate::PDFIUM_VERSION.into(),
                path: Some(lib.path),
                source: Some(lib.source.to_string()),
            },
            None => Self {
                found: false,
                version: pdfium_locate::PDFIUM_VERSION.into(),
                path: None,
                source: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    pub target_os: String,
    pub target_arch: String,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub ram_total_gb: f64,
    pub gpu: MemoryReport,
    pub pdfium: PdfiumStatus,
}

impl VersionInfo {
    /// Gather everything `dsocr info` prints; GPU figures are for `device`.
    pub fn collect(memory: &MemoryManager, device: u32) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();

        let cpu_model = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "unknown".into());

        Self {
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            target_os: std::env::consts::OS.into(),
            target_arch: std::env::consts::ARCH.into(),
            os_name: System::name(),
            os_version: System::os_version(),
            cpu_model,
            cpu_cores: sys.cpus().len(),
            ram_total_gb: sys.total_memory() as f64 / GIB,
            gpu: memory.report(device),
            pdfium: PdfiumStatus::detect(),
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        return format!("{secs:.1}s");
    }
    let total = secs.round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else {
        format!("{m}m {s:02}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OcrError;
    use crate::memory::{DeviceMemory, DeviceReading};
    use std::sync::Arc;

    #[test]
    fn bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    struct TwoGpus;

    impl DeviceMemory for TwoGpus {
        fn device_count(&self) -> u32 {
            2
        }

        fn read(&self, device: u32) -> Result<DeviceReading, OcrError> {
            Ok(DeviceReading {
                name: format!("GPU {device}"),
                used_bytes: 1 << 30,
                total_bytes: 8 << 30,
            })
        }

        fn release_cache(&self, _device: u32) -> Result<(), OcrError> {
            Ok(())
        }
    }

    #[test]
    fn collect_reports_the_configured_device() {
        let memory = MemoryManager::new(Arc::new(TwoGpus), 0.9);
        let info = VersionInfo::collect(&memory, 1);
        assert_eq!(info.gpu.device_name, "GPU 1");
        assert_eq!(info.gpu.device_count, 2);
        assert_eq!(info.name, "dsocr");
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(4.31), "4.3s");
        assert_eq!(format_duration(125.0), "2m 05s");
        assert_eq!(format_duration(3723.0), "1h 02m 03s");
    }
}

//! Configuration types.
//!
//! Two layers:
//!
//! * [`AppConfig`] — the JSON file on disk (`config/system_config.json` by
//!   default). Every section and key has a default, so a partial file is
//!   valid. Dotted-key access (`"device.type"`) backs `dsocr config get/set`.
//!
//! * [`EngineConfig`] — the runtime knobs the [`crate::engine::OcrEngine`]
//!   and [`crate::backend::VisionLlmBackend`] read, built via
//!   [`EngineConfigBuilder`] or derived with [`AppConfig::engine_config`].

use crate::backend::{Device, InferenceSettings};
use crate::error::OcrError;
use crate::prompts::DEFAULT_PROMPT;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/system_config.json";

// ── File sections ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSection {
    pub name: String,
    pub version: String,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: "DeepSeek-OCR".into(),
            version: "1.0.0".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub model_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            model_dir: "./models/deepseek-ocr".into(),
            output_dir: "./outputs".into(),
            log_dir: "./outputs/logs".into(),
        }
    }
}

/// Compute device family named in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cuda,
    Cpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub index: u32,
    pub fallback_to_cpu: bool,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            kind: DeviceKind::Cuda,
            index: 0,
            fallback_to_cpu: true,
        }
    }
}

impl DeviceSection {
    pub fn device(&self) -> Device {
        match self.kind {
            DeviceKind::Cuda => Device::Gpu(self.index),
            DeviceKind::Cpu => Device::Cpu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Provider serving the model on the GPU host (e.g. "ollama", "vllm").
    pub provider: String,
    pub name: String,
    /// Provider and model used after a fallback to the CPU.
    pub cpu_provider: Option<String>,
    pub cpu_name: Option<String>,
    pub base_size: u32,
    pub image_size: u32,
    pub crop_mode: bool,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            provider: "ollama".into(),
            name: "deepseek-ocr".into(),
            cpu_provider: None,
            cpu_name: None,
            base_size: 1024,
            image_size: 1024,
            crop_mode: false,
            prompt: DEFAULT_PROMPT.into(),
            temperature: 0.0,
            max_tokens: 8192,
            max_retries: 3,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// Usage ratio at or above which the cache is cleared.
    pub vram_threshold: f64,
    /// Clear the cache every N batch items (0 disables).
    pub auto_clear_every: usize,
    pub base_batch_size: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            vram_threshold: 0.9,
            auto_clear_every: 5,
            base_batch_size: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfSection {
    pub dpi: u32,
    pub format: String,
    pub max_pages: Option<usize>,
}

impl Default for PdfSection {
    fn default() -> Self {
        Self {
            dpi: 200,
            format: "png".into(),
            max_pages: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub console_output: bool,
    pub file_output: bool,
    pub colored: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "INFO".into(),
            console_output: true,
            file_output: true,
            colored: true,
        }
    }
}

/// The application configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub project: ProjectSection,
    pub paths: PathsSection,
    pub device: DeviceSection,
    pub model: ModelSection,
    pub memory: MemorySection,
    pub pdf: PdfSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load from `path`. A missing file yields defaults; an unreadable or
    /// malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OcrError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config file '{}' not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path).map_err(|e| OcrError::Configuration {
            item: path.display().to_string(),
            issue: format!("cannot read file: {e}"),
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| OcrError::Configuration {
            item: path.display().to_string(),
            issue: format!("malformed JSON: {e}"),
        })?;

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Like [`AppConfig::load`], but any error is logged and defaults returned.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{e}; falling back to default configuration");
                Self::default()
            }
        }
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), OcrError> {
        let path = path.as_ref();
        let write_err = |source| OcrError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| OcrError::Internal(format!("config serialisation: {e}")))?;
        std::fs::write(path, json + "\n").map_err(write_err)?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Read a value by dotted key, e.g. `"model.image_size"`.
    pub fn get(&self, key_path: &str) -> Option<Value> {
        let root = serde_json::to_value(self).ok()?;
        key_path
            .split('.')
            .try_fold(&root, |node, key| node.get(key))
            .cloned()
    }

    /// Set a value by dotted key. Intermediate objects are created; the result
    /// must still deserialise into an [`AppConfig`], so type mismatches are
    /// rejected and leave `self` unchanged.
    pub fn set(&mut self, key_path: &str, value: Value) -> Result<(), OcrError> {
        let bad_key = |issue: &str| OcrError::Configuration {
            item: key_path.to_string(),
            issue: issue.to_string(),
        };

        let mut root = serde_json::to_value(&*self)
            .map_err(|e| OcrError::Internal(format!("config serialisation: {e}")))?;

        let keys: Vec<&str> = key_path.split('.').collect();
        if keys.iter().any(|k| k.is_empty()) {
            return Err(bad_key("empty key segment"));
        }
        let (last, parents) = keys
            .split_last()
            .ok_or_else(|| bad_key("empty key"))?;

        let mut node = &mut root;
        for key in parents {
            let obj = node
                .as_object_mut()
                .ok_or_else(|| bad_key("path crosses a non-object value"))?;
            node = obj
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        node.as_object_mut()
            .ok_or_else(|| bad_key("path crosses a non-object value"))?
            .insert(last.to_string(), value);

        let updated: AppConfig =
            serde_json::from_value(root).map_err(|e| bad_key(&format!("invalid value: {e}")))?;
        *self = updated;
        debug!("Config key '{}' updated", key_path);
        Ok(())
    }

    /// Range-check values that deserialise fine but make no sense.
    pub fn validate(&self) -> Result<(), OcrError> {
        let fail = |item: &str, issue: String| {
            Err(OcrError::Configuration {
                item: item.into(),
                issue,
            })
        };

        let t = self.memory.vram_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return fail("memory.vram_threshold", format!("must be in (0, 1], got {t}"));
        }
        if !(72..=600).contains(&self.pdf.dpi) {
            return fail("pdf.dpi", format!("must be 72–600, got {}", self.pdf.dpi));
        }
        if self.memory.base_batch_size == 0 {
            return fail("memory.base_batch_size", "must be ≥ 1".into());
        }
        if self.model.image_size < 64 {
            return fail("model.image_size", format!("must be ≥ 64, got {}", self.model.image_size));
        }
        if self.model.base_size < 64 {
            return fail("model.base_size", format!("must be ≥ 64, got {}", self.model.base_size));
        }
        let format = self.pdf.format.to_ascii_lowercase();
        if format != "png" && format != "jpeg" && format != "jpg" {
            return fail("pdf.format", format!("must be png or jpeg, got '{}'", self.pdf.format));
        }
        Ok(())
    }

    /// Runtime engine settings derived from this file.
    pub fn engine_config(&self) -> Result<EngineConfig, OcrError> {
        self.validate()?;
        let m = &self.model;
        let mut builder = EngineConfig::builder()
            .provider(&m.provider)
            .model(&m.name)
            .device(self.device.device())
            .fallback_to_cpu(self.device.fallback_to_cpu)
            .temperature(m.temperature)
            .max_tokens(m.max_tokens)
            .max_retries(m.max_retries)
            .timeout_secs(m.timeout_secs)
            .vram_threshold(self.memory.vram_threshold)
            .auto_clear_every(self.memory.auto_clear_every)
            .settings(InferenceSettings {
                prompt: m.prompt.clone(),
                base_size: m.base_size,
                image_size: m.image_size,
                crop_mode: m.crop_mode,
            });
        if let (Some(provider), Some(name)) = (&m.cpu_provider, &m.cpu_name) {
            builder = builder.cpu_model(provider, name);
        }
        builder.build()
    }
}

// ── Runtime configuration ────────────────────────────────────────────────

/// Runtime settings for an OCR engine and its backend.
///
/// # Example
/// ```rust
/// use dsocr::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .provider("ollama")
///     .model("deepseek-ocr")
///     .max_retries(2)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provider: String,
    pub model: String,
    /// `(provider, model)` bound when the engine falls back to the CPU.
    pub cpu_model: Option<(String, String)>,
    /// Device the model is first loaded on.
    pub device: Device,
    pub fallback_to_cpu: bool,
    /// Sampling temperature. OCR wants 0: transcription, not creativity.
    pub temperature: f32,
    pub max_tokens: usize,
    /// Retries on transient inference errors. Out-of-memory is never retried.
    pub max_retries: u32,
    /// Initial retry delay, doubled after each attempt.
    pub retry_backoff_ms: u64,
    /// Per-inference timeout.
    pub timeout_secs: u64,
    pub vram_threshold: f64,
    pub auto_clear_every: usize,
    /// Defaults applied when a caller passes no explicit settings.
    pub settings: InferenceSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let m = ModelSection::default();
        let mem = MemorySection::default();
        Self {
            provider: m.provider,
            model: m.name,
            cpu_model: None,
            device: Device::Gpu(0),
            fallback_to_cpu: true,
            temperature: m.temperature,
            max_tokens: m.max_tokens,
            max_retries: m.max_retries,
            retry_backoff_ms: 1000,
            timeout_secs: m.timeout_secs,
            vram_threshold: mem.vram_threshold,
            auto_clear_every: mem.auto_clear_every,
            settings: InferenceSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.config.provider = name.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn cpu_model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.config.cpu_model = Some((provider.into(), model.into()));
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    pub fn fallback_to_cpu(mut self, v: bool) -> Self {
        self.config.fallback_to_cpu = v;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs.max(1);
        self
    }

    pub fn vram_threshold(mut self, ratio: f64) -> Self {
        self.config.vram_threshold = ratio;
        self
    }

    pub fn auto_clear_every(mut self, n: usize) -> Self {
        self.config.auto_clear_every = n;
        self
    }

    pub fn settings(mut self, settings: InferenceSettings) -> Self {
        self.config.settings = settings;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<EngineConfig, OcrError> {
        let c = &self.config;
        if !(c.vram_threshold > 0.0 && c.vram_threshold <= 1.0) {
            return Err(OcrError::Configuration {
                item: "vram_threshold".into(),
                issue: format!("must be in (0, 1], got {}", c.vram_threshold),
            });
        }
        if c.provider.trim().is_empty() || c.model.trim().is_empty() {
            return Err(OcrError::Configuration {
                item: "model".into(),
                issue: "provider and model name must not be empty".into(),
            });
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let c = AppConfig::default();
        assert_eq!(c.project.name, "DeepSeek-OCR");
        assert_eq!(c.device.kind, DeviceKind::Cuda);
        assert!(c.device.fallback_to_cpu);
        assert_eq!(c.model.base_size, 1024);
        assert_eq!(c.model.image_size, 1024);
        assert_eq!(c.pdf.dpi, 200);
        assert_eq!(c.logging.level, "INFO");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let c: AppConfig = serde_json::from_str(r#"{"device": {"type": "cpu"}}"#).unwrap();
        assert_eq!(c.device.kind, DeviceKind::Cpu);
        assert!(c.device.fallback_to_cpu);
        assert_eq!(c.memory, MemorySection::default());
        assert_eq!(c.device.device(), Device::Cpu);
    }

    #[test]
    fn dotted_get() {
        let c = AppConfig::default();
        assert_eq!(c.get("device.type"), Some(json!("cuda")));
        assert_eq!(c.get("model.image_size"), Some(json!(1024)));
        assert_eq!(c.get("model.nope"), None);
    }

    #[test]
    fn dotted_set_updates_and_rejects_mismatch() {
        let mut c = AppConfig::default();
        c.set("pdf.dpi", json!(300)).unwrap();
        assert_eq!(c.pdf.dpi, 300);

        let err = c.set("pdf.dpi", json!("high")).unwrap_err();
        assert!(matches!(err, OcrError::Configuration { .. }));
        assert_eq!(c.pdf.dpi, 300, "failed set must not modify config");

        assert!(c.set("device..type", json!("cpu")).is_err());
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let mut c = AppConfig::default();
        c.memory.vram_threshold = 1.5;
        assert!(c.validate().is_err());

        let mut c = AppConfig::default();
        c.pdf.dpi = 1200;
        assert!(c.validate().is_err());

        let mut c = AppConfig::default();
        c.pdf.format = "gif".into();
        assert!(c.validate().is_err());

        let mut c = AppConfig::default();
        c.memory.base_batch_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = AppConfig::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(c, AppConfig::default());
    }

    #[test]
    fn load_malformed_file_errors_but_load_or_default_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(AppConfig::load(&path).is_err());
        assert_eq!(AppConfig::load_or_default(&path), AppConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut c = AppConfig::default();
        c.model.name = "deepseek-ocr:3b".into();
        c.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), c);
    }

    #[test]
    fn engine_config_from_file() {
        let mut c = AppConfig::default();
        c.model.cpu_provider = Some("ollama".into());
        c.model.cpu_name = Some("deepseek-ocr-cpu".into());
        c.device.index = 1;
        let e = c.engine_config().unwrap();
        assert_eq!(e.device, Device::Gpu(1));
        assert_eq!(
            e.cpu_model,
            Some(("ollama".to_string(), "deepseek-ocr-cpu".to_string()))
        );
        assert_eq!(e.settings.image_size, 1024);
    }

    #[test]
    fn builder_clamps_and_validates() {
        let e = EngineConfig::builder().temperature(9.0).build().unwrap();
        assert_eq!(e.temperature, 2.0);
        assert!(EngineConfig::builder().vram_threshold(0.0).build().is_err());
        assert!(EngineConfig::builder().model(" ").build().is_err());
    }
}

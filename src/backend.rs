//! The model seam: what the engine needs from an OCR model, and the default
//! implementation that reaches a served DeepSeek-OCR through `edgequake-llm`.
//!
//! ## Error classes
//!
//! A backend reports every failed call as an [`InferenceError`]:
//!
//! | Class | Engine reaction |
//! |-------|-----------------|
//! | `OutOfMemory` | never retried; triggers the CPU fallback |
//! | `Transient`   | retried with exponential backoff |
//! | `Fatal`       | recorded as a failed result |

use crate::config::EngineConfig;
use crate::error::OcrError;
use crate::pipeline::encode::encode_all;
use crate::prompts::{prompt_text, ModelMode, DEFAULT_PROMPT};
use crate::retry::{retry, RetryPolicy};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

// ── Device ───────────────────────────────────────────────────────────────

/// Where the model runs. Displayed and serialised as `cuda:N` / `cpu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Device {
    Gpu(u32),
    Cpu,
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }

    /// GPU ordinal used for memory queries; 0 for the CPU.
    pub fn memory_index(&self) -> u32 {
        match self {
            Device::Gpu(i) => *i,
            Device::Cpu => 0,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Gpu(i) => write!(f, "cuda:{i}"),
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        if s == "cuda" || s == "gpu" {
            return Ok(Device::Gpu(0));
        }
        s.strip_prefix("cuda:")
            .and_then(|n| n.parse().ok())
            .map(Device::Gpu)
            .ok_or_else(|| format!("unknown device '{s}' (cpu, cuda, cuda:N)"))
    }
}

impl From<Device> for String {
    fn from(d: Device) -> Self {
        d.to_string()
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ── Settings ─────────────────────────────────────────────────────────────

/// Per-call model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceSettings {
    pub prompt: String,
    /// Side of the global view in crop mode.
    pub base_size: u32,
    /// Side each image (or tile, in crop mode) is fitted to.
    pub image_size: u32,
    pub crop_mode: bool,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self::from_mode(ModelMode::Base)
    }
}

impl InferenceSettings {
    pub fn from_mode(mode: ModelMode) -> Self {
        let (base_size, image_size, crop_mode) = mode.sizes();
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            base_size,
            image_size,
            crop_mode,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

// ── Errors ───────────────────────────────────────────────────────────────

static RE_OOM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i:out of memory)|\bOOM\b").unwrap());

// Status codes only count as whole numbers: "1500 tokens" is not a 500.
static RE_TRANSIENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(429|5\d\d)\b|timeout|timed out|rate limit|connection|temporarily unavailable|overloaded",
    )
    .unwrap()
});

/// Failure of a single inference call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("transient inference error: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl InferenceError {
    /// Classify a provider error message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if RE_OOM.is_match(&message) {
            InferenceError::OutOfMemory(message)
        } else if RE_TRANSIENT.is_match(&message) {
            InferenceError::Transient(message)
        } else {
            InferenceError::Fatal(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, InferenceError::Transient(_))
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, InferenceError::OutOfMemory(_))
    }
}

impl From<InferenceError> for OcrError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::OutOfMemory(memory) => OcrError::OutOfMemory { memory },
            InferenceError::Transient(reason) | InferenceError::Fatal(reason) => {
                OcrError::Inference { reason }
            }
        }
    }
}

// ── Trait ────────────────────────────────────────────────────────────────

/// An OCR model that can be bound to a device and queried with images.
///
/// Implementations are used by one engine at a time; `&mut self` on the
/// lifecycle methods keeps loading and unloading exclusive.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Bind the model on `device`. Loading on a new device replaces any
    /// previous binding.
    async fn load(&mut self, device: Device) -> Result<(), OcrError>;

    async fn unload(&mut self);

    fn is_loaded(&self) -> bool;

    /// Device of the current binding.
    fn device(&self) -> Option<Device>;

    /// Run the model over prepared views of one input.
    async fn infer(
        &self,
        images: &[DynamicImage],
        settings: &InferenceSettings,
    ) -> Result<String, InferenceError>;

    /// `provider/model`, for logs and reports.
    fn describe(&self) -> String;

    /// Whether a CPU binding exists to fall back to after an OOM.
    fn has_cpu_fallback(&self) -> bool {
        true
    }

    /// Ask whatever holds the weights to give their memory back. The model
    /// stays bound; the next call may pay a reload.
    async fn release_cache(&self) -> Result<(), OcrError> {
        Ok(())
    }
}

/// Ollama keeps a model resident for a while after each call; a request with
/// `keep_alive: 0` evicts it from VRAM immediately.
const OLLAMA_DEFAULT_HOST: &str = "http://localhost:11434";

// ── Vision LLM backend ───────────────────────────────────────────────────

/// Talks to a served DeepSeek-OCR (Ollama, vLLM, any OpenAI-compatible host).
///
/// The GPU device binds `provider`/`model` from [`EngineConfig`]. The CPU
/// device binds `cpu_model` when one is configured and the primary model
/// otherwise, which is what a host without a local GPU wants.
pub struct VisionLlmBackend {
    config: EngineConfig,
    provider: Option<Arc<dyn LLMProvider>>,
    bound: Option<(Device, String, String)>,
    http: reqwest::Client,
}

impl fmt::Debug for VisionLlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionLlmBackend")
            .field("provider", &self.config.provider)
            .field("model", &self.config.model)
            .field("bound", &self.bound)
            .finish()
    }
}

impl VisionLlmBackend {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            provider: None,
            bound: None,
            http: reqwest::Client::new(),
        }
    }

    fn target(&self, device: Device) -> (String, String) {
        match (device, &self.config.cpu_model) {
            (Device::Cpu, Some(cpu)) => cpu.clone(),
            _ => (self.config.provider.clone(), self.config.model.clone()),
        }
    }

    async fn ollama_unload(&self, model: &str) -> Result<(), OcrError> {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| OLLAMA_DEFAULT_HOST.into());
        let url = format!("{}/api/generate", ollama_base_url(&host));
        debug!("Asking {} to unload {}", url, model);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "model": model, "keep_alive": 0 }))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| OcrError::Internal(format!("unload request to {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(OcrError::Internal(format!(
                "unload request to {url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            ..Default::default()
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.max_retries,
            initial_delay: Duration::from_millis(self.config.retry_backoff_ms),
            backoff_factor: 2.0,
        }
    }
}

#[async_trait]
impl OcrBackend for VisionLlmBackend {
    async fn load(&mut self, device: Device) -> Result<(), OcrError> {
        let (provider_name, model) = self.target(device);
        info!("Binding model {}/{} on {}", provider_name, model, device);

        let provider = ProviderFactory::create_llm_provider(&provider_name, &model).map_err(|e| {
            OcrError::ModelLoad {
                model: format!("{provider_name}/{model}"),
                reason: e.to_string(),
            }
        })?;

        self.provider = Some(provider);
        self.bound = Some((device, provider_name, model));
        Ok(())
    }

    async fn unload(&mut self) {
        if let Some((device, provider, model)) = self.bound.take() {
            info!("Released model {}/{} on {}", provider, model, device);
        }
        self.provider = None;
    }

    fn is_loaded(&self) -> bool {
        self.provider.is_some()
    }

    fn device(&self) -> Option<Device> {
        self.bound.as_ref().map(|(d, _, _)| *d)
    }

    async fn infer(
        &self,
        images: &[DynamicImage],
        settings: &InferenceSettings,
    ) -> Result<String, InferenceError> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| InferenceError::Fatal("model is not loaded".into()))?;

        let attachments =
            encode_all(images).map_err(|e| InferenceError::Fatal(format!("image encoding: {e}")))?;
        let messages = vec![ChatMessage::user_with_images(
            prompt_text(&settings.prompt),
            attachments,
        )];
        let options = self.options();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        debug!("Inference with {} view(s)", images.len());

        let (messages, options) = (&messages, &options);
        retry(
            &self.retry_policy(),
            "inference",
            InferenceError::is_transient,
            || async move {
                match tokio::time::timeout(timeout, provider.chat(messages, Some(options))).await {
                    Err(_) => Err(InferenceError::Transient(format!(
                        "timed out after {}s",
                        timeout.as_secs()
                    ))),
                    Ok(Err(e)) => Err(InferenceError::classify(e.to_string())),
                    Ok(Ok(response)) => {
                        debug!(
                            "{} prompt tokens, {} completion tokens",
                            response.prompt_tokens, response.completion_tokens
                        );
                        Ok(response.content)
                    }
                }
            },
        )
        .await
    }

    fn describe(&self) -> String {
        match &self.bound {
            Some((_, provider, model)) => format!("{provider}/{model}"),
            None => format!("{}/{}", self.config.provider, self.config.model),
        }
    }

    fn has_cpu_fallback(&self) -> bool {
        self.config.cpu_model.is_some()
    }

    async fn release_cache(&self) -> Result<(), OcrError> {
        let Some((_, provider, model)) = &self.bound else {
            return Ok(());
        };
        if provider.eq_ignore_ascii_case("ollama") {
            self.ollama_unload(model).await?;
            info!("Ollama evicted {} from memory", model);
        } else {
            warn!("Provider {} has no unload call, VRAM stays with the server", provider);
        }
        Ok(())
    }
}

/// `OLLAMA_HOST` may omit the scheme (`0.0.0.0:11434`).
fn ollama_base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_display_and_parse() {
        assert_eq!(Device::Gpu(1).to_string(), "cuda:1");
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Gpu(0));
        assert_eq!("CUDA:2".parse::<Device>().unwrap(), Device::Gpu(2));
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(serde_json::to_string(&Device::Gpu(0)).unwrap(), "\"cuda:0\"");
    }

    #[test]
    fn classify_errors() {
        assert!(InferenceError::classify("CUDA error: out of memory").is_out_of_memory());
        assert!(InferenceError::classify("model runner OOM").is_out_of_memory());
        assert!(InferenceError::classify("HTTP 503 Service Unavailable").is_transient());
        assert!(InferenceError::classify("request timed out").is_transient());
        assert!(InferenceError::classify("status: 429 Too Many Requests").is_transient());
        assert_eq!(
            InferenceError::classify("model 'x' not found"),
            InferenceError::Fatal("model 'x' not found".into())
        );
    }

    #[test]
    fn classify_matches_whole_words_only() {
        assert!(matches!(
            InferenceError::classify("prompt of 1500 tokens exceeds context length"),
            InferenceError::Fatal(_)
        ));
        assert!(matches!(
            InferenceError::classify("model 'BLOOM-ocr' not found"),
            InferenceError::Fatal(_)
        ));
        assert!(matches!(
            InferenceError::classify("ZOOM level 5000 unsupported"),
            InferenceError::Fatal(_)
        ));
        assert!(InferenceError::classify("runner: OOM while allocating").is_out_of_memory());
        assert!(InferenceError::classify("CUDA Out Of Memory").is_out_of_memory());
    }

    #[test]
    fn ollama_host_gets_a_scheme() {
        assert_eq!(ollama_base_url("0.0.0.0:11434"), "http://0.0.0.0:11434");
        assert_eq!(ollama_base_url("https://ocr.lan/"), "https://ocr.lan");
    }

    #[test]
    fn inference_error_to_ocr_error() {
        let e: OcrError = InferenceError::OutOfMemory("22 GB used".into()).into();
        assert!(e.is_out_of_memory());
        let e: OcrError = InferenceError::Fatal("bad".into()).into();
        assert!(matches!(e, OcrError::Inference { .. }));
    }

    #[test]
    fn default_settings_use_base_mode() {
        let s = InferenceSettings::default();
        assert_eq!((s.base_size, s.image_size, s.crop_mode), (1024, 1024, false));
        assert_eq!(s.prompt, DEFAULT_PROMPT);
    }

    #[tokio::test]
    async fn cpu_without_cpu_model_binds_primary() {
        let mut backend = VisionLlmBackend::new(EngineConfig::default());
        assert!(!backend.has_cpu_fallback());
        backend.load(Device::Cpu).await.unwrap();
        assert!(backend.is_loaded());
        assert_eq!(backend.device(), Some(Device::Cpu));
        assert_eq!(backend.describe(), "ollama/deepseek-ocr");
    }

    #[tokio::test]
    async fn cpu_model_is_used_when_configured() {
        let config = EngineConfig::builder()
            .cpu_model("ollama", "deepseek-ocr-cpu")
            .build()
            .unwrap();
        let mut backend = VisionLlmBackend::new(config);
        assert!(backend.has_cpu_fallback());
        backend.load(Device::Cpu).await.unwrap();
        assert_eq!(backend.describe(), "ollama/deepseek-ocr-cpu");
    }

    #[tokio::test]
    async fn release_before_load_is_noop() {
        let backend = VisionLlmBackend::new(EngineConfig::default());
        backend.release_cache().await.unwrap();
    }

    #[tokio::test]
    async fn infer_before_load_is_fatal() {
        let backend = VisionLlmBackend::new(EngineConfig::default());
        let err = backend.infer(&[], &InferenceSettings::default()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Fatal(_)));
    }
}

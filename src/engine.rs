//! The OCR engine: model lifecycle, single-image processing, batches and the
//! CPU fallback.
//!
//! ## Flow per image
//!
//! ```text
//!  load (if needed) → read header → decode RGB → prepare views
//!      → backend.infer → clean_output → VRAM snapshot
//!      → performance sample → optional <stem>.md
//! ```
//!
//! Every inference path takes `&mut self`, so an engine runs one inference at
//! a time. Memory and performance bookkeeping are shared `Arc`s so the CLI
//! and reports can read them while the engine owns the model.

use crate::backend::{Device, InferenceSettings, OcrBackend, VisionLlmBackend};
use crate::config::{AppConfig, EngineConfig};
use crate::error::OcrError;
use crate::memory::MemoryManager;
use crate::output::{write_markdown, BatchSummary, ModelInfo, OcrResult};
use crate::perf::{PerfTimer, PerformanceTracker};
use crate::pipeline::{image as img, postprocess};
use crate::progress::{NoopProgressCallback, OcrProgressCallback};
use chrono::Local;
use futures::future::join_all;
use image::{DynamicImage, GenericImageView};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// VRAM below this after loading on a GPU suggests the model is elsewhere.
const MIN_LOADED_VRAM_GB: f64 = 0.1;

/// Log VRAM every this many batch items.
const VRAM_LOG_EVERY: usize = 10;

/// Header size assumed when a batch item cannot be read ahead.
const FALLBACK_PROBE_SIZE: (u32, u32) = (1024, 1024);

struct Recognised {
    text: String,
    image_size: (u32, u32),
    memory_used_gb: f64,
}

/// Runs a [`OcrBackend`] over images with memory and performance bookkeeping.
pub struct OcrEngine {
    config: EngineConfig,
    backend: Box<dyn OcrBackend>,
    memory: Arc<MemoryManager>,
    tracker: Arc<PerformanceTracker>,
    /// Device the model is loaded on by default; restored after a fallback.
    device: Device,
}

impl std::fmt::Debug for OcrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcrEngine")
            .field("model", &self.backend.describe())
            .field("device", &self.device)
            .field("loaded", &self.backend.is_loaded())
            .finish()
    }
}

impl OcrEngine {
    /// The model is not loaded until first use or [`OcrEngine::load_model`].
    pub fn new(
        config: EngineConfig,
        backend: Box<dyn OcrBackend>,
        memory: Arc<MemoryManager>,
        tracker: Arc<PerformanceTracker>,
    ) -> Self {
        let device = if config.device.is_gpu() && !memory.gpu_available() {
            warn!("{} requested but no GPU is available, using cpu", config.device);
            Device::Cpu
        } else {
            config.device
        };
        info!("OCR engine for {} on {}", backend.describe(), device);
        Self {
            config,
            backend,
            memory,
            tracker,
            device,
        }
    }

    /// Engine over a [`VisionLlmBackend`] with auto-detected GPU memory.
    pub fn from_config(config: EngineConfig) -> Self {
        let memory = Arc::new(MemoryManager::detect(config.vram_threshold));
        let tracker = Arc::new(
            PerformanceTracker::new(Arc::clone(&memory)).with_device(config.device.memory_index()),
        );
        let backend = Box::new(VisionLlmBackend::new(config.clone()));
        Self::new(config, backend, memory, tracker)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.is_loaded()
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    fn memory_index(&self) -> u32 {
        self.device.memory_index()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Load the model on the engine's device. No-op when already loaded.
    pub async fn load_model(&mut self) -> Result<(), OcrError> {
        if self.backend.is_loaded() {
            debug!("Model already loaded");
            return Ok(());
        }
        self.load_on(self.device).await
    }

    async fn load_on(&mut self, device: Device) -> Result<(), OcrError> {
        info!("Loading model {} on {}", self.backend.describe(), device);
        let started = Instant::now();
        self.backend.load(device).await?;

        if device.is_gpu() {
            let snap = self.memory.snapshot(device.memory_index());
            info!(
                "Model loaded in {:.1}s, VRAM {:.2}/{:.2} GB ({:.1}%)",
                started.elapsed().as_secs_f64(),
                snap.used_gb,
                snap.total_gb,
                snap.usage_percent
            );
            if snap.gpu_available && snap.used_gb < MIN_LOADED_VRAM_GB {
                warn!(
                    "Only {:.2} GB VRAM in use after loading; the model may not be running on the GPU",
                    snap.used_gb
                );
            }
        } else {
            info!("Model loaded in {:.1}s", started.elapsed().as_secs_f64());
        }
        Ok(())
    }

    /// Release the model and the device cache.
    pub async fn unload_model(&mut self) {
        if !self.backend.is_loaded() {
            return;
        }
        let device = self.backend.device().unwrap_or(self.device);
        if device.is_gpu() {
            self.release_memory(device.memory_index()).await;
        }
        self.backend.unload().await;
        info!("Model unloaded");
    }

    /// Have the backend give its device memory back, then release the
    /// probe's cache. Returns the GB freed.
    pub async fn clear_cache(&self) -> f64 {
        self.release_memory(self.memory_index()).await
    }

    async fn release_memory(&self, dev: u32) -> f64 {
        if !self.memory.gpu_available() {
            debug!("No GPU available, skipping cache clear");
            return 0.0;
        }
        let before = self.memory.snapshot(dev);
        if let Err(e) = self.backend.release_cache().await {
            warn!("Backend could not release memory: {}", e);
        }
        self.memory.finish_clear(dev, &before)
    }

    pub fn model_info(&self) -> ModelInfo {
        let described = self.backend.describe();
        let (provider, model) = match described.split_once('/') {
            Some((p, m)) => (p.to_string(), m.to_string()),
            None => (String::new(), described),
        };
        let (vram_used_gb, vram_total_gb) = if self.memory.gpu_available() {
            let snap = self.memory.snapshot(self.memory_index());
            (Some(snap.used_gb), Some(snap.total_gb))
        } else {
            (None, None)
        };
        ModelInfo {
            loaded: self.backend.is_loaded(),
            provider,
            model,
            device: self.backend.device(),
            vram_used_gb,
            vram_total_gb,
        }
    }

    // ── Single image ─────────────────────────────────────────────────────

    /// OCR one image. Errors become a failure record.
    pub async fn process_image(
        &mut self,
        path: &Path,
        settings: Option<&InferenceSettings>,
        save_dir: Option<&Path>,
    ) -> OcrResult {
        let settings = self.resolve(settings);
        self.process_resolved(path, None, &settings, save_dir).await
    }

    /// Like [`OcrEngine::process_image`] but returns the error, so callers
    /// can react to [`OcrError::OutOfMemory`].
    pub async fn try_process_image(
        &mut self,
        path: &Path,
        settings: Option<&InferenceSettings>,
        save_dir: Option<&Path>,
    ) -> Result<OcrResult, OcrError> {
        let settings = self.resolve(settings);
        let timer = self.tracker.start();
        let (outcome, _) = self.attempt(path, None, &settings, save_dir).await;
        self.record(timer, path, outcome.as_ref().ok());
        outcome
    }

    /// OCR with a retry on the CPU when the GPU runs out of memory.
    ///
    /// The original device is reloaded afterwards whether or not the CPU
    /// attempt succeeded.
    pub async fn process_with_fallback(
        &mut self,
        path: &Path,
        settings: Option<&InferenceSettings>,
        save_dir: Option<&Path>,
    ) -> OcrResult {
        let settings = self.resolve(settings);
        let timer = self.tracker.start();
        let dev = self.memory_index();
        if self.memory.is_critical(dev) {
            self.release_memory(dev).await;
        }

        let (outcome, gpu_secs) = self.attempt(path, None, &settings, save_dir).await;
        let gpu_err = match outcome {
            Ok(result) => {
                self.record(timer, path, Some(&result));
                return result;
            }
            Err(e) => e,
        };

        let original = self.device;
        if !gpu_err.is_out_of_memory() || !self.config.fallback_to_cpu || !original.is_gpu() {
            self.record(timer, path, None);
            return self.failure(path, &gpu_err, gpu_secs);
        }

        if !self.backend.has_cpu_fallback() {
            let e = OcrError::ModelLoad {
                model: self.backend.describe(),
                reason: "no CPU model configured (set model.cpu_provider and model.cpu_name)"
                    .into(),
            };
            error!("Out of memory on {} for {}: {}", original, path.display(), e);
            self.record(timer, path, None);
            return OcrResult::failure(
                path,
                format!("GPU and CPU processing both failed: {e}"),
                gpu_secs,
                self.backend.device(),
            );
        }

        warn!("Out of memory on {} for {}, retrying on cpu", original, path.display());
        self.release_memory(dev).await;
        self.backend.unload().await;

        let (cpu_outcome, cpu_secs) = match self.load_on(Device::Cpu).await {
            Ok(()) => self.attempt(path, None, &settings, save_dir).await,
            Err(e) => (Err(e), 0.0),
        };
        self.record(timer, path, cpu_outcome.as_ref().ok());

        self.backend.unload().await;
        if let Err(e) = self.load_on(original).await {
            error!("Failed to restore model on {}: {}", original, e);
        }

        match cpu_outcome {
            Ok(result) => {
                info!("CPU fallback succeeded for {}", path.display());
                result
            }
            Err(e) => {
                error!("CPU fallback failed for {}: {}", path.display(), e);
                OcrResult::failure(
                    path,
                    format!("GPU and CPU processing both failed: {e}"),
                    gpu_secs + cpu_secs,
                    Some(Device::Cpu),
                )
            }
        }
    }

    fn resolve(&self, settings: Option<&InferenceSettings>) -> InferenceSettings {
        settings.cloned().unwrap_or_else(|| self.config.settings.clone())
    }

    fn failure(&self, path: &Path, err: &OcrError, secs: f64) -> OcrResult {
        error!("OCR failed for {}: {}", path.display(), err);
        OcrResult::failure(path, err.to_string(), secs, self.backend.device())
    }

    async fn process_resolved(
        &mut self,
        path: &Path,
        preloaded: Option<DynamicImage>,
        settings: &InferenceSettings,
        save_dir: Option<&Path>,
    ) -> OcrResult {
        let timer = self.tracker.start();
        let (outcome, secs) = self.attempt(path, preloaded, settings, save_dir).await;
        self.record(timer, path, outcome.as_ref().ok());
        match outcome {
            Ok(result) => result,
            Err(e) => self.failure(path, &e, secs),
        }
    }

    /// One performance sample per input, whatever the number of attempts.
    fn record(&self, timer: PerfTimer, path: &Path, done: Option<&OcrResult>) {
        let file = path.display().to_string();
        match done {
            Some(result) => self.tracker.record(timer, result.image_size, file, true),
            None => self.tracker.record(timer, (0, 0), file, false),
        };
    }

    /// One timed attempt. Returns the elapsed seconds alongside the outcome.
    async fn attempt(
        &mut self,
        path: &Path,
        preloaded: Option<DynamicImage>,
        settings: &InferenceSettings,
        save_dir: Option<&Path>,
    ) -> (Result<OcrResult, OcrError>, f64) {
        let started = Instant::now();
        let outcome = self.recognise(path, preloaded, settings, save_dir).await;
        let secs = started.elapsed().as_secs_f64();

        let result = outcome.map(|done| {
            info!("Processed {} in {:.2}s", path.display(), secs);
            OcrResult {
                file_path: path.to_path_buf(),
                text: done.text,
                processing_time_secs: secs,
                image_size: done.image_size,
                memory_used_gb: done.memory_used_gb,
                timestamp: Local::now(),
                settings: Some(settings.clone()),
                device: self.backend.device(),
                success: true,
                error: None,
            }
        });
        (result, secs)
    }

    async fn recognise(
        &mut self,
        path: &Path,
        preloaded: Option<DynamicImage>,
        settings: &InferenceSettings,
        save_dir: Option<&Path>,
    ) -> Result<Recognised, OcrError> {
        self.load_model().await?;

        let info = img::info(path)?;
        debug!(
            "{}: {}x{} {}, {:.2} MB",
            info.file_name, info.width, info.height, info.format, info.file_size_mb
        );
        let image = match preloaded {
            Some(image) => image,
            None => img::load(path)?,
        };
        let image_size = image.dimensions();

        let views = prepare_views(image, settings);
        let raw = self.backend.infer(&views, settings).await?;
        let text = postprocess::clean_output(&raw);

        let device = self.backend.device().unwrap_or(self.device);
        let memory_used_gb = if device.is_gpu() {
            self.memory.snapshot(device.memory_index()).used_gb
        } else {
            0.0
        };

        if let Some(dir) = save_dir {
            write_markdown(dir, &file_stem(path), &text)?;
        }

        Ok(Recognised {
            text,
            image_size,
            memory_used_gb,
        })
    }

    // ── Batch ────────────────────────────────────────────────────────────

    /// OCR `paths` in order, one inference at a time.
    ///
    /// Images are decoded ahead in chunks whose size comes from
    /// [`MemoryManager::optimal_batch_size`]. `stop` is checked before each
    /// item; a stopped batch returns the results so far.
    pub async fn batch_process(
        &mut self,
        paths: &[PathBuf],
        base_batch_size: usize,
        settings: Option<&InferenceSettings>,
        save_dir: Option<&Path>,
        stop: &AtomicBool,
        progress: Option<&dyn OcrProgressCallback>,
    ) -> Vec<OcrResult> {
        let settings = self.resolve(settings);
        let noop = NoopProgressCallback;
        let progress = progress.unwrap_or(&noop);
        let total = paths.len();
        let started = Instant::now();

        info!("Batch of {} images, base batch size {}", total, base_batch_size);
        progress.on_batch_start(total);

        let mut results = Vec::with_capacity(total);
        let mut index = 0;

        'chunks: while index < total {
            let dev = self.memory_index();
            let probe_size = img::info(&paths[index])
                .map(|i| (i.width, i.height))
                .unwrap_or(FALLBACK_PROBE_SIZE);
            let chunk = self
                .memory
                .optimal_batch_size(base_batch_size.max(1), probe_size, dev)
                .max(1);
            let end = (index + chunk).min(total);
            debug!("Decoding items {}..={} ahead", index + 1, end);

            let loads = paths[index..end].iter().cloned().map(|p| {
                tokio::task::spawn_blocking(move || {
                    img::load(&p).map_err(|e| debug!("Read-ahead failed for {}: {}", p.display(), e))
                })
            });
            let decoded: Vec<Option<DynamicImage>> = join_all(loads)
                .await
                .into_iter()
                .map(|joined| joined.ok().and_then(Result::ok))
                .collect();

            for (path, preloaded) in paths[index..end].iter().zip(decoded) {
                if stop.load(Ordering::SeqCst) {
                    warn!("Batch stopped after {}/{} items", index, total);
                    break 'chunks;
                }
                index += 1;

                let dev = self.memory_index();
                if self.memory.is_critical(dev) {
                    self.release_memory(dev).await;
                }

                progress.on_item_start(index, total, path);
                let result = self.process_resolved(path, preloaded, &settings, save_dir).await;
                match &result.error {
                    None => progress.on_item_complete(index, total, result.text.len()),
                    Some(e) => progress.on_item_error(index, total, e),
                }
                progress.on_item_result(index, &result);
                results.push(result);

                if index % VRAM_LOG_EVERY == 0 {
                    let snap = self.memory.snapshot(dev);
                    info!(
                        "Progress {}/{}, VRAM {:.2} GB ({:.1}%)",
                        index, total, snap.used_gb, snap.usage_percent
                    );
                }
                let every = self.config.auto_clear_every;
                if every > 0 && index % every == 0 {
                    self.release_memory(dev).await;
                }
            }
        }

        let summary = BatchSummary::from_results(&results);
        info!(
            "Batch complete: {} succeeded, {} failed, {:.1}s",
            summary.successful,
            summary.failed,
            started.elapsed().as_secs_f64()
        );
        progress.on_batch_complete(results.len(), total, summary.successful);
        results
    }
}

/// Views sent to the model for one image.
///
/// Without crop mode the image is fitted to `image_size`. In crop mode it is
/// cut into `image_size` tiles followed by a `base_size` global view.
pub fn prepare_views(image: DynamicImage, settings: &InferenceSettings) -> Vec<DynamicImage> {
    if !settings.crop_mode {
        return vec![img::resize(image, Some(settings.image_size), true)];
    }
    let mut views = img::tile(&image, settings.image_size);
    debug!("Crop mode: {} tiles", views.len());
    views.push(img::resize(image, Some(settings.base_size), true));
    views
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into())
}

/// Build an engine from `config`, OCR one file with CPU fallback and unload.
pub async fn process_image_once(path: &Path, config: &AppConfig) -> Result<OcrResult, OcrError> {
    let mut engine = OcrEngine::from_config(config.engine_config()?);
    let result = engine.process_with_fallback(path, None, None).await;
    engine.unload_model().await;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn settings(crop_mode: bool) -> InferenceSettings {
        InferenceSettings {
            crop_mode,
            base_size: 64,
            image_size: 32,
            ..Default::default()
        }
    }

    #[test]
    fn plain_mode_fits_to_image_size() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(100, 50));
        let views = prepare_views(image, &settings(false));
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].dimensions(), (32, 16));
    }

    #[test]
    fn crop_mode_adds_tiles_and_global_view() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(100, 50));
        let views = prepare_views(image, &settings(true));
        // 4 columns x 2 rows of 32px tiles, then the 64px global view.
        assert_eq!(views.len(), 9);
        assert_eq!(views[0].dimensions(), (32, 32));
        assert_eq!(views[8].dimensions(), (64, 32));
    }

    #[test]
    fn stem_of_path() {
        assert_eq!(file_stem(Path::new("scans/page_0001.png")), "page_0001");
    }
}

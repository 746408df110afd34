//! Background batch jobs.
//!
//! [`BatchWorker::spawn`] moves an [`OcrEngine`] onto a tokio task and runs
//! [`OcrEngine::batch_process`] there. The returned [`BatchHandle`] stops the
//! batch between items, streams [`WorkerEvent`]s and hands the engine back
//! on [`BatchHandle::join`].

use crate::backend::InferenceSettings;
use crate::engine::OcrEngine;
use crate::error::OcrError;
use crate::output::{BatchSummary, OcrResult};
use crate::progress::OcrProgressCallback;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

/// What a running batch reports.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started { total: usize },
    /// Item `index` (1-based) is about to be processed.
    Progress { index: usize, total: usize, file: PathBuf },
    ItemDone(OcrResult),
    /// The stop flag ended the batch early.
    Stopped { processed: usize },
    Finished(BatchSummary),
}

/// Parameters for one background batch.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub base_batch_size: usize,
    /// `None` uses the engine's configured settings.
    pub settings: Option<InferenceSettings>,
    pub save_dir: Option<PathBuf>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            base_batch_size: 4,
            settings: None,
            save_dir: None,
        }
    }
}

struct ChannelProgress {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ChannelProgress {
    fn send(&self, event: WorkerEvent) {
        // Receiver may have been dropped; the batch carries on regardless.
        if self.tx.send(event).is_err() {
            debug!("Worker event receiver dropped");
        }
    }
}

impl OcrProgressCallback for ChannelProgress {
    fn on_batch_start(&self, total: usize) {
        self.send(WorkerEvent::Started { total });
    }

    fn on_item_start(&self, index: usize, total: usize, file: &Path) {
        self.send(WorkerEvent::Progress {
            index,
            total,
            file: file.to_path_buf(),
        });
    }

    fn on_item_result(&self, _index: usize, result: &OcrResult) {
        self.send(WorkerEvent::ItemDone(result.clone()));
    }
}

pub struct BatchWorker;

impl BatchWorker {
    /// Start the batch on the current tokio runtime.
    pub fn spawn(mut engine: OcrEngine, paths: Vec<PathBuf>, options: BatchOptions) -> BatchHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let task_stop = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            let progress = ChannelProgress { tx };
            let results = engine
                .batch_process(
                    &paths,
                    options.base_batch_size,
                    options.settings.as_ref(),
                    options.save_dir.as_deref(),
                    &task_stop,
                    Some(&progress),
                )
                .await;

            if results.len() < paths.len() && task_stop.load(Ordering::SeqCst) {
                info!("Worker stopped after {}/{} items", results.len(), paths.len());
                progress.send(WorkerEvent::Stopped {
                    processed: results.len(),
                });
            }
            progress.send(WorkerEvent::Finished(BatchSummary::from_results(&results)));
            (engine, results)
        });

        BatchHandle { stop, events: rx, task }
    }
}

/// Control side of a running batch.
pub struct BatchHandle {
    stop: Arc<AtomicBool>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    task: JoinHandle<(OcrEngine, Vec<OcrResult>)>,
}

impl BatchHandle {
    /// Ask the batch to stop before its next item.
    pub fn stop(&self) {
        info!("Stop requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Shared stop flag, e.g. for a Ctrl-C handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<WorkerEvent> {
        &mut self.events
    }

    /// Next event, or `None` once the batch has finished and all events
    /// were read.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Handle that drops the batch mid-item. The engine goes with it.
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Wait for the batch and take back the engine.
    pub async fn join(self) -> Result<(OcrEngine, Vec<OcrResult>), OcrError> {
        self.task.await.map_err(|e| {
            if e.is_cancelled() {
                OcrError::Cancelled
            } else {
                OcrError::Internal(format!("batch worker failed: {e}"))
            }
        })
    }
}

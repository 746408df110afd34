//! Progress-callback trait for batch OCR events.
//!
//! Pass an [`Arc<dyn OcrProgressCallback>`] to
//! [`crate::engine::OcrEngine::batch_process`] to observe a batch as it runs.
//! The CLI drives an `indicatif` bar from it; [`crate::worker`] forwards the
//! same events over a channel.
//!
//! # Example
//!
//! ```rust
//! use dsocr::OcrProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl OcrProgressCallback for Counter {
//!     fn on_item_complete(&self, index: usize, total: usize, _text_len: usize) {
//!         let done = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{done}/{total} (item {index})");
//!     }
//! }
//! ```

use crate::output::OcrResult;
use std::path::Path;
use std::sync::Arc;

/// Batch events. Every method defaults to a no-op.
///
/// `index` is 1-based. Items are processed one at a time, so calls arrive in
/// order from a single task.
pub trait OcrProgressCallback: Send + Sync {
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    fn on_item_start(&self, index: usize, total: usize, file: &Path) {
        let _ = (index, total, file);
    }

    /// `text_len` is the byte length of the recognised text.
    fn on_item_complete(&self, index: usize, total: usize, text_len: usize) {
        let _ = (index, total, text_len);
    }

    fn on_item_error(&self, index: usize, total: usize, error: &str) {
        let _ = (index, total, error);
    }

    /// Full record of the item, after `on_item_complete` or `on_item_error`.
    fn on_item_result(&self, index: usize, result: &OcrResult) {
        let _ = (index, result);
    }

    /// `processed` is below `total` when the batch was stopped early.
    fn on_batch_complete(&self, processed: usize, total: usize, successful: usize) {
        let _ = (processed, total, successful);
    }
}

/// Used when no callback is supplied.
pub struct NoopProgressCallback;

impl OcrProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn OcrProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracking {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        successful: AtomicUsize,
    }

    impl OcrProgressCallback for Tracking {
        fn on_item_start(&self, _index: usize, _total: usize, _file: &Path) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_item_complete(&self, _index: usize, _total: usize, _text_len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_item_error(&self, _index: usize, _total: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_batch_complete(&self, _processed: usize, _total: usize, successful: usize) {
            self.successful.store(successful, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(2);
        cb.on_item_start(1, 2, Path::new("a.png"));
        cb.on_item_complete(1, 2, 10);
        cb.on_item_error(2, 2, "boom");
        cb.on_item_result(2, &OcrResult::failure("b.png", "boom", 0.0, None));
        cb.on_batch_complete(2, 2, 1);
    }

    #[test]
    fn overridden_methods_receive_events() {
        let t = Tracking::default();
        t.on_batch_start(3);
        t.on_item_start(1, 3, Path::new("a.png"));
        t.on_item_complete(1, 3, 5);
        t.on_item_start(2, 3, Path::new("b.png"));
        t.on_item_error(2, 3, "decode failed");
        t.on_batch_complete(2, 3, 1);

        assert_eq!(t.starts.load(Ordering::SeqCst), 2);
        assert_eq!(t.completes.load(Ordering::SeqCst), 1);
        assert_eq!(t.errors.load(Ordering::SeqCst), 1);
        assert_eq!(t.successful.load(Ordering::SeqCst), 1);
    }
}

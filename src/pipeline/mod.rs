//! Pipeline stages between an input file and the model call.
//!
//! ## Data Flow
//!
//! ```text
//! pdf ──▶ image ──▶ encode ──▶ (backend) ──▶ postprocess
//! (pdfium) (load/resize/tile) (base64)        (cleanup)
//! ```
//!
//! 1. [`pdf`]    — rasterise pages to files; pdfium runs in `spawn_blocking`
//! 2. [`image`]  — load, convert to RGB, resize, tile for crop mode
//! 3. [`encode`] — PNG-encode and base64-wrap each view for the request body
//! 4. [`postprocess`] — strip grounding markup and clean the Markdown

pub mod encode;
pub mod image;
pub mod pdf;
pub mod postprocess;

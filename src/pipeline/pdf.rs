//! PDF rasterisation: render pages to image files via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is not safe to call from async contexts. All pdfium work runs on
//! the blocking pool so Tokio workers never stall during rendering.
//!
//! Pages are rendered at `dpi` (PDF points are 1/72 inch, so the scale factor
//! is `dpi / 72`) and written as `{prefix}_{page:04}.{ext}`, where `page` is
//! the 1-based page number in the document.

use crate::error::OcrError;
use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Seconds per page used for [`PdfInfo::estimated_conversion_secs`].
const SECS_PER_PAGE_ESTIMATE: f64 = 2.0;

/// Output image format for rendered pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageFormat {
    #[default]
    Png,
    Jpeg,
}

impl PageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PageFormat::Png => "png",
            PageFormat::Jpeg => "jpeg",
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            PageFormat::Png => ImageFormat::Png,
            PageFormat::Jpeg => ImageFormat::Jpeg,
        }
    }
}

impl fmt::Display for PageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for PageFormat {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(PageFormat::Png),
            "jpg" | "jpeg" => Ok(PageFormat::Jpeg),
            other => Err(OcrError::Configuration {
                item: "pdf.format".into(),
                issue: format!("unsupported page format '{other}' (png or jpeg)"),
            }),
        }
    }
}

/// Outcome of a rasterisation run. Never an `Err`: failures are recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfConversionResult {
    pub success: bool,
    pub pdf_path: PathBuf,
    /// Pages in the selected range, before `max_pages` truncation.
    pub total_pages: usize,
    pub converted_pages: usize,
    pub image_paths: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub error: Option<String>,
}

impl PdfConversionResult {
    fn failed(pdf_path: &Path, output_dir: &Path, error: String) -> Self {
        Self {
            success: false,
            pdf_path: pdf_path.to_path_buf(),
            total_pages: 0,
            converted_pages: 0,
            image_paths: Vec::new(),
            output_dir: output_dir.to_path_buf(),
            error: Some(error),
        }
    }
}

/// Document-level facts without rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfInfo {
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size_mb: f64,
    pub total_pages: usize,
    /// First page width and height in points.
    pub first_page_size: (f32, f32),
    pub estimated_conversion_secs: f64,
}

/// Renders PDF pages to image files.
#[derive(Debug, Clone)]
pub struct PdfConverter {
    pub dpi: u32,
    pub format: PageFormat,
    pub max_pages: Option<usize>,
}

impl Default for PdfConverter {
    fn default() -> Self {
        Self {
            dpi: 200,
            format: PageFormat::Png,
            max_pages: None,
        }
    }
}

impl PdfConverter {
    pub fn new(dpi: u32, format: PageFormat, max_pages: Option<usize>) -> Self {
        info!(
            "PDF converter: {} DPI, {}, max pages {}",
            dpi,
            format,
            max_pages.map_or_else(|| "unlimited".to_string(), |n| n.to_string())
        );
        Self {
            dpi,
            format,
            max_pages,
        }
    }

    /// Rasterise `pdf` into `output_dir`.
    ///
    /// `page_range` is 1-based and inclusive; `None` renders every page.
    pub async fn convert(
        &self,
        pdf: &Path,
        output_dir: &Path,
        page_range: Option<(usize, usize)>,
        prefix: &str,
    ) -> PdfConversionResult {
        if !pdf.exists() {
            return PdfConversionResult::failed(
                pdf,
                output_dir,
                format!("PDF file not found: {}", pdf.display()),
            );
        }
        if let Err(e) = std::fs::create_dir_all(output_dir) {
            return PdfConversionResult::failed(
                pdf,
                output_dir,
                format!("cannot create output directory: {e}"),
            );
        }

        let job = RenderJob {
            pdf: pdf.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            page_range,
            prefix: prefix.to_string(),
            dpi: self.dpi,
            format: self.format,
            max_pages: self.max_pages,
        };

        info!("Converting PDF: {}", pdf.display());
        let outcome = tokio::task::spawn_blocking(move || job.run())
            .await
            .unwrap_or_else(|e| Err(OcrError::Internal(format!("render task panicked: {e}"))));

        match outcome {
            Ok((total_pages, image_paths)) => {
                info!("PDF conversion done: {} pages", image_paths.len());
                PdfConversionResult {
                    success: true,
                    pdf_path: pdf.to_path_buf(),
                    total_pages,
                    converted_pages: image_paths.len(),
                    image_paths,
                    output_dir: output_dir.to_path_buf(),
                    error: None,
                }
            }
            Err(e) => {
                error!("PDF conversion failed: {}", e);
                PdfConversionResult::failed(pdf, output_dir, e.to_string())
            }
        }
    }

    /// Pages `start..=end` (1-based).
    pub async fn convert_range(
        &self,
        pdf: &Path,
        output_dir: &Path,
        start: usize,
        end: usize,
        prefix: &str,
    ) -> PdfConversionResult {
        self.convert(pdf, output_dir, Some((start, end)), prefix).await
    }

    pub async fn convert_single(
        &self,
        pdf: &Path,
        output_dir: &Path,
        page: usize,
        prefix: &str,
    ) -> PdfConversionResult {
        self.convert(pdf, output_dir, Some((page, page)), prefix).await
    }
}

/// Document facts for `dsocr pdf --info`.
pub async fn info(pdf: &Path) -> Result<PdfInfo, OcrError> {
    if !pdf.exists() {
        return Err(OcrError::FileNotFound {
            path: pdf.to_path_buf(),
        });
    }
    let path = pdf.to_path_buf();
    tokio::task::spawn_blocking(move || info_blocking(&path))
        .await
        .map_err(|e| OcrError::Internal(format!("info task panicked: {e}")))?
}

fn info_blocking(path: &Path) -> Result<PdfInfo, OcrError> {
    let pdfium = bind(path)?;
    let document = open(&pdfium, path)?;
    let pages = document.pages();
    let total_pages = pages.len() as usize;

    let first_page_size = match pages.first() {
        Ok(page) => (page.width().value, page.height().value),
        Err(_) => (0.0, 0.0),
    };
    let file_size_mb = std::fs::metadata(path)
        .map(|m| m.len() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0);

    Ok(PdfInfo {
        file_path: path.to_path_buf(),
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        file_size_mb,
        total_pages,
        first_page_size,
        estimated_conversion_secs: total_pages as f64 * SECS_PER_PAGE_ESTIMATE,
    })
}

/// 0-based page indices for a 1-based inclusive range, clipped to the document.
pub fn select_pages(
    total: usize,
    page_range: Option<(usize, usize)>,
) -> Result<Vec<usize>, String> {
    match page_range {
        None => Ok((0..total).collect()),
        Some((start, end)) => {
            if start == 0 || start > end {
                return Err(format!(
                    "invalid page range {start}-{end} (pages are 1-based, start ≤ end)"
                ));
            }
            if start > total {
                return Err(format!(
                    "page {start} is out of range (document has {total} pages)"
                ));
            }
            Ok((start - 1..end.min(total)).collect())
        }
    }
}

/// Which pages a conversion renders, and where each one is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPlan {
    /// Pages in the selected range, before `max_pages` truncation.
    pub total_pages: usize,
    /// `(0-based index, file name)` in render order.
    pub pages: Vec<(usize, String)>,
}

/// Select the range, apply `max_pages` and name each output file after its
/// page number in the document.
pub fn plan_pages(
    document_pages: usize,
    page_range: Option<(usize, usize)>,
    max_pages: Option<usize>,
    prefix: &str,
    format: PageFormat,
) -> Result<RenderPlan, String> {
    let mut indices = select_pages(document_pages, page_range)?;
    let total_pages = indices.len();
    if let Some(max) = max_pages {
        if total_pages > max {
            warn!(
                "{} pages exceed the limit of {}, converting the first {} only",
                total_pages, max, max
            );
            indices.truncate(max);
        }
    }
    let pages = indices
        .into_iter()
        .map(|idx| (idx, page_file_name(prefix, idx + 1, format)))
        .collect();
    Ok(RenderPlan { total_pages, pages })
}

/// `{prefix}_{page:04}.{ext}` for a 1-based page number.
pub fn page_file_name(prefix: &str, page: usize, format: PageFormat) -> String {
    format!("{prefix}_{page:04}.{}", format.extension())
}

fn bind(pdf: &Path) -> Result<Pdfium, OcrError> {
    pdfium_locate::bind().map_err(|e| OcrError::PdfConversion {
        path: pdf.to_path_buf(),
        reason: e.to_string(),
    })
}

fn open<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, OcrError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| OcrError::PdfConversion {
            path: path.to_path_buf(),
            reason: format!("{e:?}"),
        })
}

struct RenderJob {
    pdf: PathBuf,
    output_dir: PathBuf,
    page_range: Option<(usize, usize)>,
    prefix: String,
    dpi: u32,
    format: PageFormat,
    max_pages: Option<usize>,
}

impl RenderJob {
    /// Returns the selected page count and the written files.
    fn run(self) -> Result<(usize, Vec<PathBuf>), OcrError> {
        let pdfium = bind(&self.pdf)?;
        let document = open(&pdfium, &self.pdf)?;
        let pages = document.pages();

        let plan = plan_pages(
            pages.len() as usize,
            self.page_range,
            self.max_pages,
            &self.prefix,
            self.format,
        )
        .map_err(|reason| OcrError::PdfConversion {
            path: self.pdf.clone(),
            reason,
        })?;

        let scale = self.dpi as f32 / 72.0;
        let render_err = |page: usize, e: PdfiumError| OcrError::PdfConversion {
            path: self.pdf.clone(),
            reason: format!("page {page}: {e:?}"),
        };

        let mut written = Vec::with_capacity(plan.pages.len());
        for (idx, file_name) in plan.pages {
            let page_num = idx + 1;
            let page = pages.get(idx as u16).map_err(|e| render_err(page_num, e))?;
            let config = PdfRenderConfig::new()
                .set_target_width((page.width().value * scale) as i32)
                .set_target_height((page.height().value * scale) as i32);
            let bitmap = page
                .render_with_config(&config)
                .map_err(|e| render_err(page_num, e))?;

            let image = match self.format {
                PageFormat::Png => bitmap.as_image(),
                // JPEG has no alpha channel.
                PageFormat::Jpeg => DynamicImage::ImageRgb8(bitmap.as_image().to_rgb8()),
            };

            let path = self.output_dir.join(file_name);
            image
                .save_with_format(&path, self.format.image_format())
                .map_err(|e| OcrError::PdfConversion {
                    path: self.pdf.clone(),
                    reason: format!("cannot write {}: {e}", path.display()),
                })?;
            debug!(
                "Rendered page {} → {}x{} px, {}",
                page_num,
                image.width(),
                image.height(),
                path.display()
            );
            written.push(path);
        }

        Ok((plan.total_pages, written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_names_are_zero_padded() {
        assert_eq!(page_file_name("page", 1, PageFormat::Png), "page_0001.png");
        assert_eq!(page_file_name("doc", 123, PageFormat::Jpeg), "doc_0123.jpeg");
    }

    #[test]
    fn page_selection() {
        assert_eq!(select_pages(3, None).unwrap(), vec![0, 1, 2]);
        assert_eq!(select_pages(10, Some((3, 5))).unwrap(), vec![2, 3, 4]);
        assert_eq!(select_pages(4, Some((3, 9))).unwrap(), vec![2, 3]);
        assert_eq!(select_pages(4, Some((2, 2))).unwrap(), vec![1]);
        assert!(select_pages(4, Some((0, 2))).is_err());
        assert!(select_pages(4, Some((3, 2))).is_err());
        assert!(select_pages(4, Some((5, 6))).is_err());
    }

    #[test]
    fn plan_names_pages_by_document_position() {
        let plan = plan_pages(10, Some((3, 5)), Some(2), "page", PageFormat::Png).unwrap();
        assert_eq!(plan.total_pages, 3);
        assert_eq!(
            plan.pages,
            vec![(2, "page_0003.png".to_string()), (3, "page_0004.png".to_string())]
        );

        let all = plan_pages(3, None, None, "scan", PageFormat::Jpeg).unwrap();
        assert_eq!(all.total_pages, 3);
        assert_eq!(all.pages.last().unwrap().1, "scan_0003.jpeg");

        let capped = plan_pages(150, None, Some(100), "page", PageFormat::Png).unwrap();
        assert_eq!(capped.total_pages, 150);
        assert_eq!(capped.pages.len(), 100);

        assert!(plan_pages(4, Some((5, 6)), None, "page", PageFormat::Png).is_err());
    }

    #[test]
    fn format_parsing() {
        assert_eq!("PNG".parse::<PageFormat>().unwrap(), PageFormat::Png);
        assert_eq!("jpg".parse::<PageFormat>().unwrap(), PageFormat::Jpeg);
        assert!("tiff".parse::<PageFormat>().is_err());
    }

    #[tokio::test]
    async fn missing_pdf_yields_failure_record() {
        let dir = tempfile::tempdir().unwrap();
        let r = PdfConverter::default()
            .convert(&dir.path().join("nope.pdf"), dir.path(), None, "page")
            .await;
        assert!(!r.success);
        assert_eq!(r.converted_pages, r.image_paths.len());
        assert!(r.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn info_on_missing_pdf_is_not_found() {
        let err = info(Path::new("/definitely/not/here.pdf")).await.unwrap_err();
        assert!(matches!(err, OcrError::FileNotFound { .. }));
    }
}

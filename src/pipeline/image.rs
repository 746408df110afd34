//! Image loading and preparation.
//!
//! Everything handed to the model is 8-bit RGB: alpha channels and 16-bit
//! scans are flattened on load so every backend sees the same pixel layout.

use crate::error::OcrError;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Extensions accepted as image input (lower-case, without the dot).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tiff", "webp"];

/// Header-level facts about an image file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub file_path: PathBuf,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub file_size_mb: f64,
}

/// What [`process`] did to an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub file_path: PathBuf,
    pub file_name: String,
    pub original_size: (u32, u32),
    pub processed_size: (u32, u32),
    pub format: String,
    pub resized: bool,
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn is_image_file(path: &Path) -> bool {
    SUPPORTED_EXTENSIONS.contains(&extension_of(path).as_str())
}

pub fn is_pdf_file(path: &Path) -> bool {
    extension_of(path) == "pdf"
}

/// Supported images directly inside `dir`, sorted by path.
pub fn find_images(dir: &Path) -> Result<Vec<PathBuf>, OcrError> {
    if !dir.is_dir() {
        return Err(OcrError::FileNotFound {
            path: dir.to_path_buf(),
        });
    }
    let entries = std::fs::read_dir(dir).map_err(|e| OcrError::ImageProcessing {
        path: dir.to_path_buf(),
        reason: format!("cannot list directory: {e}"),
    })?;

    let mut images: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image_file(p))
        .collect();
    images.sort();
    debug!("Found {} images in {}", images.len(), dir.display());
    Ok(images)
}

fn check_input(path: &Path) -> Result<(), OcrError> {
    if !path.exists() {
        return Err(OcrError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    if !is_image_file(path) {
        return Err(OcrError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension: extension_of(path),
        });
    }
    Ok(())
}

/// Decode an image file and convert it to RGB8.
pub fn load(path: &Path) -> Result<DynamicImage, OcrError> {
    check_input(path)?;

    let decode_err = |reason: String| OcrError::ImageProcessing {
        path: path.to_path_buf(),
        reason,
    };
    let img = ImageReader::open(path)
        .map_err(|e| decode_err(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| decode_err(e.to_string()))?
        .decode()
        .map_err(|e| decode_err(e.to_string()))?;

    let rgb = match img {
        DynamicImage::ImageRgb8(_) => img,
        other => {
            debug!("Converting {:?} to RGB8", other.color());
            DynamicImage::ImageRgb8(other.to_rgb8())
        }
    };
    info!("Loaded {} ({}x{})", file_name_of(path), rgb.width(), rgb.height());
    Ok(rgb)
}

/// Fit `image` within `max_size`.
///
/// With `keep_aspect` the longer side becomes `max_size` and the shorter side
/// is scaled and truncated; otherwise the result is a `max_size` square.
/// Images that already fit are returned untouched.
pub fn resize(image: DynamicImage, max_size: Option<u32>, keep_aspect: bool) -> DynamicImage {
    let Some(max) = max_size else {
        return image;
    };
    let (w, h) = image.dimensions();
    if w <= max && h <= max {
        debug!("Image {}x{} already within {}", w, h, max);
        return image;
    }

    let (nw, nh) = if !keep_aspect {
        (max, max)
    } else if w > h {
        (max, ((h as f64 * (max as f64 / w as f64)) as u32).max(1))
    } else {
        (((w as f64 * (max as f64 / h as f64)) as u32).max(1), max)
    };

    info!("Resizing {}x{} -> {}x{}", w, h, nw, nh);
    image.resize_exact(nw, nh, FilterType::Lanczos3)
}

/// [`load`] followed by [`resize`].
pub fn process(
    path: &Path,
    max_size: Option<u32>,
    keep_aspect: bool,
) -> Result<(DynamicImage, ProcessInfo), OcrError> {
    let image = load(path)?;
    let original_size = image.dimensions();
    let image = resize(image, max_size, keep_aspect);
    let processed_size = image.dimensions();

    let info = ProcessInfo {
        file_path: path.to_path_buf(),
        file_name: file_name_of(path),
        original_size,
        processed_size,
        format: extension_of(path),
        resized: original_size != processed_size,
    };
    Ok((image, info))
}

/// Read dimensions and format from the header only.
pub fn info(path: &Path) -> Result<ImageInfo, OcrError> {
    if !path.exists() {
        return Err(OcrError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let read_err = |reason: String| OcrError::ImageProcessing {
        path: path.to_path_buf(),
        reason,
    };

    let reader = ImageReader::open(path)
        .map_err(|e| read_err(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| read_err(e.to_string()))?;
    let format = reader
        .format()
        .map(|f| format!("{f:?}").to_uppercase())
        .unwrap_or_else(|| "UNKNOWN".into());
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| read_err(e.to_string()))?;
    let file_size_mb = std::fs::metadata(path)
        .map(|m| m.len() as f64 / (1024.0 * 1024.0))
        .map_err(|e| read_err(e.to_string()))?;

    Ok(ImageInfo {
        file_path: path.to_path_buf(),
        file_name: file_name_of(path),
        width,
        height,
        format,
        file_size_mb,
    })
}

/// `true` when the file exists, has a supported extension and a readable header.
pub fn validate(path: &Path) -> bool {
    if check_input(path).is_err() {
        return false;
    }
    ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map(|r| r.into_dimensions().is_ok())
        .unwrap_or(false)
}

/// Split into a row-major grid of tiles no larger than `tile_size` square.
pub fn tile(image: &DynamicImage, tile_size: u32) -> Vec<DynamicImage> {
    let tile_size = tile_size.max(1);
    let (w, h) = image.dimensions();
    let cols = w.div_ceil(tile_size);
    let rows = h.div_ceil(tile_size);

    let mut tiles = Vec::with_capacity((cols * rows) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let x = col * tile_size;
            let y = row * tile_size;
            tiles.push(image.crop_imm(x, y, tile_size.min(w - x), tile_size.min(h - y)));
        }
    }
    debug!("Tiled {}x{} into {}x{} grid", w, h, cols, rows);
    tiles
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};

    fn rgba(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([10, 20, 30, 255])))
    }

    #[test]
    fn extension_checks_are_case_insensitive() {
        assert!(is_image_file(Path::new("scan.PNG")));
        assert!(is_image_file(Path::new("a/b/photo.Jpeg")));
        assert!(!is_image_file(Path::new("doc.gif")));
        assert!(!is_image_file(Path::new("noext")));
        assert!(is_pdf_file(Path::new("report.PDF")));
    }

    #[test]
    fn resize_keeps_aspect_with_truncation() {
        let out = resize(rgba(3000, 1000), Some(1024), true);
        assert_eq!(out.dimensions(), (1024, 341));
        let out = resize(rgba(1000, 3000), Some(1024), true);
        assert_eq!(out.dimensions(), (341, 1024));
    }

    #[test]
    fn resize_noop_cases() {
        assert_eq!(resize(rgba(800, 600), Some(1024), true).dimensions(), (800, 600));
        assert_eq!(resize(rgba(4000, 600), None, true).dimensions(), (4000, 600));
    }

    #[test]
    fn resize_square_without_aspect() {
        assert_eq!(resize(rgba(2000, 500), Some(512), false).dimensions(), (512, 512));
    }

    #[test]
    fn load_converts_to_rgb_and_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        rgba(40, 30).save_with_format(&path, ImageFormat::Png).unwrap();

        let img = load(&path).unwrap();
        assert!(matches!(img, DynamicImage::ImageRgb8(_)));

        assert!(matches!(
            load(&dir.path().join("missing.png")),
            Err(OcrError::FileNotFound { .. })
        ));

        let gif = dir.path().join("x.gif");
        std::fs::write(&gif, b"GIF89a").unwrap();
        assert!(matches!(load(&gif), Err(OcrError::UnsupportedFormat { .. })));

        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"not an image").unwrap();
        assert!(matches!(load(&broken), Err(OcrError::ImageProcessing { .. })));
        assert!(!validate(&broken));
        assert!(validate(&path));
    }

    #[test]
    fn process_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.png");
        rgba(2048, 1024).save_with_format(&path, ImageFormat::Png).unwrap();

        let (img, pi) = process(&path, Some(1024), true).unwrap();
        assert_eq!(img.dimensions(), (1024, 512));
        assert_eq!(pi.original_size, (2048, 1024));
        assert!(pi.resized);

        let ii = info(&path).unwrap();
        assert_eq!((ii.width, ii.height), (2048, 1024));
        assert_eq!(ii.format, "PNG");
        assert_eq!(ii.file_name, "big.png");
    }

    #[test]
    fn find_images_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.jpg", "notes.txt", "c.PDF"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.png")).unwrap();
        let found = find_images(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(|p| file_name_of(p)).collect();
        assert_eq!(names, ["a.jpg", "b.png"]);
    }

    #[test]
    fn tile_covers_image() {
        let tiles = tile(&rgba(1500, 700), 640);
        assert_eq!(tiles.len(), 6);
        assert_eq!(tiles[0].dimensions(), (640, 640));
        assert_eq!(tiles[2].dimensions(), (220, 640));
        assert_eq!(tiles[5].dimensions(), (220, 60));
    }
}

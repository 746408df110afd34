//! # pdfium-locate
//!
//! Find a usable [PDFium](https://pdfium.googlesource.com/pdfium/) shared
//! library for `pdfium-render`, and fetch one into a per-user cache when the
//! machine has none.
//!
//! ## Search order
//!
//! 1. `PDFIUM_LIB_PATH` — an explicit library file.
//! 2. Project-local copy under `tools/pdfium/lib/` or `tools/pdfium/bin/`
//!    (relative to the current directory).
//! 3. Every directory on `PATH` and the platform loader path
//!    (`LD_LIBRARY_PATH` / `DYLD_LIBRARY_PATH`).
//! 4. The cache directory (`PDFIUM_CACHE_DIR` or `~/.cache/dsocr/pdfium-{VERSION}`).
//!
//! [`ensure_library`] adds a fifth step: download the platform archive from
//! [bblanchon/pdfium-binaries](https://github.com/bblanchon/pdfium-binaries)
//! into the cache. Set `PDFIUM_NO_DOWNLOAD=1` to forbid network access.
//!
//! ```rust,no_run
//! let located = pdfium_locate::ensure_library(None).expect("PDFium unavailable");
//! println!("{} ({})", located.path.display(), located.source);
//! let pdfium = pdfium_locate::bind_at(&located.path).expect("bind failed");
//! ```

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use pdfium_render::prelude::Pdfium;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The pdfium-binaries release tag used for downloads.
pub const PDFIUM_VERSION: &str = "7690";

const BASE_URL: &str = "https://github.com/bblanchon/pdfium-binaries/releases/download";

/// Errors returned while locating, fetching or binding PDFium.
#[derive(Error, Debug)]
pub enum LocateError {
    #[error("Unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("PDFium library not found and downloads are disabled (PDFIUM_NO_DOWNLOAD)")]
    NotFound,

    #[error("Cache directory error: {0}")]
    CacheDir(#[source] std::io::Error),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Archive extraction failed: {0}")]
    Extract(String),

    #[error("Failed to bind PDFium from '{path}': {reason}")]
    Bind { path: PathBuf, reason: String },
}

/// Where a library was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibrarySource {
    EnvVar,
    ProjectLocal,
    SystemPath,
    Cache,
    Downloaded,
}

impl fmt::Display for LibrarySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LibrarySource::EnvVar => "PDFIUM_LIB_PATH",
            LibrarySource::ProjectLocal => "project tools/ directory",
            LibrarySource::SystemPath => "system search path",
            LibrarySource::Cache => "local cache",
            LibrarySource::Downloaded => "downloaded",
        };
        f.write_str(s)
    }
}

/// A PDFium library on disk and how it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedLibrary {
    pub path: PathBuf,
    pub source: LibrarySource,
}

struct Archive {
    name: &'static str,
    member: &'static str,
}

fn platform_archive() -> Result<Archive, LocateError> {
    let archive = match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => ("pdfium-mac-arm64.tgz", "lib/libpdfium.dylib"),
        ("macos", "x86_64") => ("pdfium-mac-x64.tgz", "lib/libpdfium.dylib"),
        ("linux", "x86_64") => ("pdfium-linux-x64.tgz", "lib/libpdfium.so"),
        ("linux", "aarch64") => ("pdfium-linux-arm64.tgz", "lib/libpdfium.so"),
        ("windows", "x86_64") => ("pdfium-win-x64.tgz", "bin/pdfium.dll"),
        ("windows", "aarch64") => ("pdfium-win-arm64.tgz", "bin/pdfium.dll"),
        ("windows", "x86") => ("pdfium-win-x86.tgz", "bin/pdfium.dll"),
        (os, arch) => {
            return Err(LocateError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            })
        }
    };
    Ok(Archive {
        name: archive.0,
        member: archive.1,
    })
}

/// The platform file name of the PDFium shared library.
pub fn library_file_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "pdfium.dll"
    } else if cfg!(target_os = "macos") {
        "libpdfium.dylib"
    } else {
        "libpdfium.so"
    }
}

/// Per-version cache directory. `PDFIUM_CACHE_DIR` overrides the base.
pub fn cache_dir() -> PathBuf {
    let base = match std::env::var_os("PDFIUM_CACHE_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
            .unwrap_or_else(std::env::temp_dir)
            .join("dsocr"),
    };
    base.join(format!("pdfium-{PDFIUM_VERSION}"))
}

/// Project-local directories searched under `root`.
pub fn project_dirs(root: &Path) -> [PathBuf; 2] {
    let tools = root.join("tools").join("pdfium");
    [tools.join("lib"), tools.join("bin")]
}

fn system_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for var in ["PATH", "LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH"] {
        if let Some(value) = std::env::var_os(var) {
            dirs.extend(std::env::split_paths(&value));
        }
    }
    dirs
}

/// Search without touching the network, relative to `root` for the
/// project-local step.
pub fn locate_from(root: &Path) -> Option<LocatedLibrary> {
    if let Some(p) = std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from) {
        if p.is_file() {
            return Some(LocatedLibrary {
                path: p,
                source: LibrarySource::EnvVar,
            });
        }
        warn!("PDFIUM_LIB_PATH '{}' does not exist, searching elsewhere", p.display());
    }

    let name = library_file_name();
    let candidates = project_dirs(root)
        .into_iter()
        .map(|d| (d, LibrarySource::ProjectLocal))
        .chain(system_dirs().into_iter().map(|d| (d, LibrarySource::SystemPath)))
        .chain(std::iter::once((cache_dir(), LibrarySource::Cache)));

    for (dir, source) in candidates {
        let path = dir.join(name);
        if path.is_file() {
            debug!("PDFium found at {} ({})", path.display(), source);
            return Some(LocatedLibrary { path, source });
        }
    }
    None
}

/// Search from the current directory without touching the network.
pub fn locate() -> Option<LocatedLibrary> {
    let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    locate_from(&root)
}

static RESOLVED: OnceLock<LocatedLibrary> = OnceLock::new();

/// Locate the library, downloading it into the cache when nothing is found.
///
/// `on_progress` receives `(bytes_downloaded, total_bytes)` while fetching.
/// The result is memoised for the lifetime of the process.
pub fn ensure_library(
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<LocatedLibrary, LocateError> {
    if let Some(found) = RESOLVED.get() {
        return Ok(found.clone());
    }

    let found = match locate() {
        Some(found) => found,
        None => {
            if std::env::var_os("PDFIUM_NO_DOWNLOAD").is_some() {
                return Err(LocateError::NotFound);
            }
            download_to_cache(on_progress)?
        }
    };

    let _ = RESOLVED.set(found.clone());
    Ok(found)
}

/// Locate (or fetch) and bind in one step.
pub fn bind() -> Result<Pdfium, LocateError> {
    let found = ensure_library(None)?;
    bind_at(&found.path)
}

/// Bind to the library file at `path`.
pub fn bind_at(path: &Path) -> Result<Pdfium, LocateError> {
    Pdfium::bind_to_library(path)
        .map(Pdfium::new)
        .map_err(|e| LocateError::Bind {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn download_to_cache(
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<LocatedLibrary, LocateError> {
    let archive = platform_archive()?;
    let dir = cache_dir();
    std::fs::create_dir_all(&dir).map_err(LocateError::CacheDir)?;

    let url = format!("{BASE_URL}/chromium%2F{PDFIUM_VERSION}/{}", archive.name);
    info!("Downloading PDFium {} from {}", PDFIUM_VERSION, url);

    let bytes = fetch(&url, on_progress)?;
    let dest = dir.join(library_file_name());
    unpack_member(&bytes, archive.member, &dest)?;
    info!("PDFium cached at {}", dest.display());

    Ok(LocatedLibrary {
        path: dest,
        source: LibrarySource::Downloaded,
    })
}

fn fetch(url: &str, on_progress: Option<&dyn Fn(u64, Option<u64>)>) -> Result<Vec<u8>, LocateError> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("pdfium-locate/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| LocateError::Download(e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .map_err(|e| LocateError::Download(format!("GET {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(LocateError::Download(format!(
            "HTTP {} for {url}",
            response.status()
        )));
    }

    let total = response.content_length();
    let mut buf = Vec::with_capacity(total.unwrap_or(32 * 1024 * 1024) as usize);
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        match response.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Some(cb) = on_progress {
                    cb(buf.len() as u64, total);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(LocateError::Download(format!("read error: {e}"))),
        }
    }

    Ok(buf)
}

fn unpack_member(archive: &[u8], member: &str, dest: &Path) -> Result<(), LocateError> {
    use flate2::read::GzDecoder;

    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let entries = tar
        .entries()
        .map_err(|e| LocateError::Extract(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| LocateError::Extract(e.to_string()))?;
        let is_member = entry
            .path()
            .map(|p| p.to_string_lossy() == member)
            .unwrap_or(false);
        if is_member {
            entry
                .unpack(dest)
                .map_err(|e| LocateError::Extract(format!("unpack failed: {e}")))?;
            return Ok(());
        }
    }

    Err(LocateError::Extract(format!("'{member}' not found in archive")))
}

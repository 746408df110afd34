//! CLI binary for dsocr.
//!
//! A thin shim over the library crate: maps flags and the JSON config file
//! to engine settings, drives a progress bar and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dsocr::config::DEFAULT_CONFIG_PATH;
use dsocr::memory::MemoryManager;
use dsocr::output::{write_json_report, OcrReport};
use dsocr::perf::{MonitorReport, SystemMonitor};
use dsocr::pipeline::image::{find_images, is_pdf_file};
use dsocr::pipeline::pdf::{self, PageFormat};
use dsocr::prompts::task_prompt;
use dsocr::system::{format_bytes, format_duration, VersionInfo};
use dsocr::{
    AppConfig, BatchOptions, BatchSummary, BatchWorker, InferenceSettings, ModelMode, OcrEngine,
    OcrError, OcrResult, PdfConverter, WorkerEvent,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # OCR one image with the configured model
  dsocr image scan.png

  # Large pages: tile at 640 px with a 1024 px global view
  dsocr image --mode gundam --save -o outputs/md invoice.jpg

  # Directory of images or a PDF, with reports
  dsocr batch ./scans -o outputs/batch_results
  dsocr batch report.pdf --max-pages 20

  # Rasterise only
  dsocr pdf report.pdf --dpi 300 --first 2 --last 5
  dsocr pdf report.pdf --info

  # Watch CPU/RAM/VRAM until Ctrl-C
  dsocr monitor --interval 2 --export outputs/monitor.json

  # Configuration
  dsocr config init
  dsocr config set device.type '"cpu"'
  dsocr config get memory.vram_threshold

ENVIRONMENT VARIABLES:
  DSOCR_CONFIG            Path of the JSON configuration file
  DSOCR_MODEL             Override model.name
  DSOCR_PROVIDER          Override model.provider (ollama, vllm, openai, ...)
  PDFIUM_LIB_PATH         Path to an existing libpdfium; skips auto-download
  PDFIUM_CACHE_DIR        Override the default pdfium cache directory
  PDFIUM_NO_DOWNLOAD      Never download pdfium
  RUST_LOG                Tracing filter, overrides -v/-q and logging.level

SETUP:
  1. Serve the model:  ollama pull deepseek-ocr
  2. OCR:              dsocr image scan.png

  PDFium (~30 MB) is downloaded on first PDF use and cached in
  ~/.cache/dsocr/pdfium-7690/.
"#;

/// Run DeepSeek-OCR over images and PDFs with VRAM-aware batching.
#[derive(Parser, Debug)]
#[command(
    name = "dsocr",
    version,
    about = "Run DeepSeek-OCR over images and PDFs with VRAM-aware batching",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true, env = "DSOCR_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DSOCR_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DSOCR_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// OCR a single image.
    Image(ImageArgs),
    /// OCR a directory of images or every page of a PDF.
    Batch(BatchArgs),
    /// Rasterise PDF pages to images, or show PDF facts.
    Pdf(PdfArgs),
    /// Sample CPU, RAM and VRAM until Ctrl-C.
    Monitor(MonitorArgs),
    /// Versions, hardware, memory and PDFium status.
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Show or edit the configuration file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// Model and resolution flags shared by `image` and `batch`.
#[derive(Args, Debug)]
struct ModelArgs {
    /// Model name on the serving provider.
    #[arg(long, env = "DSOCR_MODEL")]
    model: Option<String>,

    /// Serving provider: ollama, vllm, openai, ...
    #[arg(long, env = "DSOCR_PROVIDER")]
    provider: Option<String>,

    /// Resolution preset: tiny, small, base, large, gundam.
    #[arg(long)]
    mode: Option<ModelMode>,

    #[arg(long)]
    base_size: Option<u32>,

    #[arg(long)]
    image_size: Option<u32>,

    /// Tile the image at image-size plus a base-size global view.
    #[arg(long)]
    crop: bool,

    /// Prompt preset: markdown, ocr, figure, describe.
    #[arg(long)]
    task: Option<String>,
}

#[derive(Args, Debug)]
struct ImageArgs {
    image: PathBuf,

    #[command(flatten)]
    model: ModelArgs,

    /// Directory for the Markdown file written with --save.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write <output>/<stem>.md.
    #[arg(long)]
    save: bool,

    /// Retry on the CPU when the GPU runs out of memory.
    #[arg(long)]
    fallback: bool,

    /// Print the result record as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Directory of images or a PDF.
    input: PathBuf,

    #[command(flatten)]
    model: ModelArgs,

    #[arg(short, long, default_value = "outputs/batch_results")]
    output: PathBuf,

    /// PDF pages to rasterise.
    #[arg(long, default_value_t = 100)]
    max_pages: usize,

    /// Base batch size for read-ahead (default: memory.base_batch_size).
    #[arg(long)]
    batch_size: Option<usize>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct PdfArgs {
    pdf: PathBuf,

    #[arg(short, long, default_value = "outputs/pdf_images")]
    output: PathBuf,

    /// Rendering DPI (72–600, default: pdf.dpi).
    #[arg(long, value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: Option<u32>,

    /// png or jpeg (default: pdf.format).
    #[arg(long)]
    format: Option<PageFormat>,

    /// First page, 1-based.
    #[arg(long)]
    first: Option<usize>,

    /// Last page, 1-based, inclusive.
    #[arg(long)]
    last: Option<usize>,

    #[arg(long)]
    max_pages: Option<usize>,

    #[arg(long, default_value = "page")]
    prefix: String,

    /// Print document facts instead of rendering.
    #[arg(long)]
    info: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct MonitorArgs {
    /// Seconds between samples.
    #[arg(long, default_value_t = 1.0)]
    interval: f64,

    /// One line per sample.
    #[arg(long)]
    compact: bool,

    /// Write the session report here on exit.
    #[arg(long)]
    export: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Write the default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print one value by dotted key, e.g. model.image_size.
    Get { key: String },
    /// Set one value by dotted key; VALUE is JSON (strings need quotes).
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(&cli.config, &cli.command)?;

    let show_progress = matches!(&cli.command, Command::Batch(b) if !b.no_progress && !b.json);
    init_logging(&cli, &config, show_progress)?;

    let outcome = match cli.command {
        Command::Image(args) => run_image(args, &config).await,
        Command::Batch(args) => run_batch(args, &config, cli.quiet).await,
        Command::Pdf(args) => run_pdf(args, &config, cli.quiet).await,
        Command::Monitor(args) => run_monitor(args, &config).await,
        Command::Info { json } => run_info(json, &config),
        Command::Config(cmd) => run_config(cmd, config, &cli.config),
    };

    if let Err(e) = &outcome {
        if let Some(ocr) = e.downcast_ref::<OcrError>() {
            eprintln!("{} {}", red("✘"), ocr);
            eprintln!("  {}", dim(ocr.suggestion()));
            return Ok(ExitCode::FAILURE);
        }
    }
    outcome
}

/// Strict for every command except `config`, which must work on a broken
/// file so it can be repaired.
fn load_config(path: &Path, command: &Command) -> Result<AppConfig> {
    match AppConfig::load(path) {
        Ok(config) => Ok(config),
        Err(e) if matches!(command, Command::Config(_)) => {
            eprintln!("{} {}; using defaults", cyan("⚠"), e);
            Ok(AppConfig::default())
        }
        Err(e) => {
            Err(e).with_context(|| format!("Failed to load config {}", path.display()))
        }
    }
}

// ── Logging ──────────────────────────────────────────────────────────────────

/// stderr (coloured per config) plus `<log_dir>/dsocr_YYYYMMDD.log`.
fn init_logging(cli: &Cli, config: &AppConfig, show_progress: bool) -> Result<()> {
    let logging = &config.logging;
    let level = if cli.verbose {
        "debug".to_string()
    } else if cli.quiet || show_progress {
        "error".to_string()
    } else {
        filter_level(&logging.level).to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let console = logging.console_output.then(|| {
        fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(logging.colored)
    });

    let file = if logging.file_output {
        std::fs::create_dir_all(&config.paths.log_dir).with_context(|| {
            format!("Failed to create log directory {}", config.paths.log_dir.display())
        })?;
        let name = format!("dsocr_{}.log", chrono::Local::now().format("%Y%m%d"));
        let path = config.paths.log_dir.join(name);
        let handle = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        Some(fmt::layer().with_writer(Mutex::new(handle)).with_ansi(false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(())
}

/// Map a config level name to an `EnvFilter` directive. Unknown names fall
/// back to `info` rather than becoming a target filter.
fn filter_level(name: &str) -> &'static str {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" | "fatal" => "error",
        "off" => "off",
        _ => "info",
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

/// Config file values, then CLI overrides.
fn engine_config(args: &ModelArgs, config: &AppConfig) -> Result<dsocr::EngineConfig> {
    let mut config = config.clone();
    if let Some(model) = &args.model {
        config.model.name = model.clone();
    }
    if let Some(provider) = &args.provider {
        config.model.provider = provider.clone();
    }

    let mut engine = config.engine_config().context("Invalid configuration")?;
    let mut settings = match args.mode {
        Some(mode) => InferenceSettings::from_mode(mode).with_prompt(engine.settings.prompt.clone()),
        None => engine.settings.clone(),
    };
    if let Some(size) = args.base_size {
        settings.base_size = size;
    }
    if let Some(size) = args.image_size {
        settings.image_size = size;
    }
    if args.crop {
        settings.crop_mode = true;
    }
    if let Some(task) = &args.task {
        let prompt = task_prompt(task).with_context(|| {
            format!("Unknown task '{task}' (markdown, ocr, figure, describe)")
        })?;
        settings.prompt = prompt.to_string();
    }
    engine.settings = settings;
    Ok(engine)
}

// ── image ────────────────────────────────────────────────────────────────────

async fn run_image(args: ImageArgs, config: &AppConfig) -> Result<ExitCode> {
    let mut engine = OcrEngine::from_config(engine_config(&args.model, config)?);
    let save_dir = args
        .save
        .then(|| args.output.clone().unwrap_or_else(|| config.paths.output_dir.clone()));

    let result = if args.fallback {
        engine.process_with_fallback(&args.image, None, save_dir.as_deref()).await
    } else {
        engine.process_image(&args.image, None, save_dir.as_deref()).await
    };
    engine.unload_model().await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("Failed to serialise result")?
        );
    } else {
        print_result(&result, save_dir.as_deref());
    }
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_result(result: &OcrResult, save_dir: Option<&Path>) {
    if !result.success {
        eprintln!(
            "{} {}  {}",
            red("✘"),
            result.file_name(),
            red(result.error.as_deref().unwrap_or("unknown error"))
        );
        return;
    }

    println!("{}", result.text.trim_end());
    eprintln!();
    eprintln!(
        "{} {}  {}x{}  {}  {}",
        green("✔"),
        bold(&result.file_name()),
        result.image_size.0,
        result.image_size.1,
        dim(&format_duration(result.processing_time_secs)),
        dim(&result.device.map(|d| d.to_string()).unwrap_or_default()),
    );
    if result.memory_used_gb > 0.0 {
        eprintln!("   VRAM {:.2} GB", result.memory_used_gb);
    }
    if let Some(dir) = save_dir {
        eprintln!("   saved to {}", bold(&dir.display().to_string()));
    }
}

// ── batch ────────────────────────────────────────────────────────────────────

async fn run_batch(args: BatchArgs, config: &AppConfig, quiet: bool) -> Result<ExitCode> {
    if !args.input.exists() {
        return Err(OcrError::FileNotFound {
            path: args.input.clone(),
        }
        .into());
    }

    let mut pdf_record = None;
    let (paths, ocr_dir) = if is_pdf_file(&args.input) {
        ensure_pdfium(quiet)?;
        let converter = PdfConverter::new(
            config.pdf.dpi,
            config.pdf.format.parse()?,
            Some(args.max_pages),
        );
        let images_dir = args.output.join("pdf_images");
        let converted = converter.convert(&args.input, &images_dir, None, "page").await;
        if !converted.success {
            anyhow::bail!(
                "PDF conversion failed: {}",
                converted.error.as_deref().unwrap_or("unknown error")
            );
        }
        let paths = converted.image_paths.clone();
        pdf_record = Some(converted);
        (paths, args.output.join("pdf_ocr"))
    } else {
        (find_images(&args.input)?, args.output.clone())
    };

    if paths.is_empty() {
        warn!("No images found in {}", args.input.display());
        eprintln!("{} no images found in {}", cyan("⚠"), args.input.display());
        return Ok(ExitCode::FAILURE);
    }

    let engine = OcrEngine::from_config(engine_config(&args.model, config)?);
    let memory = engine.memory().clone();
    let tracker = engine.tracker().clone();
    let device = engine.device().memory_index();

    let options = BatchOptions {
        base_batch_size: args.batch_size.unwrap_or(config.memory.base_batch_size),
        settings: None,
        save_dir: Some(ocr_dir),
    };
    let mut handle = BatchWorker::spawn(engine, paths, options);

    let stop = handle.stop_flag();
    let abort = handle.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{} stopping after the current item… (Ctrl-C again to abort)",
                cyan("⚠")
            );
            stop.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });

    let bar = (!args.no_progress && !args.json && !quiet).then(ProgressBar::new_spinner);
    let mut summary = BatchSummary::default();
    while let Some(event) = handle.next_event().await {
        match event {
            WorkerEvent::Started { total } => {
                if let Some(bar) = &bar {
                    activate_bar(bar, total);
                }
            }
            WorkerEvent::Progress { file, .. } => {
                if let Some(bar) = &bar {
                    bar.set_message(file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
                }
            }
            WorkerEvent::ItemDone(result) => {
                if let Some(bar) = &bar {
                    bar.println(item_line(&result));
                    bar.inc(1);
                }
            }
            WorkerEvent::Stopped { processed } => {
                if let Some(bar) = &bar {
                    bar.println(format!("{} stopped after {processed} items", cyan("⚠")));
                }
            }
            WorkerEvent::Finished(s) => summary = s,
        }
    }
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    let (mut engine, results) = handle.join().await?;
    engine.unload_model().await;

    let mut report = OcrReport::new(&args.input, results);
    report.pdf = pdf_record;
    report.memory = Some(memory.report(device));
    report.performance = Some(tracker.summary());
    write_json_report(&args.output.join("report.json"), &report)?;
    tracker.export_report(args.output.join("performance_report.json"))?;
    info!("Reports written to {}", args.output.display());

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !quiet {
        print_summary(&summary, &args.output);
    }

    Ok(if summary.successful > 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn activate_bar(bar: &ProgressBar, total: usize) {
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  \
         [{bar:42.green/238}] {pos:>3}/{len} images  \
         ⏱ {elapsed_precise}  ETA {eta_precise}  {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(TICKS);

    bar.set_length(total as u64);
    bar.set_style(style);
    bar.set_prefix("OCR");
    bar.enable_steady_tick(Duration::from_millis(80));
}

fn item_line(result: &OcrResult) -> String {
    if result.success {
        format!(
            "  {} {:<32}  {}  {}",
            green("✓"),
            result.file_name(),
            dim(&format!("{:>6} chars", result.text.len())),
            dim(&format_duration(result.processing_time_secs)),
        )
    } else {
        let error = result.error.as_deref().unwrap_or("unknown error");
        // Keep lines tidy.
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };
        format!("  {} {:<32}  {}", red("✗"), result.file_name(), red(&msg))
    }
}

fn print_summary(summary: &BatchSummary, output: &Path) {
    let mark = if summary.failed == 0 {
        green("✔")
    } else if summary.successful == 0 {
        red("✘")
    } else {
        cyan("⚠")
    };
    eprintln!(
        "{mark} {}/{} images  ({:.1}% success)  {} total, {} avg",
        bold(&summary.successful.to_string()),
        summary.total_processed,
        summary.success_rate,
        format_duration(summary.total_time_secs),
        format_duration(summary.average_time_secs),
    );
    for (file, error) in &summary.failures {
        eprintln!("   {} {}: {}", red("✗"), file, dim(error));
    }
    eprintln!("   reports in {}", bold(&output.display().to_string()));
}

// ── pdf ──────────────────────────────────────────────────────────────────────

async fn run_pdf(args: PdfArgs, config: &AppConfig, quiet: bool) -> Result<ExitCode> {
    ensure_pdfium(quiet)?;

    if args.info {
        let facts = pdf::info(&args.pdf).await?;
        if args.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&facts).context("Failed to serialise info")?
            );
        } else {
            println!("File:         {}", facts.file_name);
            println!("Size:         {:.2} MB", facts.file_size_mb);
            println!("Pages:        {}", facts.total_pages);
            println!(
                "First page:   {:.0} x {:.0} pt",
                facts.first_page_size.0, facts.first_page_size.1
            );
            println!(
                "Estimate:     {}",
                format_duration(facts.estimated_conversion_secs)
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    let format = match args.format {
        Some(f) => f,
        None => config.pdf.format.parse()?,
    };
    let converter = PdfConverter::new(
        args.dpi.unwrap_or(config.pdf.dpi),
        format,
        args.max_pages.or(config.pdf.max_pages),
    );
    let range = match (args.first, args.last) {
        (None, None) => None,
        (first, last) => Some((first.unwrap_or(1), last.unwrap_or(usize::MAX))),
    };
    let result = converter.convert(&args.pdf, &args.output, range, &args.prefix).await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("Failed to serialise result")?
        );
    } else if result.success {
        let written: u64 = result
            .image_paths
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        eprintln!(
            "{} {}/{} pages, {}  →  {}",
            green("✔"),
            result.converted_pages,
            result.total_pages,
            format_bytes(written),
            bold(&result.output_dir.display().to_string())
        );
    } else {
        eprintln!(
            "{} {}",
            red("✘"),
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Locate PDFium, downloading it with a progress bar on first use.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if pdfium_locate::locate().is_some() {
        return Ok(());
    }
    if quiet {
        tokio::task::block_in_place(|| pdfium_locate::ensure_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_locate::ensure_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

// ── monitor ──────────────────────────────────────────────────────────────────

async fn run_monitor(args: MonitorArgs, config: &AppConfig) -> Result<ExitCode> {
    let memory = std::sync::Arc::new(MemoryManager::detect(config.memory.vram_threshold));
    let mut monitor = SystemMonitor::new(memory, config.device.index);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(args.interval.max(0.1)));
    let mut samples = Vec::new();

    eprintln!("{} monitoring, Ctrl-C to stop", cyan("◆"));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                let s = monitor.sample();
                if args.compact {
                    println!(
                        "{}  CPU {:5.1}%  RAM {:5.1}%  VRAM {:5.1}%",
                        s.timestamp.format("%H:%M:%S"),
                        s.cpu_percent,
                        s.ram_percent,
                        s.vram.usage_percent
                    );
                } else {
                    println!("{}", bold(&s.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()));
                    println!("  CPU   {:5.1}%  ({} cores)", s.cpu_percent, s.cpu_cores);
                    println!(
                        "  RAM   {:5.1}%  {:.2}/{:.2} GB  ({:.2} GB available)",
                        s.ram_percent, s.ram_used_gb, s.ram_total_gb, s.ram_available_gb
                    );
                    if s.vram.gpu_available {
                        println!(
                            "  VRAM  {:5.1}%  {:.2}/{:.2} GB  {}",
                            s.vram.usage_percent, s.vram.used_gb, s.vram.total_gb,
                            dim(&s.vram.device_name)
                        );
                    }
                }
                samples.push(s);
            }
        }
    }

    let Some(report) = MonitorReport::from_samples(&samples) else {
        eprintln!("{} no samples taken", cyan("⚠"));
        return Ok(ExitCode::SUCCESS);
    };
    eprintln!(
        "{} {} samples over {}  CPU avg {:.1}%  RAM avg {:.1}%",
        green("✔"),
        report.samples,
        format_duration(report.duration_secs),
        report.cpu.avg,
        report.ram.avg
    );
    if let Some(path) = &args.export {
        write_json_report(path, &report)?;
        eprintln!("   report written to {}", bold(&path.display().to_string()));
    }
    Ok(ExitCode::SUCCESS)
}

// ── info ─────────────────────────────────────────────────────────────────────

fn run_info(json: bool, config: &AppConfig) -> Result<ExitCode> {
    let memory = MemoryManager::detect(config.memory.vram_threshold);
    let info = VersionInfo::collect(&memory, config.device.device().memory_index());

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info).context("Failed to serialise info")?
        );
        return Ok(ExitCode::SUCCESS);
    }

    println!("{} {}", bold(&info.name), info.version);
    println!(
        "Platform:     {} {} ({}/{})",
        info.os_name.as_deref().unwrap_or("unknown"),
        info.os_version.as_deref().unwrap_or(""),
        info.target_os,
        info.target_arch
    );
    println!("CPU:          {} ({} cores)", info.cpu_model, info.cpu_cores);
    println!("RAM:          {:.1} GB", info.ram_total_gb);
    if info.gpu.gpu_available {
        println!(
            "GPU:          {} x{}  VRAM {:.2}/{:.2} GB ({:.1}%)",
            info.gpu.device_name,
            info.gpu.device_count,
            info.gpu.vram.used_gb,
            info.gpu.vram.total_gb,
            info.gpu.vram.usage_percent
        );
        println!(
            "Threshold:    {:.0}%{}",
            info.gpu.threshold.warning_percent,
            if info.gpu.threshold.is_critical {
                red("  (critical)")
            } else {
                String::new()
            }
        );
    } else {
        println!("GPU:          {}", dim("none (CPU mode)"));
    }
    match (&info.pdfium.path, &info.pdfium.source) {
        (Some(path), Some(source)) => println!(
            "PDFium:       {} ({}, {})",
            path.display(),
            source,
            info.pdfium.version
        ),
        _ => println!("PDFium:       {}", dim("not found (downloaded on first PDF use)")),
    }
    println!(
        "Model:        {}/{} on {}",
        config.model.provider,
        config.model.name,
        config.device.device()
    );
    Ok(ExitCode::SUCCESS)
}

// ── config ───────────────────────────────────────────────────────────────────

fn run_config(cmd: ConfigCommand, mut config: AppConfig, path: &Path) -> Result<ExitCode> {
    match cmd {
        ConfigCommand::Show => {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to serialise config")?
            );
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            AppConfig::default().save(path)?;
            eprintln!("{} wrote {}", green("✔"), bold(&path.display().to_string()));
        }
        ConfigCommand::Get { key } => match config.get(&key) {
            Some(value) => println!("{value}"),
            None => {
                eprintln!("{} no such key '{key}'", red("✘"));
                return Ok(ExitCode::FAILURE);
            }
        },
        ConfigCommand::Set { key, value } => {
            // Bare words are taken as strings so `set device.type cpu` works.
            let value = serde_json::from_str(&value)
                .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
            config.set(&key, value)?;
            config.validate()?;
            config.save(path)?;
            eprintln!("{} {key} updated", green("✔"));
        }
    }
    Ok(ExitCode::SUCCESS)
}

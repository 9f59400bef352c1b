//! CLI binary for docbatch.
//!
//! A thin shim over the library crate: maps flags to `BatchConfig` and
//! `ModelConfig`, runs one batch, and prints the same JSON shapes an HTTP
//! front end would return.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use docbatch::prompts::{default_prompt, PROMPT_TYPES};
use docbatch::{
    merge_results, resolve_input, ArtifactStore, BatchConfig, BatchProgressCallback,
    BatchResponse, BatchScheduler, DeleteResponse, HistoryResponse, HistoryStore, JobResult,
    ModelBackend, ModelConfig, Presets, ProgressCallback, PromptSpec, UploadedFile,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

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

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar counting files, with a log line per page above it. Pages of
/// different files interleave, so every line names its file.
struct CliProgressCallback {
    bar: ProgressBar,
    page_errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);
        bar.set_style(style);
        bar.set_prefix("Processing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            page_errors: AtomicUsize::new(0),
        })
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_files} file(s)…"))
        ));
    }

    fn on_file_start(&self, _file_index: usize, filename: &str, total_pages: usize) {
        self.bar.set_message(format!("{filename} ({total_pages} page(s))"));
    }

    fn on_page_complete(&self, filename: &str, page_num: usize, total_pages: usize, text_len: usize) {
        self.bar.println(format!(
            "  {} {}  page {:>3}/{:<3}  {}",
            green("✓"),
            filename,
            page_num,
            total_pages,
            dim(&format!("{text_len:>5} chars")),
        ));
    }

    fn on_page_error(&self, filename: &str, page_num: usize, total_pages: usize, error: &str) {
        self.page_errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {}  page {:>3}/{:<3}  {}",
            red("✗"),
            filename,
            page_num,
            total_pages,
            red(&truncate(error, 80)),
        ));
    }

    fn on_file_complete(&self, _file_index: usize, filename: &str, output_url: &str) {
        self.bar.println(format!("{} {}  →  {}", green("✔"), bold(filename), output_url));
        self.bar.inc(1);
    }

    fn on_file_error(&self, _file_index: usize, filename: &str, error: &str) {
        self.bar
            .println(format!("{} {}  {}", red("✘"), bold(filename), red(&truncate(error, 100))));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total_files: usize, succeeded: usize) {
        self.bar.finish_and_clear();
        let failed = total_files.saturating_sub(succeeded);
        let page_errors = self.page_errors.load(Ordering::SeqCst);
        if failed == 0 && page_errors == 0 {
            eprintln!(
                "{} {} file(s) processed successfully",
                green("✔"),
                bold(&succeeded.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} file(s) processed  ({} failed, {} page error(s))",
                if succeeded == 0 { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                total_files,
                red(&failed.to_string()),
                page_errors,
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Local mlx_vlm model, invoice prompt (default)
  docbatch process --model-path mlx-community/Qwen2.5-VL-7B-Instruct-4bit receipts/*.jpg

  # OpenAI-compatible endpoint, full-text extraction
  docbatch process --base-url https://dashscope.aliyuncs.com/compatible-mode/v1 \
      --api-key sk-... --model-name qwen-vl-max --prompt-type pdf_extract report.pdf

  # edgequake-llm provider, credentials from the environment
  docbatch process --provider openai --model gpt-4.1-mini scan.png

  # Custom prompt, merged output, JSON response
  docbatch process --prompt-type custom --custom-prompt "List every date" --merge --json a.pdf b.png

  # Saved presets
  docbatch process --presets presets.json --preset "Qwen local" --prompt-preset tables doc.pdf

  # History
  docbatch history list
  docbatch history delete 3f2a9c...

ENVIRONMENT VARIABLES:
  DOCBATCH_DATA_DIR       Root for uploads/, outputs/ and history.json (default: data)
  DOCBATCH_MODEL_PATH     Local model path or Hugging Face id
  DOCBATCH_BASE_URL       OpenAI-compatible base URL
  DOCBATCH_API_KEY        API key for the base URL
  DOCBATCH_MODEL_NAME     Model name at the base URL
  VLM_PYTHON              Python interpreter that has mlx_vlm installed
  PDFIUM_LIB_PATH         Path to an existing libpdfium; skips auto-download
  RUST_LOG                Overrides the log filter
"#;

/// Batch-convert PDFs and images to Markdown with a vision model.
#[derive(Parser, Debug)]
#[command(
    name = "docbatch",
    version,
    about = "Batch-convert PDFs and images to Markdown with a vision model",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root directory for uploads/, outputs/ and history.json.
    #[arg(long, global = true, env = "DOCBATCH_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCBATCH_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCBATCH_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process files or URLs.
    Process(ProcessArgs),
    /// Inspect or edit the processing history.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// List the built-in prompt types.
    Prompts,
}

#[derive(Subcommand, Debug)]
enum HistoryAction {
    /// Print every record, newest first, as JSON.
    List,
    /// Delete a record and its Markdown file.
    Delete { id: String },
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Local file paths or HTTP/HTTPS URLs (PDF or image).
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Built-in prompt: describe, invoice, pdf_extract, custom.
    #[arg(long, env = "DOCBATCH_PROMPT_TYPE", default_value = "invoice")]
    prompt_type: String,

    /// Prompt text used with `--prompt-type custom`.
    #[arg(long, env = "DOCBATCH_CUSTOM_PROMPT")]
    custom_prompt: Option<String>,

    /// Read the custom prompt from a file.
    #[arg(long, conflicts_with = "custom_prompt")]
    prompt_file: Option<PathBuf>,

    /// Local model path or Hugging Face id (mlx_vlm).
    #[arg(long, env = "DOCBATCH_MODEL_PATH")]
    model_path: Option<String>,

    /// Python interpreter for mlx_vlm.
    #[arg(long, env = "DOCBATCH_PYTHON")]
    python: Option<String>,

    /// OpenAI-compatible base URL.
    #[arg(long, env = "DOCBATCH_BASE_URL")]
    base_url: Option<String>,

    /// API key for `--base-url`.
    #[arg(long, env = "DOCBATCH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model name at `--base-url`.
    #[arg(long, env = "DOCBATCH_MODEL_NAME")]
    model_name: Option<String>,

    /// edgequake-llm provider (openai, anthropic, gemini, ollama, ...).
    #[arg(long, env = "DOCBATCH_PROVIDER", requires = "model")]
    provider: Option<String>,

    /// Model id for `--provider`.
    #[arg(long, env = "DOCBATCH_MODEL")]
    model: Option<String>,

    /// JSON file with saved model and prompt presets.
    #[arg(long, env = "DOCBATCH_PRESETS")]
    presets: Option<PathBuf>,

    /// Model preset (id or name) from `--presets`.
    #[arg(long, requires = "presets")]
    preset: Option<String>,

    /// Prompt preset (id or name) from `--presets`.
    #[arg(long, requires = "presets")]
    prompt_preset: Option<String>,

    /// Max output tokens per page.
    #[arg(long, env = "DOCBATCH_MAX_TOKENS", default_value_t = 1024)]
    max_tokens: usize,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "DOCBATCH_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Pages extracted per PDF.
    #[arg(long, env = "DOCBATCH_MAX_PAGES", default_value_t = 10)]
    max_pages: usize,

    /// Files processed at once; also bounds concurrent model calls.
    #[arg(short, long, env = "DOCBATCH_BATCH_SIZE", default_value_t = 5)]
    batch_size: usize,

    /// Retries per page for remote timeouts and transport errors.
    #[arg(long, env = "DOCBATCH_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Remote request timeout in seconds.
    #[arg(long, env = "DOCBATCH_REQUEST_TIMEOUT", default_value_t = 120)]
    request_timeout: u64,

    /// Local generation timeout in seconds.
    #[arg(long, env = "DOCBATCH_LOCAL_TIMEOUT", default_value_t = 300)]
    local_timeout: u64,

    /// Per-file deadline in seconds (0 disables).
    #[arg(long, env = "DOCBATCH_JOB_TIMEOUT", default_value_t = 1800)]
    job_timeout: u64,

    /// Password for encrypted PDFs.
    #[arg(long, env = "DOCBATCH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// HTTP download timeout in seconds for URL inputs.
    #[arg(long, env = "DOCBATCH_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Also write all completed files as one merged document.
    #[arg(long)]
    merge: bool,

    /// Print the batch response as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "DOCBATCH_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose brings them back.
    let show_progress = match &cli.command {
        Command::Process(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let history = Arc::new(HistoryStore::open(cli.data_dir.join("history.json")));

    match &cli.command {
        Command::Process(args) => run_process(&cli, args, history, show_progress).await,
        Command::History { action } => run_history(action, &history).await,
        Command::Prompts => {
            for name in PROMPT_TYPES {
                let text = default_prompt(name).unwrap_or_default();
                let first = text.lines().next().unwrap_or_default();
                println!("{}  {}", bold(&format!("{name:<12}")), dim(&truncate(first, 90)));
            }
            Ok(())
        }
    }
}

async fn run_history(action: &HistoryAction, history: &HistoryStore) -> Result<()> {
    let json = match action {
        HistoryAction::List => {
            let records = history.list().await.context("Failed to read history")?;
            serde_json::to_string_pretty(&HistoryResponse::new(records))?
        }
        HistoryAction::Delete { id } => {
            let ok = history
                .delete(id)
                .await
                .context("Failed to update history")?;
            if !ok {
                warn!("No history record with id {}", id);
            }
            serde_json::to_string_pretty(&DeleteResponse { ok })?
        }
    };
    println!("{json}");
    Ok(())
}

async fn run_process(
    cli: &Cli,
    args: &ProcessArgs,
    history: Arc<HistoryStore>,
    show_progress: bool,
) -> Result<()> {
    let presets = match &args.presets {
        Some(path) => Some(load_presets(path).await?),
        None => None,
    };
    let config = build_config(args)?;
    let model = select_model(args, presets.as_ref())?;
    let prompt = select_prompt(args, presets.as_ref()).await?;

    let mut files: Vec<UploadedFile> = Vec::with_capacity(args.inputs.len());
    for input in &args.inputs {
        files.push(
            resolve_input(input, config.download_timeout_secs)
                .await
                .with_context(|| format!("Failed to read {input}"))?,
        );
    }

    if files.iter().any(|f| f.filename.to_lowercase().ends_with(".pdf")) {
        ensure_pdfium(cli.quiet)?;
    }

    let storage = ArtifactStore::open(&cli.data_dir)
        .await
        .with_context(|| format!("Failed to open data dir {}", cli.data_dir.display()))?;
    let backend = ModelBackend::from_config(&model, &config).context("Invalid model configuration")?;

    let mut scheduler = BatchScheduler::new(backend, storage.clone(), history);
    if show_progress {
        let cb: ProgressCallback = CliProgressCallback::new();
        scheduler = scheduler.with_progress(cb);
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted: finishing in-flight pages, skipping the rest");
            on_ctrl_c.cancel();
        }
    });

    let results = scheduler
        .process_with_cancel(files, &prompt, &config, cancel)
        .await;

    let merged = if args.merge {
        merge_results(&results, &storage)
            .await
            .context("Failed to write merged document")?
    } else {
        None
    };

    let succeeded = results.iter().filter(|r| r.is_completed()).count();
    let total = results.len();

    if args.json {
        let mut response = BatchResponse::new(results);
        response.merged = merged;
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else if !cli.quiet {
        if !show_progress {
            print_summary(&results);
        }
        if let Some(m) = &merged {
            eprintln!("{} merged  →  {}", green("✔"), bold(&m.saved_path));
        }
    }

    if succeeded == 0 && total > 0 {
        bail!("no file was processed successfully");
    }
    Ok(())
}

fn print_summary(results: &[JobResult]) {
    for r in results {
        match r {
            JobResult::Completed(c) => eprintln!(
                "{} {}  {}/{} pages  →  {}",
                if c.failed_pages == 0 { green("✔") } else { cyan("⚠") },
                bold(&c.input),
                c.pages - c.failed_pages,
                c.pages,
                c.saved_path
            ),
            JobResult::Failed(f) => eprintln!(
                "{} {}  {}",
                red("✘"),
                bold(&f.input),
                red(&format!("[{}] {}", f.error_kind, f.error))
            ),
        }
    }
}

/// Map CLI args to `BatchConfig`.
fn build_config(args: &ProcessArgs) -> Result<BatchConfig> {
    let mut builder = BatchConfig::builder()
        .batch_size(args.batch_size)
        .max_pages(args.max_pages)
        .max_tokens(args.max_tokens)
        .temperature(args.temperature)
        .max_retries(args.max_retries)
        .request_timeout_secs(args.request_timeout)
        .local_timeout_secs(args.local_timeout)
        .job_timeout_secs((args.job_timeout > 0).then_some(args.job_timeout))
        .download_timeout_secs(args.download_timeout);
    if let Some(pwd) = &args.password {
        builder = builder.password(pwd.clone());
    }
    builder.build().context("Invalid configuration")
}

/// Preset, then provider, then local-or-API form fields.
fn select_model(args: &ProcessArgs, presets: Option<&Presets>) -> Result<ModelConfig> {
    if let (Some(key), Some(presets)) = (&args.preset, presets) {
        let preset = presets
            .model(key)
            .with_context(|| format!("No model preset named '{key}'"))?;
        return Ok(preset.config.clone());
    }
    if let (Some(provider), Some(model)) = (&args.provider, &args.model) {
        return Ok(ModelConfig::Provider {
            provider: provider.clone(),
            model: model.clone(),
        });
    }
    let mut config = ModelConfig::select(
        args.model_path.as_deref().unwrap_or_default(),
        args.base_url.as_deref().unwrap_or_default(),
        args.api_key.as_deref().unwrap_or_default(),
        args.model_name.as_deref().unwrap_or_default(),
    )
    .context("Pass --model-path, or --base-url with --api-key and --model-name")?;
    if let ModelConfig::Local { python, .. } = &mut config {
        python.clone_from(&args.python);
    }
    Ok(config)
}

async fn select_prompt(args: &ProcessArgs, presets: Option<&Presets>) -> Result<PromptSpec> {
    if let (Some(key), Some(presets)) = (&args.prompt_preset, presets) {
        let preset = presets
            .prompt(key)
            .with_context(|| format!("No prompt preset named '{key}'"))?;
        return Ok(PromptSpec::Custom(preset.content.clone()));
    }
    let custom = match &args.prompt_file {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read prompt from {:?}", path))?,
        ),
        None => args.custom_prompt.clone(),
    };
    Ok(PromptSpec::from_form(&args.prompt_type, custom.as_deref()))
}

async fn load_presets(path: &Path) -> Result<Presets> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read presets from {:?}", path))?;
    Presets::from_json(&json).context("Invalid presets file")
}

// ── Ensure PDFium engine is available ───────────────────────────────────
// On first use the shared library (~30 MB) is downloaded and cached;
// later runs only check the cache path.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if quiet {
        return tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .map(|_| ())
            .context("Failed to download PDFium engine");
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
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

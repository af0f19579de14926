use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use converter::{
    config::ConverterConfig,
    job::{FrameShape, Job, JobInput},
    pipeline::Converter,
    queue::JobStore,
    temp::cleanup_orphaned_temp_files,
    worker::run_workers,
};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Animated sticker conversion worker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process queued jobs until Ctrl-C
    Run,
    /// Queue a conversion job and print its id
    Submit(SourceArgs),
    /// Convert a single source right away
    Convert {
        #[command(flatten)]
        source: SourceArgs,

        /// Where to write the .webm sticker
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print a job record as JSON
    Status {
        id: String,
    },
}

#[derive(clap::Args, Debug)]
struct SourceArgs {
    /// Remote source (http or https)
    #[arg(long)]
    url: Option<String>,

    /// Local file sent inline, base64 encoded
    #[arg(long)]
    file: Option<PathBuf>,

    /// Local file the worker reads directly
    #[arg(long)]
    path: Option<PathBuf>,

    /// square, circle, rounded, medium or lite
    #[arg(long, default_value = "square")]
    shape: FrameShape,

    #[arg(long)]
    force_crop: bool,

    /// Produce the 100x100 emoji variant
    #[arg(long)]
    emoji: bool,

    /// Bitrate in kbps for clips of 3s or less
    #[arg(long)]
    bitrate: Option<u32>,

    /// Duration ceiling in seconds
    #[arg(long)]
    max_duration: Option<u32>,

    /// Opaque value echoed back in the result
    #[arg(long)]
    tag: Option<String>,
}

impl SourceArgs {
    fn into_job(self) -> Result<Job> {
        let input = match (self.url, self.file, self.path) {
            (Some(url), None, None) => JobInput::Url { url },
            (None, Some(file), None) => {
                let bytes = std::fs::read(&file)
                    .with_context(|| format!("Failed to read source file: {}", file.display()))?;
                JobInput::Inline { data: STANDARD.encode(bytes) }
            }
            (None, None, Some(path)) => {
                // The worker may run from another directory
                let path = std::fs::canonicalize(&path)
                    .with_context(|| format!("Source file not found: {}", path.display()))?;
                JobInput::Path { path }
            }
            _ => bail!("Exactly one of --url, --file or --path is required"),
        };

        let mut job = Job::new(input)
            .with_shape(self.shape)
            .with_force_crop(self.force_crop)
            .with_emoji(self.emoji);
        job.bitrate = self.bitrate;
        job.max_duration = self.max_duration;
        job.tag = self.tag;
        Ok(job)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // RUST_LOG wins; --verbose only changes the default
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = ConverterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    cfg.apply_env_overrides();

    match args.command {
        Command::Run => run(cfg).await,
        Command::Submit(source) => submit(&cfg, source).await,
        Command::Convert { source, output } => convert(cfg, source, output).await,
        Command::Status { id } => status(&cfg, &id).await,
    }
}

async fn run(cfg: ConverterConfig) -> Result<()> {
    info!("Sticker worker starting");
    info!("Configuration loaded:");
    info!("  Workers: {}", cfg.worker_count());
    info!("  Default bitrate: {}k", cfg.default_bitrate);
    info!("  Default max duration: {}s", cfg.default_max_duration);
    info!("  ffmpeg: {}", cfg.ffmpeg_bin.display());
    info!("  ffprobe: {}", cfg.ffprobe_bin.display());
    info!("  Temp dir: {}", cfg.temp_dir.display());
    info!("  Job state dir: {}", cfg.job_state_dir.display());
    info!("  Assets dir: {}", cfg.assets_dir.display());

    let store = Arc::new(JobStore::new(&cfg.job_state_dir));
    store.init().await?;
    let converter = Arc::new(Converter::new(cfg.clone()).context("Failed to initialize converter")?);

    info!("🔄 Starting recovery checks...");
    let recovered_count = store
        .recover_interrupted(converter.host())
        .await
        .context("Failed to recover interrupted jobs on startup")?;
    let cleaned_count = cleanup_orphaned_temp_files(&cfg.temp_dir, cfg.stale_after())
        .await
        .context("Failed to cleanup orphaned temp files on startup")?;
    if recovered_count > 0 || cleaned_count > 0 {
        info!(
            "✅ Startup recovery complete: {} job(s) marked failed, {} temp file(s) cleaned",
            recovered_count, cleaned_count
        );
    } else {
        info!("✅ Startup recovery complete: no interrupted jobs or orphaned files found");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = tokio::spawn(run_workers(converter, store, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("🛑 Shutdown requested, finishing in-flight jobs...");
    shutdown_tx.send(true).ok();

    pool.await.context("Worker pool task failed")??;
    Ok(())
}

async fn submit(cfg: &ConverterConfig, source: SourceArgs) -> Result<()> {
    let job = source.into_job()?;
    let store = JobStore::new(&cfg.job_state_dir);
    store.init().await?;
    let record = store.enqueue(job).await?;
    println!("{}", record.job.id);
    Ok(())
}

async fn convert(cfg: ConverterConfig, source: SourceArgs, output: PathBuf) -> Result<()> {
    let job = source.into_job()?;
    let converter = Converter::new(cfg).context("Failed to initialize converter")?;

    let result = match converter.process(&job).await {
        Ok(result) => result,
        Err(failure) => bail!("Conversion failed: {}", failure),
    };

    let bytes = STANDARD
        .decode(result.content.as_bytes())
        .context("Converter returned invalid base64 content")?;
    tokio::fs::write(&output, &bytes)
        .await
        .with_context(|| format!("Failed to write sticker: {}", output.display()))?;
    info!("Wrote {} ({} bytes)", output.display(), bytes.len());

    println!("{}", serde_json::to_string_pretty(&result.metadata)?);
    Ok(())
}

async fn status(cfg: &ConverterConfig, id: &str) -> Result<()> {
    let store = JobStore::new(&cfg.job_state_dir);
    let Some(mut record) = store.get(id).await? else {
        bail!("No job with id {}", id);
    };

    // The sticker itself is not useful on a terminal
    if let Some(output) = record.output.as_mut() {
        output.content = format!("<{} base64 chars>", output.content.len());
    }
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

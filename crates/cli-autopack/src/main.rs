use anyhow::{anyhow, Context, Result};
use autopack::{
    config::AutopackConfig,
    ffmpeg::Toolchain,
    progress::{ProgressEvent, ProgressSink, Stage},
    run_job, scan,
};
use clap::{Parser, Subcommand};
use humansize::{format_size, DECIMAL};
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Pack a video into a multi-rendition DASH bundle with subtitles, fonts and a fallback encode
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
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one pack job
    Pack {
        /// Source video
        input: PathBuf,
        /// Job id, also the job directory name (default: random UUID)
        #[arg(short, long)]
        job: Option<String>,
        /// Base directory for job directories
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Probe a source and print the stream selection and ladder as JSON
    Plan {
        /// Source video
        input: PathBuf,
    },
    /// Pack every media file under a directory, one job at a time
    Batch {
        /// Library root
        root: PathBuf,
        /// Base directory for job directories
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Check that ffmpeg, ffprobe and the packager are usable
    Check,
}

/// Log each item's progress every 10%
fn spawn_progress_logger(job: String) -> (ProgressSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let handle = tokio::spawn(async move {
        let mut reported: HashMap<(Stage, String), u32> = HashMap::new();
        while let Some(event) = rx.recv().await {
            if event.total <= 0.0 {
                continue;
            }
            let percent = ((event.elapsed / event.total) * 100.0).clamp(0.0, 100.0) as u32;
            let step = percent / 10 * 10;
            let key = (event.stage, event.item.clone());
            if reported.get(&key).map_or(true, |&last| step > last) {
                reported.insert(key, step);
                info!("Job {}: {:?} {} {}%", job, event.stage, event.item, step);
            }
        }
    });
    (tx, handle)
}

async fn pack_one(cfg: &AutopackConfig, input: PathBuf, job_id: String) -> autopack::Result<()> {
    let (sink, logger) = spawn_progress_logger(job_id.clone());
    let result = run_job(cfg.clone(), input, job_id, Some(sink)).await;
    // every sender is gone once the job returns
    let _ = logger.await;
    result.map(|_| ())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger - use RUST_LOG env var or default to info level
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = AutopackConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Commands::Pack { input, job, dir } => {
            if let Some(dir) = dir {
                cfg.work_dir = dir;
            }
            let job_id = job.unwrap_or_else(|| Uuid::new_v4().to_string());
            info!("Work directory: {}", cfg.work_dir.display());
            pack_one(&cfg, input, job_id.clone())
                .await
                .with_context(|| format!("Job {} failed", job_id))?;
            info!("K THX BYE");
        }
        Commands::Plan { input } => {
            let plan = autopack::plan(&cfg, &input)
                .await
                .with_context(|| format!("Failed to plan {}", input.display()))?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Batch { root, dir } => {
            if let Some(dir) = dir {
                cfg.work_dir = dir;
            }
            let files = scan::scan_library(&root)?;
            let total: u64 = files.iter().map(|f| f.size).sum();
            info!(
                "Batch: {} file(s), {} under {}",
                files.len(),
                format_size(total, DECIMAL),
                root.display()
            );

            let mut failed = Vec::new();
            for (i, file) in files.iter().enumerate() {
                info!(
                    "Batch [{}/{}]: {} ({}) as job {}",
                    i + 1,
                    files.len(),
                    file.path.display(),
                    format_size(file.size, DECIMAL),
                    file.job_id
                );
                if let Err(e) = pack_one(&cfg, file.path.clone(), file.job_id.clone()).await {
                    error!("❌ Job {} failed: {}", file.job_id, e);
                    failed.push(file.job_id.clone());
                }
            }

            info!(
                "Batch summary: {} succeeded, {} failed",
                files.len() - failed.len(),
                failed.len()
            );
            if !failed.is_empty() {
                return Err(anyhow!("{} job(s) failed: {}", failed.len(), failed.join(", ")));
            }
        }
        Commands::Check => {
            let tools = Toolchain::from_config(&cfg);
            let report = tools
                .check(&cfg.encoders)
                .await
                .context("Toolchain check failed")?;
            let v = &report.ffmpeg_version;
            info!("FFmpeg {}.{}.{}", v.major, v.minor, v.patch);
            if !report.missing_encoders.is_empty() {
                warn!("Missing encoders: {}", report.missing_encoders.join(", "));
                return Err(anyhow!(
                    "FFmpeg lacks required encoders: {}",
                    report.missing_encoders.join(", ")
                ));
            }
            info!("✅ Toolchain ready");
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use archival_montage::builder::{BuildRequest, BuildServices, CompilationBuilder, download_progress};
use archival_montage::config::BuildConfig;
use archival_montage::manifest::AssetManifest;
use archival_montage::narration::load_narration;
use archival_montage::progress::ProgressReporter;
use archival_montage::shot_plan::guardrail::TopicAnchorGuardrail;
use archival_montage::shot_plan::{compile, load_validated_plan, validate, write_plan_document};
use archival_montage::{init, lock};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "archival-montage", version, about = "Narration-driven archival footage montage builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile narration (and an optional raw scene plan) into a shot plan document
    Compile {
        /// Narration JSON: `[{block_id, text}]` or `{"blocks": [...]}`
        #[arg(short, long)]
        narration: PathBuf,
        /// Raw scene plan from the creative step; malformed input is repaired
        #[arg(short, long)]
        scene_plan: Option<PathBuf>,
        /// Where to write the shot plan document
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = 150)]
        words_per_minute: u32,
    },
    /// Check a shot plan document against its narration
    Validate {
        #[arg(short, long)]
        plan: PathBuf,
        #[arg(short, long)]
        narration: PathBuf,
    },
    /// Build the final video from a validated plan and resolved assets
    Build {
        /// Build name; output is `<output_dir>/<name>.mp4`
        #[arg(long)]
        name: String,
        #[arg(short, long)]
        plan: PathBuf,
        #[arg(short, long)]
        narration: PathBuf,
        /// Resolved-asset manifest JSON
        #[arg(short, long)]
        manifest: PathBuf,
        /// Directory of `<block_id>.{wav,mp3,m4a}` voice-over files
        #[arg(short, long)]
        audio_dir: Option<PathBuf>,
        /// Build config JSON (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Compile {
            narration,
            scene_plan,
            output,
            words_per_minute,
        } => run_compile(narration, scene_plan, output, words_per_minute).await?,
        Commands::Validate { plan, narration } => run_validate(plan, narration).await?,
        Commands::Build {
            name,
            plan,
            narration,
            manifest,
            audio_dir,
            config,
        } => run_build(name, plan, narration, manifest, audio_dir, config).await?,
    };
    std::process::exit(code);
}

async fn run_compile(
    narration: PathBuf,
    scene_plan: Option<PathBuf>,
    output: PathBuf,
    words_per_minute: u32,
) -> Result<i32> {
    let blocks = load_narration(&narration).await?;
    let raw = match &scene_plan {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read scene plan: {}", path.display()))?;
            // Unparsable creative output is treated like a missing plan.
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!("scene plan is not JSON ({}); synthesizing", err);
                    None
                }
            }
        }
        None => None,
    };

    let compiled = compile(&blocks, raw.as_ref(), words_per_minute, &TopicAnchorGuardrail)?;
    for warning in &compiled.warnings {
        tracing::warn!("{}", warning);
    }
    write_plan_document(&output, &compiled.plan)?;
    println!(
        "{} scenes, {}s -> {}",
        compiled.plan.total_scenes,
        compiled.plan.total_duration_sec,
        output.display()
    );
    Ok(0)
}

async fn run_validate(plan: PathBuf, narration: PathBuf) -> Result<i32> {
    let blocks = load_narration(&narration).await?;
    let text = tokio::fs::read_to_string(&plan)
        .await
        .with_context(|| format!("Failed to read plan: {}", plan.display()))?;
    let document: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse plan: {}", plan.display()))?;

    match validate(&document, &blocks) {
        Ok(valid) => {
            println!("OK: {} scenes", valid.plan().scenes.len());
            Ok(0)
        }
        Err(err) => {
            println!("{}: {}", err.code(), err);
            Ok(2)
        }
    }
}

async fn run_build(
    name: String,
    plan: PathBuf,
    narration: PathBuf,
    manifest: PathBuf,
    audio_dir: Option<PathBuf>,
    config: Option<PathBuf>,
) -> Result<i32> {
    let cfg = match &config {
        Some(path) => BuildConfig::load(path).await?,
        None => BuildConfig::default(),
    };
    init::ensure_directories(&cfg).await?;
    if !init::check_media_tools().await {
        anyhow::bail!("ffmpeg and ffprobe must be installed and on PATH");
    }

    let blocks = load_narration(&narration).await?;
    let plan = load_validated_plan(&plan, &blocks)?;
    let manifest = AssetManifest::load(&manifest).await?;

    let guard = lock::acquire(&cfg.work_dir, cfg.lock_stale())?;
    let progress = ProgressReporter::logging();
    let services = BuildServices::system(&cfg, Some(download_progress(progress.handle())))?;
    let builder = CompilationBuilder::new(cfg, services);

    let cancel = builder.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping at the next beat");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let result = builder
        .run(
            &guard,
            BuildRequest {
                name: &name,
                plan: &plan,
                blocks: &blocks,
                manifest: &manifest,
                audio_dir: audio_dir.as_deref(),
            },
            &progress,
        )
        .await;
    progress.finish();

    match result {
        Ok(output) => {
            println!("{}", output.video.display());
            if let Some(report) = output.report_path {
                println!("{}", report.display());
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("{}: {}", err.code(), err);
            for beat in err.beat_failures() {
                for attempt in &beat.attempts {
                    eprintln!("  {} {}: {}", beat.block_id, attempt.asset_id, attempt.reason);
                }
            }
            Ok(1)
        }
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use autoreel::automation::{AutomationEngine, EngineOptions, RunRequest};
use autoreel::config;
use autoreel::model::{Breakdown, ContentType, VideoFormat};
use autoreel::service::GenerationClient;
use autoreel::store::ProjectStore;
use clap::Parser;
use tracing::{info, warn};

/// Run the whole pipeline once and print the final video URL.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Script text file
    #[arg(long, required_unless_present = "breakdown")]
    script: Option<PathBuf>,

    /// Prepared breakdown JSON; skips remote script parsing
    #[arg(long)]
    breakdown: Option<PathBuf>,

    /// Channel (niche) id
    #[arg(long)]
    channel: String,

    #[arg(long, default_value = "short")]
    format: VideoFormat,

    #[arg(long, default_value = "story")]
    content_type: ContentType,

    /// Title used when the breakdown has none
    #[arg(long, default_value = "")]
    title: String,

    /// Ask the stitcher to upload the finished video
    #[arg(long)]
    auto_upload: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let script = match &args.script {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading script {}", path.display()))?,
        None => String::new(),
    };
    let breakdown = match &args.breakdown {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading breakdown {}", path.display()))?;
            Some(Breakdown::from_json(&raw).context("parsing breakdown")?)
        }
        None => None,
    };
    if script.trim().is_empty() && breakdown.is_none() {
        bail!("script is empty");
    }

    let client = GenerationClient::from_config(&cfg)?;
    let engine = Arc::new(AutomationEngine::new(
        Arc::new(client),
        ProjectStore::new(),
        EngineOptions::from_config(&cfg),
    ));

    let interrupt = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            interrupt.cancel();
        }
    });

    let title = if args.title.is_empty() {
        args.script
            .as_ref()
            .or(args.breakdown.as_ref())
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        args.title.clone()
    };

    let req = RunRequest {
        script,
        channel_id: args.channel,
        title,
        format: args.format,
        content_type: args.content_type,
        auto_upload: args.auto_upload,
        breakdown,
    };

    match engine.run(req).await? {
        Some(url) => {
            println!("{url}");
            Ok(())
        }
        None => {
            info!("run cancelled");
            print!("{}", engine.snapshot());
            Ok(())
        }
    }
}

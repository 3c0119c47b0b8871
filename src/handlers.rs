//! Console commands for the daemon. Every line read counts as a key event
//! for the activity monitor, commands or not.
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{ActivityKind, ActivityMonitor};
use crate::automation::{AutomationEngine, RunRequest};
use crate::model::{ContentType, ProductionRequest, QueueStatus, VideoFormat};
use crate::queue::WorkQueue;

pub const DEFAULT_CHANNEL: &str = "default";

pub const HELP: &str = "\
Commands:
  /add <name> <script-file> [channel] [short|long] [story|documentary]
  /run <script-file> [channel] [short|long] [story|documentary]
  /queue
  /remove <id>
  /status
  /cancel
  /retry <scene> <channel> [short|long]
  /help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArgs {
    pub script_file: String,
    pub channel_id: String,
    pub format: VideoFormat,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { name: String, job: JobArgs },
    Run(JobArgs),
    Queue,
    Remove(Uuid),
    Status,
    Cancel,
    Retry {
        scene: usize,
        channel_id: String,
        format: VideoFormat,
    },
    Help,
}

fn job_args<'a>(mut words: impl Iterator<Item = &'a str>, usage: &str) -> Result<JobArgs, String> {
    let script_file = words.next().ok_or_else(|| usage.to_string())?.to_string();
    let channel_id = words.next().unwrap_or(DEFAULT_CHANNEL).to_string();
    let format = words.next().map(str::parse).transpose()?.unwrap_or_default();
    let content_type = words.next().map(str::parse).transpose()?.unwrap_or_default();
    Ok(JobArgs {
        script_file,
        channel_id,
        format,
        content_type,
    })
}

/// Parse one console line. Non-command text is rejected with a hint.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty input".into());
    };
    match head {
        "/add" => {
            let name = words
                .next()
                .ok_or("usage: /add <name> <script-file> [channel] [format] [type]")?
                .to_string();
            let job = job_args(words, "usage: /add <name> <script-file> [channel] [format] [type]")?;
            Ok(Command::Add { name, job })
        }
        "/run" => Ok(Command::Run(job_args(
            words,
            "usage: /run <script-file> [channel] [format] [type]",
        )?)),
        "/queue" => Ok(Command::Queue),
        "/remove" => {
            let raw = words.next().ok_or("usage: /remove <id>")?;
            let id = Uuid::parse_str(raw).map_err(|_| format!("invalid id '{raw}'"))?;
            Ok(Command::Remove(id))
        }
        "/status" => Ok(Command::Status),
        "/cancel" => Ok(Command::Cancel),
        "/retry" => {
            let usage = "usage: /retry <scene> <channel> [short|long]";
            let scene = words
                .next()
                .ok_or(usage)?
                .parse::<usize>()
                .map_err(|_| usage.to_string())?;
            let channel_id = words.next().ok_or(usage)?.to_string();
            let format = words.next().map(str::parse).transpose()?.unwrap_or_default();
            Ok(Command::Retry {
                scene,
                channel_id,
                format,
            })
        }
        "/help" => Ok(Command::Help),
        other if other.starts_with('/') => Err(format!("unknown command {other}; try /help")),
        _ => Err("commands start with '/'; try /help".into()),
    }
}

/// Shared handles the console acts on.
#[derive(Clone)]
pub struct Console {
    pub engine: Arc<AutomationEngine>,
    pub monitor: Arc<ActivityMonitor>,
    pub queue: WorkQueue,
}

#[instrument(skip_all)]
pub async fn handle_line(console: &Console, line: &str) -> Result<String> {
    console.monitor.record(ActivityKind::Key);
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let command = match parse_command(trimmed) {
        Ok(c) => c,
        Err(msg) => return Ok(msg),
    };

    match command {
        Command::Add { name, job } => {
            let script = read_script(&job.script_file).await?;
            let req = ProductionRequest::new(
                name,
                job.channel_id,
                job.format,
                job.content_type,
                script,
            );
            let item = console.queue.enqueue(&req).await?;
            Ok(format!("Queued {} as {}", item.request.name, item.request.id))
        }
        Command::Run(job) => {
            if console.engine.is_running() {
                return Ok("An automation run is already in progress.".into());
            }
            let script = read_script(&job.script_file).await?;
            let title = std::path::Path::new(&job.script_file)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let req = RunRequest {
                script,
                channel_id: job.channel_id,
                title,
                format: job.format,
                content_type: job.content_type,
                auto_upload: false,
                breakdown: None,
            };
            let engine = Arc::clone(&console.engine);
            tokio::spawn(async move {
                match engine.run(req).await {
                    Ok(Some(url)) => info!(%url, "run finished"),
                    Ok(None) => info!("run cancelled"),
                    Err(err) => error!(error = %err, "run failed"),
                }
            });
            Ok("Run started; /status to follow it.".into())
        }
        Command::Queue => {
            let items = console.queue.list().await?;
            if items.is_empty() {
                return Ok("Queue is empty.".into());
            }
            let mut out = String::new();
            for item in items {
                let _ = write!(
                    out,
                    "{} [{}] {} ({}, {})",
                    item.request.id,
                    item.status,
                    item.request.name,
                    item.request.channel_id,
                    item.request.format.as_str()
                );
                if item.status == QueueStatus::Error {
                    if let Some(err) = &item.error {
                        let _ = write!(out, ": {err}");
                    }
                }
                out.push('\n');
            }
            Ok(out.trim_end().to_string())
        }
        Command::Remove(id) => match console.queue.remove(id).await {
            Ok(()) => Ok(format!("Removed {id}")),
            Err(err) => Ok(err.to_string()),
        },
        Command::Status => {
            let run = console.engine.snapshot();
            let store = console.engine.store();
            let mut out = format!(
                "running: {}, idle: {} ({}s since input)\n",
                console.engine.is_running(),
                console.monitor.is_idle(),
                console.monitor.elapsed_secs()
            );
            let _ = write!(out, "{run}");
            let total = store.scene_count();
            if total > 0 {
                let _ = write!(out, "scenes: {}/{} valid", store.valid_scene_count(), total);
            }
            if let Some(url) = store.final_video_url() {
                let _ = write!(out, "\nfinal video: {url}");
            }
            Ok(out.trim_end().to_string())
        }
        Command::Cancel => {
            if console.engine.cancel() {
                Ok("Cancelling the active run.".into())
            } else {
                Ok("Nothing is running.".into())
            }
        }
        Command::Retry {
            scene,
            channel_id,
            format,
        } => {
            if scene >= console.engine.store().scene_count() {
                return Ok(format!("scene {scene} does not exist"));
            }
            let engine = Arc::clone(&console.engine);
            tokio::spawn(async move {
                match engine.regenerate_scene_video(scene, &channel_id, format).await {
                    Ok(Some(url)) => info!(scene, %url, "scene video regenerated"),
                    Ok(None) => info!(scene, "scene regeneration cancelled"),
                    Err(err) => warn!(scene, error = %err, "scene regeneration failed"),
                }
            });
            Ok(format!("Regenerating video for scene {scene}."))
        }
        Command::Help => Ok(HELP.to_string()),
    }
}

async fn read_script(path: &str) -> Result<String> {
    let script = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading script {path}"))?;
    if script.trim().is_empty() {
        return Err(anyhow!("script {path} is empty"));
    }
    Ok(script)
}

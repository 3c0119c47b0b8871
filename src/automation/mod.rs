//! The automation engine: drives one production through script breakdown,
//! character art, scene art, scene video, mood analysis and the final stitch.
//!
//! Exactly one run (or manual scene regeneration) may be active per engine.
//! Every remote call, chunk read and retry delay races the run's
//! cancellation token; a cancelled run returns `Ok(None)`.
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::model::{Breakdown, ContentType, ProductionRequest, VideoFormat, VideoValidity};
use crate::ndjson::NdjsonDecoder;
use crate::retry::RetryPolicy;
use crate::service::model::{
    BreakdownRequest, CharacterImage, CharacterImagesRequest, CharacterPrompt, MoodRequest,
    Notification, SceneImagesRequest, ScenePrompt, StitchRequest, StreamLine,
};
use crate::service::{ByteStream, GenerationService, ServiceError};
use crate::store::ProjectStore;

pub mod ledger;
mod video;

pub use ledger::{AutomationRun, Step, StepStatus, STEP_NAMES};
pub use video::{RepairReport, VideoOutcome};

use ledger::{
    ANALYZE_MOOD, CHARACTER_IMAGES, EXTRACT_CHARACTERS, PARSE_SCRIPT, SCENE_IMAGES, SCENE_VIDEOS,
    STITCH,
};
use video::{guarded, pause, verify_and_repair, VideoFanout, VideoWorker};

/// Mood sent to the stitcher when analysis is unavailable.
pub const FALLBACK_MOOD: &str = "auto";

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("an automation run is already in progress")]
    AlreadyRunning,

    #[error("{step} failed: {source}")]
    Service {
        step: &'static str,
        #[source]
        source: ServiceError,
    },

    #[error("script breakdown produced no scenes")]
    NoScenes,

    /// Too few valid videos after the repair pass.
    #[error("{missing} of {total} scene videos are missing or invalid after repair")]
    Shortfall { missing: usize, total: usize },

    #[error("scene {0} does not exist")]
    SceneNotFound(usize),

    #[error("scene {0} has no image to animate")]
    MissingImage(usize),

    #[error("scene {index} video could not be generated after {attempts} attempts")]
    VideoUnavailable { index: usize, attempts: u32 },

    #[error("scene {0} video failed verification")]
    InvalidVideo(usize),
}

impl AutomationError {
    fn service(step: usize, source: ServiceError) -> Self {
        AutomationError::Service {
            step: STEP_NAMES[step],
            source,
        }
    }
}

/// Why the pipeline stopped early.
enum Halt {
    Cancelled,
    Failed(AutomationError),
}

impl From<AutomationError> for Halt {
    fn from(err: AutomationError) -> Self {
        Halt::Failed(err)
    }
}

/// Arguments of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub script: String,
    pub channel_id: String,
    pub title: String,
    pub format: VideoFormat,
    pub content_type: ContentType,
    pub auto_upload: bool,
    /// Caller-parsed breakdown; skips the remote breakdown call.
    pub breakdown: Option<Breakdown>,
}

impl From<&ProductionRequest> for RunRequest {
    fn from(req: &ProductionRequest) -> Self {
        Self {
            script: req.script.clone(),
            channel_id: req.channel_id.clone(),
            title: req.name.clone(),
            format: req.format,
            content_type: req.content_type,
            auto_upload: req.auto_upload(),
            breakdown: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub retry: RetryPolicy,
    pub max_concurrent_videos: usize,
    pub call_timeout: Duration,
    pub prepared_breakdown_delay: Duration,
    pub notify: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent_videos: 4,
            call_timeout: Duration::from_secs(900),
            prepared_breakdown_delay: Duration::from_millis(300),
            notify: true,
        }
    }
}

impl EngineOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            retry: cfg.automation.retry_policy(),
            max_concurrent_videos: cfg.automation.max_concurrent_videos,
            call_timeout: cfg.request_timeout(),
            prepared_breakdown_delay: Duration::from_millis(
                cfg.automation.prepared_breakdown_delay_ms,
            ),
            notify: cfg.automation.notify,
        }
    }
}

/// Clears the running flag however the run ends, including when its future is dropped.
struct RunningGuard<'a> {
    running: &'a watch::Sender<bool>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.send_replace(false);
    }
}

pub struct AutomationEngine {
    service: Arc<dyn GenerationService>,
    store: ProjectStore,
    options: EngineOptions,
    ledger: watch::Sender<AutomationRun>,
    running: watch::Sender<bool>,
    cancel: Mutex<CancellationToken>,
}

impl AutomationEngine {
    pub fn new(
        service: Arc<dyn GenerationService>,
        store: ProjectStore,
        options: EngineOptions,
    ) -> Self {
        let (ledger, _) = watch::channel(AutomationRun::default());
        let (running, _) = watch::channel(false);
        Self {
            service,
            store,
            options,
            ledger,
            running,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    pub fn snapshot(&self) -> AutomationRun {
        self.ledger.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AutomationRun> {
        self.ledger.subscribe()
    }

    /// Ask the active run to stop at its next suspension point.
    /// Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        let token = self.cancel.lock();
        if !self.is_running() {
            return false;
        }
        info!("cancelling automation run");
        token.cancel();
        self.ledger.send_modify(|run| {
            run.cancelled = true;
            run.current_action = "Cancelling...".into();
        });
        true
    }

    /// Clear the ledger. Refused while a run is active.
    pub fn reset(&self) -> Result<(), AutomationError> {
        let _slot = self.cancel.lock();
        if self.is_running() {
            return Err(AutomationError::AlreadyRunning);
        }
        self.ledger.send_replace(AutomationRun::default());
        Ok(())
    }

    fn acquire(&self) -> Result<(RunningGuard<'_>, CancellationToken), AutomationError> {
        let mut slot = self.cancel.lock();
        let acquired = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        if !acquired {
            return Err(AutomationError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        *slot = token.clone();
        Ok((
            RunningGuard {
                running: &self.running,
            },
            token,
        ))
    }

    /// Run the whole pipeline. `Ok(Some(url))` on success, `Ok(None)` if
    /// cancelled, `Err` on a fatal failure (recorded on the failing step).
    #[instrument(skip_all, fields(title = %req.title, channel = %req.channel_id))]
    pub async fn run(&self, req: RunRequest) -> Result<Option<String>, AutomationError> {
        let (_guard, token) = self.acquire()?;
        self.ledger.send_replace(AutomationRun::default());
        info!("automation run started");

        match self.pipeline(&req, &token).await {
            Ok(url) => {
                self.narrate(format!("Done: {url}"));
                info!(%url, "automation run finished");
                Ok(Some(url))
            }
            Err(Halt::Cancelled) => {
                self.ledger.send_modify(|run| {
                    run.cancelled = true;
                    run.current_action = "Cancelled".into();
                });
                info!("automation run cancelled");
                Ok(None)
            }
            Err(Halt::Failed(err)) => {
                let message = err.to_string();
                self.ledger.send_modify(|run| {
                    let current = run.current;
                    run.fail(current, message.clone());
                    run.current_action = format!("Failed: {message}");
                });
                error!(error = %message, "automation run failed");
                let project_name = self.project_name(&req);
                self.notify(
                    &token,
                    Notification::Failure {
                        project_name,
                        error_message: message,
                    },
                )
                .await;
                Err(err)
            }
        }
    }

    async fn pipeline(&self, req: &RunRequest, token: &CancellationToken) -> Result<String, Halt> {
        self.checkpoint(token)?;
        self.parse_script(req, token).await?;

        self.checkpoint(token)?;
        self.begin(EXTRACT_CHARACTERS);
        let count = self.store.character_count();
        self.narrate(format!("Found {count} characters"));
        self.finish(EXTRACT_CHARACTERS);

        self.checkpoint(token)?;
        let character_images = self.character_images(req, token).await?;

        self.checkpoint(token)?;
        let video_urls = self.scenes(req, token, &character_images).await?;

        self.checkpoint(token)?;
        let mood = self.analyze_mood(req, token).await?;

        self.checkpoint(token)?;
        self.stitch(req, token, video_urls, mood).await
    }

    fn checkpoint(&self, token: &CancellationToken) -> Result<(), Halt> {
        if token.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        Ok(())
    }

    fn begin(&self, step: usize) {
        info!(step = STEP_NAMES[step], "step started");
        self.ledger.send_modify(|run| run.start(step));
    }

    fn finish(&self, step: usize) {
        debug!(step = STEP_NAMES[step], "step done");
        self.ledger.send_modify(|run| run.finish(step));
    }

    fn narrate(&self, action: impl Into<String>) {
        let action = action.into();
        info!(action = %action, "automation");
        self.ledger.send_modify(|run| run.current_action = action);
    }

    fn project_name(&self, req: &RunRequest) -> String {
        let title = self.store.title();
        if title.trim().is_empty() {
            req.title.clone()
        } else {
            title
        }
    }

    async fn parse_script(&self, req: &RunRequest, token: &CancellationToken) -> Result<(), Halt> {
        self.begin(PARSE_SCRIPT);
        let mut breakdown = match &req.breakdown {
            Some(prepared) => {
                self.narrate("Using prepared breakdown");
                if !pause(token, self.options.prepared_breakdown_delay).await {
                    return Err(Halt::Cancelled);
                }
                prepared.clone()
            }
            None => {
                self.narrate("Breaking down script");
                let body = BreakdownRequest {
                    story_narrative: &req.script,
                    niche_id: &req.channel_id,
                    video_length: req.format.as_str(),
                    video_type: req.content_type.as_str(),
                };
                let Some(result) = guarded(
                    token,
                    self.options.call_timeout,
                    self.service.generate_breakdown(&body),
                )
                .await
                else {
                    return Err(Halt::Cancelled);
                };
                result.map_err(|e| AutomationError::service(PARSE_SCRIPT, e))?
            }
        };
        if breakdown.scenes.is_empty() {
            return Err(AutomationError::NoScenes.into());
        }
        if breakdown.title.trim().is_empty() {
            breakdown.title = req.title.clone();
        }
        self.store.load_breakdown(&breakdown);
        self.narrate(format!(
            "Script parsed into {} scenes and {} characters",
            breakdown.scenes.len(),
            breakdown.characters.len()
        ));
        self.finish(PARSE_SCRIPT);
        Ok(())
    }

    /// Read an NDJSON stream to the end, handing each line to `on_line`.
    /// The token is checked before every chunk read.
    async fn consume_stream(
        &self,
        step: usize,
        token: &CancellationToken,
        mut stream: ByteStream,
        mut on_line: impl FnMut(StreamLine),
    ) -> Result<(), Halt> {
        let deadline = self.options.call_timeout;
        let mut decoder = NdjsonDecoder::new();
        loop {
            self.checkpoint(token)?;
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Halt::Cancelled),
                next = tokio::time::timeout(deadline, stream.next()) => next,
            };
            match next {
                Err(_) => {
                    return Err(AutomationError::service(step, ServiceError::Timeout(deadline)).into())
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => return Err(AutomationError::service(step, err).into()),
                Ok(Some(Ok(chunk))) => {
                    for line in decoder.push::<StreamLine>(&chunk) {
                        on_line(line);
                    }
                }
            }
        }
        if let Some(line) = decoder.finish::<StreamLine>() {
            on_line(line);
        }
        Ok(())
    }

    async fn character_images(
        &self,
        req: &RunRequest,
        token: &CancellationToken,
    ) -> Result<Vec<CharacterImage>, Halt> {
        self.begin(CHARACTER_IMAGES);
        let characters = self.store.characters();
        let mut accepted: Vec<CharacterImage> = characters
            .iter()
            .filter(|c| c.locked)
            .filter_map(|c| {
                c.image_url.as_ref().map(|url| CharacterImage {
                    name: c.name.clone(),
                    image_url: url.clone(),
                })
            })
            .collect();
        let prompts: Vec<CharacterPrompt> = characters
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.locked)
            .map(|(index, c)| CharacterPrompt {
                index,
                name: c.name.clone(),
                prompt: c.prompt.clone(),
            })
            .collect();

        if prompts.is_empty() {
            info!("no characters to render; skipping character images");
            self.narrate("No characters to render");
            self.finish(CHARACTER_IMAGES);
            return Ok(accepted);
        }

        self.narrate(format!("Generating {} character images", prompts.len()));
        let body = CharacterImagesRequest {
            niche_id: &req.channel_id,
            characters: prompts,
            video_type: req.content_type.as_str(),
        };
        let Some(opened) = guarded(
            token,
            self.options.call_timeout,
            self.service.character_images_stream(&body),
        )
        .await
        else {
            return Err(Halt::Cancelled);
        };
        let stream = opened.map_err(|e| AutomationError::service(CHARACTER_IMAGES, e))?;

        let store = &self.store;
        self.consume_stream(CHARACTER_IMAGES, token, stream, |line| match line {
            StreamLine::Image { index, image_url } => {
                if image_url.trim().is_empty() {
                    warn!(character = index, "empty character image URL; skipping");
                    return;
                }
                let mut name = None;
                let known = store.update_character(index, |c| {
                    c.image_url = Some(image_url.clone());
                    c.locked = true;
                    name = Some(c.name.clone());
                });
                match (known, name) {
                    (true, Some(name)) => {
                        info!(character = index, %name, "character image ready");
                        accepted.push(CharacterImage { name, image_url });
                    }
                    _ => warn!(character = index, "image for unknown character index"),
                }
            }
            StreamLine::Error { error, index } => {
                warn!(character = ?index, %error, "character image failed; continuing");
            }
            StreamLine::Thumbnail { .. } => debug!("ignoring thumbnail line in character stream"),
        })
        .await?;

        self.narrate(format!("{} character images ready", accepted.len()));
        self.finish(CHARACTER_IMAGES);
        Ok(accepted)
    }

    fn video_worker(&self, req: &RunRequest, token: &CancellationToken) -> VideoWorker {
        VideoWorker {
            service: self.service.clone(),
            store: self.store.clone(),
            token: token.clone(),
            limiter: Arc::new(Semaphore::new(self.options.max_concurrent_videos.max(1))),
            policy: self.options.retry,
            deadline: self.options.call_timeout,
            niche_id: req.channel_id.clone(),
            is_shorts: req.format.is_shorts(),
        }
    }

    /// Scene images and scene videos, pipelined: each scene's video task is
    /// launched as soon as its image arrives while the stream keeps draining.
    async fn scenes(
        &self,
        req: &RunRequest,
        token: &CancellationToken,
        character_images: &[CharacterImage],
    ) -> Result<Vec<String>, Halt> {
        self.begin(SCENE_IMAGES);
        let prompts: Vec<ScenePrompt> = self
            .store
            .scenes()
            .into_iter()
            .map(|s| ScenePrompt {
                index: s.index,
                prompt: s.image_prompt,
            })
            .collect();
        let total = prompts.len();
        self.narrate(format!("Generating {total} scene images"));

        let thumbnail_prompt = self.store.thumbnail_prompt();
        let body = SceneImagesRequest {
            niche_id: &req.channel_id,
            scenes: prompts,
            character_images,
            video_type: req.content_type.as_str(),
            thumbnail_prompt: thumbnail_prompt.as_deref(),
        };
        let Some(opened) = guarded(
            token,
            self.options.call_timeout,
            self.service.scene_images_stream(&body),
        )
        .await
        else {
            return Err(Halt::Cancelled);
        };
        let stream = opened.map_err(|e| AutomationError::service(SCENE_IMAGES, e))?;

        let worker = self.video_worker(req, token);
        let mut fanout = VideoFanout::new(worker.clone());
        let store = &self.store;
        self.consume_stream(SCENE_IMAGES, token, stream, |line| match line {
            StreamLine::Thumbnail { image_url, .. } => {
                info!(%image_url, "thumbnail ready");
                store.set_thumbnail_url(image_url);
            }
            StreamLine::Image { index, image_url } => {
                if image_url.trim().is_empty() {
                    warn!(scene = index, "empty scene image URL; no video launched");
                    return;
                }
                let known = store.update_scene(index, |s| {
                    s.image_url = Some(image_url.clone());
                    s.video_url = None;
                    s.validity = VideoValidity::Unknown;
                });
                if known {
                    debug!(scene = index, "scene image ready; launching video");
                    fanout.launch(index);
                } else {
                    warn!(scene = index, "image for unknown scene index");
                }
            }
            StreamLine::Error { error, index } => {
                warn!(scene = ?index, %error, "scene image failed; continuing");
            }
        })
        .await?;
        self.finish(SCENE_IMAGES);

        self.begin(SCENE_VIDEOS);
        self.narrate(format!("Waiting for {} scene videos", fanout.len()));
        let Some(outcomes) = fanout.join().await else {
            return Err(Halt::Cancelled);
        };
        let ready = outcomes
            .values()
            .filter(|o| matches!(o, VideoOutcome::Ready(_)))
            .count();
        info!(ready, total, "fan-out finished; verifying scene videos");

        let Some(report) = verify_and_repair(&worker, |action| self.narrate(action)).await else {
            return Err(Halt::Cancelled);
        };
        if report.video_urls.len() < total {
            return Err(AutomationError::Shortfall {
                missing: total - report.video_urls.len(),
                total,
            }
            .into());
        }
        self.narrate(format!(
            "All {total} scene videos verified ({} repaired)",
            report.repaired.len()
        ));
        self.finish(SCENE_VIDEOS);
        Ok(report.video_urls)
    }

    /// Best-effort: any failure falls back to [`FALLBACK_MOOD`].
    async fn analyze_mood(&self, req: &RunRequest, token: &CancellationToken) -> Result<String, Halt> {
        self.begin(ANALYZE_MOOD);
        self.narrate("Analyzing mood");
        let text = self
            .store
            .scenes()
            .iter()
            .map(|s| match &s.dialogue {
                Some(d) if !d.trim().is_empty() => format!("{} {}", s.video_prompt, d),
                _ => s.video_prompt.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        let title = self.project_name(req);
        let body = MoodRequest {
            script: &text,
            title: &title,
            niche: &req.channel_id,
        };
        let Some(result) = guarded(
            token,
            self.options.call_timeout,
            self.service.analyze_mood(&body),
        )
        .await
        else {
            return Err(Halt::Cancelled);
        };
        let mood = match result {
            Ok(mood) if !mood.trim().is_empty() => mood.trim().to_string(),
            Ok(_) => FALLBACK_MOOD.to_string(),
            Err(err) => {
                warn!(?err, "mood analysis failed; using fallback");
                FALLBACK_MOOD.to_string()
            }
        };
        self.narrate(format!("Mood: {mood}"));
        self.finish(ANALYZE_MOOD);
        Ok(mood)
    }

    async fn stitch(
        &self,
        req: &RunRequest,
        token: &CancellationToken,
        video_urls: Vec<String>,
        mood: String,
    ) -> Result<String, Halt> {
        self.begin(STITCH);
        self.narrate(format!("Stitching {} scenes", video_urls.len()));
        let title = self.project_name(req);
        let body = StitchRequest {
            video_urls,
            niche_id: req.channel_id.clone(),
            title: title.clone(),
            music: mood,
            is_shorts: req.format.is_shorts(),
            script: req.script.clone(),
            auto_upload: req.auto_upload,
            thumbnail_url: self.store.thumbnail_url(),
        };
        let Some(result) = guarded(token, self.options.call_timeout, self.service.stitch(&body))
            .await
        else {
            return Err(Halt::Cancelled);
        };
        let url = result.map_err(|e| AutomationError::service(STITCH, e))?;
        let url = url.trim().to_string();
        if url.is_empty() {
            return Err(
                AutomationError::service(STITCH, ServiceError::EmptyArtifact("final video URL"))
                    .into(),
            );
        }
        self.store.set_final_video_url(url.clone());
        self.finish(STITCH);

        self.notify(
            token,
            Notification::Success {
                project_name: title,
                video_url: url.clone(),
            },
        )
        .await;
        Ok(url)
    }

    /// Fire-and-forget; failures are logged and swallowed.
    async fn notify(&self, token: &CancellationToken, notification: Notification) {
        if !self.options.notify {
            return;
        }
        match guarded(
            token,
            self.options.call_timeout,
            self.service.notify(&notification),
        )
        .await
        {
            Some(Ok(())) => debug!("notification sent"),
            Some(Err(err)) => warn!(?err, "notification failed"),
            None => debug!("notification skipped; run cancelled"),
        }
    }

    /// Regenerate one scene's video outside a run (manual retry), using the
    /// same retry policy as the fan-out, then verify it.
    /// `Ok(None)` if cancelled.
    #[instrument(skip(self, format))]
    pub async fn regenerate_scene_video(
        &self,
        index: usize,
        channel_id: &str,
        format: VideoFormat,
    ) -> Result<Option<String>, AutomationError> {
        let (_guard, token) = self.acquire()?;
        let scene = self
            .store
            .scene(index)
            .ok_or(AutomationError::SceneNotFound(index))?;
        if scene.image_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Err(AutomationError::MissingImage(index));
        }

        let req = RunRequest {
            script: String::new(),
            channel_id: channel_id.to_string(),
            title: self.store.title(),
            format,
            content_type: ContentType::default(),
            auto_upload: false,
            breakdown: None,
        };
        let worker = self.video_worker(&req, &token);
        let url = match worker.generate_with_retry(index).await {
            VideoOutcome::Ready(url) => url,
            VideoOutcome::Cancelled => return Ok(None),
            VideoOutcome::Exhausted => {
                return Err(AutomationError::VideoUnavailable {
                    index,
                    attempts: self.options.retry.max_attempts,
                })
            }
        };
        let Some(verified) = worker.verify(&url).await else {
            return Ok(None);
        };
        let valid = verified.unwrap_or_else(|err| {
            warn!(?err, "verification call failed");
            false
        });
        self.store.update_scene(index, |s| {
            s.validity = if valid {
                VideoValidity::Valid
            } else {
                VideoValidity::Invalid
            }
        });
        if valid {
            Ok(Some(url))
        } else {
            Err(AutomationError::InvalidVideo(index))
        }
    }
}

//! Per-scene video generation: bounded fan-out while the image stream is
//! still draining, the join barrier, and the verification/repair pass.
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::model::{Scene, VideoValidity};
use crate::retry::RetryPolicy;
use crate::service::model::VideoRequest;
use crate::service::{GenerationService, ServiceError};
use crate::store::ProjectStore;

/// Race a remote call against cancellation and a deadline.
/// `None` means the token fired; the call future is dropped, which aborts it.
pub(crate) async fn guarded<T, F>(
    token: &CancellationToken,
    deadline: Duration,
    call: F,
) -> Option<Result<T, ServiceError>>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        res = tokio::time::timeout(deadline, call) => {
            Some(res.unwrap_or_else(|_| Err(ServiceError::Timeout(deadline))))
        }
    }
}

/// Sleep unless cancelled first; `false` means cancelled.
pub(crate) async fn pause(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoOutcome {
    Ready(String),
    Exhausted,
    Cancelled,
}

/// Everything a detached video task needs; cheap to clone into `tokio::spawn`.
#[derive(Clone)]
pub(crate) struct VideoWorker {
    pub service: Arc<dyn GenerationService>,
    pub store: ProjectStore,
    pub token: CancellationToken,
    pub limiter: Arc<Semaphore>,
    pub policy: RetryPolicy,
    pub deadline: Duration,
    pub niche_id: String,
    pub is_shorts: bool,
}

impl VideoWorker {
    fn request_for(&self, scene: &Scene) -> Option<VideoRequest> {
        let image_url = scene.image_url.as_deref().filter(|u| !u.trim().is_empty())?;
        Some(VideoRequest {
            scene_index: scene.index,
            image_url: image_url.to_string(),
            prompt: scene.video_prompt.clone(),
            dialogue: scene.dialogue.clone().unwrap_or_default(),
            camera_angle: scene.camera_angle.clone().unwrap_or_default(),
            niche_id: self.niche_id.clone(),
            is_shorts: self.is_shorts,
            sound_effect: (!scene.sound_effects.is_empty())
                .then(|| scene.sound_effects.join(", ")),
            emotion: scene.emotion.clone(),
        })
    }

    /// One generation call for the scene as it currently stands in the store.
    /// An empty URL in a 2xx response is reported as a soft failure.
    pub async fn generate_once(&self, index: usize) -> Option<Result<String, ServiceError>> {
        let Some(request) = self.store.scene(index).and_then(|s| self.request_for(&s)) else {
            return Some(Err(ServiceError::EmptyArtifact("scene image URL")));
        };

        let _permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return None,
            permit = self.limiter.clone().acquire_owned() => permit.ok()?,
        };

        let result = guarded(
            &self.token,
            self.deadline,
            self.service.generate_video(&request),
        )
        .await?;
        Some(result.and_then(|resp| {
            let url = resp.video_url.trim().to_string();
            if url.is_empty() {
                Err(ServiceError::EmptyArtifact("video URL"))
            } else {
                Ok(url)
            }
        }))
    }

    /// Up to `policy.max_attempts` calls; a success is written to the store.
    #[instrument(skip(self))]
    pub async fn generate_with_retry(&self, index: usize) -> VideoOutcome {
        for attempt in 1..=self.policy.max_attempts {
            if self.token.is_cancelled() {
                return VideoOutcome::Cancelled;
            }
            match self.generate_once(index).await {
                None => return VideoOutcome::Cancelled,
                Some(Ok(url)) => {
                    self.store.update_scene(index, |s| {
                        s.video_url = Some(url.clone());
                        s.validity = VideoValidity::Unknown;
                    });
                    info!(attempt, %url, "scene video generated");
                    return VideoOutcome::Ready(url);
                }
                Some(Err(err)) => {
                    warn!(?err, attempt, "scene video attempt failed");
                    if self.policy.should_retry(attempt)
                        && !pause(&self.token, self.policy.delay_after(attempt)).await
                    {
                        return VideoOutcome::Cancelled;
                    }
                }
            }
        }
        warn!(
            attempts = self.policy.max_attempts,
            "scene video still missing; leaving it to the repair pass"
        );
        VideoOutcome::Exhausted
    }

    pub async fn verify(&self, url: &str) -> Option<Result<bool, ServiceError>> {
        guarded(&self.token, self.deadline, self.service.verify_video(url)).await
    }
}

/// Index-keyed set of detached video tasks.
pub(crate) struct VideoFanout {
    worker: VideoWorker,
    tasks: BTreeMap<usize, JoinHandle<VideoOutcome>>,
}

impl VideoFanout {
    pub fn new(worker: VideoWorker) -> Self {
        Self {
            worker,
            tasks: BTreeMap::new(),
        }
    }

    /// Start generating the video for `index` without waiting on it. A second
    /// image for the same scene supersedes the task started for the first.
    pub fn launch(&mut self, index: usize) {
        let worker = self.worker.clone();
        let handle = tokio::spawn(async move { worker.generate_with_retry(index).await });
        if let Some(previous) = self.tasks.insert(index, handle) {
            debug!(scene = index, "superseding earlier video task");
            previous.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Join barrier: wait for every launched task. `None` if cancelled first.
    pub async fn join(mut self) -> Option<BTreeMap<usize, VideoOutcome>> {
        let tasks = std::mem::take(&mut self.tasks);
        let (indices, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let results = tokio::select! {
            biased;
            _ = self.worker.token.cancelled() => {
                aborts.iter().for_each(|a| a.abort());
                return None;
            }
            results = join_all(handles) => results,
        };
        let outcomes = indices
            .into_iter()
            .zip(results)
            .map(|(index, res)| match res {
                Ok(outcome) => (index, outcome),
                Err(err) => {
                    warn!(scene = index, ?err, "video task did not complete");
                    (index, VideoOutcome::Exhausted)
                }
            })
            .collect();
        Some(outcomes)
    }
}

impl Drop for VideoFanout {
    fn drop(&mut self) {
        for handle in self.tasks.values() {
            handle.abort();
        }
    }
}

/// Result of the verification/repair sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Verified URLs in scene order.
    pub video_urls: Vec<String>,
    pub repaired: Vec<usize>,
    pub missing: Vec<usize>,
}

/// Verify every scene in index order; a scene without a URL, or whose URL
/// fails verification, gets exactly one regeneration and one re-verification.
/// Scene state is re-read from the store on every iteration.
/// `None` if cancelled.
#[instrument(skip_all)]
pub(crate) async fn verify_and_repair(
    worker: &VideoWorker,
    mut narrate: impl FnMut(String),
) -> Option<RepairReport> {
    let mut report = RepairReport::default();
    let total = worker.store.scene_count();

    for index in 0..total {
        if worker.token.is_cancelled() {
            return None;
        }
        let Some(scene) = worker.store.scene(index) else {
            report.missing.push(index);
            continue;
        };

        if let Some(url) = scene.video_url.filter(|u| !u.trim().is_empty()) {
            narrate(format!("Verifying scene {} video", index + 1));
            let valid = match worker.verify(&url).await? {
                Ok(valid) => valid,
                Err(err) => {
                    warn!(scene = index, ?err, "verification call failed");
                    false
                }
            };
            if valid {
                worker
                    .store
                    .update_scene(index, |s| s.validity = VideoValidity::Valid);
                report.video_urls.push(url);
                continue;
            }
            worker
                .store
                .update_scene(index, |s| s.validity = VideoValidity::Invalid);
        }

        narrate(format!("Repairing scene {} video", index + 1));
        match worker.generate_once(index).await? {
            Ok(url) => {
                let valid = match worker.verify(&url).await? {
                    Ok(valid) => valid,
                    Err(err) => {
                        warn!(scene = index, ?err, "re-verification call failed");
                        false
                    }
                };
                worker.store.update_scene(index, |s| {
                    s.video_url = Some(url.clone());
                    s.validity = if valid {
                        VideoValidity::Valid
                    } else {
                        VideoValidity::Invalid
                    };
                });
                if valid {
                    info!(scene = index, "scene video repaired");
                    report.repaired.push(index);
                    report.video_urls.push(url);
                } else {
                    warn!(scene = index, "repaired video failed verification");
                    report.missing.push(index);
                }
            }
            Err(err) => {
                warn!(scene = index, ?err, "repair attempt failed");
                report.missing.push(index);
            }
        }
    }

    Some(report)
}

#![allow(dead_code)]

use async_trait::async_trait;
use autoreel::automation::{AutomationEngine, EngineOptions};
use autoreel::model::{Breakdown, CharacterSpec, SceneSpec};
use autoreel::retry::{Backoff, RetryPolicy};
use autoreel::service::model::{
    BreakdownRequest, CharacterImage, CharacterImagesRequest, MoodRequest, Notification,
    SceneImagesRequest, StitchRequest, VideoRequest, VideoResponse,
};
use autoreel::service::{ByteStream, GenerationService, ServiceError};
use autoreel::store::ProjectStore;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Breakdown,
    CharacterImages(usize),
    SceneImages {
        scenes: usize,
        characters: Vec<CharacterImage>,
    },
    Video { scene: usize, attempt: u32 },
    Verify(String),
    Mood,
    Stitch(StitchRequest),
    Notify(Notification),
}

/// Scripted behavior of the fake service.
#[derive(Debug, Clone)]
pub struct Script {
    pub breakdown: Breakdown,
    /// Breakdown call never returns; only cancellation ends it.
    pub hang_breakdown: bool,
    /// Characters whose image line is replaced by an error line.
    pub character_image_errors: HashSet<usize>,
    /// Scenes whose image line is replaced by an error line.
    pub scene_image_errors: HashSet<usize>,
    /// Number of leading failures per scene's video calls.
    pub video_failures: HashMap<usize, u32>,
    /// URLs that fail verification.
    pub invalid_urls: HashSet<String>,
    pub mood: Result<String, u16>,
    pub stitch: Result<String, u16>,
    /// Size of the byte chunks NDJSON streams are cut into.
    pub chunk_size: usize,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            breakdown: breakdown(2, 3),
            hang_breakdown: false,
            character_image_errors: HashSet::new(),
            scene_image_errors: HashSet::new(),
            video_failures: HashMap::new(),
            invalid_urls: HashSet::new(),
            mood: Ok("calm piano".into()),
            stitch: Ok("https://cdn.test/final.mp4".into()),
            chunk_size: 7,
        }
    }
}

pub fn breakdown(characters: usize, scenes: usize) -> Breakdown {
    Breakdown {
        title: "The Lighthouse".into(),
        characters: (0..characters)
            .map(|i| CharacterSpec {
                name: format!("char-{i}"),
                prompt: format!("portrait of character {i}"),
            })
            .collect(),
        scenes: (0..scenes)
            .map(|i| SceneSpec {
                image_prompt: format!("scene {i} still"),
                video_prompt: format!("scene {i} motion"),
                dialogue: Some(format!("line {i}")),
                ..Default::default()
            })
            .collect(),
        thumbnail_prompt: Some("lighthouse at dusk".into()),
    }
}

pub fn video_url(scene: usize, attempt: u32) -> String {
    format!("https://cdn.test/video/{scene}/{attempt}.mp4")
}

#[derive(Clone, Default)]
pub struct RecordingService {
    script: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Vec<Call>>>,
    video_attempts: Arc<Mutex<HashMap<usize, u32>>>,
}

impl RecordingService {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            ..Default::default()
        }
    }

    pub async fn update(&self, f: impl FnOnce(&mut Script)) {
        f(&mut *self.script.lock().await);
    }

    pub async fn breakdown_calls(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| matches!(c, Call::Breakdown))
            .count()
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn video_calls(&self, scene: usize) -> u32 {
        self.video_attempts
            .lock()
            .await
            .get(&scene)
            .copied()
            .unwrap_or(0)
    }

    pub async fn stitch_request(&self) -> Option<StitchRequest> {
        self.calls.lock().await.iter().find_map(|c| match c {
            Call::Stitch(req) => Some(req.clone()),
            _ => None,
        })
    }

    /// Character images sent with the scene image request.
    pub async fn scene_character_images(&self) -> Option<Vec<CharacterImage>> {
        self.calls.lock().await.iter().find_map(|c| match c {
            Call::SceneImages { characters, .. } => Some(characters.clone()),
            _ => None,
        })
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                Call::Notify(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    async fn record(&self, call: Call) {
        self.calls.lock().await.push(call);
    }

    async fn stream(&self, lines: Vec<String>) -> ByteStream {
        let chunk_size = self.script.lock().await.chunk_size.max(1);
        let body = lines.join("\n").into_bytes();
        let chunks: Vec<Result<Bytes, ServiceError>> = body
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks).boxed()
    }
}

fn api_error(status: u16) -> ServiceError {
    ServiceError::Api {
        status,
        body: "scripted failure".into(),
    }
}

#[async_trait]
impl GenerationService for RecordingService {
    async fn generate_breakdown(
        &self,
        _req: &BreakdownRequest<'_>,
    ) -> Result<Breakdown, ServiceError> {
        self.record(Call::Breakdown).await;
        let script = self.script.lock().await.clone();
        if script.hang_breakdown {
            std::future::pending::<()>().await;
        }
        Ok(script.breakdown)
    }

    async fn character_images_stream(
        &self,
        req: &CharacterImagesRequest<'_>,
    ) -> Result<ByteStream, ServiceError> {
        self.record(Call::CharacterImages(req.characters.len())).await;
        let errors = self.script.lock().await.character_image_errors.clone();
        let lines = req
            .characters
            .iter()
            .map(|c| {
                if errors.contains(&c.index) {
                    format!(r#"{{"error":"nsfw filter","index":{}}}"#, c.index)
                } else {
                    format!(
                        r#"{{"index":{},"imageUrl":"https://cdn.test/char/{}.png"}}"#,
                        c.index, c.index
                    )
                }
            })
            .collect();
        Ok(self.stream(lines).await)
    }

    async fn scene_images_stream(
        &self,
        req: &SceneImagesRequest<'_>,
    ) -> Result<ByteStream, ServiceError> {
        self.record(Call::SceneImages {
            scenes: req.scenes.len(),
            characters: req.character_images.to_vec(),
        })
        .await;
        let errors = self.script.lock().await.scene_image_errors.clone();
        let mut lines = vec![
            r#"{"type":"thumbnail","imageUrl":"https://cdn.test/thumb.png"}"#.to_string(),
            String::new(),
        ];
        // Reverse order: the stream is not sorted by index.
        for scene in req.scenes.iter().rev() {
            if errors.contains(&scene.index) {
                lines.push(format!(
                    r#"{{"error":"render failed","index":{}}}"#,
                    scene.index
                ));
            } else {
                lines.push(format!(
                    r#"{{"index":{},"imageUrl":"https://cdn.test/scene/{}.png"}}"#,
                    scene.index, scene.index
                ));
            }
        }
        Ok(self.stream(lines).await)
    }

    async fn generate_video(&self, req: &VideoRequest) -> Result<VideoResponse, ServiceError> {
        let attempt = {
            let mut attempts = self.video_attempts.lock().await;
            let n = attempts.entry(req.scene_index).or_insert(0);
            *n += 1;
            *n
        };
        self.record(Call::Video {
            scene: req.scene_index,
            attempt,
        })
        .await;
        let failures = self
            .script
            .lock()
            .await
            .video_failures
            .get(&req.scene_index)
            .copied()
            .unwrap_or(0);
        if attempt <= failures {
            return Err(api_error(503));
        }
        Ok(VideoResponse {
            video_url: video_url(req.scene_index, attempt),
            formatted_prompt: None,
        })
    }

    async fn verify_video(&self, video_url: &str) -> Result<bool, ServiceError> {
        self.record(Call::Verify(video_url.to_string())).await;
        Ok(!self.script.lock().await.invalid_urls.contains(video_url))
    }

    async fn analyze_mood(&self, _req: &MoodRequest<'_>) -> Result<String, ServiceError> {
        self.record(Call::Mood).await;
        self.script.lock().await.mood.clone().map_err(api_error)
    }

    async fn stitch(&self, req: &StitchRequest) -> Result<String, ServiceError> {
        self.record(Call::Stitch(req.clone())).await;
        self.script.lock().await.stitch.clone().map_err(api_error)
    }

    async fn notify(&self, notification: &Notification) -> Result<(), ServiceError> {
        self.record(Call::Notify(notification.clone())).await;
        Ok(())
    }
}

pub fn fast_options() -> EngineOptions {
    EngineOptions {
        retry: RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
            backoff: Backoff::Fixed,
        },
        max_concurrent_videos: 2,
        call_timeout: Duration::from_secs(10),
        prepared_breakdown_delay: Duration::from_millis(1),
        notify: true,
    }
}

pub fn engine(service: &RecordingService) -> Arc<AutomationEngine> {
    engine_with(service, fast_options())
}

pub fn engine_with(service: &RecordingService, options: EngineOptions) -> Arc<AutomationEngine> {
    Arc::new(AutomationEngine::new(
        Arc::new(service.clone()),
        ProjectStore::new(),
        options,
    ))
}

/// Poll until `cond` holds, failing the test after two seconds.
pub async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

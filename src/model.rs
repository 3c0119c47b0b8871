use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    #[default]
    Short,
    Long,
}

impl VideoFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoFormat::Short => "short",
            VideoFormat::Long => "long",
        }
    }

    pub fn is_shorts(&self) -> bool {
        matches!(self, VideoFormat::Short)
    }
}

impl FromStr for VideoFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" | "shorts" => Ok(VideoFormat::Short),
            "long" => Ok(VideoFormat::Long),
            other => Err(format!("unknown video format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Story,
    Documentary,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Story => "story",
            ContentType::Documentary => "documentary",
        }
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "story" => Ok(ContentType::Story),
            "documentary" => Ok(ContentType::Documentary),
            other => Err(format!("unknown content type '{other}'")),
        }
    }
}

/// Destination a finished video may be uploaded to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Tiktok,
    Instagram,
}

/// One unit of queueable work. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductionRequest {
    pub id: Uuid,
    pub name: String,
    pub channel_id: String,
    pub format: VideoFormat,
    pub content_type: ContentType,
    pub script: String,
    pub platforms: Vec<Platform>,
    pub created_at: DateTime<Utc>,
}

impl ProductionRequest {
    pub fn new(
        name: impl Into<String>,
        channel_id: impl Into<String>,
        format: VideoFormat,
        content_type: ContentType,
        script: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            channel_id: channel_id.into(),
            format,
            content_type,
            script: script.into(),
            platforms: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_platforms(mut self, platforms: Vec<Platform>) -> Self {
        self.platforms = platforms;
        self
    }

    /// Auto-upload is requested whenever at least one destination is set.
    pub fn auto_upload(&self) -> bool {
        !self.platforms.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Processing,
    Done,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(QueueStatus::Queued),
            "processing" => Some(QueueStatus::Processing),
            "done" => Some(QueueStatus::Done),
            "error" => Some(QueueStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    pub request: ProductionRequest,
    pub status: QueueStatus,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoValidity {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Character {
    pub name: String,
    pub prompt: String,
    pub image_url: Option<String>,
    /// Set once the image is accepted as canonical; locked characters are not regenerated.
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Scene {
    /// Stable 0-based position assigned at breakdown time.
    pub index: usize,
    pub image_prompt: String,
    pub video_prompt: String,
    pub dialogue: Option<String>,
    pub camera_angle: Option<String>,
    pub emotion: Option<String>,
    pub sound_effects: Vec<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub validity: VideoValidity,
}

impl Scene {
    pub fn has_video(&self) -> bool {
        self.video_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    pub fn is_complete(&self) -> bool {
        self.has_video() && self.validity == VideoValidity::Valid
    }
}

/// Character entry of a script breakdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CharacterSpec {
    pub name: String,
    pub prompt: String,
}

/// Scene entry of a script breakdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SceneSpec {
    #[serde(alias = "prompt", alias = "text_to_image_prompt")]
    pub image_prompt: String,
    #[serde(default, alias = "motion_prompt", alias = "image_to_video_prompt")]
    pub video_prompt: String,
    #[serde(default)]
    pub dialogue: Option<String>,
    #[serde(default, alias = "camera_movement")]
    pub camera_angle: Option<String>,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default, alias = "sfx")]
    pub sound_effects: Vec<String>,
}

/// Structured output of script parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Breakdown {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub characters: Vec<CharacterSpec>,
    #[serde(default)]
    pub scenes: Vec<SceneSpec>,
    #[serde(default)]
    pub thumbnail_prompt: Option<String>,
}

impl Breakdown {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakdown_accepts_prompt_aliases() {
        let raw = r#"{
            "title": "Lighthouse",
            "characters": [{"name": "Ada", "prompt": "old keeper"}],
            "scenes": [
                {"prompt": "a lighthouse at dusk", "motion_prompt": "slow pan",
                 "camera_movement": "dolly in", "sfx": ["waves"]},
                {"image_prompt": "storm", "dialogue": "Hold on!"}
            ]
        }"#;
        let b = Breakdown::from_json(raw).unwrap();
        assert_eq!(b.characters.len(), 1);
        assert_eq!(b.scenes[0].image_prompt, "a lighthouse at dusk");
        assert_eq!(b.scenes[0].video_prompt, "slow pan");
        assert_eq!(b.scenes[0].camera_angle.as_deref(), Some("dolly in"));
        assert_eq!(b.scenes[0].sound_effects, vec!["waves".to_string()]);
        assert_eq!(b.scenes[1].dialogue.as_deref(), Some("Hold on!"));
        assert!(b.thumbnail_prompt.is_none());
    }

    #[test]
    fn format_and_content_type_parse() {
        assert_eq!("Shorts".parse::<VideoFormat>().unwrap(), VideoFormat::Short);
        assert_eq!("long".parse::<VideoFormat>().unwrap(), VideoFormat::Long);
        assert!("medium".parse::<VideoFormat>().is_err());
        assert_eq!(
            "documentary".parse::<ContentType>().unwrap(),
            ContentType::Documentary
        );
    }

    #[test]
    fn queue_status_round_trips_through_str() {
        for s in [
            QueueStatus::Queued,
            QueueStatus::Processing,
            QueueStatus::Done,
            QueueStatus::Error,
        ] {
            assert_eq!(QueueStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(QueueStatus::parse("paused"), None);
    }

    #[test]
    fn scene_completion_requires_valid_url() {
        let mut scene = Scene {
            video_url: Some("".into()),
            validity: VideoValidity::Valid,
            ..Default::default()
        };
        assert!(!scene.is_complete());
        scene.video_url = Some("https://cdn/v.mp4".into());
        assert!(scene.is_complete());
        scene.validity = VideoValidity::Invalid;
        assert!(!scene.is_complete());
    }
}

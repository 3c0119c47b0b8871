//! Request and response payloads of the remote generation service.
use serde::{Deserialize, Serialize};

use crate::model::Breakdown;

#[derive(Debug, Clone, Serialize)]
pub struct BreakdownRequest<'a> {
    pub story_narrative: &'a str,
    pub niche_id: &'a str,
    pub video_length: &'a str,
    pub video_type: &'a str,
}

pub type BreakdownResponse = Breakdown;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CharacterPrompt {
    pub index: usize,
    pub name: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CharacterImagesRequest<'a> {
    pub niche_id: &'a str,
    pub characters: Vec<CharacterPrompt>,
    pub video_type: &'a str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScenePrompt {
    pub index: usize,
    pub prompt: String,
}

/// Accepted character image carried into scene generation for consistency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CharacterImage {
    pub name: String,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SceneImagesRequest<'a> {
    pub niche_id: &'a str,
    pub scenes: Vec<ScenePrompt>,
    pub character_images: &'a [CharacterImage],
    pub video_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_prompt: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VideoRequest {
    pub scene_index: usize,
    pub image_url: String,
    pub prompt: String,
    pub dialogue: String,
    pub camera_angle: String,
    pub niche_id: String,
    pub is_shorts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_effect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoResponse {
    #[serde(rename = "videoUrl", alias = "video_url", default)]
    pub video_url: String,
    #[serde(rename = "formattedPrompt", alias = "formatted_prompt", default)]
    pub formatted_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyRequest<'a> {
    pub video_url: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoodRequest<'a> {
    pub script: &'a str,
    pub title: &'a str,
    pub niche: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoodResponse {
    pub mood: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StitchRequest {
    pub video_urls: Vec<String>,
    pub niche_id: String,
    pub title: String,
    pub music: String,
    pub is_shorts: bool,
    pub script: String,
    pub auto_upload: bool,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StitchResponse {
    pub final_video_url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Notification {
    Success {
        project_name: String,
        video_url: String,
    },
    Failure {
        project_name: String,
        error_message: String,
    },
}

/// Marker for the `"type": "thumbnail"` stream line.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailTag {
    Thumbnail,
}

/// One line of an image-generation NDJSON stream.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StreamLine {
    Thumbnail {
        #[serde(rename = "type")]
        kind: ThumbnailTag,
        #[serde(rename = "imageUrl", alias = "image_url")]
        image_url: String,
    },
    Image {
        index: usize,
        #[serde(rename = "imageUrl", alias = "image_url")]
        image_url: String,
    },
    Error {
        error: String,
        #[serde(default)]
        index: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_lines_decode_each_shape() {
        let image: StreamLine =
            serde_json::from_value(json!({"index": 2, "imageUrl": "u2"})).unwrap();
        assert_eq!(
            image,
            StreamLine::Image {
                index: 2,
                image_url: "u2".into()
            }
        );

        let thumb: StreamLine =
            serde_json::from_value(json!({"type": "thumbnail", "imageUrl": "t"})).unwrap();
        assert!(matches!(thumb, StreamLine::Thumbnail { .. }));

        let err: StreamLine = serde_json::from_value(json!({"error": "boom"})).unwrap();
        assert_eq!(
            err,
            StreamLine::Error {
                error: "boom".into(),
                index: None
            }
        );
    }

    #[test]
    fn notification_is_tagged_by_type() {
        let body = serde_json::to_value(Notification::Failure {
            project_name: "p".into(),
            error_message: "stitch failed".into(),
        })
        .unwrap();
        assert_eq!(body["type"], "failure");
        assert_eq!(body["error_message"], "stitch failed");
    }

    #[test]
    fn video_response_tolerates_missing_url() {
        let resp: VideoResponse = serde_json::from_value(json!({})).unwrap();
        assert!(resp.video_url.is_empty());
    }
}

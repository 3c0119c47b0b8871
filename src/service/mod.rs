use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::Breakdown;

pub mod model;

use model::{
    BreakdownRequest, CharacterImagesRequest, MoodRequest, MoodResponse, Notification,
    SceneImagesRequest, StitchRequest, StitchResponse, VerifyRequest, VerifyResponse,
    VideoRequest, VideoResponse,
};

/// Raw body chunks of a streamed response.
pub type ByteStream = BoxStream<'static, Result<Bytes, ServiceError>>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The HTTP request itself failed (network, DNS, TLS, body read).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-2xx status code.
    #[error("generation service error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("invalid response JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("call exceeded its {0:?} deadline")]
    Timeout(Duration),

    /// A 2xx response that carried no usable artifact.
    #[error("service returned an empty {0}")]
    EmptyArtifact(&'static str),

    #[error("invalid service URL: {0}")]
    InvalidUrl(String),
}

/// The remote generation service as seen by the automation engine.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate_breakdown(&self, req: &BreakdownRequest<'_>)
        -> Result<Breakdown, ServiceError>;

    /// NDJSON stream of `{index, imageUrl}` / `{error}` lines.
    async fn character_images_stream(
        &self,
        req: &CharacterImagesRequest<'_>,
    ) -> Result<ByteStream, ServiceError>;

    /// NDJSON stream of `{index, imageUrl}` / `{type:"thumbnail", imageUrl}` / `{error}` lines.
    async fn scene_images_stream(
        &self,
        req: &SceneImagesRequest<'_>,
    ) -> Result<ByteStream, ServiceError>;

    async fn generate_video(&self, req: &VideoRequest) -> Result<VideoResponse, ServiceError>;

    async fn verify_video(&self, video_url: &str) -> Result<bool, ServiceError>;

    async fn analyze_mood(&self, req: &MoodRequest<'_>) -> Result<String, ServiceError>;

    /// Returns the final video URL.
    async fn stitch(&self, req: &StitchRequest) -> Result<String, ServiceError>;

    async fn notify(&self, notification: &Notification) -> Result<(), ServiceError>;
}

/// reqwest-backed client for the generation service HTTP API.
#[derive(Clone)]
pub struct GenerationClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl fmt::Debug for GenerationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GenerationClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .user_agent("autoreel/0.1")
            .connect_timeout(Duration::from_secs(30))
            .no_proxy()
            .build()?;
        Self::with_client(http, base_url, api_key)
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling, custom TLS).
    pub fn with_client(
        http: Client,
        base_url: &str,
        api_key: Option<String>,
    ) -> Result<Self, ServiceError> {
        // `Url::join` drops the last path segment unless the base ends with '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url =
            Url::parse(&normalized).map_err(|e| ServiceError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ServiceError> {
        Self::new(&cfg.service.base_url, cfg.service.api_key.clone())
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        self.base_url
            .join(path)
            .map_err(|e| ServiceError::InvalidUrl(e.to_string()))
    }

    pub fn build_request<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Request, ServiceError> {
        let mut builder = self
            .http
            .post(self.endpoint(path)?)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        Ok(builder.build()?)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, ServiceError> {
        let request = self.build_request(path, body)?;
        debug!(url = %request.url(), "generation service request");
        let response = self.http.execute(request).await?;
        debug!(path, status = %response.status(), "generation service response");
        Self::ensure_success(response).await
    }

    async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ServiceError> {
        let response = self.send(path, body).await?;
        let raw = response.bytes().await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn post_stream<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ByteStream, ServiceError> {
        let response = self.send(path, body).await?;
        Ok(response.bytes_stream().map_err(ServiceError::from).boxed())
    }

    async fn ensure_success(response: Response) -> Result<Response, ServiceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            warn!(%status, %body, "generation service returned an error");
            return Err(ServiceError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationService for GenerationClient {
    async fn generate_breakdown(
        &self,
        req: &BreakdownRequest<'_>,
    ) -> Result<Breakdown, ServiceError> {
        self.post_json("scripts/generate-breakdown", req).await
    }

    async fn character_images_stream(
        &self,
        req: &CharacterImagesRequest<'_>,
    ) -> Result<ByteStream, ServiceError> {
        self.post_stream("characters/generate-images-stream", req)
            .await
    }

    async fn scene_images_stream(
        &self,
        req: &SceneImagesRequest<'_>,
    ) -> Result<ByteStream, ServiceError> {
        self.post_stream("scenes/generate-images-stream", req).await
    }

    async fn generate_video(&self, req: &VideoRequest) -> Result<VideoResponse, ServiceError> {
        self.post_json("scenes/generate-video", req).await
    }

    async fn verify_video(&self, video_url: &str) -> Result<bool, ServiceError> {
        let resp: VerifyResponse = self
            .post_json("videos/verify", &VerifyRequest { video_url })
            .await?;
        Ok(resp.valid)
    }

    async fn analyze_mood(&self, req: &MoodRequest<'_>) -> Result<String, ServiceError> {
        let resp: MoodResponse = self.post_json("scripts/analyze-mood", req).await?;
        Ok(resp.mood)
    }

    async fn stitch(&self, req: &StitchRequest) -> Result<String, ServiceError> {
        let resp: StitchResponse = self.post_json("videos/stitch", req).await?;
        Ok(resp.final_video_url)
    }

    async fn notify(&self, notification: &Notification) -> Result<(), ServiceError> {
        self.send("notifications/email", notification).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_without_trailing_slash_keeps_prefix() {
        let client = GenerationClient::new("http://svc.local/api", None).unwrap();
        let url = client.endpoint("videos/verify").unwrap();
        assert_eq!(url.as_str(), "http://svc.local/api/videos/verify");
    }

    #[test]
    fn build_request_sets_headers() {
        let client =
            GenerationClient::new("http://svc.local/api/", Some("secret".into())).unwrap();
        let request = client
            .build_request("videos/stitch", &serde_json::json!({ "sample": true }))
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/api/videos/stitch");
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer secret"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn blank_api_key_sends_no_auth() {
        let client = GenerationClient::new("http://svc.local/", Some("  ".into())).unwrap();
        let request = client.build_request("x", &serde_json::json!({})).unwrap();
        assert!(request.headers().get("Authorization").is_none());
    }
}

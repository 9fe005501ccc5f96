use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use engine::{ArtifactKind, AudioMetadata, VideoMetadata, Voice, AUDIO_META_PATH, VIDEO_META_PATH};

use super::{
    accepted, BlockAudioRequest, BlockVideoRequest, GenerationBackend, GenerationResponse,
    ProjectDetail, ProjectRequest, VoicesResponse,
};
use crate::error::{PipelineError, Result};

/// Cache-busting token for static reads and probes.
pub fn cache_bust_token() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

/// Generation service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| PipelineError::transport(base_url, e))?;
        if base.cannot_be_a_base() {
            return Err(PipelineError::transport(base_url, "URL cannot be used as a base"));
        }
        Ok(HttpBackend {
            client: reqwest::Client::new(),
            base,
            request_timeout,
        })
    }

    fn url_with(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // checked in `new`
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// `{base}/static/{project}/media/{relative}`
    fn static_url(&self, project: &str, relative: &str) -> Url {
        let mut segments = vec!["static", project, "media"];
        segments.extend(relative.split('/').filter(|s| !s.is_empty()));
        self.url_with(&segments)
    }

    async fn get_json<T>(&self, endpoint: &str, url: Url) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| PipelineError::transport(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::rejection(endpoint, format!("{} - {}", status, error_text)));
        }
        response
            .json()
            .await
            .map_err(|e| PipelineError::transport(endpoint, e))
    }

    /// POST a generation request. No client timeout: generation may take minutes.
    async fn post_generation<B>(&self, endpoint: &str, body: &B) -> Result<GenerationResponse>
    where
        B: Serialize + ?Sized,
    {
        let response = self
            .client
            .post(self.url_with(&[endpoint]))
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::transport(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::rejection(endpoint, format!("{} - {}", status, error_text)));
        }

        let parsed: GenerationResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::transport(endpoint, e))?;
        accepted(endpoint, parsed)
    }

    /// Read a static JSON record. Missing file is `Ok(None)`, unreadable body is `Ok(Some(Null))`.
    async fn fetch_static_json(&self, project: &str, relative: &str) -> Result<Option<Value>> {
        let mut url = self.static_url(project, relative);
        url.query_pairs_mut().append_pair("t", &cache_bust_token());

        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| PipelineError::transport(relative, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(PipelineError::rejection(relative, response.status().to_string()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::transport(relative, e))?;
        Ok(Some(serde_json::from_str(&body).unwrap_or(Value::Null)))
    }
}

#[async_trait::async_trait]
impl GenerationBackend for HttpBackend {
    async fn get_project(&self, project: &str) -> Result<ProjectDetail> {
        self.get_json("projects", self.url_with(&["projects", project])).await
    }

    async fn list_voices(&self) -> Result<Vec<Voice>> {
        let response: VoicesResponse = self.get_json("voices", self.url_with(&["voices"])).await?;
        Ok(response.voices)
    }

    async fn generate_block_video(
        &self,
        request: &BlockVideoRequest,
    ) -> Result<GenerationResponse> {
        self.post_generation("generate_block_video", request).await
    }

    async fn generate_block_audio(
        &self,
        request: &BlockAudioRequest,
    ) -> Result<GenerationResponse> {
        self.post_generation("generate_audio", request).await
    }

    async fn generate_full_audio(&self, project: &str) -> Result<GenerationResponse> {
        let body = ProjectRequest {
            project_name: project.to_string(),
        };
        self.post_generation("generate_full_audio", &body).await
    }

    async fn stitch_video(&self, project: &str) -> Result<GenerationResponse> {
        let body = ProjectRequest {
            project_name: project.to_string(),
        };
        self.post_generation("generate_full_video", &body).await
    }

    async fn mux_audio_video(&self, project: &str) -> Result<GenerationResponse> {
        let body = ProjectRequest {
            project_name: project.to_string(),
        };
        self.post_generation("mux_audio_video", &body).await
    }

    async fn fetch_audio_meta(&self, project: &str) -> Result<AudioMetadata> {
        Ok(self
            .fetch_static_json(project, AUDIO_META_PATH)
            .await?
            .map(|v| AudioMetadata::from_json(&v))
            .unwrap_or_default())
    }

    async fn fetch_video_meta(&self, project: &str) -> Result<VideoMetadata> {
        Ok(self
            .fetch_static_json(project, VIDEO_META_PATH)
            .await?
            .map(|v| VideoMetadata::from_json(&v))
            .unwrap_or_default())
    }

    fn artifact_url(&self, project: &str, kind: &ArtifactKind) -> String {
        self.static_url(project, &kind.media_path()).to_string()
    }

    async fn probe(&self, url: &str) -> bool {
        match self
            .client
            .head(url)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("[Backend] probe of {} failed: {}", url, e);
                false
            }
        }
    }
}

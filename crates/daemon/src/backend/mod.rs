use serde::{Deserialize, Serialize};
use serde_json::Value;

use engine::{ArtifactKind, AudioMetadata, RawBlock, VideoMetadata, Voice};

use crate::error::{PipelineError, Result};

pub mod http;

#[cfg(test)]
pub mod scripted;

pub use http::HttpBackend;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectDetail {
    #[serde(default)]
    pub blocks: Vec<RawBlock>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct VoicesResponse {
    #[serde(default)]
    pub voices: Vec<Voice>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockVideoRequest {
    pub project_name: String,
    pub block_id: String,
    pub block_text: String,
    pub user_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockAudioRequest {
    pub project_name: String,
    pub block_id: String,
    pub text: String,
    pub voice_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectRequest {
    pub project_name: String,
}

/// Body of a generation endpoint response.
///
/// Most endpoints answer `{success: bool}`; block video answers
/// `{status: "success", url, video_path}`. Both spellings are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub detail: Option<Value>,
}

impl GenerationResponse {
    pub fn succeeded(&self) -> bool {
        match self.success {
            Some(flag) => flag,
            None => self.status.as_deref() == Some("success"),
        }
    }

    fn failure_detail(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        match &self.detail {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "backend reported failure".to_string(),
        }
    }
}

/// Turn a parsed response into `Ok` only when the backend reports success.
pub(crate) fn accepted(endpoint: &str, response: GenerationResponse) -> Result<GenerationResponse> {
    if response.succeeded() {
        Ok(response)
    } else {
        Err(PipelineError::rejection(endpoint, response.failure_detail()))
    }
}

/// The external generation service.
///
/// Generation calls resolve `Ok` only when the backend accepted the job;
/// transport problems and `success: false` both come back as `Err`.
#[async_trait::async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn get_project(&self, project: &str) -> Result<ProjectDetail>;

    async fn list_voices(&self) -> Result<Vec<Voice>>;

    async fn generate_block_video(&self, request: &BlockVideoRequest) -> Result<GenerationResponse>;

    async fn generate_block_audio(&self, request: &BlockAudioRequest) -> Result<GenerationResponse>;

    async fn generate_full_audio(&self, project: &str) -> Result<GenerationResponse>;

    async fn stitch_video(&self, project: &str) -> Result<GenerationResponse>;

    async fn mux_audio_video(&self, project: &str) -> Result<GenerationResponse>;

    /// Current `audio.json`; missing or malformed records read as empty.
    async fn fetch_audio_meta(&self, project: &str) -> Result<AudioMetadata>;

    /// Current `video.json`; missing or malformed records read as empty.
    async fn fetch_video_meta(&self, project: &str) -> Result<VideoMetadata>;

    /// Locator of an artifact, without cache-busting.
    fn artifact_url(&self, project: &str, kind: &ArtifactKind) -> String;

    /// Header-only existence check. Never fails; any problem reads as absent.
    async fn probe(&self, url: &str) -> bool;
}

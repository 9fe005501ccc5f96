//! In-memory backend with per-call latency and outcomes, for coordinator tests.

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::poller::PollPolicy;

use engine::{ArtifactKind, AudioMetadata, RawBlock, VideoMetadata, Voice};

use super::{
    BlockAudioRequest, BlockVideoRequest, GenerationBackend, GenerationResponse, ProjectDetail,
};
use crate::error::{PipelineError, Result};

pub const BASE: &str = "http://backend.test";

/// Short settle and backoff so paused-clock tests stay readable.
pub fn fast_policy() -> PollPolicy {
    PollPolicy {
        settle_delay: Duration::from_millis(500),
        initial_backoff: Duration::from_millis(200),
        max_backoff: Duration::from_secs(1),
        max_attempts: 3,
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    /// Accept the job; `writes_artifact` decides whether the file shows up.
    Succeed { writes_artifact: bool },
    Reject(String),
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub delay: Duration,
    pub outcome: Outcome,
}

impl Plan {
    pub fn ok() -> Self {
        Plan {
            delay: Duration::ZERO,
            outcome: Outcome::Succeed { writes_artifact: true },
        }
    }

    pub fn ok_without_artifact() -> Self {
        Plan {
            delay: Duration::ZERO,
            outcome: Outcome::Succeed { writes_artifact: false },
        }
    }

    pub fn reject(detail: &str) -> Self {
        Plan {
            delay: Duration::ZERO,
            outcome: Outcome::Reject(detail.to_string()),
        }
    }

    pub fn unreachable() -> Self {
        Plan {
            delay: Duration::ZERO,
            outcome: Outcome::Unreachable,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct State {
    blocks: Vec<RawBlock>,
    voices: Vec<Voice>,
    audio_meta: Map<String, Value>,
    video_meta: Map<String, Value>,
    existing: HashSet<String>,
    block_video_plans: HashMap<String, Plan>,
    block_audio_plans: HashMap<String, (Plan, String)>,
    project_plans: HashMap<&'static str, Plan>,
    log: Vec<String>,
    meta_unreachable: bool,
}

pub struct ScriptedBackend {
    state: Mutex<State>,
}

fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

impl ScriptedBackend {
    pub fn new(texts: &[&str]) -> Self {
        let blocks = texts
            .iter()
            .map(|t| RawBlock {
                id: None,
                text: t.to_string(),
                target_sec: 3.0,
            })
            .collect();
        ScriptedBackend {
            state: Mutex::new(State {
                blocks,
                voices: vec![
                    Voice { voice_id: "v1".into(), name: "Rachel".into(), preview_url: None },
                    Voice { voice_id: "v2".into(), name: "Adam".into(), preview_url: None },
                ],
                ..State::default()
            }),
        }
    }

    pub fn plan_block_video(&self, block_id: &str, plan: Plan) {
        self.state.lock().block_video_plans.insert(block_id.to_string(), plan);
    }

    /// On success the entry `{url, voice_id}` is written to `audio.json`.
    pub fn plan_block_audio(&self, block_id: &str, plan: Plan, url: &str) {
        self.state
            .lock()
            .block_audio_plans
            .insert(block_id.to_string(), (plan, url.to_string()));
    }

    /// `endpoint` is one of `generate_full_audio`, `generate_full_video`, `mux_audio_video`.
    pub fn plan_project(&self, endpoint: &'static str, plan: Plan) {
        self.state.lock().project_plans.insert(endpoint, plan);
    }

    pub fn set_audio_entry(&self, block_id: &str, url: &str, voice_id: &str) {
        self.state
            .lock()
            .audio_meta
            .insert(block_id.to_string(), json!({"url": url, "voice_id": voice_id}));
    }

    pub fn set_video_entry(&self, block_id: &str, url: &str) {
        self.state
            .lock()
            .video_meta
            .insert(block_id.to_string(), json!({"url": url}));
    }

    pub fn set_meta_unreachable(&self, unreachable: bool) {
        self.state.lock().meta_unreachable = unreachable;
    }

    pub fn put_artifact(&self, project: &str, kind: &ArtifactKind) {
        let url = self.artifact_url(project, kind);
        self.state.lock().existing.insert(url);
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.state.lock().log.iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn record(&self, entry: String) {
        self.state.lock().log.push(entry);
    }

    async fn run(&self, plan: Plan, endpoint: &str, label: String) -> Result<bool> {
        self.record(format!("{}:start", label));
        tokio::time::sleep(plan.delay).await;
        match plan.outcome {
            Outcome::Succeed { writes_artifact } => {
                self.record(format!("{}:ok", label));
                Ok(writes_artifact)
            }
            Outcome::Reject(detail) => {
                self.record(format!("{}:rejected", label));
                Err(PipelineError::rejection(endpoint, detail))
            }
            Outcome::Unreachable => {
                self.record(format!("{}:unreachable", label));
                Err(PipelineError::transport(endpoint, "connection refused"))
            }
        }
    }

    async fn run_project(
        &self,
        endpoint: &'static str,
        project: &str,
        kind: ArtifactKind,
    ) -> Result<GenerationResponse> {
        let plan = self
            .state
            .lock()
            .project_plans
            .get(endpoint)
            .cloned()
            .unwrap_or_else(Plan::ok);
        if self.run(plan, endpoint, endpoint.to_string()).await? {
            self.put_artifact(project, &kind);
        }
        Ok(GenerationResponse {
            success: Some(true),
            ..GenerationResponse::default()
        })
    }
}

#[async_trait::async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn get_project(&self, _project: &str) -> Result<ProjectDetail> {
        Ok(ProjectDetail {
            blocks: self.state.lock().blocks.clone(),
        })
    }

    async fn list_voices(&self) -> Result<Vec<Voice>> {
        Ok(self.state.lock().voices.clone())
    }

    async fn generate_block_video(
        &self,
        request: &BlockVideoRequest,
    ) -> Result<GenerationResponse> {
        let plan = self
            .state
            .lock()
            .block_video_plans
            .get(&request.block_id)
            .cloned()
            .unwrap_or_else(Plan::ok);
        let label = format!("video:{}", request.block_id);
        if self.run(plan, "generate_block_video", label).await? {
            let kind = ArtifactKind::BlockVideo(request.block_id.clone());
            self.put_artifact(&request.project_name, &kind);
        }
        Ok(GenerationResponse {
            status: Some("success".into()),
            ..GenerationResponse::default()
        })
    }

    async fn generate_block_audio(
        &self,
        request: &BlockAudioRequest,
    ) -> Result<GenerationResponse> {
        let (plan, url) = self
            .state
            .lock()
            .block_audio_plans
            .get(&request.block_id)
            .cloned()
            .unwrap_or_else(|| (Plan::ok(), format!("/{}.mp3", request.block_id)));
        let label = format!("audio:{}", request.block_id);
        if self.run(plan, "generate_audio", label).await? {
            self.set_audio_entry(&request.block_id, &url, &request.voice_id);
        }
        Ok(GenerationResponse {
            success: Some(true),
            ..GenerationResponse::default()
        })
    }

    async fn generate_full_audio(&self, project: &str) -> Result<GenerationResponse> {
        self.run_project("generate_full_audio", project, ArtifactKind::FullAudio).await
    }

    async fn stitch_video(&self, project: &str) -> Result<GenerationResponse> {
        self.run_project("generate_full_video", project, ArtifactKind::StitchedVideo).await
    }

    async fn mux_audio_video(&self, project: &str) -> Result<GenerationResponse> {
        self.run_project("mux_audio_video", project, ArtifactKind::MuxedVideo).await
    }

    async fn fetch_audio_meta(&self, _project: &str) -> Result<AudioMetadata> {
        self.record("meta:audio".into());
        let state = self.state.lock();
        if state.meta_unreachable {
            return Err(PipelineError::transport("audio.json", "connection refused"));
        }
        Ok(AudioMetadata::from_json(&Value::Object(state.audio_meta.clone())))
    }

    async fn fetch_video_meta(&self, _project: &str) -> Result<VideoMetadata> {
        self.record("meta:video".into());
        let state = self.state.lock();
        if state.meta_unreachable {
            return Err(PipelineError::transport("video.json", "connection refused"));
        }
        Ok(VideoMetadata::from_json(&Value::Object(state.video_meta.clone())))
    }

    fn artifact_url(&self, project: &str, kind: &ArtifactKind) -> String {
        format!("{}/static/{}/media/{}", BASE, project, kind.media_path())
    }

    async fn probe(&self, url: &str) -> bool {
        let bare = strip_query(url).to_string();
        let mut state = self.state.lock();
        state.log.push(format!("probe:{}", bare.trim_start_matches(BASE)));
        state.existing.contains(&bare)
    }
}

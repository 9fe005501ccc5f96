use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use engine::{ArtifactKind, ArtifactState, BlockField, StageAction, StageEvent};

use super::{InFlightKey, NoticeLevel, ProjectAction, Session};
use crate::backend::{BlockAudioRequest, BlockVideoRequest, GenerationResponse};
use crate::error::{PipelineError, Result};
use crate::poller::ProbeOutcome;

/// What an operator action amounted to. Errors never escape an action; they land here.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Completed,
    /// Backend accepted the work but its result has not been observed yet.
    Unconfirmed { message: String },
    /// Refused before any request was sent.
    Rejected { message: String },
    Failed { message: String },
}

impl ActionOutcome {
    pub fn from_error(err: &PipelineError) -> Self {
        let message = err.to_string();
        if err.is_validation() {
            ActionOutcome::Rejected { message }
        } else if matches!(err, PipelineError::NotConfirmed { .. }) {
            ActionOutcome::Unconfirmed { message }
        } else {
            ActionOutcome::Failed { message }
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ActionOutcome::Completed => None,
            ActionOutcome::Unconfirmed { message }
            | ActionOutcome::Rejected { message }
            | ActionOutcome::Failed { message } => Some(message),
        }
    }
}

/// Per-block results of a generate-all fan-out.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub requested: usize,
    pub completed: Vec<String>,
    pub unconfirmed: Vec<String>,
    pub failed: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

impl BatchReport {
    pub fn outcome(&self) -> ActionOutcome {
        if let Some(message) = &self.rejected {
            return ActionOutcome::Rejected {
                message: message.clone(),
            };
        }
        if !self.failed.is_empty() {
            let ids: Vec<&str> = self.failed.iter().map(|(id, _)| id.as_str()).collect();
            return ActionOutcome::Failed {
                message: format!(
                    "{} of {} block videos failed: {}",
                    self.failed.len(),
                    self.requested,
                    ids.join(", ")
                ),
            };
        }
        if !self.unconfirmed.is_empty() {
            return ActionOutcome::Unconfirmed {
                message: format!(
                    "{} block video(s) still processing: {}",
                    self.unconfirmed.len(),
                    self.unconfirmed.join(", ")
                ),
            };
        }
        ActionOutcome::Completed
    }
}

impl Session {
    /// Turn an action result into its outcome, logging and noting problems.
    fn settle(&self, action: &str, result: Result<()>) -> ActionOutcome {
        match result {
            Ok(()) => {
                info!("[Dispatcher] {} on {} completed", action, self.project);
                ActionOutcome::Completed
            }
            Err(e) => {
                let outcome = ActionOutcome::from_error(&e);
                let level = match outcome {
                    ActionOutcome::Rejected { .. } => NoticeLevel::Warning,
                    ActionOutcome::Unconfirmed { .. } => {
                        warn!("[Dispatcher] {} on {}: {}", action, self.project, e);
                        NoticeLevel::Info
                    }
                    _ => {
                        error!("[Dispatcher] {} on {} failed: {}", action, self.project, e);
                        NoticeLevel::Error
                    }
                };
                self.set_notice(level, e.to_string());
                outcome
            }
        }
    }

    /// Narration for one block. Needs a voice and text.
    pub async fn generate_block_audio(&self, block_id: &str) -> ActionOutcome {
        let result = self.run_block_audio(block_id).await;
        self.settle(&format!("audio generation for {}", block_id), result)
    }

    async fn run_block_audio(&self, block_id: &str) -> Result<()> {
        let block = self
            .block(block_id)
            .ok_or_else(|| PipelineError::UnknownBlock(block_id.to_string()))?;
        if block.voice_id.is_empty() {
            return Err(PipelineError::Validation(
                "Please select a voice before generating audio.".to_string(),
            ));
        }
        if block.text.trim().is_empty() {
            return Err(PipelineError::Validation(format!("{} has no text to narrate", block_id)));
        }

        let _mark = self.mark_in_flight(InFlightKey::Audio(block.id.clone()))?;
        let request = BlockAudioRequest {
            project_name: self.project.clone(),
            block_id: block.id.clone(),
            text: block.text,
            voice_id: block.voice_id.clone(),
        };
        self.backend().generate_block_audio(&request).await?;

        let meta = self.backend().fetch_audio_meta(&self.project).await?;
        let Some(entry) = meta.get(block_id) else {
            return Err(PipelineError::rejection(
                "generate_audio",
                format!("no audio.json entry for {} after generation", block_id),
            ));
        };

        let voice = if entry.voice_id.is_empty() {
            request.voice_id
        } else {
            entry.voice_id.clone()
        };
        let url = entry.url.clone();
        self.write(|state| {
            state.registry.update_field(block_id, BlockField::AudioUrl(url));
            state.registry.update_field(block_id, BlockField::VoiceId(voice));
        });
        Ok(())
    }

    /// Video for one block. Needs text.
    pub async fn generate_block_video(&self, block_id: &str) -> ActionOutcome {
        let result = self.run_single_block_video(block_id).await;
        self.settle(&format!("video generation for {}", block_id), result)
    }

    fn block_video_request(&self, block_id: &str) -> Result<BlockVideoRequest> {
        let block = self
            .block(block_id)
            .ok_or_else(|| PipelineError::UnknownBlock(block_id.to_string()))?;
        Ok(BlockVideoRequest {
            project_name: self.project.clone(),
            block_id: block.id,
            block_text: block.text,
            user_prompt: block.user_prompt,
        })
    }

    async fn run_single_block_video(&self, block_id: &str) -> Result<()> {
        let request = self.block_video_request(block_id)?;
        if request.block_text.trim().is_empty() {
            return Err(PipelineError::Validation(format!("{} has no text to visualize", block_id)));
        }
        let _mark = self.mark_in_flight(InFlightKey::Video(request.block_id.clone()))?;
        self.request_block_video(&request).await
    }

    /// Send one block-video request and confirm its file. Shared by single and batch paths.
    async fn request_block_video(&self, request: &BlockVideoRequest) -> Result<()> {
        self.backend().generate_block_video(request).await?;

        let kind = ArtifactKind::BlockVideo(request.block_id.clone());
        match self.poller().await_artifact(&self.project, &kind, false).await {
            ProbeOutcome::Present(url) => {
                self.write(|state| {
                    state.registry.update_field(&request.block_id, BlockField::VideoUrl(url));
                    state.artifacts.set(&kind, ArtifactState::Absent);
                });
                Ok(())
            }
            ProbeOutcome::TimedOut { attempts } => {
                self.write(|state| state.artifacts.set(&kind, ArtifactState::Unconfirmed));
                Err(PipelineError::NotConfirmed {
                    artifact: kind,
                    attempts,
                })
            }
        }
    }

    /// Request a video for every block at once and reconcile once all have settled.
    pub async fn generate_all_videos(&self) -> BatchReport {
        let mut report = BatchReport::default();

        let leased = self.lease_stage(StageAction::GenerateAllVideos, StageEvent::VideosSettled);
        let lease = match leased {
            Ok(lease) => lease,
            Err(e) => {
                report.rejected = Some(e.to_string());
                self.settle("generate all videos", Err(e));
                return report;
            }
        };
        let _mark = self
            .mark_in_flight(InFlightKey::Project(ProjectAction::GenerateAllVideos))
            .ok();

        let requests: Vec<BlockVideoRequest> = self.read(|state| {
            state
                .registry
                .blocks()
                .iter()
                .map(|block| BlockVideoRequest {
                    project_name: self.project.clone(),
                    block_id: block.id.clone(),
                    block_text: block.text.clone(),
                    user_prompt: block.user_prompt.clone(),
                })
                .collect()
        });
        info!("[Dispatcher] Generating {} block videos for {}", requests.len(), self.project);

        // one request per block, even when a single-block request is already pending
        let results = join_all(requests.iter().map(|request| async move {
            let _mark = self
                .join_in_flight(InFlightKey::Video(request.block_id.clone()))
                .ok();
            (request.block_id.clone(), self.request_block_video(request).await)
        }))
        .await;
        report.requested = results.len();

        for (block_id, result) in results {
            match result {
                Ok(()) => report.completed.push(block_id),
                Err(PipelineError::NotConfirmed { .. }) => report.unconfirmed.push(block_id),
                Err(e) => {
                    warn!("[Dispatcher] Video for {} failed: {}", block_id, e);
                    report.failed.push((block_id, e.to_string()));
                }
            }
        }

        self.reconcile_video().await;
        lease.finish(StageEvent::VideosSettled);

        let outcome = report.outcome();
        match outcome.message() {
            None => info!(
                "[Dispatcher] All {} block videos for {} ready",
                report.requested, self.project
            ),
            Some(message) => {
                let level = if report.failed.is_empty() {
                    NoticeLevel::Info
                } else {
                    NoticeLevel::Error
                };
                warn!("[Dispatcher] generate all videos on {}: {}", self.project, message);
                self.set_notice(level, message.to_string());
            }
        }
        report
    }

    /// Narration track for the whole project.
    pub async fn generate_full_audio(&self) -> ActionOutcome {
        let result = async {
            let _mark = self.mark_in_flight(InFlightKey::Project(ProjectAction::FullAudio))?;
            let project = self.project.clone();
            let call = self.backend().generate_full_audio(&project);
            self.project_generation(ArtifactKind::FullAudio, call).await
        }
        .await;
        self.settle("full audio generation", result)
    }

    /// Combine block videos into one silent video. Needs at least one block video.
    pub async fn stitch_video(&self) -> ActionOutcome {
        let result = async {
            let lease = self.lease_stage(StageAction::Stitch, StageEvent::StitchSettled)?;
            let _mark = self.mark_in_flight(InFlightKey::Project(ProjectAction::Stitch))?;
            let project = self.project.clone();
            let call = self.backend().stitch_video(&project);
            let result = self.project_generation(ArtifactKind::StitchedVideo, call).await;
            lease.finish(StageEvent::StitchSettled);
            result
        }
        .await;
        self.settle("video stitching", result)
    }

    /// Combine stitched video and full audio. Needs both to be present.
    pub async fn mux_audio_video(&self) -> ActionOutcome {
        let result = async {
            let lease = self.lease_stage(StageAction::Mux, StageEvent::MuxFailed)?;
            let _mark = self.mark_in_flight(InFlightKey::Project(ProjectAction::Mux))?;
            let project = self.project.clone();
            let call = self.backend().mux_audio_video(&project);
            let result = self.project_generation(ArtifactKind::MuxedVideo, call).await;
            let event = if result.is_ok() {
                StageEvent::MuxConfirmed
            } else {
                StageEvent::MuxFailed
            };
            lease.finish(event);
            result
        }
        .await;
        self.settle("audio/video muxing", result)
    }

    /// Await a project-level call, then poll for its artifact.
    ///
    /// A failed call leaves the artifact state as it was.
    async fn project_generation<F>(&self, kind: ArtifactKind, call: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<GenerationResponse>>,
    {
        call.await?;

        match self.poller().await_artifact(&self.project, &kind, true).await {
            ProbeOutcome::Present(url) => {
                self.write(|state| state.artifacts.set(&kind, ArtifactState::Present { url }));
                Ok(())
            }
            ProbeOutcome::TimedOut { attempts } => {
                self.write(|state| state.artifacts.set(&kind, ArtifactState::Unconfirmed));
                Err(PipelineError::NotConfirmed {
                    artifact: kind,
                    attempts,
                })
            }
        }
    }
}

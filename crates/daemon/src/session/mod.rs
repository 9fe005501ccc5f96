//! One open project: the block registry plus everything derived from it.
//!
//! All state lives behind one mutex that is only ever held for short,
//! synchronous merges; no lock is held across an await. Completions write
//! back by block id, one field at a time, so concurrent per-block work can
//! finish in any order. Once a session is closed, late completions are
//! dropped instead of applied.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use engine::{
    audio_updates, video_updates, ArtifactBoard, ArtifactKind, ArtifactState, Block, BlockField,
    BlockRegistry, PipelineStage, Progress, StageAction, StageController, StageEvent, Voice,
};

use crate::backend::GenerationBackend;
use crate::error::{PipelineError, Result};
use crate::poller::{ExistencePoller, PollPolicy};

mod dispatch;
pub mod manager;

pub use dispatch::{ActionOutcome, BatchReport};
pub use manager::SessionManager;

/// Project-scoped actions tracked in the in-flight set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectAction {
    FullAudio,
    GenerateAllVideos,
    Stitch,
    Mux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Last user-facing message produced by an action.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InFlightKey {
    Audio(String),
    Video(String),
    Project(ProjectAction),
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub registry: BlockRegistry,
    pub voices: Vec<Voice>,
    pub artifacts: ArtifactBoard,
    pub stage: StageController,
    pub audio_in_flight: BTreeSet<String>,
    /// Block id -> number of outstanding requests for its video.
    pub video_in_flight: BTreeMap<String, usize>,
    pub project_in_flight: BTreeSet<ProjectAction>,
    pub notice: Option<Notice>,
}

impl SessionState {
    /// `shared` lets a video mark stack on one that is already held.
    fn in_flight_set_insert(&mut self, key: &InFlightKey, shared: bool) -> bool {
        match key {
            InFlightKey::Audio(id) => self.audio_in_flight.insert(id.clone()),
            InFlightKey::Video(id) => {
                let count = self.video_in_flight.entry(id.clone()).or_insert(0);
                if *count > 0 && !shared {
                    return false;
                }
                *count += 1;
                true
            }
            InFlightKey::Project(action) => self.project_in_flight.insert(*action),
        }
    }

    fn in_flight_set_remove(&mut self, key: &InFlightKey) {
        match key {
            InFlightKey::Audio(id) => {
                self.audio_in_flight.remove(id);
            }
            InFlightKey::Video(id) => {
                if let Some(count) = self.video_in_flight.get_mut(id) {
                    *count -= 1;
                    if *count == 0 {
                        self.video_in_flight.remove(id);
                    }
                }
            }
            InFlightKey::Project(action) => {
                self.project_in_flight.remove(action);
            }
        }
    }
}

/// Read-only view handed to the UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub project: String,
    pub blocks: Vec<Block>,
    pub voices: Vec<Voice>,
    pub stage: PipelineStage,
    pub progress: Progress,
    pub artifacts: ArtifactBoard,
    pub can_generate_all: bool,
    pub can_stitch: bool,
    pub can_mux: bool,
    pub audio_in_flight: Vec<String>,
    pub video_in_flight: Vec<String>,
    pub project_in_flight: Vec<ProjectAction>,
    pub notice: Option<Notice>,
}

pub struct Session {
    id: Uuid,
    project: String,
    backend: Arc<dyn GenerationBackend>,
    poller: ExistencePoller,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

/// Marks something as in flight; the mark is removed on drop whatever the outcome.
pub(crate) struct InFlight<'a> {
    session: &'a Session,
    key: InFlightKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.session.state.lock().in_flight_set_remove(&self.key);
    }
}

/// Holds a transient pipeline stage. Dropping it without `finish` fires `fallback`.
pub(crate) struct StageLease<'a> {
    session: &'a Session,
    fallback: StageEvent,
    finished: bool,
}

impl StageLease<'_> {
    pub fn finish(mut self, event: StageEvent) {
        self.finished = true;
        self.session.fire_stage(event);
    }
}

impl Drop for StageLease<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.session.fire_stage(self.fallback);
        }
    }
}

impl Session {
    /// Load a project and reconcile it against the backend.
    ///
    /// Only the project read itself is fatal; voices, metadata and probes
    /// degrade to empty or absent with a warning.
    pub async fn open(
        project: &str,
        backend: Arc<dyn GenerationBackend>,
        policy: PollPolicy,
    ) -> Result<Arc<Session>> {
        let (detail, voices) = tokio::join!(backend.get_project(project), backend.list_voices());
        let detail = detail?;
        let voices = voices.unwrap_or_else(|e| {
            warn!("[Session] Failed to load voices: {}", e);
            Vec::new()
        });

        let registry = BlockRegistry::load(detail.blocks);
        info!("[Session] Loaded project {} with {} blocks", project, registry.len());

        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            project: project.to_string(),
            poller: ExistencePoller::new(backend.clone(), policy),
            backend,
            state: Mutex::new(SessionState {
                registry,
                voices,
                ..SessionState::default()
            }),
            closed: AtomicBool::new(false),
        });

        session.refresh().await;
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop applying results to this session. In-flight backend work is not cancelled.
    pub fn close(&self) {
        let _state = self.state.lock();
        self.closed.store(true, Ordering::SeqCst);
        info!("[Session] Closed session {} for {}", self.id, self.project);
    }

    /// Re-read both metadata records and the three project artifacts.
    pub async fn refresh(&self) {
        self.reconcile_audio().await;
        self.reconcile_video().await;

        let (full_audio, stitched, muxed) = tokio::join!(
            self.poller.probe_now(&self.project, &ArtifactKind::FullAudio),
            self.poller.probe_now(&self.project, &ArtifactKind::StitchedVideo),
            self.poller.probe_now(&self.project, &ArtifactKind::MuxedVideo),
        );

        self.write(|state| {
            for (kind, found) in [
                (ArtifactKind::FullAudio, full_audio),
                (ArtifactKind::StitchedVideo, stitched),
                (ArtifactKind::MuxedVideo, muxed),
            ] {
                let next = match found {
                    Some(url) => ArtifactState::Present { url },
                    None => ArtifactState::Absent,
                };
                state.artifacts.set(&kind, next);
            }
        });
    }

    pub(crate) async fn reconcile_audio(&self) {
        match self.backend.fetch_audio_meta(&self.project).await {
            Ok(meta) => {
                self.write(|state| {
                    let updates = audio_updates(state.registry.blocks(), &meta);
                    state.registry.apply(updates);
                });
            }
            Err(e) => warn!("[Session] Failed to load audio metadata for {}: {}", self.project, e),
        }
    }

    pub(crate) async fn reconcile_video(&self) {
        match self.backend.fetch_video_meta(&self.project).await {
            Ok(meta) => {
                self.write(|state| {
                    let updates = video_updates(state.registry.blocks(), &meta);
                    state.registry.apply(updates);
                    state.artifacts.settle_block_videos(&state.registry);
                });
            }
            Err(e) => warn!("[Session] Failed to load video metadata for {}: {}", self.project, e),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        let available = |action: StageAction| {
            state
                .stage
                .availability(action, &state.registry, &state.artifacts)
                .is_ok()
        };

        SessionSnapshot {
            session_id: self.id,
            project: self.project.clone(),
            blocks: state.registry.blocks().to_vec(),
            voices: state.voices.clone(),
            stage: state.stage.stage(),
            progress: Progress::of(&state.registry),
            artifacts: state.artifacts.clone(),
            can_generate_all: available(StageAction::GenerateAllVideos),
            can_stitch: available(StageAction::Stitch),
            can_mux: available(StageAction::Mux),
            audio_in_flight: state.audio_in_flight.iter().cloned().collect(),
            video_in_flight: state.video_in_flight.keys().cloned().collect(),
            project_in_flight: state.project_in_flight.iter().copied().collect(),
            notice: state.notice.clone(),
        }
    }

    pub fn block(&self, block_id: &str) -> Option<Block> {
        self.state.lock().registry.get(block_id).cloned()
    }

    /// Operator edit of a user-editable field.
    pub fn edit(&self, block_id: &str, field: BlockField) -> Result<()> {
        match field {
            BlockField::Text(_) | BlockField::UserPrompt(_) | BlockField::VoiceId(_) => {}
            other => {
                return Err(PipelineError::Validation(format!(
                    "{} is not editable",
                    other.name()
                )))
            }
        }
        let mut state = self.state.lock();
        if !state.registry.contains(block_id) {
            return Err(PipelineError::UnknownBlock(block_id.to_string()));
        }
        state.registry.update_field(block_id, field);
        Ok(())
    }

    /// Apply `f` unless the session has been closed.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        let mut state = self.state.lock();
        if self.is_closed() {
            debug!("[Session] Discarding late update for closed session {}", self.id);
            return None;
        }
        Some(f(&mut state))
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.state.lock())
    }

    pub(crate) fn mark_in_flight(&self, key: InFlightKey) -> Result<InFlight<'_>> {
        let inserted = self.state.lock().in_flight_set_insert(&key, false);
        if !inserted {
            let what = match &key {
                InFlightKey::Audio(id) => format!("audio generation for {}", id),
                InFlightKey::Video(id) => format!("video generation for {}", id),
                InFlightKey::Project(action) => format!("{:?}", action),
            };
            return Err(PipelineError::Busy(what));
        }
        Ok(InFlight { session: self, key })
    }

    /// Like `mark_in_flight`, but a block video already in flight is joined, not refused.
    pub(crate) fn join_in_flight(&self, key: InFlightKey) -> Result<InFlight<'_>> {
        if self.state.lock().in_flight_set_insert(&key, true) {
            Ok(InFlight { session: self, key })
        } else {
            self.mark_in_flight(key)
        }
    }

    /// Enter the stage for `action` if it is available right now.
    pub(crate) fn lease_stage(
        &self,
        action: StageAction,
        fallback: StageEvent,
    ) -> Result<StageLease<'_>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state
            .stage
            .begin(action, &state.registry, &state.artifacts)
            .map_err(PipelineError::Unavailable)?;
        Ok(StageLease {
            session: self,
            fallback,
            finished: false,
        })
    }

    fn fire_stage(&self, event: StageEvent) {
        if let Err(e) = self.state.lock().stage.fire(event) {
            warn!("[Session] {}", e);
        }
    }

    pub(crate) fn set_notice(&self, level: NoticeLevel, message: String) {
        self.write(|state| {
            state.notice = Some(Notice {
                level,
                message,
                at: Utc::now(),
            })
        });
    }

    pub(crate) fn backend(&self) -> &dyn GenerationBackend {
        self.backend.as_ref()
    }

    pub(crate) fn poller(&self) -> &ExistencePoller {
        &self.poller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{fast_policy, ScriptedBackend};

    #[tokio::test]
    async fn open_reconciles_metadata_and_artifacts() {
        let backend = Arc::new(ScriptedBackend::new(&["one", "two", "three"]));
        backend.set_audio_entry("block_0", "/a0.mp3", "v2");
        backend.set_video_entry("block_2", "/v2.mp4");
        backend.put_artifact("demo", &ArtifactKind::FullAudio);

        let session = Session::open("demo", backend.clone(), fast_policy()).await.unwrap();
        let snap = session.snapshot();

        assert_eq!(snap.blocks.len(), 3);
        assert_eq!(snap.voices.len(), 2);
        assert_eq!(snap.blocks[0].audio_url, "/a0.mp3");
        // dominant voice fills blocks without a voice
        assert_eq!(snap.blocks[1].voice_id, "v2");
        assert_eq!(snap.blocks[2].video_url, "/v2.mp4");
        assert!(snap.artifacts.full_audio.is_present());
        assert_eq!(snap.artifacts.stitched_video, ArtifactState::Absent);
        assert_eq!(snap.stage, PipelineStage::Idle);
        assert!(snap.can_stitch);
        assert!(!snap.can_mux);
        assert_eq!(snap.progress.video_percent, 33);
    }

    #[tokio::test]
    async fn open_survives_unreachable_metadata() {
        let backend = Arc::new(ScriptedBackend::new(&["one"]));
        backend.set_meta_unreachable(true);

        let session = Session::open("demo", backend, fast_policy()).await.unwrap();
        let snap = session.snapshot();
        assert_eq!(snap.blocks.len(), 1);
        assert!(snap.blocks[0].audio_url.is_empty());
    }

    #[tokio::test]
    async fn edits_address_blocks_by_id() {
        let backend = Arc::new(ScriptedBackend::new(&["one", "two"]));
        let session = Session::open("demo", backend, fast_policy()).await.unwrap();

        session.edit("block_1", BlockField::UserPrompt("neon skyline".into())).unwrap();
        session.edit("block_0", BlockField::VoiceId("v1".into())).unwrap();
        assert!(matches!(
            session.edit("block_9", BlockField::Text("x".into())),
            Err(PipelineError::UnknownBlock(_))
        ));
        assert!(matches!(
            session.edit("block_0", BlockField::AudioUrl("/forged.mp3".into())),
            Err(PipelineError::Validation(_))
        ));

        let snap = session.snapshot();
        assert_eq!(snap.blocks[1].user_prompt, "neon skyline");
        assert_eq!(snap.blocks[0].voice_id, "v1");
        assert!(snap.blocks[0].audio_url.is_empty());
    }

    #[tokio::test]
    async fn in_flight_mark_is_exclusive_and_released_on_drop() {
        let backend = Arc::new(ScriptedBackend::new(&["one"]));
        let session = Session::open("demo", backend, fast_policy()).await.unwrap();

        let mark = session.mark_in_flight(InFlightKey::Audio("block_0".into())).unwrap();
        assert_eq!(session.snapshot().audio_in_flight, vec!["block_0".to_string()]);
        assert!(matches!(
            session.mark_in_flight(InFlightKey::Audio("block_0".into())),
            Err(PipelineError::Busy(_))
        ));
        drop(mark);
        assert!(session.snapshot().audio_in_flight.is_empty());
    }

    #[tokio::test]
    async fn video_marks_can_be_joined_and_count_down() {
        let backend = Arc::new(ScriptedBackend::new(&["one"]));
        let session = Session::open("demo", backend, fast_policy()).await.unwrap();
        let key = || InFlightKey::Video("block_0".into());

        let single = session.mark_in_flight(key()).unwrap();
        assert!(session.mark_in_flight(key()).is_err());
        let joined = session.join_in_flight(key()).unwrap();

        drop(single);
        assert_eq!(session.snapshot().video_in_flight, vec!["block_0".to_string()]);
        drop(joined);
        assert!(session.snapshot().video_in_flight.is_empty());
    }

    #[tokio::test]
    async fn closed_session_ignores_writes() {
        let backend = Arc::new(ScriptedBackend::new(&["one"]));
        let session = Session::open("demo", backend, fast_policy()).await.unwrap();

        session.close();
        let applied = session.write(|state| {
            state.registry.update_field("block_0", BlockField::VideoUrl("/late.mp4".into()))
        });
        assert!(applied.is_none());
        assert!(session.snapshot().blocks[0].video_url.is_empty());
    }
}

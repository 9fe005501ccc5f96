use serde::{Deserialize, Serialize};
use std::fmt;

use crate::artifact::ArtifactBoard;
use crate::block::BlockRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Idle,
    GeneratingVideos,
    Stitching,
    Muxing,
    Complete,
}

impl PipelineStage {
    /// A transient stage has an operation in flight.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            PipelineStage::GeneratingVideos | PipelineStage::Stitching | PipelineStage::Muxing
        )
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::GeneratingVideos => "generating videos",
            PipelineStage::Stitching => "stitching",
            PipelineStage::Muxing => "muxing",
            PipelineStage::Complete => "complete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    StartVideos,
    VideosSettled,
    StartStitch,
    StitchSettled,
    StartMux,
    MuxConfirmed,
    MuxFailed,
}

/// Transition table. `None` means the event is not accepted in `current`.
pub fn next_stage(current: PipelineStage, event: StageEvent) -> Option<PipelineStage> {
    use PipelineStage::*;
    use StageEvent::*;

    match (current, event) {
        (Idle | Complete, StartVideos) => Some(GeneratingVideos),
        (Idle | Complete, StartStitch) => Some(Stitching),
        (Idle | Complete, StartMux) => Some(Muxing),
        (GeneratingVideos, VideosSettled) => Some(Idle),
        (Stitching, StitchSettled) => Some(Idle),
        (Muxing, MuxConfirmed) => Some(Complete),
        (Muxing, MuxFailed) => Some(Idle),
        _ => None,
    }
}

/// Stage-gated operator actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    GenerateAllVideos,
    Stitch,
    Mux,
}

impl StageAction {
    fn start_event(self) -> StageEvent {
        match self {
            StageAction::GenerateAllVideos => StageEvent::StartVideos,
            StageAction::Stitch => StageEvent::StartStitch,
            StageAction::Mux => StageEvent::StartMux,
        }
    }
}

/// Why a stage action is currently disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocked {
    Busy(PipelineStage),
    NoBlockVideos,
    MuxInputsMissing,
}

impl fmt::Display for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocked::Busy(stage) => write!(f, "pipeline is busy ({})", stage),
            Blocked::NoBlockVideos => write!(f, "no block has a generated video yet"),
            Blocked::MuxInputsMissing => {
                write!(f, "muxing needs both the stitched video and the full audio track")
            }
        }
    }
}

impl std::error::Error for Blocked {}

/// Event fired in a stage that does not accept it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: PipelineStage,
    pub event: StageEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event {:?} not accepted while {}", self.event, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

/// Holds the single active pipeline stage.
#[derive(Debug, Clone, Default)]
pub struct StageController {
    stage: PipelineStage,
}

impl StageController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn fire(&mut self, event: StageEvent) -> Result<PipelineStage, InvalidTransition> {
        let next = next_stage(self.stage, event).ok_or(InvalidTransition {
            from: self.stage,
            event,
        })?;
        self.stage = next;
        Ok(next)
    }

    /// Whether `action` may start now, given current block and artifact state.
    pub fn availability(
        &self,
        action: StageAction,
        registry: &BlockRegistry,
        artifacts: &ArtifactBoard,
    ) -> Result<(), Blocked> {
        if next_stage(self.stage, action.start_event()).is_none() {
            return Err(Blocked::Busy(self.stage));
        }
        match action {
            StageAction::GenerateAllVideos => Ok(()),
            StageAction::Stitch if !registry.any_video() => Err(Blocked::NoBlockVideos),
            StageAction::Stitch => Ok(()),
            StageAction::Mux if !artifacts.mux_inputs_present() => Err(Blocked::MuxInputsMissing),
            StageAction::Mux => Ok(()),
        }
    }

    /// Check availability and enter the action's stage in one step.
    pub fn begin(
        &mut self,
        action: StageAction,
        registry: &BlockRegistry,
        artifacts: &ArtifactBoard,
    ) -> Result<PipelineStage, Blocked> {
        self.availability(action, registry, artifacts)?;
        self.fire(action.start_event())
            .map_err(|e| Blocked::Busy(e.from))
    }
}

/// Aggregate generation progress over all blocks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub audio_generated: usize,
    pub videos_generated: usize,
    pub audio_ratio: f64,
    pub video_ratio: f64,
    pub audio_percent: u32,
    pub video_percent: u32,
}

fn ratio(done: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 / total as f64
    }
}

fn percent(r: f64) -> u32 {
    (r * 100.0).round() as u32
}

impl Progress {
    pub fn of(registry: &BlockRegistry) -> Self {
        let total = registry.len();
        let audio_generated = registry.audio_generated();
        let videos_generated = registry.videos_generated();
        let audio_ratio = ratio(audio_generated, total);
        let video_ratio = ratio(videos_generated, total);

        Progress {
            total,
            audio_generated,
            videos_generated,
            audio_ratio,
            video_ratio,
            audio_percent: percent(audio_ratio),
            video_percent: percent(video_ratio),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactKind, ArtifactState};
    use crate::block::{BlockField, RawBlock};

    fn registry(n: usize) -> BlockRegistry {
        BlockRegistry::load(
            (0..n)
                .map(|i| RawBlock {
                    id: None,
                    text: format!("b{}", i),
                    target_sec: 2.0,
                })
                .collect(),
        )
    }

    #[test]
    fn transient_stages_return_to_idle() {
        let mut c = StageController::new();
        assert_eq!(c.fire(StageEvent::StartVideos), Ok(PipelineStage::GeneratingVideos));
        assert_eq!(c.fire(StageEvent::VideosSettled), Ok(PipelineStage::Idle));
        assert_eq!(c.fire(StageEvent::StartStitch), Ok(PipelineStage::Stitching));
        assert_eq!(c.fire(StageEvent::StitchSettled), Ok(PipelineStage::Idle));
        assert_eq!(c.fire(StageEvent::StartMux), Ok(PipelineStage::Muxing));
        assert_eq!(c.fire(StageEvent::MuxFailed), Ok(PipelineStage::Idle));
    }

    #[test]
    fn confirmed_mux_completes_and_complete_is_reenterable() {
        let mut c = StageController::new();
        c.fire(StageEvent::StartMux).unwrap();
        assert_eq!(c.fire(StageEvent::MuxConfirmed), Ok(PipelineStage::Complete));

        assert_eq!(c.fire(StageEvent::StartStitch), Ok(PipelineStage::Stitching));
        c.fire(StageEvent::StitchSettled).unwrap();
        c.fire(StageEvent::StartMux).unwrap();
        c.fire(StageEvent::MuxConfirmed).unwrap();
        assert_eq!(c.fire(StageEvent::StartVideos), Ok(PipelineStage::GeneratingVideos));
    }

    #[test]
    fn only_one_stage_is_active() {
        let mut c = StageController::new();
        c.fire(StageEvent::StartVideos).unwrap();
        let err = c.fire(StageEvent::StartStitch).unwrap_err();
        assert_eq!(err.from, PipelineStage::GeneratingVideos);
        assert_eq!(c.stage(), PipelineStage::GeneratingVideos);
        assert!(c.fire(StageEvent::MuxConfirmed).is_err());
    }

    #[test]
    fn stitch_enabled_once_any_block_has_video() {
        let mut reg = registry(3);
        let board = ArtifactBoard::default();
        let c = StageController::new();

        assert_eq!(
            c.availability(StageAction::Stitch, &reg, &board),
            Err(Blocked::NoBlockVideos)
        );
        reg.update_field("block_1", BlockField::VideoUrl("/b1.mp4".into()));
        assert_eq!(c.availability(StageAction::Stitch, &reg, &board), Ok(()));
    }

    #[test]
    fn mux_requires_both_inputs() {
        let reg = registry(1);
        let mut board = ArtifactBoard::default();
        let c = StageController::new();
        let present = ArtifactState::Present { url: "/f".into() };

        board.set(&ArtifactKind::StitchedVideo, present.clone());
        assert_eq!(
            c.availability(StageAction::Mux, &reg, &board),
            Err(Blocked::MuxInputsMissing)
        );
        board.set(&ArtifactKind::FullAudio, present);
        assert_eq!(c.availability(StageAction::Mux, &reg, &board), Ok(()));
        board.set(&ArtifactKind::StitchedVideo, ArtifactState::Absent);
        assert_eq!(
            c.availability(StageAction::Mux, &reg, &board),
            Err(Blocked::MuxInputsMissing)
        );
    }

    #[test]
    fn begin_rejects_while_busy() {
        let reg = registry(1);
        let board = ArtifactBoard::default();
        let mut c = StageController::new();

        assert_eq!(
            c.begin(StageAction::GenerateAllVideos, &reg, &board),
            Ok(PipelineStage::GeneratingVideos)
        );
        assert_eq!(
            c.begin(StageAction::GenerateAllVideos, &reg, &board),
            Err(Blocked::Busy(PipelineStage::GeneratingVideos))
        );
    }

    #[test]
    fn progress_of_empty_project_is_zero() {
        let p = Progress::of(&registry(0));
        assert_eq!(p.total, 0);
        assert_eq!(p.audio_ratio, 0.0);
        assert_eq!(p.video_ratio, 0.0);
        assert_eq!(p.video_percent, 0);
        assert!(!p.video_ratio.is_nan());
    }

    #[test]
    fn progress_rounds_percent() {
        let mut reg = registry(3);
        reg.update_field("block_0", BlockField::VideoUrl("/v.mp4".into()));
        assert_eq!(Progress::of(&reg).video_percent, 33);

        reg.update_field("block_2", BlockField::VideoUrl("/v.mp4".into()));
        let p = Progress::of(&reg);
        assert_eq!(p.video_percent, 67);
        assert_eq!(p.videos_generated, 2);
        assert_eq!(p.audio_percent, 0);
    }
}

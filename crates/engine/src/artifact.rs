use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::block::BlockRegistry;

/// Project-relative location of the per-block audio record.
pub const AUDIO_META_PATH: &str = "audio/audio.json";
/// Project-relative location of the per-block video record.
pub const VIDEO_META_PATH: &str = "video/video.json";

/// A derived file the backend produces out of process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "block_id", rename_all = "snake_case")]
pub enum ArtifactKind {
    FullAudio,
    StitchedVideo,
    MuxedVideo,
    BlockVideo(String),
}

impl ArtifactKind {
    /// Path below `{project}/media/` where the backend writes this artifact.
    pub fn media_path(&self) -> String {
        match self {
            ArtifactKind::FullAudio => "audio/full_audio.mp3".to_string(),
            ArtifactKind::StitchedVideo => "video/final_video.mp4".to_string(),
            ArtifactKind::MuxedVideo => "mux/full_video.mp4".to_string(),
            ArtifactKind::BlockVideo(block_id) => format!("video/{}.mp4", block_id),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::FullAudio => write!(f, "full audio"),
            ArtifactKind::StitchedVideo => write!(f, "stitched video"),
            ArtifactKind::MuxedVideo => write!(f, "muxed video"),
            ArtifactKind::BlockVideo(block_id) => write!(f, "video for {}", block_id),
        }
    }
}

/// What the coordinator currently knows about an artifact.
///
/// `Unconfirmed` means the backend accepted the job but probing gave up
/// before the file appeared. It is not the same as `Absent`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArtifactState {
    #[default]
    Absent,
    Present { url: String },
    Unconfirmed,
}

impl ArtifactState {
    pub fn is_present(&self) -> bool {
        matches!(self, ArtifactState::Present { .. })
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ArtifactState::Present { url } => Some(url),
            _ => None,
        }
    }
}

/// Presence state of every project artifact plus unconfirmed block videos.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArtifactBoard {
    pub full_audio: ArtifactState,
    pub stitched_video: ArtifactState,
    pub muxed_video: ArtifactState,
    /// Only blocks whose video state differs from what `video_url` says.
    pub block_videos: BTreeMap<String, ArtifactState>,
}

impl ArtifactBoard {
    pub fn get(&self, kind: &ArtifactKind) -> ArtifactState {
        match kind {
            ArtifactKind::FullAudio => self.full_audio.clone(),
            ArtifactKind::StitchedVideo => self.stitched_video.clone(),
            ArtifactKind::MuxedVideo => self.muxed_video.clone(),
            ArtifactKind::BlockVideo(id) => self.block_videos.get(id).cloned().unwrap_or_default(),
        }
    }

    pub fn set(&mut self, kind: &ArtifactKind, state: ArtifactState) {
        match kind {
            ArtifactKind::FullAudio => self.full_audio = state,
            ArtifactKind::StitchedVideo => self.stitched_video = state,
            ArtifactKind::MuxedVideo => self.muxed_video = state,
            ArtifactKind::BlockVideo(id) => match state {
                ArtifactState::Absent => {
                    self.block_videos.remove(id);
                }
                other => {
                    self.block_videos.insert(id.clone(), other);
                }
            },
        }
    }

    /// Drop block video states that `video_url` now answers for.
    pub fn settle_block_videos(&mut self, registry: &BlockRegistry) {
        self.block_videos
            .retain(|id, _| !registry.get(id).map_or(false, |block| block.has_video()));
    }

    /// Muxing needs a stitched video and a full audio track at the same time.
    pub fn mux_inputs_present(&self) -> bool {
        self.stitched_video.is_present() && self.full_audio.is_present()
    }
}

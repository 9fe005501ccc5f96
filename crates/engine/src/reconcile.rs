//! Merging of server-side generation metadata into the block registry.
//!
//! The backend keeps two records per project: `audio.json` (block id ->
//! `{url, voice_id}`) and `video.json` (block id -> `{url}`). Both are the
//! authority on what has been generated. Everything here is pure: callers
//! fetch the payloads and apply the resulting field updates.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::block::{Block, BlockField, BlockRegistry};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioEntry {
    pub url: String,
    pub voice_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoEntry {
    pub url: String,
}

/// A single-field change addressed by block id.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub block_id: String,
    pub field: BlockField,
}

impl FieldUpdate {
    pub fn new(block_id: impl Into<String>, field: BlockField) -> Self {
        FieldUpdate {
            block_id: block_id.into(),
            field,
        }
    }
}

fn str_field(entry: &Value, key: &str) -> String {
    entry
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Per-block entries in payload order, so first-occurrence ordering is observable.
fn object_entries(payload: &Value) -> impl Iterator<Item = (&String, &Value)> {
    payload
        .as_object()
        .into_iter()
        .flat_map(|map| map.iter())
        .filter(|(_, entry)| entry.is_object())
}

/// Parsed `audio.json`. Anything malformed is treated as absent.
#[derive(Debug, Clone, Default)]
pub struct AudioMetadata {
    entries: Vec<(String, AudioEntry)>,
    index: HashMap<String, usize>,
}

impl AudioMetadata {
    pub fn from_json(payload: &Value) -> Self {
        let mut meta = AudioMetadata::default();
        for (block_id, entry) in object_entries(payload) {
            meta.index.insert(block_id.clone(), meta.entries.len());
            meta.entries.push((
                block_id.clone(),
                AudioEntry {
                    url: str_field(entry, "url"),
                    voice_id: str_field(entry, "voice_id"),
                },
            ));
        }
        meta
    }

    pub fn parse(body: &str) -> Self {
        serde_json::from_str::<Value>(body)
            .map(|v| Self::from_json(&v))
            .unwrap_or_default()
    }

    pub fn get(&self, block_id: &str) -> Option<&AudioEntry> {
        self.index.get(block_id).map(|&i| &self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most frequent `voice_id` across all entries.
    ///
    /// Ties go to the voice that occurs first in the payload.
    pub fn dominant_voice(&self) -> Option<&str> {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for (_, entry) in &self.entries {
            if entry.voice_id.is_empty() {
                continue;
            }
            match counts.iter_mut().find(|(voice, _)| *voice == entry.voice_id) {
                Some((_, n)) => *n += 1,
                None => counts.push((entry.voice_id.as_str(), 1)),
            }
        }

        let mut best: Option<(&str, usize)> = None;
        for (voice, n) in counts {
            if best.map_or(true, |(_, top)| n > top) {
                best = Some((voice, n));
            }
        }
        best.map(|(voice, _)| voice)
    }
}

/// Parsed `video.json`.
#[derive(Debug, Clone, Default)]
pub struct VideoMetadata {
    entries: HashMap<String, VideoEntry>,
}

impl VideoMetadata {
    pub fn from_json(payload: &Value) -> Self {
        let entries = object_entries(payload)
            .map(|(block_id, entry)| {
                (
                    block_id.clone(),
                    VideoEntry {
                        url: str_field(entry, "url"),
                    },
                )
            })
            .collect();
        VideoMetadata { entries }
    }

    pub fn parse(body: &str) -> Self {
        serde_json::from_str::<Value>(body)
            .map(|v| Self::from_json(&v))
            .unwrap_or_default()
    }

    pub fn get(&self, block_id: &str) -> Option<&VideoEntry> {
        self.entries.get(block_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Field updates that bring `blocks` in line with `meta`.
///
/// A block with an entry takes its url and voice from it (keeping its own
/// voice if the entry has none). A block without an entry and without a
/// voice gets the dominant voice. Only actual changes are emitted.
pub fn audio_updates(blocks: &[Block], meta: &AudioMetadata) -> Vec<FieldUpdate> {
    let dominant = meta.dominant_voice();
    let mut updates = Vec::new();

    for block in blocks {
        let (url, voice) = match meta.get(&block.id) {
            Some(entry) => {
                let voice = if !entry.voice_id.is_empty() {
                    Some(entry.voice_id.as_str())
                } else if block.voice_id.is_empty() {
                    dominant
                } else {
                    None
                };
                (Some(entry.url.as_str()), voice)
            }
            None if block.voice_id.is_empty() => (None, dominant),
            None => (None, None),
        };

        if let Some(url) = url.filter(|u| *u != block.audio_url) {
            updates.push(FieldUpdate::new(&block.id, BlockField::AudioUrl(url.to_string())));
        }
        if let Some(voice) = voice.filter(|v| *v != block.voice_id) {
            updates.push(FieldUpdate::new(&block.id, BlockField::VoiceId(voice.to_string())));
        }
    }

    updates
}

/// Field updates for `video_url`. Absence in the metadata never clears a url.
pub fn video_updates(blocks: &[Block], meta: &VideoMetadata) -> Vec<FieldUpdate> {
    blocks
        .iter()
        .filter_map(|block| {
            let entry = meta.get(&block.id)?;
            if entry.url.is_empty() || entry.url == block.video_url {
                return None;
            }
            Some(FieldUpdate::new(&block.id, BlockField::VideoUrl(entry.url.clone())))
        })
        .collect()
}

fn apply_to_copy(blocks: &[Block], updates: Vec<FieldUpdate>) -> Vec<Block> {
    let mut registry = BlockRegistry::from_blocks(blocks.to_vec());
    registry.apply(updates);
    registry.into_blocks()
}

/// `blocks` with audio metadata merged in.
pub fn reconcile_audio(blocks: &[Block], meta: &AudioMetadata) -> Vec<Block> {
    apply_to_copy(blocks, audio_updates(blocks, meta))
}

/// `blocks` with video metadata merged in.
pub fn reconcile_video(blocks: &[Block], meta: &VideoMetadata) -> Vec<Block> {
    apply_to_copy(blocks, video_updates(blocks, meta))
}

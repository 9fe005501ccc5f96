use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::reconcile::FieldUpdate;

/// One unit of script text with its own target duration and derived media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub text: String,
    pub target_sec: f64,
    pub user_prompt: String,
    pub voice_id: String,
    pub audio_url: String, // "" until generated
    pub video_url: String, // "" until generated
}

impl Block {
    pub fn has_audio(&self) -> bool {
        !self.audio_url.is_empty()
    }

    pub fn has_video(&self) -> bool {
        !self.video_url.is_empty()
    }
}

/// Block as served by `GET /projects/{name}`; the id is optional there.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBlock {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub target_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    pub voice_id: String,
    pub name: String,
    #[serde(default)]
    pub preview_url: Option<String>,
}

/// Fields the coordinator is allowed to change. `id` and `target_sec` are fixed at load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum BlockField {
    Text(String),
    UserPrompt(String),
    VoiceId(String),
    AudioUrl(String),
    VideoUrl(String),
}

impl BlockField {
    fn apply(self, block: &mut Block) {
        match self {
            BlockField::Text(v) => block.text = v,
            BlockField::UserPrompt(v) => block.user_prompt = v,
            BlockField::VoiceId(v) => block.voice_id = v,
            BlockField::AudioUrl(v) => block.audio_url = v,
            BlockField::VideoUrl(v) => block.video_url = v,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlockField::Text(_) => "text",
            BlockField::UserPrompt(_) => "user_prompt",
            BlockField::VoiceId(_) => "voice_id",
            BlockField::AudioUrl(_) => "audio_url",
            BlockField::VideoUrl(_) => "video_url",
        }
    }
}

/// Synthetic id for a block that arrived without one.
pub fn synthetic_block_id(position: usize) -> String {
    format!("block_{}", position)
}

/// Ordered, id-addressed store of a project's blocks.
///
/// Order is fixed by `load` and never changes afterwards. Every mutation goes
/// through `update_field`, which addresses a block by id and touches exactly
/// one field, so completions arriving in any order cannot clobber each other.
#[derive(Debug, Clone, Default)]
pub struct BlockRegistry {
    blocks: Vec<Block>,
    index: HashMap<String, usize>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the project payload.
    ///
    /// Missing ids become `block_{position}`. A duplicate id is replaced by a
    /// fresh synthetic one so that id-keyed merges stay well defined.
    pub fn load(raw_blocks: Vec<RawBlock>) -> Self {
        let mut registry = BlockRegistry {
            blocks: Vec::with_capacity(raw_blocks.len()),
            index: HashMap::with_capacity(raw_blocks.len()),
        };

        for (position, raw) in raw_blocks.into_iter().enumerate() {
            let mut id = raw
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| synthetic_block_id(position));

            if registry.index.contains_key(&id) {
                let mut fresh = synthetic_block_id(position);
                while registry.index.contains_key(&fresh) {
                    fresh.push('_');
                }
                warn!(
                    "[Registry] Duplicate block id {:?} at position {}, using {:?}",
                    id, position, fresh
                );
                id = fresh;
            }

            registry.index.insert(id.clone(), registry.blocks.len());
            registry.blocks.push(Block {
                id,
                text: raw.text,
                target_sec: raw.target_sec,
                user_prompt: String::new(),
                voice_id: String::new(),
                audio_url: String::new(),
                video_url: String::new(),
            });
        }

        registry
    }

    /// Registry over already-normalized blocks. First occurrence wins on duplicate ids.
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let mut index = HashMap::with_capacity(blocks.len());
        for (i, block) in blocks.iter().enumerate() {
            index.entry(block.id.clone()).or_insert(i);
        }
        BlockRegistry { blocks, index }
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn get(&self, id: &str) -> Option<&Block> {
        self.index.get(id).map(|&i| &self.blocks[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().map(|b| b.id.as_str())
    }

    /// Replace one field of the block with the given id.
    ///
    /// Returns false (and logs) when no such block exists; that is a
    /// consistency problem on the caller's side, not an error.
    pub fn update_field(&mut self, id: &str, field: BlockField) -> bool {
        match self.index.get(id) {
            Some(&i) => {
                field.apply(&mut self.blocks[i]);
                true
            }
            None => {
                warn!("[Registry] update of {} ignored, no block with id {:?}", field.name(), id);
                false
            }
        }
    }

    /// Apply a batch of field updates; returns how many hit an existing block.
    pub fn apply(&mut self, updates: impl IntoIterator<Item = FieldUpdate>) -> usize {
        updates
            .into_iter()
            .filter(|update| self.update_field(&update.block_id, update.field.clone()))
            .count()
    }

    pub fn audio_generated(&self) -> usize {
        self.blocks.iter().filter(|b| b.has_audio()).count()
    }

    pub fn videos_generated(&self) -> usize {
        self.blocks.iter().filter(|b| b.has_video()).count()
    }

    pub fn any_video(&self) -> bool {
        self.blocks.iter().any(Block::has_video)
    }
}

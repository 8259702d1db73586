//! Knowledge packs: small, size-capped UTF-8 text artifacts (prompts,
//! skills, workflows) shared through the registry.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{MAX_PACK_TAGS, MAX_PACK_TAG_LEN};
use crate::time::TimestampSeconds;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgePack {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub owner_node: String,
    #[serde(default)]
    pub created_ts: TimestampSeconds,
    #[serde(default)]
    pub updated_ts: TimestampSeconds,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub size_bytes: usize,
}

/// Pack description without the content body, returned by `knowledge_list`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackMeta {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub owner_node: String,
    #[serde(default)]
    pub created_ts: TimestampSeconds,
    #[serde(default)]
    pub updated_ts: TimestampSeconds,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub size_bytes: usize,
}

impl KnowledgePack {
    pub fn meta(&self) -> PackMeta {
        PackMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            summary: self.summary.clone(),
            tags: self.tags.clone(),
            version: self.version.clone(),
            owner_node: self.owner_node.clone(),
            created_ts: self.created_ts,
            updated_ts: self.updated_ts,
            content_hash: self.content_hash.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

/// SHA-256 of the pack content, hex encoded.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Trim tags, drop empties, cap tag length and tag count.
pub fn sanitize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| {
            if t.len() > MAX_PACK_TAG_LEN {
                let mut end = MAX_PACK_TAG_LEN;
                while !t.is_char_boundary(end) {
                    end -= 1;
                }
                t[..end].to_string()
            } else {
                t.to_string()
            }
        })
        .take(MAX_PACK_TAGS)
        .collect()
}

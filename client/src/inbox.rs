//! Local knowledge inbox: fetched packs are stored one JSON file per
//! pack, indexed by a manifest. Saving the same `(id, contentHash)` twice
//! is a no-op, so repeated fetches stay idempotent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fabric_common::knowledge::KnowledgePack;
use fabric_common::time::{get_current_time_in_seconds, TimestampSeconds};

#[derive(Debug, Error)]
pub enum InboxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad pack file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub saved_at: TimestampSeconds,
    #[serde(default)]
    pub file: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub packs: Vec<ManifestEntry>,
}

fn manifest_path(inbox: &Path) -> PathBuf {
    inbox.join("manifest.json")
}

fn load_manifest(inbox: &Path) -> Manifest {
    let path = manifest_path(inbox);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|data| serde_json::from_str(&data).ok())
        .unwrap_or_default()
}

fn save_manifest(inbox: &Path, manifest: &Manifest) -> Result<(), InboxError> {
    let data = serde_json::to_string_pretty(manifest)?;
    std::fs::write(manifest_path(inbox), data)?;
    Ok(())
}

/// Keep only characters that are safe in a filename.
fn safe_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "pack".to_string()
    } else {
        cleaned
    }
}

fn pack_filename(pack: &KnowledgePack) -> String {
    format!("{}_{}.json", pack.id, safe_filename(&pack.name))
}

/// Save a pack into the inbox. Returns the file path; re-saving the same
/// `(id, contentHash)` leaves everything untouched.
pub fn save_pack(inbox: &Path, pack: &KnowledgePack) -> Result<PathBuf, InboxError> {
    std::fs::create_dir_all(inbox)?;
    let mut manifest = load_manifest(inbox);

    if manifest
        .packs
        .iter()
        .any(|entry| entry.id == pack.id && entry.content_hash == pack.content_hash)
    {
        return Ok(inbox.join(pack_filename(pack)));
    }

    let filename = pack_filename(pack);
    let path = inbox.join(&filename);
    std::fs::write(&path, serde_json::to_string_pretty(pack)?)?;

    // replace any stale entry for the same pack id
    manifest.packs.retain(|entry| entry.id != pack.id);
    manifest.packs.push(ManifestEntry {
        id: pack.id.clone(),
        name: pack.name.clone(),
        kind: pack.kind.clone(),
        version: pack.version.clone(),
        content_hash: pack.content_hash.clone(),
        saved_at: get_current_time_in_seconds(),
        file: filename,
    });
    save_manifest(inbox, &manifest)?;
    Ok(path)
}

/// Look a pack up by id, via the manifest first, falling back to a
/// directory scan when the manifest is missing or stale.
pub fn find_pack(inbox: &Path, pack_id: &str) -> Option<KnowledgePack> {
    let manifest = load_manifest(inbox);
    for entry in &manifest.packs {
        if entry.id != pack_id || entry.file.is_empty() {
            continue;
        }
        if let Some(pack) = read_pack_file(&inbox.join(&entry.file)) {
            return Some(pack);
        }
    }
    let entries = std::fs::read_dir(inbox).ok()?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().map(|ext| ext == "json").unwrap_or(false)
            && path.file_name().map(|n| n != "manifest.json").unwrap_or(false)
        {
            if let Some(pack) = read_pack_file(&path) {
                if pack.id == pack_id {
                    return Some(pack);
                }
            }
        }
    }
    None
}

fn read_pack_file(path: &Path) -> Option<KnowledgePack> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

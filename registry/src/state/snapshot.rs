//! Snapshot persistence: one JSON document, atomically replaced through a
//! sibling `.tmp` file so a crash mid-write never corrupts the previous
//! snapshot. Loading tolerates missing or corrupt files; the in-memory
//! state stays authoritative either way.

use std::fs;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use fabric_common::knowledge::KnowledgePack;

use super::{NodeEntry, RegistryError, Reservation, RegistryStore};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDoc {
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
    #[serde(default)]
    pub knowledge_packs: Vec<KnowledgePack>,
}

pub(super) fn save(store: &mut RegistryStore, path: &Path) -> Result<(), RegistryError> {
    let doc = store.export();
    let data = serde_json::to_vec_pretty(&doc).map_err(|e| RegistryError::Storage(e.to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| RegistryError::Storage(e.to_string()))?;
        }
    }

    let tmp = tmp_path(path);
    fs::write(&tmp, &data).map_err(|e| RegistryError::Storage(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| RegistryError::Storage(e.to_string()))?;
    store.mark_saved();
    Ok(())
}

pub(super) fn load(store: &mut RegistryStore, path: &Path) {
    if !path.exists() {
        return;
    }
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            warn!("failed to read snapshot {}: {}", path.display(), e);
            return;
        }
    };
    match serde_json::from_slice::<SnapshotDoc>(&data) {
        Ok(doc) => store.import(doc),
        Err(e) => {
            warn!(
                "corrupt snapshot {} ({}); starting with empty state",
                path.display(),
                e
            );
        }
    }
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    std::path::PathBuf::from(os)
}

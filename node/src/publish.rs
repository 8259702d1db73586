//! Knowledge auto-publish: scan a directory of pack JSON files and push
//! new or changed packs to the registry. Re-publishing is deduplicated by
//! content hash, and updates always set allowUpdate so owned packs can
//! evolve in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use serde_json::{json, Value};

use fabric_common::config::DEFAULT_REQUEST_TIMEOUT_SECS;
use fabric_common::knowledge::content_hash;
use fabric_common::protocol::Envelope;
use fabric_common::ws::{expect_kind, request_once, WsClientError};

use crate::config::MIN_PUBLISH_INTERVAL_SECS;

#[derive(Clone, Debug)]
pub struct PublishConfig {
    pub registry_url: String,
    pub registry_token: String,
    pub node_id: String,
    pub dir: PathBuf,
    pub interval_secs: u64,
}

/// One publishable pack file, as read from the publish directory.
#[derive(Clone, Debug, PartialEq)]
pub struct PackFile {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub content: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub version: String,
}

/// Parse a pack file; `name`, `kind` and `content` are mandatory. The id
/// defaults to the content-addressed hash of (name, kind, content) so a
/// renamed file keeps its identity.
pub fn load_pack_file(path: &Path) -> Option<PackFile> {
    let data = std::fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&data).ok()?;
    let obj = value.as_object()?;

    let name = obj.get("name")?.as_str()?.trim().to_string();
    let kind = obj.get("kind")?.as_str()?.trim().to_string();
    let content = obj.get("content")?.as_str()?.to_string();
    if name.is_empty() || kind.is_empty() || content.is_empty() {
        return None;
    }

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| compute_pack_id(&name, &kind, &content));

    Some(PackFile {
        id,
        name,
        kind,
        content,
        summary: obj
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string(),
        tags: obj
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        version: obj
            .get("version")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("1.0")
            .to_string(),
    })
}

pub fn compute_pack_id(name: &str, kind: &str, content: &str) -> String {
    content_hash(&format!("{name}\n{kind}\n{content}"))
}

/// Run the publish loop until cancelled.
pub async fn run_publish_loop(cfg: PublishConfig) {
    let interval = Duration::from_secs(cfg.interval_secs.max(MIN_PUBLISH_INTERVAL_SECS));
    // pack id -> last published content hash
    let mut published: HashMap<String, String> = HashMap::new();
    loop {
        if let Err(e) = publish_dir(&cfg, &mut published).await {
            warn!("knowledge auto publish failed: {}", e);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn publish_dir(
    cfg: &PublishConfig,
    published: &mut HashMap<String, String>,
) -> Result<(), WsClientError> {
    let mut paths: Vec<PathBuf> = match std::fs::read_dir(&cfg.dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect(),
        // a missing directory is not an error; it may appear later
        Err(_) => return Ok(()),
    };
    paths.sort();

    for path in paths {
        let Some(pack) = load_pack_file(&path) else {
            continue;
        };
        let hash = content_hash(&pack.content);
        if published.get(&pack.id) == Some(&hash) {
            continue;
        }
        publish_pack(cfg, &pack).await?;
        debug!("published knowledge pack {} ({})", pack.id, pack.name);
        published.insert(pack.id, hash);
    }
    Ok(())
}

async fn publish_pack(cfg: &PublishConfig, pack: &PackFile) -> Result<(), WsClientError> {
    let env = Envelope::with_payload(
        "knowledge_publish",
        json!({
            "id": pack.id,
            "name": pack.name,
            "kind": pack.kind,
            "content": pack.content,
            "summary": pack.summary,
            "tags": pack.tags,
            "version": pack.version,
            "ownerNode": cfg.node_id,
            "allowUpdate": true,
            "registryToken": cfg.registry_token,
        }),
    );
    let reply = request_once(
        &cfg.registry_url,
        &env,
        Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
    )
    .await?;
    expect_kind(reply, "knowledge_publish_ok")?;
    Ok(())
}

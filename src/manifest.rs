use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Size and modification time of a source file; the change-detection stamp
/// recorded by each stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub src: String,
    pub size: u64,
    pub mtime: f64,
}

pub fn file_meta(path: &Path) -> Option<FileMeta> {
    let meta = fs::metadata(path).ok()?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Some(FileMeta {
        src: path.display().to_string(),
        size: meta.len(),
        mtime,
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(value).context("serialize json")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("swap {}", path.display()))?;
    Ok(())
}

/// Missing or unreadable stamps read as `None`, which callers treat as "changed".
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Rebuilt,
    Built,
    Extracted,
    SkippedUnchanged,
    SkippedExists,
    Downloaded,
    DownloadedFallback,
    MissingSrc,
    MissingBronze,
    MissingSilver,
    ZipMissing,
    Failed,
    Ok,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestItem {
    pub key: String,
    pub status: ItemStatus,
    #[serde(flatten)]
    pub detail: serde_json::Map<String, Json>,
}

impl ManifestItem {
    pub fn new(key: impl Into<String>, status: ItemStatus) -> Self {
        Self {
            key: key.into(),
            status,
            detail: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Json::Null);
        self.detail.insert(field.to_string(), value);
        self
    }
}

/// Per-stage outcome log written to `logs/<stage>_manifest_<run_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub run_at: String,
    pub items: Vec<ManifestItem>,
}

impl Manifest {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            run_at: utc_now_iso(),
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, item: ManifestItem) {
        self.items.push(item);
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    pub fn write(&self, log_dir: &Path, stage: &str) -> Result<PathBuf> {
        let path = log_dir.join(format!("{stage}_manifest_{}.json", self.run_id));
        write_json(&path, self)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_items_flatten_detail() {
        let mut manifest = Manifest::new("20250101_000000");
        manifest.push(ManifestItem::new("gbg_teams_all", ItemStatus::Rebuilt).with("rows", 12));
        manifest.push(ManifestItem::new("player_bios", ItemStatus::MissingSrc));
        let json = serde_json::to_value(&manifest).expect("json");
        assert_eq!(json["items"][0]["status"], "rebuilt");
        assert_eq!(json["items"][0]["rows"], 12);
        assert_eq!(json["items"][1]["status"], "missing_src");
        assert_eq!(manifest.count(ItemStatus::Rebuilt), 1);
    }

    #[test]
    fn stamps_roundtrip_and_detect_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src.csv");
        fs::write(&src, "a,b\n1,2\n").expect("write src");
        let before = file_meta(&src).expect("meta");
        let stamp_path = dir.path().join(".stamp.json");
        write_json(&stamp_path, &before).expect("stamp");
        let read: Option<FileMeta> = read_json(&stamp_path);
        assert_eq!(read.as_ref(), Some(&before));

        fs::write(&src, "a,b\n1,2\n3,4\n").expect("rewrite src");
        let after = file_meta(&src).expect("meta");
        assert_ne!(Some(after), read);
        assert!(read_json::<FileMeta>(&dir.path().join("missing.json")).is_none());
    }
}

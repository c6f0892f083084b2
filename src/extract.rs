use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::info;
use walkdir::WalkDir;

use crate::config::PipelineConfig;
use crate::datasets::SourceKind;
use crate::fsutil::clear_dir_except;
use crate::manifest::{ItemStatus, Manifest, ManifestItem, file_meta, read_json, write_json};

pub const EXTRACT_STAMP: &str = ".extract_stamp.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractStamp {
    pub zip_size: u64,
    pub zip_mtime: f64,
}

/// Unpacks `zip_path` into `out_dir` unless the archive's size and mtime match
/// the previous extraction. Archive handling is delegated to the system `unzip`.
pub fn extract_zip(zip_path: &Path, out_dir: &Path, overwrite: bool) -> Result<ManifestItem> {
    let key = out_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(meta) = file_meta(zip_path) else {
        return Ok(ManifestItem::new(key, ItemStatus::ZipMissing)
            .with("zip", zip_path.display().to_string()));
    };
    let stamp = ExtractStamp {
        zip_size: meta.size,
        zip_mtime: meta.mtime,
    };
    let stamp_path = out_dir.join(EXTRACT_STAMP);
    if !overwrite && read_json::<ExtractStamp>(&stamp_path).as_ref() == Some(&stamp) {
        return Ok(ManifestItem::new(key, ItemStatus::SkippedUnchanged));
    }

    clear_dir_except(out_dir, EXTRACT_STAMP)?;
    let output = Command::new("unzip")
        .arg("-o")
        .arg("-q")
        .arg(zip_path)
        .arg("-d")
        .arg(out_dir)
        .output()
        .context("spawn unzip")?;
    if !output.status.success() {
        return Err(anyhow!(
            "unzip {} failed: {}",
            zip_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    write_json(&stamp_path, &stamp)?;

    let files = WalkDir::new(out_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() != EXTRACT_STAMP)
        .count();
    Ok(ManifestItem::new(key, ItemStatus::Extracted).with("files", files))
}

pub fn extract_all(cfg: &PipelineConfig) -> Result<PathBuf> {
    let mut manifest = Manifest::new(&cfg.run_id);
    for ds in cfg.datasets.iter().filter(|d| d.kind == SourceKind::Zip) {
        let zip_path = cfg.paths.raw.join(ds.raw_file_name());
        let out_dir = cfg.paths.extracted.join(&ds.key);
        let overwrite = cfg.refresh.extract
            || (ds.is_rolling() && cfg.refresh.download.rolling_sources);

        info!(dataset = %ds.key, dir = %out_dir.display(), overwrite, "extract");
        let item = extract_zip(&zip_path, &out_dir, overwrite)
            .with_context(|| format!("extract {}", ds.key))?
            .with("zip", zip_path.display().to_string())
            .with("extract_dir", out_dir.display().to_string());
        manifest.push(item);
    }
    let path = manifest.write(&cfg.paths.logs, "extract")?;
    info!(manifest = %path.display(), "extract complete");
    Ok(path)
}

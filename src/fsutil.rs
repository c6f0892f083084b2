use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::PipelineError;

pub const STAGED_EXTENSIONS: &[&str] = &["parquet", "json"];

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub scanned: usize,
    pub copied: usize,
    pub src: String,
    pub dst: String,
}

fn mtime_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Mirrors files with the given extensions from `src` into `dst`. A file is
/// copied when the destination is missing, differs in size, or is older.
pub fn sync_tree(src: &Path, dst: &Path, extensions: &[&str]) -> Result<SyncSummary> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    let mut scanned = 0usize;
    let mut copied = 0usize;

    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.contains(&ext));
        if !matches {
            continue;
        }
        let rel = path.strip_prefix(src).with_context(|| format!("relative {}", path.display()))?;
        let target = dst.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        scanned += 1;

        if let (Ok(s), Ok(d)) = (fs::metadata(path), fs::metadata(&target))
            && s.len() == d.len()
            && mtime_secs(&s) <= mtime_secs(&d)
        {
            continue;
        }
        fs::copy(path, &target)
            .with_context(|| format!("copy {} -> {}", path.display(), target.display()))?;
        copied += 1;
    }

    Ok(SyncSummary {
        scanned,
        copied,
        src: src.display().to_string(),
        dst: dst.display().to_string(),
    })
}

/// Deletes files under `dst` with one of `extensions` that no longer exist at the
/// same relative path under `src`. Returns how many were removed.
pub fn prune_stale(src: &Path, dst: &Path, extensions: &[&str]) -> Result<usize> {
    if !dst.exists() {
        return Ok(0);
    }
    let mut removed = 0usize;
    for entry in WalkDir::new(dst) {
        let entry = entry.with_context(|| format!("walk {}", dst.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let tracked = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.contains(&ext));
        if !tracked {
            continue;
        }
        let rel = path.strip_prefix(dst).with_context(|| format!("relative {}", path.display()))?;
        if !src.join(rel).exists() {
            fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// First CSV (by sorted path) anywhere under an extraction directory.
pub fn find_extracted_csv(key: &str, dir: &Path) -> Result<PathBuf> {
    let mut csvs: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
        })
        .collect();
    csvs.sort();
    csvs.into_iter().next().ok_or_else(|| {
        PipelineError::MissingSource {
            key: key.to_string(),
            path: dir.to_path_buf(),
        }
        .into()
    })
}

/// `part_*.parquet` files directly inside `dir`, sorted by name.
pub fn list_parts(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut parts: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("part_") && n.ends_with(".parquet"))
        })
        .collect();
    parts.sort();
    parts
}

/// Every `*.parquet` below `dir`, sorted by path.
pub fn list_parquet_recursive(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("parquet"))
        .collect();
    out.sort();
    out
}

pub fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(())
}

/// Empties `dir` except for the entry named `keep`.
pub fn clear_dir_except(dir: &Path, keep: &str) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        if entry.file_name() == keep {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).with_context(|| format!("remove {}", path.display()))?;
        } else {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
    }
    Ok(())
}

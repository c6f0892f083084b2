use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bronze;
use crate::canon::Situation;
use crate::config::PipelineConfig;
use crate::frame;
use crate::fsutil::{self, STAGED_EXTENSIONS, SyncSummary};
use crate::manifest::{FileMeta, ItemStatus, Manifest, ManifestItem, read_json, utc_now_iso, write_json};
use crate::standardize::Standardizer;
use crate::store;

pub const SILVER_STAMP: &str = ".silver_stamp.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilverStamp {
    pub run_id: String,
    pub built_at: String,
    pub key: String,
    pub bronze_stamp_src: Option<FileMeta>,
    pub rows_in: usize,
    pub rows_out: usize,
    pub parts_written: usize,
    pub rs_only_in_silver: bool,
}

pub fn silver_dir(cfg: &PipelineConfig, key: &str) -> PathBuf {
    cfg.paths.silver.join(key)
}

pub fn situation_dir(base: &Path, situation: Situation) -> PathBuf {
    base.join(format!("situation={situation}"))
}

/// Silver parts for one situation. Datasets without a situation column are
/// stored unpartitioned and serve every situation.
pub fn silver_parts(cfg: &PipelineConfig, key: &str, situation: Situation) -> Vec<PathBuf> {
    let base = silver_dir(cfg, key);
    let sit_dir = situation_dir(&base, situation);
    if sit_dir.exists() {
        return fsutil::list_parts(&sit_dir);
    }
    fsutil::list_parts(&base)
}

pub fn needs_rebuild(cfg: &PipelineConfig, key: &str, force: bool) -> bool {
    if force {
        return true;
    }
    let bronze_src = bronze::read_stamp(&bronze::bronze_dir(cfg, key)).map(|s| s.src_meta);
    let Some(stamp) = read_json::<SilverStamp>(&silver_dir(cfg, key).join(SILVER_STAMP)) else {
        return true;
    };
    stamp.bronze_stamp_src != bronze_src
}

pub struct SilverBuild {
    pub stamp: SilverStamp,
    pub synced: SyncSummary,
}

pub fn build_dataset(
    cfg: &PipelineConfig,
    key: &str,
    parts: &[PathBuf],
    standardizer: &Standardizer,
) -> Result<SilverBuild> {
    let out_drive = silver_dir(cfg, key);
    let out_local = cfg.paths.local_root.join("silver_stage").join(key);
    fsutil::reset_dir(&out_local)?;

    let has_situation = match parts.first() {
        Some(first) => store::read_schema(first)?
            .iter()
            .any(|(name, _)| name == "situation"),
        None => false,
    };

    let mut rows_in = 0usize;
    let mut rows_out = 0usize;
    let mut wrote = 0usize;
    for (idx, part) in parts.iter().enumerate() {
        let df = store::read_frame(part)?;
        rows_in += df.height();
        let out = standardizer
            .standardize(df, key)
            .with_context(|| format!("standardize {}", part.display()))?;
        rows_out += out.height();
        if out.height() == 0 {
            continue;
        }
        let name = store::part_file_name(idx);
        if has_situation && frame::has_column(&out, "situation") {
            for (sit, group) in frame::split_by(&out, "situation")? {
                let sit = sit.unwrap_or_default();
                store::write_frame(&out_local.join(format!("situation={sit}")).join(&name), &group)?;
                wrote += 1;
            }
        } else {
            store::write_frame(&out_local.join(&name), &out)?;
            wrote += 1;
        }
    }

    let stamp = SilverStamp {
        run_id: cfg.run_id.clone(),
        built_at: utc_now_iso(),
        key: key.to_string(),
        bronze_stamp_src: bronze::read_stamp(&bronze::bronze_dir(cfg, key)).map(|s| s.src_meta),
        rows_in,
        rows_out,
        parts_written: wrote,
        rs_only_in_silver: cfg.rs_only_in_silver,
    };
    write_json(&out_local.join(SILVER_STAMP), &stamp)?;
    fsutil::prune_stale(&out_local, &out_drive, STAGED_EXTENSIONS)?;
    let synced = fsutil::sync_tree(&out_local, &out_drive, STAGED_EXTENSIONS)?;
    Ok(SilverBuild { stamp, synced })
}

pub fn silver_build_all(cfg: &PipelineConfig) -> Result<PathBuf> {
    let mut manifest = Manifest::new(&cfg.run_id);
    let standardizer = Standardizer::new(cfg.engine.threads, cfg.rs_only_in_silver);

    for ds in &cfg.datasets {
        let force = cfg.refresh.silver.for_source(ds.is_rolling());
        let parts = fsutil::list_parts(&bronze::bronze_dir(cfg, &ds.key));
        if parts.is_empty() {
            warn!(dataset = %ds.key, "missing bronze");
            manifest.push(ManifestItem::new(&ds.key, ItemStatus::MissingBronze));
            continue;
        }
        if !needs_rebuild(cfg, &ds.key, force) {
            info!(dataset = %ds.key, "silver unchanged");
            manifest.push(ManifestItem::new(&ds.key, ItemStatus::SkippedUnchanged));
            continue;
        }

        let built = build_dataset(cfg, &ds.key, &parts, &standardizer)
            .with_context(|| format!("silver {}", ds.key))?;
        info!(
            dataset = %ds.key,
            rows_in = built.stamp.rows_in,
            rows_out = built.stamp.rows_out,
            parts_written = built.stamp.parts_written,
            copied = built.synced.copied,
            "silver rebuilt"
        );
        manifest.push(
            ManifestItem::new(&ds.key, ItemStatus::Rebuilt)
                .with("rows_in", built.stamp.rows_in)
                .with("rows_out", built.stamp.rows_out)
                .with("parts_written", built.stamp.parts_written)
                .with("rs_only_in_silver", built.stamp.rs_only_in_silver)
                .with("synced", &built.synced),
        );
    }
    let path = manifest.write(&cfg.paths.logs, "silver")?;
    info!(manifest = %path.display(), "silver complete");
    Ok(path)
}

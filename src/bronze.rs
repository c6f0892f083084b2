use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::canon::{make_unique, to_snake_case};
use crate::config::PipelineConfig;
use crate::datasets::{DataLevel, DatasetSpec, SourceKind, SourceType};
use crate::frame::{self, parse_compact_date};
use crate::fsutil::{self, STAGED_EXTENSIONS, SyncSummary};
use crate::manifest::{
    FileMeta, ItemStatus, Manifest, ManifestItem, file_meta, read_json, utc_now_iso, write_json,
};
use crate::store;

pub const BRONZE_STAMP: &str = ".bronze_stamp.json";

const ID_COLUMNS: &[&str] = &["playerid", "goalieid", "gameid", "lineid"];
const TEXT_COLUMNS: &[&str] = &[
    "team",
    "playerteam",
    "opposingteam",
    "opp_team",
    "home_or_away",
    "position",
    "situation",
    "name",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceLabels {
    pub data_level: DataLevel,
    pub source_type: SourceType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BronzeStamp {
    pub run_id: String,
    pub built_at: String,
    pub key: String,
    pub src_meta: FileMeta,
    pub rows: usize,
    pub parts: usize,
    pub chunksize: usize,
    #[serde(default)]
    pub schema_sha256: String,
    pub meta: SourceLabels,
}

pub fn bronze_dir(cfg: &PipelineConfig, key: &str) -> PathBuf {
    cfg.paths.bronze.join(key)
}

pub fn read_stamp(dir: &Path) -> Option<BronzeStamp> {
    read_json(&dir.join(BRONZE_STAMP))
}

pub fn needs_rebuild(out_dir: &Path, src: &Path, force: bool) -> bool {
    if force {
        return true;
    }
    let current = file_meta(src);
    read_stamp(out_dir).map(|s| s.src_meta) != current
}

fn is_text_column(name: &str) -> bool {
    ID_COLUMNS.contains(&name) || TEXT_COLUMNS.contains(&name)
}

/// Raw header cells of `src`, unquoted.
fn raw_header(src: &Path) -> Result<Vec<String>> {
    let file = File::open(src).with_context(|| format!("open {}", src.display()))?;
    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .with_context(|| format!("read header of {}", src.display()))?;
    let line = line.trim_start_matches('\u{feff}').trim_end_matches(['\r', '\n']);
    Ok(line
        .split(',')
        .map(|h| h.trim().trim_matches('"').to_string())
        .collect())
}

/// Reads `src` with full-file schema inference. Identifier and label columns
/// are forced to text so `8471214` never becomes a number, and headers come
/// back snake-cased and unique.
pub fn read_csv_frame(src: &Path) -> Result<DataFrame> {
    let raw = raw_header(src)?;
    let overrides: Schema = raw
        .iter()
        .filter(|h| is_text_column(&to_snake_case(h)))
        .map(|h| Field::new(h.as_str().into(), DataType::String))
        .collect();
    let mut df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(None)
        .with_schema_overwrite(Some(Arc::new(overrides)))
        .try_into_reader_with_file_path(Some(src.to_path_buf()))
        .with_context(|| format!("open csv reader {}", src.display()))?
        .finish()
        .with_context(|| format!("parse {}", src.display()))?;

    let snake: Vec<String> = raw.iter().map(|h| to_snake_case(h)).collect();
    let unique = make_unique(&snake);
    if unique.len() == df.width() {
        df.set_column_names(unique.iter().map(String::as_str))
            .with_context(|| format!("rename headers of {}", src.display()))?;
    }
    Ok(df)
}

/// Identifier columns are text, and a parsed `gamedate_dt` accompanies a
/// compact `YYYYMMDD` `gamedate`.
pub fn basic_type_fixes(df: &mut DataFrame) -> Result<()> {
    for name in ID_COLUMNS.iter().chain(TEXT_COLUMNS) {
        if frame::has_column(df, name) {
            let values = frame::text_values(df, name)?;
            frame::set_column(df, frame::text_column(name, values))?;
        }
    }
    if frame::has_column(df, "gamedate") {
        let parsed = frame::text_values(df, "gamedate")?
            .into_iter()
            .map(|v| v.as_deref().and_then(parse_compact_date))
            .collect();
        frame::set_column(df, frame::date_column("gamedate_dt", parsed)?)?;
    }
    Ok(())
}

/// Reads `src` and hands it to `sink` in slices of `chunk_rows` rows.
pub fn read_csv_chunks(
    src: &Path,
    chunk_rows: usize,
    mut sink: impl FnMut(DataFrame) -> Result<()>,
) -> Result<usize> {
    let df = read_csv_frame(src)?;
    let total = df.height();
    let step = chunk_rows.max(1);
    let mut offset = 0usize;
    while offset < total {
        let len = step.min(total - offset);
        sink(df.slice(i64::try_from(offset).unwrap_or(i64::MAX), len))?;
        offset += len;
    }
    Ok(total)
}

fn label_column(name: &str, value: &str, rows: usize) -> Column {
    frame::text_column(name, vec![Some(value.to_string()); rows])
}

fn serde_label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

pub struct BronzeBuild {
    pub rows: usize,
    pub parts: usize,
    pub synced: SyncSummary,
}

pub fn build_dataset(cfg: &PipelineConfig, ds: &DatasetSpec, src: &Path) -> Result<BronzeBuild> {
    let out_drive = bronze_dir(cfg, &ds.key);
    let out_local = cfg.paths.local_root.join("bronze_stage").join(&ds.key);
    fsutil::reset_dir(&out_local)?;

    let source_file = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let labels = SourceLabels {
        data_level: ds.level,
        source_type: ds.source_type,
    };
    let level = serde_label(&labels.data_level);
    let source_type = serde_label(&labels.source_type);
    let chunk_rows = ds.chunk_rows();

    let mut parts = 0usize;
    let rows = read_csv_chunks(src, chunk_rows, |mut df| {
        let n = df.height();
        frame::set_column(&mut df, label_column("source_file", &source_file, n))?;
        frame::set_column(&mut df, label_column("dataset_key", &ds.key, n))?;
        frame::set_column(&mut df, label_column("data_level", &level, n))?;
        frame::set_column(&mut df, label_column("source_type", &source_type, n))?;
        basic_type_fixes(&mut df)?;
        store::write_frame(&out_local.join(store::part_file_name(parts)), &df)?;
        parts += 1;
        Ok(())
    })?;
    let schema_sha256 = if parts > 0 {
        store::schema_checksum(&out_local.join(store::part_file_name(0)))?
    } else {
        String::new()
    };

    let src_meta = file_meta(src).with_context(|| format!("stat {}", src.display()))?;
    let stamp = BronzeStamp {
        run_id: cfg.run_id.clone(),
        built_at: utc_now_iso(),
        key: ds.key.clone(),
        src_meta,
        rows,
        parts,
        chunksize: chunk_rows,
        schema_sha256,
        meta: labels,
    };
    write_json(&out_local.join(BRONZE_STAMP), &stamp)?;
    fsutil::prune_stale(&out_local, &out_drive, STAGED_EXTENSIONS)?;
    let synced = fsutil::sync_tree(&out_local, &out_drive, STAGED_EXTENSIONS)?;
    Ok(BronzeBuild { rows, parts, synced })
}

pub fn source_csv(cfg: &PipelineConfig, ds: &DatasetSpec) -> Option<PathBuf> {
    match ds.kind {
        SourceKind::Csv => {
            let path = cfg.paths.raw.join(ds.raw_file_name());
            path.exists().then_some(path)
        }
        SourceKind::Zip => fsutil::find_extracted_csv(&ds.key, &cfg.paths.extracted.join(&ds.key)).ok(),
    }
}

pub fn bronze_build_all(cfg: &PipelineConfig) -> Result<PathBuf> {
    let mut manifest = Manifest::new(&cfg.run_id);
    for ds in &cfg.datasets {
        let force = cfg.refresh.bronze.for_source(ds.is_rolling());
        let Some(src) = source_csv(cfg, ds) else {
            let expected = match ds.kind {
                SourceKind::Csv => cfg.paths.raw.join(ds.raw_file_name()),
                SourceKind::Zip => cfg.paths.extracted.join(&ds.key),
            };
            warn!(dataset = %ds.key, path = %expected.display(), "missing source csv");
            manifest.push(
                ManifestItem::new(&ds.key, ItemStatus::MissingSrc)
                    .with("src_csv", expected.display().to_string()),
            );
            continue;
        };

        if !needs_rebuild(&bronze_dir(cfg, &ds.key), &src, force) {
            info!(dataset = %ds.key, "bronze unchanged");
            manifest.push(
                ManifestItem::new(&ds.key, ItemStatus::SkippedUnchanged)
                    .with("src_csv", src.display().to_string()),
            );
            continue;
        }

        info!(dataset = %ds.key, force, "bronze rebuild");
        let built = build_dataset(cfg, ds, &src).with_context(|| format!("bronze {}", ds.key))?;
        info!(
            dataset = %ds.key,
            rows = built.rows,
            parts = built.parts,
            copied = built.synced.copied,
            "bronze rebuilt"
        );
        manifest.push(
            ManifestItem::new(&ds.key, ItemStatus::Rebuilt)
                .with("src_csv", src.display().to_string())
                .with("rows", built.rows)
                .with("parts", built.parts)
                .with("synced", &built.synced),
        );
    }
    let path = manifest.write(&cfg.paths.logs, "bronze")?;
    info!(manifest = %path.display(), "bronze complete");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_read_infers_numbers_and_keeps_ids_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("skaters.csv");
        std::fs::write(
            &src,
            "playerId,season,name,icetime,I_F_goals\n8471214,2024,A Player,900,1\n8471215,2023,B Player,61.5,\n",
        )
        .expect("write");
        let df = read_csv_frame(&src).expect("read");
        assert_eq!(frame::names(&df), vec!["playerid", "season", "name", "icetime", "i_f_goals"]);
        let dtype = |n: &str| df.column(n).map(|c| c.dtype().clone()).ok();
        assert_eq!(dtype("playerid"), Some(DataType::String));
        assert_eq!(dtype("season"), Some(DataType::Int64));
        assert_eq!(dtype("icetime"), Some(DataType::Float64));
        assert_eq!(frame::text_at(&df, "playerid", 0).as_deref(), Some("8471214"));
        assert_eq!(frame::i64_at(&df, "i_f_goals", 1), None);
    }

    #[test]
    fn chunks_snake_case_headers_and_parse_dates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("teams.csv");
        std::fs::write(
            &src,
            "playerId,gameId,gameDate,I_F_goals,I_F_goals\n8471214,2024020001,20241012,1,2\n8471215,2024020002,20241013,0,0\n8471216,2024020003,20241014,3,1\n",
        )
        .expect("write");

        let mut frames = Vec::new();
        let total = read_csv_chunks(&src, 2, |mut f| {
            basic_type_fixes(&mut f)?;
            frames.push(f);
            Ok(())
        })
        .expect("read");
        assert_eq!(total, 3);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].height(), 1);
        let first = &frames[0];
        assert_eq!(
            frame::names(first),
            vec!["playerid", "gameid", "gamedate", "i_f_goals", "i_f_goals__1", "gamedate_dt"]
        );
        let dtype = |n: &str| first.column(n).map(|c| c.dtype().clone()).ok();
        assert_eq!(dtype("playerid"), Some(DataType::String));
        assert_eq!(dtype("gamedate"), Some(DataType::Int64));
        assert_eq!(frame::i64_at(first, "i_f_goals__1", 0), Some(2));
        assert_eq!(
            frame::date_at(first, "gamedate_dt", 0),
            chrono::NaiveDate::from_ymd_opt(2024, 10, 12)
        );
    }
}

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use parquet::basic::{ConvertedType, LogicalType, Type as PhysicalType};
use parquet::file::reader::{FileReader, SerializedFileReader};
use polars::prelude::*;
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::frame;

/// Column kinds as recorded in a parquet footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Float,
    Text,
    Date,
}

pub fn part_file_name(idx: usize) -> String {
    format!("part_{idx:05}.parquet")
}

pub fn write_frame(path: &Path, df: &DataFrame) -> Result<PathBuf> {
    if df.width() == 0 {
        return Err(anyhow!("refusing to write {} with no columns", path.display()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    ParquetWriter::new(&mut file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(&mut df.clone())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path.to_path_buf())
}

/// Footer-only read; no row groups are decoded.
pub fn read_schema(path: &Path) -> Result<Vec<(String, ColumnKind)>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("open parquet reader {}", path.display()))?;
    let descr = reader.metadata().file_metadata().schema_descr();
    let mut out = Vec::with_capacity(descr.num_columns());
    for col in descr.columns() {
        let is_date = col.converted_type() == ConvertedType::DATE
            || matches!(col.logical_type(), Some(LogicalType::Date));
        let kind = match col.physical_type() {
            PhysicalType::INT32 if is_date => ColumnKind::Date,
            PhysicalType::INT32 | PhysicalType::INT64 | PhysicalType::BOOLEAN => ColumnKind::Int,
            PhysicalType::FLOAT | PhysicalType::DOUBLE => ColumnKind::Float,
            PhysicalType::BYTE_ARRAY | PhysicalType::FIXED_LEN_BYTE_ARRAY => ColumnKind::Text,
            other => {
                return Err(PipelineError::UnsupportedColumn {
                    column: col.name().to_string(),
                    physical: format!("{other:?}"),
                }
                .into());
            }
        };
        out.push((col.name().to_string(), kind));
    }
    Ok(out)
}

pub fn read_frame(path: &Path) -> Result<DataFrame> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    ParquetReader::new(file)
        .finish()
        .with_context(|| format!("read {}", path.display()))
}

/// Reads only the named columns that exist in the file, in file order.
pub fn read_frame_columns(path: &Path, names: &[&str]) -> Result<DataFrame> {
    let present: Vec<String> = read_schema(path)?
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| names.contains(&name.as_str()))
        .collect();
    if present.is_empty() {
        return Ok(DataFrame::empty());
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    ParquetReader::new(file)
        .with_columns(Some(present))
        .finish()
        .with_context(|| format!("read {}", path.display()))
}

pub fn read_frames(paths: &[PathBuf]) -> Result<DataFrame> {
    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        frames.push(read_frame(path)?);
    }
    frame::concat_frames(frames)
}

/// sha256 over `name:type|name:type|...`; changes whenever the column set or a type does.
pub fn schema_checksum(path: &Path) -> Result<String> {
    let joined = read_schema(path)?
        .iter()
        .map(|(name, kind)| format!("{name}:{kind:?}"))
        .collect::<Vec<_>>()
        .join("|");
    Ok(sha256_text(&joined))
}

pub fn sha256_text(s: &str) -> String {
    format!("{:x}", Sha256::digest(s.as_bytes()))
}

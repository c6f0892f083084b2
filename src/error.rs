use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source for dataset {key} not found at {}", path.display())]
    MissingSource { key: String, path: PathBuf },

    #[error("no bronze parts for dataset {key}")]
    MissingBronze { key: String },

    #[error("no gold parts for {relation} under {}", dir.display())]
    MissingGold { relation: String, dir: PathBuf },

    #[error("relation {relation} is missing required column {column}")]
    MissingColumn { relation: String, column: String },

    #[error("unsupported parquet column {column} ({physical})")]
    UnsupportedColumn { column: String, physical: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

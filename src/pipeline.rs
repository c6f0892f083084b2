use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value as Json, json};
use tracing::{error, info};

use crate::config::{PipelineConfig, Stage};
use crate::manifest::{utc_now_iso, write_json};
use crate::{bronze, download, extract, gold, lines, silver, warehouse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: &'static str,
    pub status: StepStatus,
    pub seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub run_at: String,
    pub current_season: i32,
    pub strict_rolling: bool,
    pub steps: Vec<StepRecord>,
    #[serde(skip)]
    pub log_path: PathBuf,
}

impl PipelineRun {
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }
}

fn path_result(path: PathBuf) -> Json {
    json!(path.display().to_string())
}

pub fn run_stage(cfg: &PipelineConfig, stage: Stage) -> Result<Json> {
    match stage {
        Stage::Download => download::download_all(cfg).map(path_result),
        Stage::Extract => extract::extract_all(cfg).map(path_result),
        Stage::Bronze => bronze::bronze_build_all(cfg).map(path_result),
        Stage::Silver => silver::silver_build_all(cfg).map(path_result),
        Stage::LinesReady => lines::build_lines_ready(cfg).map(path_result),
        Stage::Gold => gold::gold_build_all(cfg).map(path_result),
        Stage::Warehouse => {
            let summary = warehouse::warehouse_build(cfg)?;
            Ok(serde_json::to_value(&summary)?)
        }
    }
}

/// Runs the enabled stages in order, stopping at the first failure. The run
/// log is written either way.
pub fn run(cfg: &PipelineConfig) -> Result<PipelineRun> {
    cfg.paths.ensure()?;
    let mut run = PipelineRun {
        run_id: cfg.run_id.clone(),
        run_at: utc_now_iso(),
        current_season: cfg.current_season,
        strict_rolling: cfg.window_policy.is_strict(),
        steps: Vec::new(),
        log_path: cfg.paths.logs.join(format!("pipeline_run_{}.json", cfg.run_id)),
    };

    for stage in Stage::ORDER.into_iter().filter(|s| cfg.stage_enabled(*s)) {
        info!(step = stage.name(), "run step");
        let started = Instant::now();
        let outcome = run_stage(cfg, stage);
        let seconds = started.elapsed().as_secs_f64();
        match outcome {
            Ok(result) => run.steps.push(StepRecord {
                step: stage.name(),
                status: StepStatus::Ok,
                seconds,
                result: Some(result),
                error: None,
            }),
            Err(err) => {
                error!(step = stage.name(), error = %format!("{err:#}"), "step failed");
                run.steps.push(StepRecord {
                    step: stage.name(),
                    status: StepStatus::Failed,
                    seconds,
                    result: None,
                    error: Some(format!("{err:#}")),
                });
                break;
            }
        }
    }

    write_json(&run.log_path, &run)?;
    info!(log = %run.log_path.display(), "pipeline run log");
    Ok(run)
}

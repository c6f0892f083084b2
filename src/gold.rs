use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::canon::Situation;
use crate::config::PipelineConfig;
use crate::datasets::{self, LINES_GAME_READY_KEY};
use crate::engine::{Engine, quote_ident};
use crate::frame;
use crate::fsutil;
use crate::lines::LINE_COUNT_COLS;
use crate::manifest::{ItemStatus, Manifest, ManifestItem, utc_now_iso, write_json};
use crate::rolling::{RollingPlan, rs_predicate_sql};
use crate::silver::situation_dir;
use crate::store;

pub const GOLD_STAMP: &str = ".gold_stamp.json";
const SOURCE_TABLE: &str = "base_src";

const PLAYER_KEYS: &[&str] = &["playerid", "team", "situation", "season"];
const TEAM_KEYS: &[&str] = &["team", "situation", "season"];
const LINE_KEYS: &[&str] = &["combo_key_team", "situation", "season"];

const SKATER_COUNTS: &[&str] = &[
    "i_f_goals",
    "i_f_points",
    "i_f_shotsongoal",
    "i_f_shotattempts",
    "i_f_unblockedshotattempts",
    "i_f_xgoals",
    "i_f_hits",
    "i_f_takeaways",
    "i_f_giveaways",
    "penalties",
    "penaltyminutes",
];

const TEAM_COUNTS: &[&str] = &[
    "goalsfor",
    "goalsagainst",
    "xgoalsfor",
    "xgoalsagainst",
    "shotsongoalfor",
    "shotsongoalagainst",
    "shotattemptsfor",
    "shotattemptsagainst",
    "unblockedshotattemptsfor",
    "unblockedshotattemptsagainst",
    "penaltiesfor",
    "penaltiesagainst",
    "penaltyminutesfor",
    "penaltyminutesagainst",
];

const GOALIE_COUNTS: &[&str] = &[
    "goals",
    "xgoals",
    "ongoal",
    "unblocked_shot_attempts",
    "lowdangergoals",
    "mediumdangergoals",
    "highdangergoals",
    "lowdangershots",
    "mediumdangershots",
    "highdangershots",
];

/// A per-game dataset that gets trailing-window gold partitions.
#[derive(Debug, Clone, Copy)]
pub struct GoldSpec {
    pub key: &'static str,
    pub partition_keys: &'static [&'static str],
    pub count_cols: &'static [&'static str],
    /// Derived datasets follow the current season like rolling sources do.
    pub derived_rolling: bool,
    /// Rows whose partition key is empty are left out.
    pub skip_empty_keys: bool,
}

impl GoldSpec {
    const fn source(key: &'static str, partition_keys: &'static [&'static str], count_cols: &'static [&'static str]) -> Self {
        Self {
            key,
            partition_keys,
            count_cols,
            derived_rolling: false,
            skip_empty_keys: false,
        }
    }
}

pub const GOLD_SPECS: &[GoldSpec] = &[
    GoldSpec::source("gbg_skaters_hist_zip", PLAYER_KEYS, SKATER_COUNTS),
    GoldSpec::source("gbg_skaters_current_zip", PLAYER_KEYS, SKATER_COUNTS),
    GoldSpec::source("gbg_teams_all", TEAM_KEYS, TEAM_COUNTS),
    GoldSpec::source("gbg_goalies_hist_zip", PLAYER_KEYS, GOALIE_COUNTS),
    GoldSpec::source("gbg_goalies_current_zip", PLAYER_KEYS, GOALIE_COUNTS),
    GoldSpec {
        key: LINES_GAME_READY_KEY,
        partition_keys: LINE_KEYS,
        count_cols: LINE_COUNT_COLS,
        derived_rolling: true,
        skip_empty_keys: true,
    },
];

pub fn gold_spec(key: &str) -> Option<&'static GoldSpec> {
    GOLD_SPECS.iter().find(|s| s.key == key)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldStamp {
    pub run_id: String,
    pub built_at: String,
    pub dataset_key: String,
    pub situation: String,
    pub season: i64,
    pub strict_rolling: bool,
    pub rs_only_in_gold: bool,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GoldSummary {
    pub dataset_key: String,
    pub built: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub fn gold_partition_dir(gold_root: &Path, key: &str, situation: Situation, season: i64) -> PathBuf {
    situation_dir(&gold_root.join(key), situation).join(format!("season={season}"))
}

/// A partition is rebuilt when its output is missing, when forced, or when the
/// dataset follows the current season and the season is being refreshed.
pub fn partition_needs_build(
    output_exists: bool,
    force: bool,
    is_rolling: bool,
    season: i64,
    refresh_seasons: &BTreeSet<i32>,
) -> bool {
    if !output_exists || force {
        return true;
    }
    is_rolling && i32::try_from(season).is_ok_and(|s| refresh_seasons.contains(&s))
}

fn partition_filters(spec: &GoldSpec, columns: &[String], rs_only: bool) -> Vec<String> {
    let has = |name: &str| columns.iter().any(|c| c == name);
    let mut filters = Vec::new();
    if rs_only && has("gameid") {
        filters.push(format!("({})", rs_predicate_sql(has("playoffgame"))));
    }
    if spec.skip_empty_keys {
        for key in spec.partition_keys {
            filters.push(format!("COALESCE(CAST({} AS TEXT), '') <> ''", quote_ident(key)));
        }
    }
    filters
}

/// Runs the rolling plan over one (dataset, situation, season) slice.
pub fn build_partition(
    engine: &mut Engine,
    plan: &RollingPlan,
    spec: &GoldSpec,
    slice: &DataFrame,
    rs_only: bool,
) -> Result<DataFrame> {
    let columns = frame::names(slice);
    let bound = plan.bind(spec.key, &columns)?;
    if !bound.dropped.is_empty() {
        warn!(dataset = spec.key, dropped = ?bound.dropped, "count columns missing");
    }
    engine.load_frame(SOURCE_TABLE, slice)?;
    let sql = bound.to_sql(SOURCE_TABLE, &partition_filters(spec, &columns, rs_only));
    engine
        .query_frame(&sql)
        .with_context(|| format!("rolling sql for {}", spec.key))
}

fn seasons_of(df: &DataFrame) -> Result<BTreeMap<i64, DataFrame>> {
    Ok(frame::split_by(df, "season")?
        .into_iter()
        .filter_map(|(season, part)| Some((season?.parse::<i64>().ok()?, part)))
        .collect())
}

/// One situation's silver parts, split by season.
fn read_situation(parts: &[PathBuf]) -> Result<BTreeMap<i64, DataFrame>> {
    seasons_of(&store::read_frames(parts)?)
}

pub fn build_gold_for_dataset(cfg: &PipelineConfig, spec: &GoldSpec) -> Result<ManifestItem> {
    let base = cfg.paths.silver.join(spec.key);
    if !base.exists() {
        warn!(dataset = spec.key, "skip missing silver");
        return Ok(ManifestItem::new(spec.key, ItemStatus::MissingSilver));
    }

    let is_rolling = datasets::find(&cfg.datasets, spec.key).is_some_and(|d| d.is_rolling())
        || spec.derived_rolling;
    let force = cfg.refresh.gold.for_source(is_rolling);
    let plan = RollingPlan::new(spec.partition_keys, spec.count_cols, cfg.window_policy);
    let mut engine = Engine::open_in_memory(cfg.engine)?;
    let mut summary = GoldSummary {
        dataset_key: spec.key.to_string(),
        ..GoldSummary::default()
    };

    for situation in Situation::sorted_by_name() {
        let parts = fsutil::list_parts(&situation_dir(&base, situation));
        if parts.is_empty() {
            continue;
        }
        let seasons = match read_situation(&parts) {
            Ok(seasons) => seasons,
            Err(err) => {
                summary.failed += 1;
                error!(
                    dataset = spec.key,
                    situation = %situation,
                    error = %format!("{err:#}"),
                    "gold situation unreadable"
                );
                continue;
            }
        };
        for (season, slice) in seasons {
            let out_dir = gold_partition_dir(&cfg.paths.gold, spec.key, situation, season);
            let out_file = out_dir.join(store::part_file_name(0));
            if !partition_needs_build(out_file.exists(), force, is_rolling, season, &cfg.refresh_seasons) {
                summary.skipped += 1;
                continue;
            }

            let built = fsutil::reset_dir(&out_dir)
                .and_then(|_| build_partition(&mut engine, &plan, spec, &slice, cfg.rs_only_in_gold))
                .and_then(|out| {
                    store::write_frame(&out_file, &out)?;
                    write_json(
                        &out_dir.join(GOLD_STAMP),
                        &GoldStamp {
                            run_id: cfg.run_id.clone(),
                            built_at: utc_now_iso(),
                            dataset_key: spec.key.to_string(),
                            situation: situation.as_str().to_string(),
                            season,
                            strict_rolling: cfg.window_policy.is_strict(),
                            rs_only_in_gold: cfg.rs_only_in_gold,
                            rows: out.height(),
                        },
                    )?;
                    Ok(out.height())
                });
            match built {
                Ok(rows) => {
                    summary.built += 1;
                    info!(dataset = spec.key, situation = %situation, season, rows, "gold built");
                }
                Err(err) => {
                    summary.failed += 1;
                    error!(dataset = spec.key, situation = %situation, season, error = %format!("{err:#}"), "gold partition failed");
                }
            }
        }
    }

    Ok(ManifestItem::new(spec.key, ItemStatus::Ok)
        .with("built", summary.built)
        .with("skipped", summary.skipped)
        .with("failed", summary.failed))
}

pub fn gold_build_all(cfg: &PipelineConfig) -> Result<PathBuf> {
    let mut manifest = Manifest::new(&cfg.run_id);
    for spec in GOLD_SPECS {
        info!(dataset = spec.key, "build gold");
        let item = build_gold_for_dataset(cfg, spec).unwrap_or_else(|err| {
            error!(dataset = spec.key, error = %format!("{err:#}"), "gold dataset failed");
            ManifestItem::new(spec.key, ItemStatus::Failed).with("error", format!("{err:#}"))
        });
        manifest.push(item);
    }
    let path = manifest.write(&cfg.paths.logs, "gold")?;
    info!(manifest = %path.display(), "gold complete");
    Ok(path)
}

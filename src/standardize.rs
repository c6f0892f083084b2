use anyhow::Result;
use polars::prelude::DataFrame;
use rayon::prelude::*;

use crate::canon::{Situation, canonicalize_team, is_regular_season};
use crate::datasets::is_game_level_key;
use crate::frame;

const FRAGMENT_FIXES: &[(&str, &str)] = &[
    ("office_", "off_ice_"),
    ("onice_", "on_ice_"),
    ("penality", "penalty"),
];

const TYPO_COLUMNS: &[(&str, &str)] = &[
    ("penalitiesfor", "penaltiesfor"),
    ("penalitiesagainst", "penaltiesagainst"),
];

const TEAM_COLUMNS: &[&str] = &["team", "opp_team", "team_1", "team_row", "playerteam"];

pub const ID_COLUMNS: &[&str] = &["playerid", "goalieid", "gameid", "lineid"];

pub const PRIORITY_COLUMNS: &[&str] = &[
    "playerid",
    "goalieid",
    "lineid",
    "name",
    "season",
    "gamedate",
    "gameid",
    "team",
    "opp_team",
    "home_or_away",
    "position",
    "situation",
    "games_played",
    "TOI",
    "playoffgame",
    "source_file",
    "dataset_key",
    "data_level",
    "source_type",
];

pub fn build_pool(threads: usize) -> Option<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .ok()
}

pub fn with_pool<T>(pool: &Option<rayon::ThreadPool>, action: impl FnOnce() -> T + Send) -> T
where
    T: Send,
{
    if let Some(pool) = pool.as_ref() {
        pool.install(action)
    } else {
        action()
    }
}

/// Runs batch standardization on a bounded worker pool.
pub struct Standardizer {
    pool: Option<rayon::ThreadPool>,
    rs_only: bool,
}

impl Standardizer {
    pub fn new(threads: usize, rs_only: bool) -> Self {
        Self {
            pool: build_pool(threads),
            rs_only,
        }
    }

    pub fn standardize(&self, df: DataFrame, dataset_key: &str) -> Result<DataFrame> {
        let rs_only = self.rs_only;
        with_pool(&self.pool, move || standardize_columns(df, dataset_key, rs_only))
    }
}

fn fix_fragments(name: &str) -> String {
    FRAGMENT_FIXES
        .iter()
        .fold(name.to_string(), |acc, (from, to)| acc.replace(from, to))
}

fn canonicalize_team_column(df: &mut DataFrame, name: &str) -> Result<()> {
    if !frame::has_column(df, name) {
        return Ok(());
    }
    let values = frame::text_values(df, name)?
        .into_par_iter()
        .map(|v| v.map(|t| canonicalize_team(&t)))
        .collect();
    frame::set_column(df, frame::text_column(name, values))
}

/// Mask of rows that belong to the regular season. Frames without `gameid`
/// keep every row.
pub fn regular_season_mask(df: &DataFrame) -> Result<Vec<bool>> {
    if !frame::has_column(df, "gameid") {
        return Ok(vec![true; df.height()]);
    }
    let gameids = frame::text_values(df, "gameid")?;
    let flags = frame::has_column(df, "playoffgame")
        .then(|| frame::i64_values(df, "playoffgame"))
        .transpose()?;
    Ok(gameids
        .par_iter()
        .enumerate()
        .map(|(row, gid)| {
            let flag = flags.as_ref().map(|f| f[row].unwrap_or(0));
            is_regular_season(gid.as_deref().unwrap_or_default(), flag)
        })
        .collect())
}

/// Canonical column set for one batch: snake-case fixes, team codes, `TOI`
/// minutes, a single `gamedate`, recognized situations and, for per-game
/// datasets, regular-season rows only.
pub fn standardize_columns(df: DataFrame, dataset_key: &str, rs_only: bool) -> Result<DataFrame> {
    let mut df = df;

    for name in frame::names(&df) {
        let fixed = fix_fragments(&name);
        if fixed != name {
            frame::rename_or_drop(&mut df, &name, &fixed)?;
        }
    }
    for (typo, correct) in TYPO_COLUMNS {
        frame::rename_or_drop(&mut df, typo, correct)?;
    }

    if !frame::has_column(&df, "team") {
        frame::rename_or_drop(&mut df, "playerteam", "team")?;
    }
    frame::rename_or_drop(&mut df, "opposingteam", "opp_team")?;

    for name in TEAM_COLUMNS {
        canonicalize_team_column(&mut df, name)?;
    }
    frame::take_column(&mut df, "team_1");

    if frame::has_column(&df, "icetime") {
        let minutes = frame::f64_values(&df, "icetime")?
            .into_iter()
            .map(|s| s.map(|s| s / 60.0))
            .collect();
        frame::take_column(&mut df, "icetime");
        frame::set_column(&mut df, frame::float_column("TOI", minutes))?;
    }

    let date_source = if frame::has_column(&df, "gamedate_dt") {
        "gamedate_dt"
    } else {
        "gamedate"
    };
    if frame::has_column(&df, date_source) {
        let parsed = frame::date_values(&df, date_source)?;
        frame::take_column(&mut df, "gamedate_dt");
        frame::set_column(&mut df, frame::date_column("gamedate", parsed)?)?;
    }

    for name in ID_COLUMNS {
        if frame::has_column(&df, name) {
            let values = frame::text_values(&df, name)?;
            frame::set_column(&mut df, frame::text_column(name, values))?;
        }
    }

    if frame::has_column(&df, "situation") {
        let normalized: Vec<Option<String>> = frame::text_values(&df, "situation")?
            .into_iter()
            .map(|v| {
                v.and_then(|t| Situation::parse(&t))
                    .map(|s| s.as_str().to_string())
            })
            .collect();
        let keep: Vec<bool> = normalized.iter().map(Option::is_some).collect();
        frame::set_column(&mut df, frame::text_column("situation", normalized))?;
        df = frame::filter_rows(&df, &keep)?;
    }

    if rs_only && is_game_level_key(dataset_key) && frame::has_column(&df, "gameid") {
        let keep = regular_season_mask(&df)?;
        df = frame::filter_rows(&df, &keep)?;
    }

    frame::reorder(&df, PRIORITY_COLUMNS)
}

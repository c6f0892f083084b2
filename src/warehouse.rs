use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use polars::prelude::DataFrame;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use serde::Serialize;
use tracing::{info, warn};

use crate::canon::Situation;
use crate::config::PipelineConfig;
use crate::datasets::{LINES_GAME_READY_KEY, LINES_SEASON_READY_KEY};
use crate::engine::{Engine, quote_ident};
use crate::error::PipelineError;
use crate::frame;
use crate::fsutil;
use crate::store;

const SKATER_KEYS: &[&str] = &["gbg_skaters_hist_zip", "gbg_skaters_current_zip"];
const GOALIE_KEYS: &[&str] = &["gbg_goalies_hist_zip", "gbg_goalies_current_zip"];
const TEAM_KEYS: &[&str] = &["gbg_teams_all"];

pub const FACT_TABLES: &[&str] = &[
    "fact_skater_game",
    "fact_goalie_game",
    "fact_team_game",
    "fact_lines_game",
    "fact_lines_season",
];
pub const DIM_TABLES: &[&str] = &["dim_player", "dim_team", "dim_game", "dim_line_combo"];

#[derive(Debug, Clone, Serialize)]
pub struct WarehouseSummary {
    pub db_path: PathBuf,
    pub goalie_id_col: String,
    pub fact_rows: BTreeMap<String, usize>,
    pub dim_rows: BTreeMap<String, usize>,
}

/// `home`/`h`/`*home*` is 1, `away`/`a`/`*away*` is 0, anything else unknown.
pub fn home_away_flag(raw: &str) -> Option<i64> {
    let v = raw.to_lowercase();
    if v == "home" || v == "h" || v.contains("home") {
        Some(1)
    } else if v == "away" || v == "a" || v.contains("away") {
        Some(0)
    } else {
        None
    }
}

/// Gold parts of the given datasets, optionally limited to one situation.
pub fn gold_parts(gold_root: &Path, keys: &[&str], situation: Option<Situation>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for key in keys {
        let base = gold_root.join(key);
        let root = match situation {
            Some(sit) => base.join(format!("situation={sit}")),
            None => base,
        };
        out.extend(fsutil::list_parquet_recursive(&root).into_iter().filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("part_"))
        }));
    }
    out.sort();
    out
}

fn col_expr(columns: &[String], name: &str, sql_type: &str) -> String {
    if columns.iter().any(|c| c == name) {
        format!("CAST({} AS {sql_type})", quote_ident(name))
    } else {
        format!("CAST(NULL AS {sql_type})")
    }
}

fn load_required(engine: &mut Engine, table: &str, parts: &[PathBuf], dir: &Path) -> Result<usize> {
    if parts.is_empty() {
        return Err(PipelineError::MissingGold {
            relation: table.to_string(),
            dir: dir.to_path_buf(),
        }
        .into());
    }
    let df = store::read_frames(parts)?;
    engine.load_frame(table, &df)
}

fn load_optional(engine: &mut Engine, table: &str, parts: &[PathBuf]) -> Result<usize> {
    if parts.is_empty() {
        warn!(table, "no gold parts; creating empty relation");
        let empty = DataFrame::new(vec![frame::text_column("combo_key_team", Vec::new())])
            .context("empty lines rollup")?;
        return engine.load_frame(table, &empty);
    }
    let df = store::read_frames(parts)?;
    engine.load_frame(table, &df)
}

fn goalie_id_column(columns: &[String]) -> Result<&'static str> {
    ["playerid", "goalieid"]
        .into_iter()
        .find(|id| columns.iter().any(|c| c == id))
        .ok_or_else(|| {
            PipelineError::MissingColumn {
                relation: "fact_goalie_game".to_string(),
                column: "playerid|goalieid".to_string(),
            }
            .into()
        })
}

fn dim_player_sql(skater_cols: &[String], goalie_cols: &[String], goalie_id: &str) -> String {
    let sk = |name: &str, ty: &str| col_expr(skater_cols, name, ty);
    let go = |name: &str, ty: &str| col_expr(goalie_cols, name, ty);
    let gid = quote_ident(goalie_id);
    format!(
        "CREATE TABLE dim_player AS
WITH sk AS (
    SELECT CAST(\"playerid\" AS TEXT) AS playerid, {sk_name} AS name, {sk_pos} AS position,
           {sk_team} AS team, {sk_season} AS season, {sk_date} AS gamedate
    FROM fact_skater_game
    WHERE \"playerid\" IS NOT NULL AND CAST(\"playerid\" AS TEXT) <> ''
),
go AS (
    SELECT CAST({gid} AS TEXT) AS playerid, {go_name} AS name, 'G' AS position,
           {go_team} AS team, {go_season} AS season, {go_date} AS gamedate
    FROM fact_goalie_game
    WHERE {gid} IS NOT NULL AND CAST({gid} AS TEXT) <> ''
),
base AS (
    SELECT * FROM sk
    UNION ALL
    SELECT * FROM go
),
latest AS (
    SELECT playerid, name, position, team,
           ROW_NUMBER() OVER (PARTITION BY playerid ORDER BY COALESCE(gamedate, '1900-01-01') DESC) AS rn
    FROM base
),
agg AS (
    SELECT playerid, MIN(season) AS first_season, MAX(season) AS last_season,
           COUNT(*) AS fact_rows, COUNT(DISTINCT team) AS teams_seen
    FROM base
    GROUP BY playerid
)
SELECT agg.playerid, latest.name, latest.position, latest.team AS team_current,
       agg.first_season, agg.last_season, agg.fact_rows, agg.teams_seen
FROM agg
JOIN latest ON latest.playerid = agg.playerid AND latest.rn = 1
ORDER BY agg.playerid",
        sk_name = sk("name", "TEXT"),
        sk_pos = sk("position", "TEXT"),
        sk_team = sk("team", "TEXT"),
        sk_season = sk("season", "INTEGER"),
        sk_date = sk("gamedate", "TEXT"),
        go_name = go("name", "TEXT"),
        go_team = go("team", "TEXT"),
        go_season = go("season", "INTEGER"),
        go_date = go("gamedate", "TEXT"),
    )
}

fn dim_game_sql(team_cols: &[String]) -> String {
    let t = |name: &str, ty: &str| col_expr(team_cols, name, ty);
    format!(
        "CREATE TABLE dim_game AS
WITH t AS (
    SELECT CAST(\"gameid\" AS TEXT) AS gameid, {season} AS season, {date} AS gamedate,
           {team} AS team, home_flag({hoa}) AS is_home,
           {gf} AS goalsfor, {xgf} AS xgoalsfor
    FROM fact_team_game
    WHERE \"gameid\" IS NOT NULL
)
SELECT gameid,
       MAX(season) AS season,
       MAX(gamedate) AS gamedate,
       MAX(CASE WHEN is_home = 1 THEN team END) AS home_team,
       MAX(CASE WHEN is_home = 0 THEN team END) AS away_team,
       MAX(CASE WHEN is_home = 1 THEN goalsfor END) AS home_goals,
       MAX(CASE WHEN is_home = 0 THEN goalsfor END) AS away_goals,
       MAX(CASE WHEN is_home = 1 THEN xgoalsfor END) AS home_xgoals,
       MAX(CASE WHEN is_home = 0 THEN xgoalsfor END) AS away_xgoals
FROM t
GROUP BY gameid
ORDER BY gameid",
        season = t("season", "INTEGER"),
        date = t("gamedate", "TEXT"),
        team = t("team", "TEXT"),
        hoa = t("home_or_away", "TEXT"),
        gf = t("goalsfor", "INTEGER"),
        xgf = t("xgoalsfor", "REAL"),
    )
}

fn dim_line_combo_sql(season_cols: &[String], game_cols: &[String]) -> String {
    let arm = |cols: &[String], table: &str| {
        let c = |name: &str, ty: &str| col_expr(cols, name, ty);
        format!(
            "SELECT CAST(\"combo_key_team\" AS TEXT) AS combo_key_team, {ids} AS combo_key_ids,
           {team} AS team, {pos} AS position, {sit} AS situation,
           {season} AS season, {toi} AS TOI
    FROM {table}
    WHERE \"combo_key_team\" IS NOT NULL AND CAST(\"combo_key_team\" AS TEXT) <> ''",
            ids = c("combo_key_ids", "TEXT"),
            team = c("team", "TEXT"),
            pos = c("position", "TEXT"),
            sit = c("situation", "TEXT"),
            season = c("season", "INTEGER"),
            toi = c("TOI", "REAL"),
        )
    };
    format!(
        "CREATE TABLE dim_line_combo AS
WITH base AS (
    {season_arm}
    UNION ALL
    {game_arm}
),
latest AS (
    SELECT combo_key_team, combo_key_ids, team, position, situation,
           ROW_NUMBER() OVER (PARTITION BY combo_key_team ORDER BY season DESC) AS rn
    FROM base
),
agg AS (
    SELECT combo_key_team, MIN(season) AS first_season, MAX(season) AS last_season,
           COUNT(*) AS fact_rows, SUM(COALESCE(TOI, 0)) AS toi_total
    FROM base
    GROUP BY combo_key_team
)
SELECT agg.combo_key_team, latest.combo_key_ids, latest.team, latest.position, latest.situation,
       agg.first_season, agg.last_season, agg.fact_rows, agg.toi_total
FROM agg
JOIN latest ON latest.combo_key_team = agg.combo_key_team AND latest.rn = 1
ORDER BY agg.combo_key_team",
        season_arm = arm(season_cols, "fact_lines_season"),
        game_arm = arm(game_cols, "fact_lines_game"),
    )
}

fn register_functions(engine: &Engine) -> Result<()> {
    engine
        .conn()
        .create_scalar_function(
            "home_flag",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let flag = match ctx.get_raw(0) {
                    ValueRef::Text(raw) => std::str::from_utf8(raw).ok().and_then(home_away_flag),
                    _ => None,
                };
                Ok(flag)
            },
        )
        .context("register home_flag")
}

fn index_facts(engine: &Engine) -> Result<()> {
    for table in FACT_TABLES {
        let cols = engine.table_columns(table)?;
        if cols.iter().any(|c| c == "season") && cols.iter().any(|c| c == "situation") {
            engine
                .conn()
                .execute_batch(&format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} (season, situation);",
                    quote_ident(&format!("idx_{table}_season_situation")),
                    quote_ident(table)
                ))
                .with_context(|| format!("index {table}"))?;
        }
    }
    Ok(())
}

fn count_rows(engine: &Engine, table: &str) -> Result<usize> {
    let n: i64 = engine
        .conn()
        .query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), [], |row| row.get(0))
        .with_context(|| format!("count {table}"))?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Rebuilds the warehouse file at `db_path` from the gold tree.
pub fn build_warehouse(cfg: &PipelineConfig, db_path: &Path) -> Result<WarehouseSummary> {
    let gold = &cfg.paths.gold;
    let skater_parts = gold_parts(gold, SKATER_KEYS, Some(Situation::All));
    let goalie_parts = gold_parts(gold, GOALIE_KEYS, Some(Situation::All));
    let team_parts = gold_parts(gold, TEAM_KEYS, Some(Situation::All));
    let lines_game_parts = gold_parts(gold, &[LINES_GAME_READY_KEY], None);
    let lines_season_parts = gold_parts(gold, &[LINES_SEASON_READY_KEY], None);
    info!(
        skaters = skater_parts.len(),
        goalies = goalie_parts.len(),
        teams = team_parts.len(),
        lines_game = lines_game_parts.len(),
        lines_season = lines_season_parts.len(),
        "gold parts found"
    );

    if db_path.exists() {
        fs::remove_file(db_path).with_context(|| format!("remove {}", db_path.display()))?;
    }
    let mut engine = Engine::open(db_path, cfg.engine)?;
    engine
        .conn()
        .execute_batch("PRAGMA journal_mode = WAL;")
        .context("set journal mode")?;
    register_functions(&engine)?;

    let mut fact_rows = BTreeMap::new();
    fact_rows.insert(
        "fact_skater_game".to_string(),
        load_required(&mut engine, "fact_skater_game", &skater_parts, gold)?,
    );
    fact_rows.insert(
        "fact_goalie_game".to_string(),
        load_required(&mut engine, "fact_goalie_game", &goalie_parts, gold)?,
    );
    fact_rows.insert(
        "fact_team_game".to_string(),
        load_required(&mut engine, "fact_team_game", &team_parts, gold)?,
    );
    fact_rows.insert(
        "fact_lines_game".to_string(),
        load_optional(&mut engine, "fact_lines_game", &lines_game_parts)?,
    );
    fact_rows.insert(
        "fact_lines_season".to_string(),
        load_optional(&mut engine, "fact_lines_season", &lines_season_parts)?,
    );

    let skater_cols = engine.table_columns("fact_skater_game")?;
    let goalie_cols = engine.table_columns("fact_goalie_game")?;
    let team_cols = engine.table_columns("fact_team_game")?;
    let lines_game_cols = engine.table_columns("fact_lines_game")?;
    let lines_season_cols = engine.table_columns("fact_lines_season")?;
    let goalie_id = goalie_id_column(&goalie_cols)?;
    if !skater_cols.iter().any(|c| c == "playerid") {
        return Err(PipelineError::MissingColumn {
            relation: "fact_skater_game".to_string(),
            column: "playerid".to_string(),
        }
        .into());
    }
    if !team_cols.iter().any(|c| c == "gameid") {
        return Err(PipelineError::MissingColumn {
            relation: "fact_team_game".to_string(),
            column: "gameid".to_string(),
        }
        .into());
    }
    info!(goalie_id, "goalie id column");

    let conn = engine.conn();
    conn.execute_batch(&dim_player_sql(&skater_cols, &goalie_cols, goalie_id))
        .context("build dim_player")?;
    let dim_team = if team_cols.iter().any(|c| c == "team") {
        "CREATE TABLE dim_team AS
         SELECT DISTINCT CAST(\"team\" AS TEXT) AS team FROM fact_team_game
         WHERE \"team\" IS NOT NULL AND CAST(\"team\" AS TEXT) <> ''
         ORDER BY team"
    } else {
        "CREATE TABLE dim_team (team TEXT)"
    };
    conn.execute_batch(dim_team).context("build dim_team")?;
    conn.execute_batch(&dim_game_sql(&team_cols))
        .context("build dim_game")?;
    conn.execute_batch(&dim_line_combo_sql(&lines_season_cols, &lines_game_cols))
        .context("build dim_line_combo")?;
    index_facts(&engine)?;

    let mut dim_rows = BTreeMap::new();
    for table in DIM_TABLES {
        dim_rows.insert(table.to_string(), count_rows(&engine, table)?);
    }
    info!(db = %db_path.display(), ?dim_rows, "warehouse built");

    Ok(WarehouseSummary {
        db_path: db_path.to_path_buf(),
        goalie_id_col: goalie_id.to_string(),
        fact_rows,
        dim_rows,
    })
}

pub fn warehouse_build(cfg: &PipelineConfig) -> Result<WarehouseSummary> {
    build_warehouse(cfg, &cfg.paths.warehouse_db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_away_flags() {
        assert_eq!(home_away_flag("HOME"), Some(1));
        assert_eq!(home_away_flag("h"), Some(1));
        assert_eq!(home_away_flag("at_home"), Some(1));
        assert_eq!(home_away_flag("Away"), Some(0));
        assert_eq!(home_away_flag("a"), Some(0));
        assert_eq!(home_away_flag("neutral"), None);
        assert_eq!(home_away_flag(""), None);
    }

    #[test]
    fn missing_columns_project_as_null() {
        let cols = vec!["team".to_string()];
        assert_eq!(col_expr(&cols, "team", "TEXT"), "CAST(\"team\" AS TEXT)");
        assert_eq!(col_expr(&cols, "home_or_away", "TEXT"), "CAST(NULL AS TEXT)");
    }

    #[test]
    fn goalie_id_detection() {
        let with_goalieid = vec!["goalieid".to_string(), "name".to_string()];
        assert_eq!(goalie_id_column(&with_goalieid).expect("id"), "goalieid");
        let both = vec!["goalieid".to_string(), "playerid".to_string()];
        assert_eq!(goalie_id_column(&both).expect("id"), "playerid");
        assert!(goalie_id_column(&["name".to_string()]).is_err());
    }
}

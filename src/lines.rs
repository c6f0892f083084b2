use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::canon::{
    Situation, canonicalize_team, combination_ids_key, combination_key, decode_combination_ids,
    expected_unit_size, per60,
};
use crate::config::PipelineConfig;
use crate::datasets::{LINES_GAME_READY_KEY, LINES_SEASON_READY_KEY};
use crate::error::PipelineError;
use crate::frame;
use crate::fsutil;
use crate::manifest::{ItemStatus, Manifest, ManifestItem, utc_now_iso, write_json};
use crate::silver::{self, situation_dir};
use crate::standardize::regular_season_mask;
use crate::store;

pub const LINE_COUNT_COLS: &[&str] = &[
    "xgoalsfor",
    "xgoalsagainst",
    "goalsfor",
    "goalsagainst",
    "shotsongoalfor",
    "shotsongoalagainst",
    "shotattemptsfor",
    "shotattemptsagainst",
    "unblockedshotattemptsfor",
    "unblockedshotattemptsagainst",
    "highdangershotsfor",
    "highdangershotsagainst",
    "mediumdangershotsfor",
    "mediumdangershotsagainst",
    "lowdangershotsfor",
    "lowdangershotsagainst",
    "penaltiesfor",
    "penaltiesagainst",
    "penaltyminutesfor",
    "penaltyminutesagainst",
];

pub const LINE_PCT_COLS: &[&str] = &["xgoalspercentage", "corsipercentage", "fenwickpercentage"];

const LINE_ID_COLS: &[&str] = &[
    "lineid",
    "name",
    "gameid",
    "season",
    "team",
    "opp_team",
    "home_or_away",
    "gamedate",
    "position",
    "situation",
    "TOI",
];

const LINE_FLAG_COLS: &[&str] = &["playoffgame"];

const ROLLUP_KEYS: &[&str] = &[
    "season",
    "team",
    "situation",
    "position",
    "combo_key_team",
    "combo_key_ids",
];

const LINE_SOURCES: &[&str] = &["gbg_lines_hist_zip", "gbg_lines_current_zip"];
const SKATER_SOURCES: &[&str] = &["gbg_skaters_hist_zip", "gbg_skaters_current_zip"];

/// Every column a line-game row may carry, in output order.
pub fn line_columns() -> Vec<&'static str> {
    LINE_ID_COLS
        .iter()
        .chain(LINE_COUNT_COLS)
        .chain(LINE_PCT_COLS)
        .chain(LINE_FLAG_COLS)
        .copied()
        .collect()
}

pub type NameLookup = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct LinesResolution {
    pub game: DataFrame,
    pub rollup: DataFrame,
    pub mapping_ok_rate: f64,
}

fn text_or_blank(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    Ok(frame::text_values(df, name)?
        .into_iter()
        .map(Option::unwrap_or_default)
        .collect())
}

fn text_column(name: &str, values: Vec<String>) -> Column {
    frame::text_column(name, values.into_iter().map(Some).collect())
}

/// Decorates one season of line-game rows with decoded member ids, names,
/// combination keys and per-60 rates, and rolls mapped rows up to season level.
pub fn resolve(lines: &DataFrame, names: &NameLookup) -> Result<LinesResolution> {
    if !frame::has_column(lines, "lineid") {
        return Err(PipelineError::MissingColumn {
            relation: LINES_GAME_READY_KEY.to_string(),
            column: "lineid".to_string(),
        }
        .into());
    }
    let mut df = frame::select_present(lines, &line_columns())?;
    if frame::has_column(&df, "gameid") {
        let mask = regular_season_mask(&df)?;
        df = frame::filter_rows(&df, &mask)?;
    }
    let rows = df.height();

    let lineids = text_or_blank(&df, "lineid")?;
    frame::set_column(&mut df, text_column("lineid", lineids.clone()))?;
    for name in ["team", "opp_team"] {
        if frame::has_column(&df, name) {
            let values = frame::text_values(&df, name)?
                .into_iter()
                .map(|v| v.map(|t| canonicalize_team(&t)))
                .collect();
            frame::set_column(&mut df, frame::text_column(name, values))?;
        }
    }
    if frame::has_column(&df, "gamedate") {
        let dates = frame::date_values(&df, "gamedate")?;
        frame::set_column(&mut df, frame::date_column("gamedate", dates)?)?;
    }
    let positions = if frame::has_column(&df, "position") {
        text_or_blank(&df, "position")?
    } else {
        vec!["line".to_string(); rows]
    };
    frame::set_column(&mut df, text_column("position", positions.clone()))?;
    let teams = text_or_blank(&df, "team")?;

    let mut size_label = Vec::with_capacity(rows);
    let mut ids_n = Vec::with_capacity(rows);
    let mut member_ids: [Vec<String>; 3] = Default::default();
    let mut member_names: [Vec<String>; 3] = Default::default();
    let mut mapping_ok = Vec::with_capacity(rows);
    let mut key_ids = Vec::with_capacity(rows);
    let mut key_team = Vec::with_capacity(rows);

    for row in 0..rows {
        let expected = expected_unit_size(&positions[row]);
        let ids = decode_combination_ids(&lineids[row]);
        let ok = ids.len() == expected && (2..=3).contains(&expected);

        for slot in 0..3 {
            let id = ids.get(slot).cloned().unwrap_or_default();
            let name = names.get(&id).cloned().unwrap_or_default();
            member_ids[slot].push(id);
            member_names[slot].push(name);
        }
        let (kid, kteam) = if ok {
            (
                combination_ids_key(&ids).unwrap_or_default(),
                combination_key(&teams[row], &positions[row], &ids).unwrap_or_default(),
            )
        } else {
            (String::new(), String::new())
        };
        size_label.push(Some(expected as i64));
        ids_n.push(Some(ids.len() as i64));
        mapping_ok.push(Some(i64::from(ok)));
        key_ids.push(kid);
        key_team.push(kteam);
    }

    let ok_count = mapping_ok.iter().filter(|v| **v == Some(1)).count();
    let [id1, id2, id3] = member_ids;
    let [n1, n2, n3] = member_names;
    for column in [
        frame::int_column("combo_size_label", size_label),
        frame::int_column("ids_n", ids_n),
        text_column("p1_id", id1),
        text_column("p2_id", id2),
        text_column("p3_id", id3),
        frame::int_column("mapping_ok", mapping_ok),
        text_column("p1_name", n1),
        text_column("p2_name", n2),
        text_column("p3_name", n3),
        text_column("combo_key_ids", key_ids),
        text_column("combo_key_team", key_team),
    ] {
        frame::set_column(&mut df, column)?;
    }

    let toi = frame::f64_values(&df, "TOI")?;
    if frame::has_column(&df, "TOI") {
        frame::set_column(&mut df, frame::float_column("TOI", toi.clone()))?;
    }
    for stat in LINE_COUNT_COLS {
        if !frame::has_column(&df, stat) {
            continue;
        }
        let values = frame::f64_values(&df, stat)?;
        let rates = values.iter().zip(&toi).map(|(v, t)| per60(*v, *t)).collect();
        frame::set_column(&mut df, frame::float_column(stat, values))?;
        frame::set_column(&mut df, frame::float_column(&format!("{stat}_per60"), rates))?;
    }

    let mapping_ok_rate = if rows == 0 { 0.0 } else { ok_count as f64 / rows as f64 };
    let rollup = season_rollup(&df)?;
    Ok(LinesResolution {
        game: df,
        rollup,
        mapping_ok_rate,
    })
}

fn null_float() -> Expr {
    lit(NULL).cast(DataType::Float64)
}

/// Groups mapped rows by combination and sums volumes; percentage columns are
/// TOI-weighted averages over rows where both value and TOI are present.
pub fn season_rollup(game: &DataFrame) -> Result<DataFrame> {
    let counts: Vec<&str> = LINE_COUNT_COLS
        .iter()
        .copied()
        .filter(|c| frame::has_column(game, c))
        .collect();
    let pcts: Vec<&str> = LINE_PCT_COLS
        .iter()
        .copied()
        .filter(|c| frame::has_column(game, c))
        .collect();

    let ok = frame::i64_values(game, "mapping_ok")?;
    let keys = frame::text_values(game, "combo_key_team")?;
    let keep: Vec<bool> = ok
        .iter()
        .zip(&keys)
        .map(|(ok, key)| *ok == Some(1) && key.as_deref().is_some_and(|k| !k.is_empty()))
        .collect();
    let mut mapped = frame::filter_rows(game, &keep)?;
    for k in ROLLUP_KEYS {
        if !frame::has_column(&mapped, k) {
            let blank = frame::text_column(k, vec![None; mapped.height()]);
            frame::set_column(&mut mapped, blank)?;
        }
    }
    if !frame::has_column(&mapped, "TOI") {
        let blank = frame::float_column("TOI", vec![None; mapped.height()]);
        frame::set_column(&mut mapped, blank)?;
    }

    let toi = || col("TOI").cast(DataType::Float64);
    let mut aggs = vec![toi().fill_null(lit(0.0)).sum().alias("TOI")];
    for c in &counts {
        aggs.push(col(*c).cast(DataType::Float64).fill_null(lit(0.0)).sum().alias(*c));
    }
    for c in &pcts {
        let value = col(*c).cast(DataType::Float64);
        let both = value.clone().is_not_null().and(toi().is_not_null());
        let num = (value * toi()).filter(both.clone()).sum();
        let den = toi().filter(both).sum();
        aggs.push(
            when(den.clone().gt(lit(0.0)))
                .then(num / den)
                .otherwise(null_float())
                .alias(*c),
        );
    }
    let rates: Vec<Expr> = counts
        .iter()
        .map(|c| {
            when(col("TOI").gt(lit(0.0)))
                .then(col(*c) / col("TOI") * lit(60.0))
                .otherwise(null_float())
                .alias(format!("{c}_per60"))
        })
        .collect();
    let group_keys: Vec<Expr> = ROLLUP_KEYS.iter().map(|k| col(*k)).collect();

    mapped
        .lazy()
        .group_by_stable(group_keys)
        .agg(aggs)
        .with_columns(rates)
        .collect()
        .context("season rollup")
}

#[derive(Debug, Clone)]
struct NameSeen {
    gamedate: Option<NaiveDate>,
    name: String,
}

/// Records `name` for a player unless the name already held comes from a
/// strictly later game. Rows without a date, and ties, take over.
fn merge_name(
    seen: &mut HashMap<i64, HashMap<String, NameSeen>>,
    season: i64,
    playerid: String,
    gamedate: Option<NaiveDate>,
    name: String,
) {
    let slot = seen.entry(season).or_default();
    let newer = match slot.get(&playerid) {
        Some(NameSeen {
            gamedate: Some(held),
            ..
        }) => gamedate.is_none_or(|d| d >= *held),
        _ => true,
    };
    if newer {
        slot.insert(playerid, NameSeen { gamedate, name });
    }
}

/// playerid -> name per season, from the silver skater partitions. Players
/// who changed names carry the one from their latest game.
pub fn build_name_lookup(cfg: &PipelineConfig) -> Result<HashMap<i64, NameLookup>> {
    let mut parts: Vec<PathBuf> = Vec::new();
    for sit in Situation::sorted_by_name() {
        for key in SKATER_SOURCES {
            parts.extend(silver::silver_parts(cfg, key, sit));
        }
    }
    parts.sort();
    parts.dedup();
    if parts.is_empty() {
        return Err(anyhow!(
            "no silver skater partitions under {} (needed for line names)",
            cfg.paths.silver.display()
        ));
    }

    let mut seen: HashMap<i64, HashMap<String, NameSeen>> = HashMap::new();
    for part in &parts {
        let df = store::read_frame_columns(part, &["playerid", "name", "season", "gamedate"])?;
        let seasons = frame::i64_values(&df, "season")?;
        let pids = frame::text_values(&df, "playerid")?;
        let names = frame::text_values(&df, "name")?;
        let dates = frame::date_values(&df, "gamedate")?;
        for (((season, pid), name), date) in seasons.into_iter().zip(pids).zip(names).zip(dates) {
            let (Some(season), Some(pid), Some(name)) = (season, pid, name) else {
                continue;
            };
            merge_name(&mut seen, season, pid, date, name);
        }
    }
    Ok(seen
        .into_iter()
        .map(|(season, players)| {
            let lookup = players.into_iter().map(|(pid, s)| (pid, s.name)).collect();
            (season, lookup)
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct LinesPartition {
    pub situation: String,
    pub season: i64,
    pub rows_game: usize,
    pub rows_rollup: usize,
    pub mapping_ok_rate: f64,
    pub out_silver_part: String,
    pub out_gold_rollup: String,
}

pub fn build_lines_ready(cfg: &PipelineConfig) -> Result<PathBuf> {
    let mut manifest = Manifest::new(&cfg.run_id);
    let names = build_name_lookup(cfg)?;
    let empty = NameLookup::new();

    let game_base = cfg.paths.silver.join(LINES_GAME_READY_KEY);
    let rollup_base = cfg.paths.gold.join(LINES_SEASON_READY_KEY);

    for sit in Situation::sorted_by_name() {
        let mut parts: Vec<PathBuf> = LINE_SOURCES
            .iter()
            .flat_map(|key| silver::silver_parts(cfg, key, sit))
            .collect();
        parts.sort();
        parts.dedup();
        if parts.is_empty() {
            continue;
        }
        let all = store::read_frames(&parts)?;
        let mut by_season: BTreeMap<i64, DataFrame> = BTreeMap::new();
        for (season, part) in frame::split_by(&all, "season")? {
            if let Some(season) = season.and_then(|s| s.parse::<i64>().ok()) {
                by_season.insert(season, part);
            }
        }

        for (season, season_rows) in by_season {
            if season_rows.height() == 0 {
                continue;
            }
            let lookup = names.get(&season).unwrap_or(&empty);
            let res = resolve(&season_rows, lookup)
                .with_context(|| format!("lines {sit} season={season}"))?;

            let game_file = situation_dir(&game_base, sit).join(format!("part_season_{season}.parquet"));
            store::write_frame(&game_file, &res.game)?;

            let roll_dir = situation_dir(&rollup_base, sit).join(format!("season={season}"));
            fsutil::reset_dir(&roll_dir)?;
            let roll_file = roll_dir.join(store::part_file_name(0));
            store::write_frame(&roll_file, &res.rollup)?;
            write_json(
                &roll_dir.join(crate::gold::GOLD_STAMP),
                &serde_json::json!({
                    "run_id": cfg.run_id,
                    "built_at": utc_now_iso(),
                    "dataset_key": LINES_SEASON_READY_KEY,
                    "situation": sit.as_str(),
                    "season": season,
                    "note": "TOI-summed volumes + TOI-weighted pct columns; per60 computed",
                }),
            )?;

            info!(
                situation = %sit,
                season,
                rows = res.game.height(),
                mapping_ok = %format!("{:.1}%", res.mapping_ok_rate * 100.0),
                "lines ready"
            );
            let item = LinesPartition {
                situation: sit.as_str().to_string(),
                season,
                rows_game: res.game.height(),
                rows_rollup: res.rollup.height(),
                mapping_ok_rate: res.mapping_ok_rate,
                out_silver_part: game_file.display().to_string(),
                out_gold_rollup: roll_file.display().to_string(),
            };
            manifest.push(
                ManifestItem::new(LINES_GAME_READY_KEY, ItemStatus::Built)
                    .with("situation", &item.situation)
                    .with("season", item.season)
                    .with("rows_game", item.rows_game)
                    .with("rows_rollup", item.rows_rollup)
                    .with("mapping_ok_rate", item.mapping_ok_rate)
                    .with("out_silver_part", &item.out_silver_part)
                    .with("out_gold_rollup", &item.out_gold_rollup),
            );
        }
    }

    let path = manifest.write(&cfg.paths.logs, "lines_ready")?;
    info!(manifest = %path.display(), "lines ready complete");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{f64_at, float_column, i64_at, int_column, text_at};
    use approx::assert_relative_eq;

    fn texts(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|s| Some(s.to_string())).collect()
    }

    fn line_rows(lineids: &[&str], positions: &[&str], toi: &[f64], xg_pct: &[f64]) -> DataFrame {
        let n = lineids.len();
        DataFrame::new(vec![
            frame::text_column("lineid", texts(lineids)),
            int_column("season", vec![Some(2024); n]),
            frame::text_column("team", vec![Some("T.B".into()); n]),
            frame::text_column("situation", vec![Some("5v5".into()); n]),
            frame::text_column("position", texts(positions)),
            frame::text_column(
                "gameid",
                (0..n).map(|i| Some(format!("20240200{:02}", i + 1))).collect(),
            ),
            float_column("TOI", toi.iter().map(|v| Some(*v)).collect()),
            float_column("goalsfor", vec![Some(1.0); n]),
            float_column("xgoalspercentage", xg_pct.iter().map(|v| Some(*v)).collect()),
        ])
        .expect("frame")
    }

    #[test]
    fn unmapped_rows_stay_in_game_output_only() {
        let df = line_rows(
            &["84712148471215", "847121484712158471216"],
            &["pair", "pair"],
            &[10.0, 5.0],
            &[0.5, 0.5],
        );
        let res = resolve(&df, &NameLookup::new()).expect("resolve");
        assert_eq!(res.game.height(), 2);
        assert_eq!(i64_at(&res.game, "mapping_ok", 1), Some(0));
        assert_eq!(text_at(&res.game, "combo_key_team", 1).as_deref(), Some(""));
        assert_eq!(
            text_at(&res.game, "combo_key_team", 0).as_deref(),
            Some("TBL__pair__8471214-8471215")
        );
        assert_eq!(res.rollup.height(), 1);
        assert_relative_eq!(res.mapping_ok_rate, 0.5);
    }

    #[test]
    fn names_attach_and_unknown_ids_are_blank() {
        let df = line_rows(&["84712148471215"], &["pair"], &[10.0], &[0.5]);
        let names: NameLookup = [("8471214".to_string(), "Jane Doe".to_string())].into();
        let res = resolve(&df, &names).expect("resolve");
        assert_eq!(text_at(&res.game, "p1_name", 0).as_deref(), Some("Jane Doe"));
        assert_eq!(text_at(&res.game, "p2_name", 0).as_deref(), Some(""));
        assert_eq!(text_at(&res.game, "p3_id", 0).as_deref(), Some(""));
    }

    #[test]
    fn toi_weighted_percentages() {
        let df = line_rows(
            &["847121484712158471216", "847121684712148471215", "847121584712168471214"],
            &["line", "line", "line"],
            &[10.0, 20.0, 30.0],
            &[0.40, 0.50, 0.60],
        );
        let res = resolve(&df, &NameLookup::new()).expect("resolve");
        assert_eq!(res.rollup.height(), 1);
        let xg = f64_at(&res.rollup, "xgoalspercentage", 0).expect("xg pct");
        assert_relative_eq!(xg, 32.0 / 60.0, epsilon = 1e-12);
        assert_relative_eq!(f64_at(&res.rollup, "TOI", 0).expect("toi"), 60.0);
        assert_relative_eq!(f64_at(&res.rollup, "goalsfor_per60", 0).expect("per60"), 3.0);
        assert_eq!(text_at(&res.rollup, "team", 0).as_deref(), Some("TBL"));
    }

    #[test]
    fn zero_toi_has_no_rate() {
        let df = line_rows(&["84712148471215"], &["pair"], &[0.0], &[0.5]);
        let res = resolve(&df, &NameLookup::new()).expect("resolve");
        assert_eq!(f64_at(&res.game, "goalsfor_per60", 0), None);
        assert_eq!(f64_at(&res.rollup, "xgoalspercentage", 0), None);
        assert_eq!(f64_at(&res.rollup, "goalsfor_per60", 0), None);
    }

    #[test]
    fn missing_lineid_is_an_error() {
        let df = DataFrame::new(vec![int_column("season", vec![Some(2024)])]).expect("frame");
        assert!(resolve(&df, &NameLookup::new()).is_err());
    }

    #[test]
    fn latest_game_name_wins() {
        let day = |d: u32| NaiveDate::from_ymd_opt(2024, 10, d);
        let mut seen = HashMap::new();
        merge_name(&mut seen, 2024, "1".into(), day(20), "New Name".into());
        merge_name(&mut seen, 2024, "1".into(), day(10), "Old Name".into());
        assert_eq!(seen[&2024]["1"].name, "New Name");

        merge_name(&mut seen, 2024, "1".into(), day(20), "Same Day".into());
        assert_eq!(seen[&2024]["1"].name, "Same Day");

        merge_name(&mut seen, 2024, "2".into(), None, "Undated".into());
        merge_name(&mut seen, 2024, "2".into(), None, "Undated Later".into());
        assert_eq!(seen[&2024]["2"].name, "Undated Later");

        merge_name(&mut seen, 2023, "1".into(), day(1), "Other Season".into());
        assert_eq!(seen[&2024]["1"].name, "Same Day");
    }
}

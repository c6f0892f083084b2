use std::path::Path;

use approx::assert_relative_eq;
use chrono::NaiveDate;
use polars::prelude::DataFrame;

use nhl_warehouse::canon::Situation;
use nhl_warehouse::config::PipelineConfig;
use nhl_warehouse::datasets::{LINES_GAME_READY_KEY, LINES_SEASON_READY_KEY};
use nhl_warehouse::frame::{
    date_column, float_column, i64_at, int_column, text_at, text_column,
};
use nhl_warehouse::gold::{self, GOLD_STAMP, GoldStamp};
use nhl_warehouse::lines;
use nhl_warehouse::manifest::read_json;
use nhl_warehouse::silver::situation_dir;
use nhl_warehouse::store;

fn config(root: &Path) -> PipelineConfig {
    let today = NaiveDate::from_ymd_opt(2025, 1, 15).expect("date");
    let cfg = PipelineConfig::new(&root.join("data"), &root.join("local"), today);
    cfg.paths.ensure().expect("dirs");
    cfg
}

fn texts(values: &[&str]) -> Vec<Option<String>> {
    values.iter().map(|s| Some(s.to_string())).collect()
}

/// Skater names for both BOS defenders. A second, later-sorted part carries an
/// older spelling from an earlier game, which must not replace the current one.
fn write_skater_names(cfg: &PipelineConfig) {
    let day = |d: u32| NaiveDate::from_ymd_opt(2024, 10, d);
    let dir = situation_dir(&cfg.paths.silver.join("gbg_skaters_current_zip"), Situation::All);
    let current = DataFrame::new(vec![
        text_column("playerid", texts(&["8471214", "8471215"])),
        text_column("name", texts(&["Brad Marchand", "Charlie McAvoy"])),
        int_column("season", vec![Some(2024), Some(2024)]),
        date_column("gamedate", vec![day(20), day(20)]).expect("dates"),
        text_column("situation", texts(&["all", "all"])),
    ])
    .expect("frame");
    store::write_frame(&dir.join(store::part_file_name(0)), &current).expect("write skaters");
    let older = DataFrame::new(vec![
        text_column("playerid", texts(&["8471214"])),
        text_column("name", texts(&["B. Marchand"])),
        int_column("season", vec![Some(2024)]),
        date_column("gamedate", vec![day(2)]).expect("dates"),
        text_column("situation", texts(&["all"])),
    ])
    .expect("frame");
    store::write_frame(&dir.join(store::part_file_name(1)), &older).expect("write skaters");
}

/// Two regular-season games for one BOS pair, member order flipped between
/// games, plus a playoff game that must not survive.
fn write_bos_pair(cfg: &PipelineConfig) {
    let date = |d: u32| NaiveDate::from_ymd_opt(2024, 10, d);
    let df = DataFrame::new(vec![
        text_column("lineid", texts(&["84712148471215", "84712158471214", "84712148471215"])),
        text_column("name", vec![Some("Marchand-McAvoy".into()); 3]),
        text_column("gameid", texts(&["2024020001", "2024020015", "2024030111"])),
        int_column("season", vec![Some(2024); 3]),
        text_column("team", vec![Some("BOS".into()); 3]),
        text_column("position", vec![Some("pair".into()); 3]),
        text_column("situation", vec![Some("5v5".into()); 3]),
        date_column("gamedate", vec![date(10), date(14), date(20)]).expect("dates"),
        float_column("TOI", vec![Some(15.0), Some(25.0), Some(30.0)]),
        float_column("goalsfor", vec![Some(1.0), Some(2.0), Some(5.0)]),
        float_column("xgoalspercentage", vec![Some(0.4), Some(0.6), Some(0.9)]),
    ])
    .expect("frame");
    let dir = situation_dir(&cfg.paths.silver.join("gbg_lines_current_zip"), Situation::FiveOnFive);
    store::write_frame(&dir.join(store::part_file_name(0)), &df).expect("write lines");
}

fn f64_at(df: &DataFrame, name: &str, row: usize) -> f64 {
    nhl_warehouse::frame::f64_at(df, name, row).unwrap_or(f64::NAN)
}

#[test]
fn bos_pair_rolls_up_to_one_combination() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    write_skater_names(&cfg);
    write_bos_pair(&cfg);

    let manifest = lines::build_lines_ready(&cfg).expect("lines ready");
    assert!(manifest.exists());

    let game_file = situation_dir(&cfg.paths.silver.join(LINES_GAME_READY_KEY), Situation::FiveOnFive)
        .join("part_season_2024.parquet");
    let game = store::read_frame(&game_file).expect("game rows");
    assert_eq!(game.height(), 2);
    for row in 0..game.height() {
        assert_eq!(i64_at(&game, "mapping_ok", row), Some(1));
        assert_eq!(
            text_at(&game, "combo_key_team", row).as_deref(),
            Some("BOS__pair__8471214-8471215")
        );
    }
    let names: Vec<String> = ["p1_name", "p2_name"]
        .iter()
        .filter_map(|c| text_at(&game, c, 0))
        .collect();
    assert_eq!(names, vec!["Brad Marchand", "Charlie McAvoy"]);
    assert_relative_eq!(f64_at(&game, "goalsfor_per60", 0), 4.0);

    let roll_dir = situation_dir(&cfg.paths.gold.join(LINES_SEASON_READY_KEY), Situation::FiveOnFive)
        .join("season=2024");
    let rollup = store::read_frame(&roll_dir.join("part_00000.parquet")).expect("rollup");
    assert_eq!(rollup.height(), 1);
    assert_relative_eq!(f64_at(&rollup, "TOI", 0), 40.0);
    assert_relative_eq!(f64_at(&rollup, "goalsfor", 0), 3.0);
    assert_relative_eq!(f64_at(&rollup, "goalsfor_per60", 0), 4.5);
    assert_relative_eq!(f64_at(&rollup, "xgoalspercentage", 0), (0.4 * 15.0 + 0.6 * 25.0) / 40.0);
    assert_eq!(text_at(&rollup, "position", 0).as_deref(), Some("pair"));
    assert_eq!(text_at(&rollup, "situation", 0).as_deref(), Some("5v5"));
    assert_eq!(text_at(&rollup, "combo_key_ids", 0).as_deref(), Some("8471214-8471215"));
    assert!(roll_dir.join(GOLD_STAMP).exists());
}

#[test]
fn line_games_get_rolling_gold_partitions() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    write_skater_names(&cfg);
    write_bos_pair(&cfg);
    lines::build_lines_ready(&cfg).expect("lines ready");

    let spec = gold::gold_spec(LINES_GAME_READY_KEY).expect("spec");
    gold::build_gold_for_dataset(&cfg, spec).expect("gold");

    let dir = gold::gold_partition_dir(&cfg.paths.gold, LINES_GAME_READY_KEY, Situation::FiveOnFive, 2024);
    let out = store::read_frame(&dir.join("part_00000.parquet")).expect("gold rows");
    assert_eq!(out.height(), 2);
    assert_eq!(i64_at(&out, "GP_L5", 1), Some(2));
    assert_relative_eq!(f64_at(&out, "TOI_STD", 1), 40.0);
    assert_relative_eq!(f64_at(&out, "goalsfor_STD", 1), 3.0);
    assert_relative_eq!(f64_at(&out, "goalsfor_per60_STD", 1), 4.5);

    let stamp: GoldStamp = read_json(&dir.join(GOLD_STAMP)).expect("stamp");
    assert_eq!(stamp.season, 2024);
    assert_eq!(stamp.situation, "5v5");
    assert!(!stamp.strict_rolling);
    assert!(stamp.rs_only_in_gold);
}

#[test]
fn name_lookup_requires_skater_partitions() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let cfg = config(tmp.path());
    write_bos_pair(&cfg);
    assert!(lines::build_lines_ready(&cfg).is_err());
}

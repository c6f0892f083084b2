use approx::assert_relative_eq;
use chrono::NaiveDate;
use polars::prelude::{DataFrame, DataType};

use nhl_warehouse::config::EngineLimits;
use nhl_warehouse::engine::Engine;
use nhl_warehouse::frame::{
    date_column, f64_values, float_column, i64_at, int_column, names, set_column, text_at,
    text_column,
};
use nhl_warehouse::rolling::{RollingPlan, WindowPolicy};

const KEYS: &[&str] = &["playerid", "team", "situation", "season"];

fn limits() -> EngineLimits {
    EngineLimits {
        threads: 2,
        memory_limit_bytes: 64 * 1024 * 1024,
    }
}

/// One skater, seven games in shuffled order; game 3 has zero TOI.
fn skater_games() -> DataFrame {
    let order = [4usize, 0, 6, 2, 1, 5, 3];
    let toi = [10.0, 12.0, 0.0, 15.0, 10.0, 20.0, 13.0];
    let goals = [1, 0, 0, 2, 1, 0, 1];
    let n = order.len();
    let date = |i: usize| NaiveDate::from_ymd_opt(2024, 10, 10 + i as u32);
    DataFrame::new(vec![
        text_column("playerid", vec![Some("8478402".into()); n]),
        text_column("team", vec![Some("EDM".into()); n]),
        text_column("situation", vec![Some("all".into()); n]),
        int_column("season", vec![Some(2024); n]),
        date_column("gamedate", order.iter().map(|i| date(*i)).collect()).expect("dates"),
        text_column(
            "gameid",
            order.iter().map(|i| Some(format!("20240200{:02}", i + 1))).collect(),
        ),
        float_column("TOI", order.iter().map(|i| Some(toi[*i])).collect()),
        int_column("i_f_goals", order.iter().map(|i| Some(goals[*i])).collect()),
    ])
    .expect("frame")
}

fn run(policy: WindowPolicy) -> DataFrame {
    let games = skater_games();
    let mut engine = Engine::open_in_memory(limits()).expect("engine");
    engine.load_frame("src", &games).expect("load");
    let bound = RollingPlan::new(KEYS, &["i_f_goals", "i_f_xgoals"], policy)
        .bind("src", &names(&games))
        .expect("bind");
    assert_eq!(bound.dropped, vec!["i_f_xgoals"]);
    engine.query_frame(&bound.to_sql("src", &[])).expect("query")
}

fn floats(out: &DataFrame, name: &str) -> Vec<Option<f64>> {
    f64_values(out, name).expect(name)
}

#[test]
fn one_output_row_per_input_row_in_game_order() {
    let out = run(WindowPolicy::Partial);
    assert_eq!(out.height(), 7);
    let ids: Vec<String> = (0..out.height())
        .map(|r| text_at(&out, "gameid", r).expect("gameid"))
        .collect();
    assert_eq!(ids[0], "2024020001");
    assert_eq!(ids[6], "2024020007");
    assert_eq!(out.column("gamedate").map(|c| c.dtype().clone()).ok(), Some(DataType::Date));
}

#[test]
fn games_in_window_count_up_to_window_size() {
    let out = run(WindowPolicy::Partial);
    for r in 0..out.height() {
        let k = r as i64 + 1;
        assert_eq!(i64_at(&out, "GP_L5", r), Some(k.min(5)));
        assert_eq!(i64_at(&out, "GP_L10", r), Some(k.min(10)));
        assert_eq!(i64_at(&out, "GP_L20", r), Some(k));
    }
}

#[test]
fn partial_policy_keeps_short_windows() {
    let out = run(WindowPolicy::Partial);
    let l5 = floats(&out, "i_f_goals_L5");
    assert_eq!(l5[0], Some(1.0));
    assert_eq!(l5[3], Some(3.0));
    // games 2..=6
    assert_eq!(l5[5], Some(3.0));
    let toi_l5 = floats(&out, "TOI_L5");
    assert_relative_eq!(toi_l5[6].expect("toi"), 58.0);
    assert_eq!(floats(&out, "TOI_STD")[6], Some(80.0));
}

#[test]
fn strict_policy_nulls_incomplete_windows_but_keeps_counts() {
    let out = run(WindowPolicy::Strict);
    let l5 = floats(&out, "i_f_goals_L5");
    assert!(l5[..4].iter().all(Option::is_none));
    assert_eq!(l5[4], Some(4.0));
    let per60_l5 = floats(&out, "i_f_goals_per60_L5");
    assert!(per60_l5[..4].iter().all(Option::is_none));
    assert!(per60_l5[4].is_some());
    assert!(floats(&out, "i_f_goals_L10").iter().all(Option::is_none));
    assert_eq!(i64_at(&out, "GP_L10", 6), Some(7));
    assert_eq!(floats(&out, "i_f_goals_STD")[2], Some(1.0));
}

#[test]
fn per60_is_null_without_positive_toi() {
    let out = run(WindowPolicy::Partial);
    let per60 = floats(&out, "i_f_goals_per60");
    assert_eq!(per60[2], None);
    assert_relative_eq!(per60[0].expect("rate"), 6.0);
    // Zero-TOI game still contributes a positive denominator to the windows.
    assert_relative_eq!(floats(&out, "i_f_goals_per60_STD")[2].expect("std"), 1.0 / 22.0 * 60.0);
}

#[test]
fn per60_windows_null_when_window_toi_is_zero() {
    let mut games = skater_games();
    set_column(&mut games, float_column("TOI", vec![Some(0.0); 7])).expect("zero toi");
    let mut engine = Engine::open_in_memory(limits()).expect("engine");
    engine.load_frame("src", &games).expect("load");
    let bound = RollingPlan::new(KEYS, &["i_f_goals"], WindowPolicy::Partial)
        .bind("src", &names(&games))
        .expect("bind");
    let out = engine.query_frame(&bound.to_sql("src", &[])).expect("query");
    for name in ["i_f_goals_per60", "i_f_goals_per60_L5", "i_f_goals_per60_L20", "i_f_goals_per60_STD"] {
        assert!(floats(&out, name).iter().all(Option::is_none), "{name}");
    }
}

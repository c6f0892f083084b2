use anyhow::{Context, Result, anyhow};
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub fn parse_compact_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    if t.len() != 8 || !t.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(t, "%Y%m%d").ok()
}

pub fn parse_any_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    let t = t.strip_suffix(".0").unwrap_or(t);
    parse_compact_date(t)
        .or_else(|| NaiveDate::parse_from_str(t.get(..10).unwrap_or(t), "%Y-%m-%d").ok())
}

pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
}

pub fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

/// Integral floats print without a fractional part, so `2024.0` reads as `2024`.
fn float_text(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        v.to_string()
    }
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.column(name).is_ok()
}

pub fn names(df: &DataFrame) -> Vec<String> {
    df.get_columns().iter().map(|c| c.name().to_string()).collect()
}

pub fn text_column(name: &str, values: Vec<Option<String>>) -> Column {
    Column::new(name.into(), values)
}

pub fn float_column(name: &str, values: Vec<Option<f64>>) -> Column {
    Column::new(name.into(), values)
}

pub fn int_column(name: &str, values: Vec<Option<i64>>) -> Column {
    Column::new(name.into(), values)
}

pub fn date_column(name: &str, values: Vec<Option<NaiveDate>>) -> Result<Column> {
    let days: Vec<Option<i32>> = values.into_iter().map(|d| d.map(date_to_days)).collect();
    Column::new(name.into(), days)
        .cast(&DataType::Date)
        .with_context(|| format!("date column {name}"))
}

// The `*_values` readers below yield one entry per row and treat a missing
// column as all-null.

pub fn f64_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let Ok(col) = df.column(name) else {
        return Ok(vec![None; df.height()]);
    };
    let cast = col
        .cast(&DataType::Float64)
        .with_context(|| format!("cast {name} to float"))?;
    Ok(cast
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

pub fn i64_values(df: &DataFrame, name: &str) -> Result<Vec<Option<i64>>> {
    let Ok(col) = df.column(name) else {
        return Ok(vec![None; df.height()]);
    };
    let cast = col
        .cast(&DataType::Int64)
        .with_context(|| format!("cast {name} to int"))?;
    Ok(cast.i64()?.into_iter().collect())
}

pub fn text_values(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let Ok(col) = df.column(name) else {
        return Ok(vec![None; df.height()]);
    };
    match col.dtype() {
        DataType::Float32 | DataType::Float64 => Ok(f64_values(df, name)?
            .into_iter()
            .map(|v| v.map(float_text))
            .collect()),
        DataType::Date => Ok(date_values(df, name)?
            .into_iter()
            .map(|d| d.map(|d| d.format("%Y-%m-%d").to_string()))
            .collect()),
        _ => {
            let cast = col
                .cast(&DataType::String)
                .with_context(|| format!("cast {name} to text"))?;
            Ok(cast.str()?.into_iter().map(|v| v.map(str::to_string)).collect())
        }
    }
}

pub fn date_values(df: &DataFrame, name: &str) -> Result<Vec<Option<NaiveDate>>> {
    let Ok(col) = df.column(name) else {
        return Ok(vec![None; df.height()]);
    };
    match col.dtype() {
        DataType::Date => {
            let days = col.cast(&DataType::Int32)?;
            Ok(days.i32()?.into_iter().map(|d| d.and_then(days_to_date)).collect())
        }
        DataType::String => Ok(col.str()?.into_iter().map(|s| s.and_then(parse_any_date)).collect()),
        _ => Ok(text_values(df, name)?
            .into_iter()
            .map(|s| s.as_deref().and_then(parse_any_date))
            .collect()),
    }
}

fn row_slice(df: &DataFrame, row: usize) -> DataFrame {
    df.slice(i64::try_from(row).unwrap_or(i64::MAX), 1)
}

pub fn text_at(df: &DataFrame, name: &str, row: usize) -> Option<String> {
    text_values(&row_slice(df, row), name).ok()?.into_iter().next().flatten()
}

pub fn f64_at(df: &DataFrame, name: &str, row: usize) -> Option<f64> {
    f64_values(&row_slice(df, row), name).ok()?.into_iter().next().flatten()
}

pub fn i64_at(df: &DataFrame, name: &str, row: usize) -> Option<i64> {
    i64_values(&row_slice(df, row), name).ok()?.into_iter().next().flatten()
}

pub fn date_at(df: &DataFrame, name: &str, row: usize) -> Option<NaiveDate> {
    date_values(&row_slice(df, row), name).ok()?.into_iter().next().flatten()
}

/// Adds a column, replacing one of the same name. A frame with no columns
/// adopts the column's length.
pub fn set_column(df: &mut DataFrame, column: Column) -> Result<()> {
    let name = column.name().to_string();
    if df.width() > 0 && column.len() != df.height() {
        return Err(anyhow!(
            "column {name} has {} rows but the frame has {}",
            column.len(),
            df.height()
        ));
    }
    df.with_column(column)
        .with_context(|| format!("set column {name}"))?;
    Ok(())
}

pub fn take_column(df: &mut DataFrame, name: &str) -> Option<Column> {
    df.drop_in_place(name).ok()
}

/// Renames `from` to `to`. When `to` already exists, `from` is dropped instead.
pub fn rename_or_drop(df: &mut DataFrame, from: &str, to: &str) -> Result<()> {
    if !has_column(df, from) || from == to {
        return Ok(());
    }
    if has_column(df, to) {
        take_column(df, from);
        return Ok(());
    }
    df.rename(from, to.into())
        .with_context(|| format!("rename {from} to {to}"))?;
    Ok(())
}

pub fn filter_rows(df: &DataFrame, keep: &[bool]) -> Result<DataFrame> {
    let mask = Series::new("mask".into(), keep);
    df.filter(mask.bool()?).context("filter rows")
}

/// The named columns that exist, in the order asked for.
pub fn select_present(df: &DataFrame, wanted: &[&str]) -> Result<DataFrame> {
    let present: Vec<&str> = wanted.iter().copied().filter(|n| has_column(df, n)).collect();
    df.select(present).context("select columns")
}

/// Moves the priority columns that exist to the front.
pub fn reorder(df: &DataFrame, priority: &[&str]) -> Result<DataFrame> {
    let all = names(df);
    let mut order: Vec<String> = priority
        .iter()
        .filter(|p| all.iter().any(|n| n == *p))
        .map(|p| p.to_string())
        .collect();
    order.extend(all.into_iter().filter(|n| !priority.contains(&n.as_str())));
    df.select(order).context("reorder columns")
}

/// Splits rows by the textual value of one column, in first-seen order.
pub fn split_by(df: &DataFrame, name: &str) -> Result<Vec<(Option<String>, DataFrame)>> {
    if !has_column(df, name) {
        return Ok(vec![(None, df.clone())]);
    }
    if df.height() == 0 {
        return Ok(Vec::new());
    }
    df.partition_by_stable([name], true)
        .with_context(|| format!("partition by {name}"))?
        .into_iter()
        .map(|part| {
            let key = text_values(&part, name)?.into_iter().next().flatten();
            Ok((key, part))
        })
        .collect()
}

/// Union by column name. Columns missing from a part are null-filled and
/// differing types are cast to their common supertype.
pub fn concat_frames(frames: Vec<DataFrame>) -> Result<DataFrame> {
    let mut frames: Vec<DataFrame> = frames.into_iter().filter(|f| f.width() > 0).collect();
    match frames.len() {
        0 => Ok(DataFrame::empty()),
        1 => Ok(frames.remove(0)),
        _ => {
            let lazy: Vec<LazyFrame> = frames.into_iter().map(IntoLazy::lazy).collect();
            concat_lf_diagonal(
                lazy,
                UnionArgs {
                    to_supertypes: true,
                    ..Default::default()
                },
            )?
            .collect()
            .context("concat frames")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataFrame {
        DataFrame::new(vec![
            text_column("team", vec![Some("BOS".into()), Some("TOR".into()), Some("BOS".into())]),
            float_column("toi", vec![Some(10.0), None, Some(5.5)]),
        ])
        .expect("frame")
    }

    #[test]
    fn split_keeps_first_seen_order() {
        let groups = split_by(&sample(), "team").expect("split");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0.as_deref(), Some("BOS"));
        assert_eq!(groups[0].1.height(), 2);
        assert_eq!(groups[1].1.height(), 1);
    }

    #[test]
    fn concat_unions_by_name_and_widens() {
        let b = DataFrame::new(vec![
            int_column("toi", vec![Some(3)]),
            int_column("extra", vec![Some(1)]),
        ])
        .expect("frame");
        let out = concat_frames(vec![sample(), b]).expect("concat");
        assert_eq!(out.height(), 4);
        assert_eq!(out.column("toi").map(|c| c.dtype().clone()).ok(), Some(DataType::Float64));
        assert_eq!(f64_at(&out, "toi", 3), Some(3.0));
        assert_eq!(text_at(&out, "team", 3), None);
        assert_eq!(i64_at(&out, "extra", 0), None);
    }

    #[test]
    fn readers_coerce_between_types() {
        let df = DataFrame::new(vec![
            float_column("season", vec![Some(2024.0)]),
            text_column("compact", vec![Some("20241012".into())]),
            int_column("numeric", vec![Some(20241012)]),
            text_column("iso", vec![Some("2024-10-12".into())]),
            text_column("word", vec![Some("x".into())]),
            float_column("bad", vec![Some(f64::NAN)]),
        ])
        .expect("frame");
        let day = NaiveDate::from_ymd_opt(2024, 10, 12);
        assert_eq!(text_at(&df, "season", 0).as_deref(), Some("2024"));
        assert_eq!(date_at(&df, "compact", 0), day);
        assert_eq!(date_at(&df, "numeric", 0), day);
        assert_eq!(date_at(&df, "iso", 0), day);
        assert_eq!(i64_at(&df, "word", 0), None);
        assert_eq!(f64_at(&df, "bad", 0), None);
        assert_eq!(f64_values(&df, "absent").expect("absent"), vec![None]);
    }

    #[test]
    fn dates_survive_the_column_builder() {
        let day = NaiveDate::from_ymd_opt(2024, 10, 12).expect("date");
        let mut df = sample();
        set_column(&mut df, date_column("gamedate", vec![Some(day), None, Some(day)]).expect("col"))
            .expect("set");
        assert_eq!(df.column("gamedate").map(|c| c.dtype().clone()).ok(), Some(DataType::Date));
        assert_eq!(date_at(&df, "gamedate", 0), Some(day));
        assert_eq!(text_at(&df, "gamedate", 2).as_deref(), Some("2024-10-12"));
    }

    #[test]
    fn set_column_rejects_length_mismatch() {
        let mut df = sample();
        let err = set_column(&mut df, int_column("short", vec![Some(1)])).expect_err("mismatch");
        assert!(err.to_string().contains("short"));
        assert_eq!(df.width(), 2);

        let mut empty = DataFrame::empty();
        set_column(&mut empty, int_column("x", vec![Some(1), Some(2)])).expect("adopt length");
        assert_eq!(empty.height(), 2);
    }

    #[test]
    fn reorder_and_rename() {
        let mut df = sample();
        df = reorder(&df, &["toi", "missing"]).expect("reorder");
        assert_eq!(names(&df), vec!["toi", "team"]);
        rename_or_drop(&mut df, "toi", "TOI").expect("rename");
        assert_eq!(names(&df), vec!["TOI", "team"]);
        set_column(&mut df, text_column("club", vec![None, None, None])).expect("set");
        rename_or_drop(&mut df, "club", "team").expect("drop");
        assert_eq!(names(&df), vec!["TOI", "team"]);
    }
}

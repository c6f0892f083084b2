use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use polars::prelude::{Column, DataFrame, DataType};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params_from_iter};

use crate::config::EngineLimits;
use crate::frame;

/// Double-quoted SQL identifier, with embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quoted SQL string literal, with embedded quotes doubled.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// SQL affinity and bound values for one frame column.
fn column_to_sql(df: &DataFrame, col: &Column) -> Result<(&'static str, Vec<SqlValue>)> {
    let name = col.name().as_str();
    let dtype = col.dtype();
    if dtype.is_integer() || matches!(dtype, DataType::Boolean) {
        let vals = frame::i64_values(df, name)?;
        let vals = vals.into_iter().map(|v| v.map_or(SqlValue::Null, SqlValue::Integer));
        return Ok(("INTEGER", vals.collect()));
    }
    if dtype.is_float() {
        let vals = frame::f64_values(df, name)?;
        let vals = vals.into_iter().map(|v| v.map_or(SqlValue::Null, SqlValue::Real));
        return Ok(("REAL", vals.collect()));
    }
    let vals = frame::text_values(df, name)?;
    let vals = vals.into_iter().map(|v| v.map_or(SqlValue::Null, SqlValue::Text));
    Ok(("TEXT", vals.collect()))
}

enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

fn from_sql(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Cell::Null,
        ValueRef::Integer(v) => Cell::Int(v),
        ValueRef::Real(v) => Cell::Float(v),
        ValueRef::Text(t) => Cell::Text(String::from_utf8_lossy(t).into_owned()),
    }
}

/// Integers stay integers, mixed numerics widen to float, any text makes the
/// column text. All-null columns come back as float.
fn result_column(name: &str, cells: Vec<Cell>, is_date: bool) -> Result<Column> {
    if is_date {
        let dates = cells
            .iter()
            .map(|c| match c {
                Cell::Text(t) => frame::parse_any_date(t),
                _ => None,
            })
            .collect();
        return frame::date_column(name, dates);
    }
    let any_text = cells.iter().any(|c| matches!(c, Cell::Text(_)));
    let any_float = cells.iter().any(|c| matches!(c, Cell::Float(_)));
    let any_int = cells.iter().any(|c| matches!(c, Cell::Int(_)));
    let column = if any_text {
        frame::text_column(
            name,
            cells
                .into_iter()
                .map(|c| match c {
                    Cell::Null => None,
                    Cell::Int(v) => Some(v.to_string()),
                    Cell::Float(v) => Some(v.to_string()),
                    Cell::Text(t) => Some(t),
                })
                .collect(),
        )
    } else if any_int && !any_float {
        frame::int_column(
            name,
            cells
                .into_iter()
                .map(|c| match c {
                    Cell::Int(v) => Some(v),
                    _ => None,
                })
                .collect(),
        )
    } else {
        frame::float_column(
            name,
            cells
                .into_iter()
                .map(|c| match c {
                    Cell::Int(v) => Some(v as f64),
                    Cell::Float(v) => Some(v),
                    _ => None,
                })
                .collect(),
        )
    };
    Ok(column)
}

/// SQLite session with a worker-thread budget and a soft heap cap. Loaded
/// frames become tables; query results come back as frames, with columns that
/// were loaded as dates restored to dates.
pub struct Engine {
    conn: Connection,
    date_columns: HashSet<String>,
}

impl Engine {
    pub fn open_in_memory(limits: EngineLimits) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        Self::configure(conn, limits)
    }

    pub fn open(path: &Path, limits: EngineLimits) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(path).with_context(|| format!("open {}", path.display()))?;
        Self::configure(conn, limits)
    }

    fn configure(conn: Connection, limits: EngineLimits) -> Result<Self> {
        let threads = i64::try_from(limits.threads).unwrap_or(i64::MAX);
        let heap = i64::try_from(limits.memory_limit_bytes).unwrap_or(i64::MAX);
        conn.pragma_update_and_check(None, "threads", threads, |row| row.get::<_, i64>(0))
            .context("set sqlite threads")?;
        conn.pragma_update_and_check(None, "soft_heap_limit", heap, |row| row.get::<_, i64>(0))
            .context("set sqlite soft_heap_limit")?;
        Ok(Self {
            conn,
            date_columns: HashSet::new(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Replaces `table` with the contents of `df`.
    pub fn load_frame(&mut self, table: &str, df: &DataFrame) -> Result<usize> {
        let mut defs = Vec::with_capacity(df.width());
        let mut values = Vec::with_capacity(df.width());
        for col in df.get_columns() {
            let (affinity, vals) = column_to_sql(df, col)
                .with_context(|| format!("convert {} for {table}", col.name()))?;
            defs.push(format!("{} {affinity}", quote_ident(col.name())));
            if matches!(col.dtype(), DataType::Date) {
                self.date_columns.insert(col.name().to_string());
            }
            values.push(vals);
        }
        let table_q = quote_ident(table);
        self.conn
            .execute_batch(&format!(
                "DROP TABLE IF EXISTS {table_q}; CREATE TABLE {table_q} ({});",
                defs.join(", ")
            ))
            .with_context(|| format!("create table {table}"))?;
        if df.width() == 0 || df.height() == 0 {
            return Ok(0);
        }

        let placeholders = vec!["?"; df.width()].join(", ");
        let tx = self.conn.transaction().context("begin load")?;
        {
            let mut stmt = tx
                .prepare(&format!("INSERT INTO {table_q} VALUES ({placeholders})"))
                .with_context(|| format!("prepare insert into {table}"))?;
            for row in 0..df.height() {
                stmt.execute(params_from_iter(values.iter().map(|c| &c[row])))
                    .with_context(|| format!("insert row {row} into {table}"))?;
            }
        }
        tx.commit().context("commit load")?;
        Ok(df.height())
    }

    pub fn query_frame(&self, sql: &str) -> Result<DataFrame> {
        let mut stmt = self.conn.prepare(sql).context("prepare query")?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut cells: Vec<Vec<Cell>> = names.iter().map(|_| Vec::new()).collect();
        let mut rows = stmt.query([]).context("run query")?;
        while let Some(row) = rows.next().context("fetch row")? {
            for (idx, slot) in cells.iter_mut().enumerate() {
                slot.push(from_sql(row.get_ref(idx)?));
            }
        }
        let columns = names
            .into_iter()
            .zip(cells)
            .map(|(name, vals)| {
                let is_date = self.date_columns.contains(&name);
                result_column(&name, vals, is_date)
            })
            .collect::<Result<Vec<_>>>()?;
        DataFrame::new(columns).context("assemble query result")
    }

    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .with_context(|| format!("table_info {table}"))?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn limits() -> EngineLimits {
        EngineLimits {
            threads: 2,
            memory_limit_bytes: 64 * 1024 * 1024,
        }
    }

    #[test]
    fn frames_roundtrip_through_tables() {
        let mut engine = Engine::open_in_memory(limits()).expect("engine");
        let days = vec![NaiveDate::from_ymd_opt(2024, 10, 12), NaiveDate::from_ymd_opt(2024, 10, 13)];
        let df = DataFrame::new(vec![
            frame::text_column("team", vec![Some("BOS".into()), None]),
            frame::float_column("TOI", vec![Some(12.5), Some(f64::NAN)]),
            frame::int_column("season", vec![Some(2024), Some(2024)]),
            frame::date_column("gamedate", days).expect("dates"),
        ])
        .expect("frame");
        assert_eq!(engine.load_frame("base", &df).expect("load"), 2);
        assert_eq!(
            engine.table_columns("base").expect("cols"),
            vec!["team", "TOI", "season", "gamedate"]
        );

        let out = engine
            .query_frame(
                "SELECT team, TOI * 2 AS toi2, season, gamedate, NULL AS nothing FROM base ORDER BY gamedate",
            )
            .expect("query");
        assert_eq!(frame::text_at(&out, "team", 1), None);
        assert_eq!(frame::f64_at(&out, "toi2", 0), Some(25.0));
        assert_eq!(frame::f64_at(&out, "toi2", 1), None);
        assert_eq!(out.column("season").map(|c| c.dtype().clone()).ok(), Some(DataType::Int64));
        assert_eq!(out.column("nothing").map(|c| c.dtype().clone()).ok(), Some(DataType::Float64));
        assert_eq!(frame::date_at(&out, "gamedate", 1), NaiveDate::from_ymd_opt(2024, 10, 13));
        assert_eq!(out.column("gamedate").map(|c| c.dtype().clone()).ok(), Some(DataType::Date));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("TOI_L5"), "\"TOI_L5\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}

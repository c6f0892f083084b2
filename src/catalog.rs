//! Read-side view of a built warehouse.
//!
//! Consumers look relations up by the columns they need rather than by a
//! fixed name, and project only the optional columns that actually exist, so
//! an older or partial warehouse degrades to fewer columns instead of errors.

use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use serde::Serialize;
use tracing::debug;

use crate::engine::quote_ident;

pub const PREFERRED_SITUATIONS: &[&str] = &["all", "5v5", "5on4", "4on5"];
pub const LINES_REQUIRED: &[&str] = &["combo_key_team", "team", "season", "situation", "TOI"];
pub const LINES_PREFERRED: &[&str] = &["fact_lines_season", "fact_lines_game", "lines_game_ready"];
pub const LINE_METRICS: &[&str] = &[
    "xgoalsfor_per60",
    "xgoalsagainst_per60",
    "goalsfor_per60",
    "goalsagainst_per60",
    "shotsongoalfor_per60",
    "shotsongoalagainst_per60",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationHandle {
    pub name: String,
    pub columns: Vec<String>,
}

impl RelationHandle {
    pub fn has(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn has_all(&self, required: &[&str]) -> bool {
        !self.columns.is_empty() && required.iter().all(|c| self.has(c))
    }
}

pub fn list_relations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .context("list relations")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Column names of a relation; empty when it does not exist.
pub fn relation_columns(conn: &Connection, name: &str) -> Vec<String> {
    let sql = format!("PRAGMA table_info({})", quote_ident(name));
    let Ok(mut stmt) = conn.prepare(&sql) else {
        return Vec::new();
    };
    stmt.query_map([], |row| row.get::<_, String>(1))
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .unwrap_or_default()
}

pub fn relation(conn: &Connection, name: &str) -> Option<RelationHandle> {
    let columns = relation_columns(conn, name);
    (!columns.is_empty()).then(|| RelationHandle {
        name: name.to_string(),
        columns,
    })
}

/// First relation carrying every required column: preferred names in order,
/// then any table or view.
pub fn find_relation_with_cols(
    conn: &Connection,
    required: &[&str],
    prefer: &[&str],
) -> Option<RelationHandle> {
    for name in prefer {
        if let Some(handle) = relation(conn, name)
            && handle.has_all(required)
        {
            return Some(handle);
        }
    }
    let all = match list_relations(conn) {
        Ok(all) => all,
        Err(err) => {
            debug!(error = %err, "relation scan failed");
            return None;
        }
    };
    all.iter()
        .filter_map(|name| relation(conn, name))
        .find(|handle| handle.has_all(required))
}

/// The requested columns a relation actually has, plus the ones it lacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionPlan {
    pub relation: String,
    pub selected: Vec<String>,
    pub missing: Vec<String>,
}

impl ProjectionPlan {
    pub fn new(handle: &RelationHandle, wanted: &[&str]) -> Self {
        let (selected, missing): (Vec<String>, Vec<String>) = wanted
            .iter()
            .map(|c| c.to_string())
            .partition(|c| handle.has(c));
        Self {
            relation: handle.name.clone(),
            selected,
            missing,
        }
    }

    pub fn select_list(&self) -> String {
        if self.selected.is_empty() {
            return "*".to_string();
        }
        self.selected
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Seasons, newest first, from `dim_game` or else any relation with a season column.
pub fn season_options(conn: &Connection) -> Result<Vec<i64>> {
    let rel = match relation(conn, "dim_game").filter(|h| h.has("season")) {
        Some(h) => Some(h),
        None => find_relation_with_cols(conn, &["season"], &["fact_team_game"]),
    };
    let Some(rel) = rel else {
        return Ok(Vec::new());
    };
    let sql = format!(
        "SELECT DISTINCT CAST(season AS INTEGER) FROM {} WHERE season IS NOT NULL ORDER BY 1 DESC",
        quote_ident(&rel.name)
    );
    let mut stmt = conn.prepare(&sql).context("season options")?;
    let seasons = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(seasons)
}

/// `all, 5v5, 5on4, 4on5` first when present, then any other tags.
pub fn order_situations(found: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = PREFERRED_SITUATIONS
        .iter()
        .filter(|p| found.iter().any(|s| s == *p))
        .map(|s| s.to_string())
        .collect();
    out.extend(found.into_iter().filter(|s| !PREFERRED_SITUATIONS.contains(&s.as_str())));
    out
}

pub fn situation_options(conn: &Connection) -> Result<Vec<String>> {
    let Some(rel) = find_relation_with_cols(conn, &["situation"], &["fact_team_game"]) else {
        return Ok(vec!["all".to_string()]);
    };
    let sql = format!(
        "SELECT DISTINCT CAST(situation AS TEXT) FROM {} WHERE situation IS NOT NULL ORDER BY 1",
        quote_ident(&rel.name)
    );
    let mut stmt = conn.prepare(&sql).context("situation options")?;
    let found = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if found.is_empty() {
        return Ok(vec!["all".to_string()]);
    }
    Ok(order_situations(found))
}

#[derive(Debug, Clone)]
pub struct LinesQuery {
    pub season: i64,
    pub situation: String,
    pub team: Option<String>,
    pub unit_type: Option<String>,
    pub min_toi: f64,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineReportRow {
    pub team: String,
    pub combo: String,
    pub combo_key_team: String,
    pub toi: Option<f64>,
    pub metrics: Vec<(String, Option<f64>)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinesReport {
    pub relation: String,
    pub missing_columns: Vec<String>,
    pub rows: Vec<LineReportRow>,
}

/// `A / B / C` from whichever member names resolved.
pub fn combo_display_name(names: &[Option<String>]) -> String {
    names
        .iter()
        .flatten()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>()
        .join(" / ")
}

pub fn lines_teams(conn: &Connection, rel: &RelationHandle, season: i64, situation: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT DISTINCT CAST(team AS TEXT) FROM {} WHERE season = ?1 AND situation = ?2 AND team IS NOT NULL ORDER BY 1",
        quote_ident(&rel.name)
    );
    let mut stmt = conn.prepare(&sql).context("lines teams")?;
    let teams = stmt
        .query_map(rusqlite::params![season, situation], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(teams)
}

/// Combination rows for one (season, situation) ordered by TOI. `None` when
/// the warehouse has no lines relation.
pub fn lines_report(conn: &Connection, query: &LinesQuery) -> Result<Option<LinesReport>> {
    let Some(rel) = find_relation_with_cols(conn, LINES_REQUIRED, LINES_PREFERRED) else {
        return Ok(None);
    };
    let mut wanted: Vec<&str> = vec!["team", "combo_key_team", "TOI", "p1_name", "p2_name", "p3_name"];
    wanted.extend(LINE_METRICS);
    let plan = ProjectionPlan::new(&rel, &wanted);

    let mut sql = format!(
        "SELECT {} FROM {} WHERE season = ? AND situation = ? AND TOI >= ?",
        plan.select_list(),
        quote_ident(&rel.name)
    );
    let mut params: Vec<SqlValue> = vec![
        SqlValue::Integer(query.season),
        SqlValue::Text(query.situation.clone()),
        SqlValue::Real(query.min_toi),
    ];
    if let Some(team) = &query.team {
        sql.push_str(" AND team = ?");
        params.push(SqlValue::Text(team.clone()));
    }
    if let Some(unit) = &query.unit_type
        && rel.has("position")
    {
        sql.push_str(" AND lower(CAST(position AS TEXT)) = ?");
        params.push(SqlValue::Text(unit.to_lowercase()));
    }
    sql.push_str(&format!(" ORDER BY TOI DESC LIMIT {}", query.limit));

    let idx = |name: &str| plan.selected.iter().position(|c| c == name);
    let team_idx = idx("team");
    let key_idx = idx("combo_key_team");
    let toi_idx = idx("TOI");
    let name_idx = [idx("p1_name"), idx("p2_name"), idx("p3_name")];
    let metric_idx: Vec<(String, usize)> = LINE_METRICS
        .iter()
        .filter_map(|m| idx(m).map(|i| (m.to_string(), i)))
        .collect();

    let mut stmt = conn.prepare(&sql).context("lines report")?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            let text = |i: Option<usize>| -> rusqlite::Result<Option<String>> {
                match i {
                    Some(i) => row.get::<_, Option<String>>(i),
                    None => Ok(None),
                }
            };
            let names = [text(name_idx[0])?, text(name_idx[1])?, text(name_idx[2])?];
            let combo_key_team = text(key_idx)?.unwrap_or_default();
            let mut combo = combo_display_name(&names);
            if combo.is_empty() {
                combo = combo_key_team.clone();
            }
            let toi = match toi_idx {
                Some(i) => row.get::<_, Option<f64>>(i)?,
                None => None,
            };
            let metrics = metric_idx
                .iter()
                .map(|(name, i)| Ok((name.clone(), row.get::<_, Option<f64>>(*i)?)))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(LineReportRow {
                team: text(team_idx)?.unwrap_or_default(),
                combo,
                combo_key_team,
                toi,
                metrics,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(LinesReport {
        relation: rel.name,
        missing_columns: plan.missing,
        rows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().expect("sqlite");
        conn.execute_batch(
            "CREATE TABLE fact_team_game (team TEXT, season INTEGER, situation TEXT);
             INSERT INTO fact_team_game VALUES ('BOS', 2023, '5on4'), ('BOS', 2024, 'all'),
                                               ('T.B', 2024, 'other'), ('T.B', 2024, '5v5');",
        )
        .expect("schema");
        conn
    }

    #[test]
    fn finds_relations_by_columns() {
        let conn = conn();
        let rel = find_relation_with_cols(&conn, &["team", "season"], &["missing_view"]).expect("relation");
        assert_eq!(rel.name, "fact_team_game");
        assert!(find_relation_with_cols(&conn, &["combo_key_team"], LINES_PREFERRED).is_none());
    }

    #[test]
    fn projection_reports_absent_columns() {
        let conn = conn();
        let rel = relation(&conn, "fact_team_game").expect("relation");
        let plan = ProjectionPlan::new(&rel, &["team", "xgoalsfor", "season"]);
        assert_eq!(plan.selected, vec!["team", "season"]);
        assert_eq!(plan.missing, vec!["xgoalsfor"]);
        assert_eq!(plan.select_list(), "\"team\", \"season\"");
    }

    #[test]
    fn options_fall_back_without_dim_game() {
        let conn = conn();
        assert_eq!(season_options(&conn).expect("seasons"), vec![2024, 2023]);
        assert_eq!(
            situation_options(&conn).expect("situations"),
            vec!["all", "5v5", "5on4", "other"]
        );

        let empty = Connection::open_in_memory().expect("sqlite");
        assert!(season_options(&empty).expect("seasons").is_empty());
        assert_eq!(situation_options(&empty).expect("situations"), vec!["all"]);
    }

    #[test]
    fn display_names_skip_unresolved() {
        let names = [Some("A. Player".to_string()), Some(String::new()), None];
        assert_eq!(combo_display_name(&names), "A. Player");
        let names = [Some("A".to_string()), Some("B".to_string()), Some("C".to_string())];
        assert_eq!(combo_display_name(&names), "A / B / C");
    }
}

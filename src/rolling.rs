//! Trailing-window aggregation compiled to SQL.
//!
//! A [`RollingPlan`] names the partition keys, the counting columns and the
//! window sizes. Binding it to a concrete column list checks the required
//! columns and yields a [`BoundPlan`], whose [`BoundPlan::to_sql`] emits a
//! single statement producing one output row per input row:
//!
//! * `TOI_L{n}`, `<c>_L{n}`: sums over the current row and the `n - 1` before it
//! * `GP_L{n}`: rows inside that window, i.e. `min(n, rows so far)`
//! * `TOI_STD`, `<c>_STD`: season-to-date sums
//! * `<c>_per60`, `<c>_per60_L{n}`, `<c>_per60_STD`: `stat / TOI * 60`, null
//!   unless the matching TOI is positive
//!
//! Under [`WindowPolicy::Strict`] a trailing sum with `GP_L{n} < n` is null,
//! which also nulls its per-60 rate. `GP_L{n}` is never suppressed.

use serde::{Deserialize, Serialize};

use crate::engine::quote_ident;
use crate::error::PipelineError;

pub const DEFAULT_WINDOWS: [usize; 3] = [5, 10, 20];
pub const TOI_COLUMN: &str = "TOI";
pub const ORDER_COLUMNS: [&str; 2] = ["gamedate", "gameid"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    Strict,
    Partial,
}

impl WindowPolicy {
    pub fn is_strict(self) -> bool {
        self == WindowPolicy::Strict
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingPlan {
    pub partition_keys: Vec<String>,
    pub count_cols: Vec<String>,
    pub windows: Vec<usize>,
    pub policy: WindowPolicy,
}

impl RollingPlan {
    pub fn new(partition_keys: &[&str], count_cols: &[&str], policy: WindowPolicy) -> Self {
        Self {
            partition_keys: partition_keys.iter().map(|s| s.to_string()).collect(),
            count_cols: count_cols.iter().map(|s| s.to_string()).collect(),
            windows: DEFAULT_WINDOWS.to_vec(),
            policy,
        }
    }

    pub fn with_windows(mut self, windows: &[usize]) -> Self {
        self.windows = windows.iter().copied().filter(|w| *w > 0).collect();
        self
    }

    /// Checks the plan against the columns a relation actually has. Keys, the
    /// ordering columns and `TOI` are required; absent counting columns are
    /// dropped from the plan.
    pub fn bind(&self, relation: &str, columns: &[String]) -> Result<BoundPlan, PipelineError> {
        let has = |name: &str| columns.iter().any(|c| c == name);
        let required = self
            .partition_keys
            .iter()
            .map(String::as_str)
            .chain(ORDER_COLUMNS)
            .chain([TOI_COLUMN]);
        for col in required {
            if !has(col) {
                return Err(PipelineError::MissingColumn {
                    relation: relation.to_string(),
                    column: col.to_string(),
                });
            }
        }
        let (count_cols, dropped): (Vec<String>, Vec<String>) =
            self.count_cols.iter().cloned().partition(|c| has(c.as_str()));
        Ok(BoundPlan {
            input_columns: columns.to_vec(),
            partition_keys: self.partition_keys.clone(),
            count_cols,
            dropped,
            windows: self.windows.clone(),
            policy: self.policy,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BoundPlan {
    pub input_columns: Vec<String>,
    pub partition_keys: Vec<String>,
    pub count_cols: Vec<String>,
    pub dropped: Vec<String>,
    pub windows: Vec<usize>,
    pub policy: WindowPolicy,
}

fn real(col: &str) -> String {
    format!("CAST({} AS REAL)", quote_ident(col))
}

fn per60_expr(stat: &str, toi: &str) -> String {
    format!(
        "CASE WHEN {toi} > 0 THEN ({stat} / {toi}) * 60.0 ELSE NULL END",
        toi = real(toi),
        stat = real(stat)
    )
}

impl BoundPlan {
    fn window_name(w: usize) -> String {
        format!("w{w}")
    }

    /// Names of the columns appended to the input columns, in output order.
    pub fn derived_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        for w in &self.windows {
            out.push(format!("TOI_L{w}"));
        }
        for w in &self.windows {
            out.push(format!("GP_L{w}"));
        }
        out.push("TOI_STD".to_string());
        for c in &self.count_cols {
            for w in &self.windows {
                out.push(format!("{c}_L{w}"));
            }
            out.push(format!("{c}_STD"));
            out.push(format!("{c}_per60"));
            for w in &self.windows {
                out.push(format!("{c}_per60_L{w}"));
            }
            out.push(format!("{c}_per60_STD"));
        }
        out
    }

    /// Input columns that are passed through untouched. Inputs sharing a name
    /// with a derived column are replaced by the derived value.
    fn passthrough(&self) -> Vec<&String> {
        let derived = self.derived_columns();
        self.input_columns
            .iter()
            .filter(|c| !derived.contains(c))
            .collect()
    }

    fn gated(&self, col: &str, w: usize) -> String {
        let raw = quote_ident(&format!("__{col}_L{w}"));
        if self.policy.is_strict() {
            format!(
                "CASE WHEN {gp} >= {w} THEN {raw} ELSE NULL END",
                gp = quote_ident(&format!("__GP_L{w}"))
            )
        } else {
            raw
        }
    }

    /// Compiles the plan against `source`, restricted by `filters` (joined with
    /// `AND`). Rows come back ordered by partition key, date, game id.
    pub fn to_sql(&self, source: &str, filters: &[String]) -> String {
        let keys = self
            .partition_keys
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ");
        let order = ORDER_COLUMNS
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let where_clause = if filters.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", filters.join(" AND "))
        };

        let mut raw = Vec::new();
        for w in &self.windows {
            let name = Self::window_name(*w);
            raw.push(format!("SUM({}) OVER {name} AS {}", real(TOI_COLUMN), quote_ident(&format!("__TOI_L{w}"))));
            raw.push(format!("COUNT(*) OVER {name} AS {}", quote_ident(&format!("__GP_L{w}"))));
        }
        raw.push(format!("SUM({}) OVER wstd AS {}", real(TOI_COLUMN), quote_ident("__TOI_STD")));
        for c in &self.count_cols {
            for w in &self.windows {
                raw.push(format!(
                    "SUM({}) OVER {} AS {}",
                    real(c),
                    Self::window_name(*w),
                    quote_ident(&format!("__{c}_L{w}"))
                ));
            }
            raw.push(format!("SUM({}) OVER wstd AS {}", real(c), quote_ident(&format!("__{c}_STD"))));
        }

        let mut windows = Vec::new();
        for w in &self.windows {
            windows.push(format!(
                "{} AS (PARTITION BY {keys} ORDER BY {order} ROWS BETWEEN {} PRECEDING AND CURRENT ROW)",
                Self::window_name(*w),
                w - 1
            ));
        }
        windows.push(format!(
            "wstd AS (PARTITION BY {keys} ORDER BY {order} ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW)"
        ));

        let passthrough = self
            .passthrough()
            .into_iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>();

        let mut gated = passthrough.clone();
        for w in &self.windows {
            gated.push(format!("{} AS {}", self.gated(TOI_COLUMN, *w), quote_ident(&format!("TOI_L{w}"))));
        }
        for w in &self.windows {
            gated.push(format!(
                "{} AS {}",
                quote_ident(&format!("__GP_L{w}")),
                quote_ident(&format!("GP_L{w}"))
            ));
        }
        gated.push(format!("{} AS {}", quote_ident("__TOI_STD"), quote_ident("TOI_STD")));
        for c in &self.count_cols {
            for w in &self.windows {
                gated.push(format!("{} AS {}", self.gated(c, *w), quote_ident(&format!("{c}_L{w}"))));
            }
            gated.push(format!(
                "{} AS {}",
                quote_ident(&format!("__{c}_STD")),
                quote_ident(&format!("{c}_STD"))
            ));
        }

        let mut outer = passthrough;
        for w in &self.windows {
            outer.push(quote_ident(&format!("TOI_L{w}")));
        }
        for w in &self.windows {
            outer.push(quote_ident(&format!("GP_L{w}")));
        }
        outer.push(quote_ident("TOI_STD"));
        for c in &self.count_cols {
            for w in &self.windows {
                outer.push(quote_ident(&format!("{c}_L{w}")));
            }
            outer.push(quote_ident(&format!("{c}_STD")));
            outer.push(format!("{} AS {}", per60_expr(c, TOI_COLUMN), quote_ident(&format!("{c}_per60"))));
            for w in &self.windows {
                outer.push(format!(
                    "{} AS {}",
                    per60_expr(&format!("{c}_L{w}"), &format!("TOI_L{w}")),
                    quote_ident(&format!("{c}_per60_L{w}"))
                ));
            }
            outer.push(format!(
                "{} AS {}",
                per60_expr(&format!("{c}_STD"), "TOI_STD"),
                quote_ident(&format!("{c}_per60_STD"))
            ));
        }

        format!(
            "WITH base AS (SELECT * FROM {source}{where_clause}),\n\
             win AS (\n  SELECT base.*,\n    {raw}\n  FROM base\n  WINDOW {windows}\n),\n\
             gated AS (\n  SELECT {gated}\n  FROM win\n)\n\
             SELECT {outer}\nFROM gated\nORDER BY {keys}, {order}",
            source = quote_ident(source),
            raw = raw.join(",\n    "),
            windows = windows.join(",\n         "),
            gated = gated.join(",\n         "),
            outer = outer.join(",\n       "),
        )
    }
}

/// Regular-season predicate over a `gameid` column: the game-type digits of the
/// zero-padded 10-character id must be `02`, and a present `playoffgame` must be 0.
pub fn rs_predicate_sql(has_playoffgame: bool) -> String {
    let padded = format!(
        "substr('0000000000' || CAST({} AS TEXT), -10, 10)",
        quote_ident("gameid")
    );
    let game_type = format!("(substr({padded}, 5, 2) = '02')");
    if has_playoffgame {
        format!(
            "{game_type} AND (COALESCE(CAST({} AS INTEGER), 0) = 0)",
            quote_ident("playoffgame")
        )
    } else {
        game_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bind_requires_keys_and_order_columns() {
        let plan = RollingPlan::new(&["playerid", "season"], &["goals"], WindowPolicy::Partial);
        let err = plan
            .bind("skaters", &cols(&["playerid", "season", "gamedate", "TOI"]))
            .expect_err("gameid missing");
        assert!(matches!(err, PipelineError::MissingColumn { ref column, .. } if column == "gameid"));
    }

    #[test]
    fn bind_drops_absent_count_columns() {
        let plan = RollingPlan::new(&["team"], &["goalsfor", "xgoalsfor"], WindowPolicy::Partial);
        let bound = plan
            .bind("teams", &cols(&["team", "gamedate", "gameid", "TOI", "goalsfor"]))
            .expect("bind");
        assert_eq!(bound.count_cols, vec!["goalsfor"]);
        assert_eq!(bound.dropped, vec!["xgoalsfor"]);
    }

    #[test]
    fn derived_column_names() {
        let plan = RollingPlan::new(&["team"], &["goalsfor"], WindowPolicy::Strict).with_windows(&[5]);
        let bound = plan
            .bind("teams", &cols(&["team", "gamedate", "gameid", "TOI", "goalsfor"]))
            .expect("bind");
        assert_eq!(
            bound.derived_columns(),
            vec![
                "TOI_L5",
                "GP_L5",
                "TOI_STD",
                "goalsfor_L5",
                "goalsfor_STD",
                "goalsfor_per60",
                "goalsfor_per60_L5",
                "goalsfor_per60_STD"
            ]
        );
    }

    #[test]
    fn strict_sql_gates_trailing_sums_only() {
        let columns = cols(&["team", "gamedate", "gameid", "TOI", "goalsfor"]);
        let strict = RollingPlan::new(&["team"], &["goalsfor"], WindowPolicy::Strict)
            .bind("t", &columns)
            .expect("bind")
            .to_sql("base_src", &["\"season\" = 2024".to_string()]);
        assert!(strict.contains("CASE WHEN \"__GP_L5\" >= 5 THEN \"__goalsfor_L5\""));
        assert!(strict.contains("\"__GP_L20\" AS \"GP_L20\""));
        assert!(strict.contains("ROWS BETWEEN 19 PRECEDING AND CURRENT ROW"));
        assert!(strict.contains("WHERE \"season\" = 2024"));

        let partial = RollingPlan::new(&["team"], &["goalsfor"], WindowPolicy::Partial)
            .bind("t", &columns)
            .expect("bind")
            .to_sql("base_src", &[]);
        assert!(!partial.contains("__GP_L5\" >= 5"));
        assert!(partial.contains("ORDER BY \"team\", \"gamedate\", \"gameid\""));
    }

    #[test]
    fn rs_predicate_mentions_playoff_flag_only_when_present() {
        assert!(rs_predicate_sql(true).contains("playoffgame"));
        assert!(!rs_predicate_sql(false).contains("playoffgame"));
    }
}

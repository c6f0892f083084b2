use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rusqlite::{Connection, OpenFlags};

use nhl_warehouse::catalog::{self, LinesQuery};

/// Line and pair combinations from a built warehouse
#[derive(Parser, Debug)]
#[command(name = "lines_report")]
struct Args {
    #[arg(long, env = "NHL_WAREHOUSE_DB", default_value = "./data/NHL_MoneyPuck/warehouse/nhl_warehouse.sqlite")]
    db: PathBuf,

    /// Season start year; newest available when omitted
    #[arg(long)]
    season: Option<i64>,

    #[arg(long, default_value = "all")]
    situation: String,

    #[arg(long)]
    team: Option<String>,

    /// `line` or `pair`
    #[arg(long, default_value = "line")]
    unit: String,

    /// Minimum TOI in minutes
    #[arg(long, default_value_t = 50.0)]
    min_toi: f64,

    #[arg(long, default_value_t = 200)]
    limit: usize,
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let conn = Connection::open_with_flags(&args.db, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("open warehouse {}", args.db.display()))?;

    let seasons = catalog::season_options(&conn)?;
    let Some(season) = args.season.or_else(|| seasons.first().copied()) else {
        println!("No seasons found in {}", args.db.display());
        return Ok(());
    };
    let situations = catalog::situation_options(&conn)?;
    if !situations.contains(&args.situation) {
        println!("Situation {} not present; available: {}", args.situation, situations.join(", "));
        return Ok(());
    }

    let query = LinesQuery {
        season,
        situation: args.situation.clone(),
        team: args.team.clone(),
        unit_type: Some(args.unit.clone()),
        min_toi: args.min_toi,
        limit: args.limit,
    };
    let Some(report) = catalog::lines_report(&conn, &query)? else {
        println!("Lines data not found in {}", args.db.display());
        println!("Build gold lines and rerun build_warehouse to expose fact_lines_season.");
        return Ok(());
    };

    println!(
        "{} | season {} | {} | {}",
        report.relation,
        season,
        args.situation,
        args.team.as_deref().unwrap_or("all teams")
    );
    if !report.missing_columns.is_empty() {
        println!("(columns not available: {})", report.missing_columns.join(", "));
    }
    if report.rows.is_empty() {
        println!("No lines/pairs matched these filters.");
        return Ok(());
    }
    for row in &report.rows {
        let metrics = row
            .metrics
            .iter()
            .map(|(name, v)| match v {
                Some(v) => format!("{name}={v:.2}"),
                None => format!("{name}=n/a"),
            })
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<5} {:<48} TOI {:>7.1}  {}",
            row.team,
            row.combo,
            row.toi.unwrap_or(0.0),
            metrics
        );
    }
    Ok(())
}

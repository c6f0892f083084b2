use anyhow::Result;
use clap::Parser;

use nhl_warehouse::config::{PipelineArgs, PipelineConfig};
use nhl_warehouse::warehouse;

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = PipelineConfig::from_args(&PipelineArgs::parse())?;
    println!("Gold: {}", cfg.paths.gold.display());
    let summary = warehouse::warehouse_build(&cfg)?;

    println!("Warehouse build complete");
    println!("DB: {}", summary.db_path.display());
    println!("Goalie id column: {}", summary.goalie_id_col);
    for (table, rows) in &summary.fact_rows {
        println!("{table}: {rows} rows");
    }
    for (table, rows) in &summary.dim_rows {
        println!("{table}: {rows} rows");
    }
    Ok(())
}

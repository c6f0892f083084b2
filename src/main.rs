use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use nhl_warehouse::config::{PipelineArgs, PipelineConfig};
use nhl_warehouse::pipeline::{self, StepStatus};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

fn main() -> Result<ExitCode> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    init_tracing();

    let args = PipelineArgs::parse();
    let cfg = PipelineConfig::from_args(&args)?;
    println!("Run {} | season {}", cfg.run_id, cfg.season_label());
    println!("Data root: {}", cfg.paths.data_root.display());

    let run = pipeline::run(&cfg)?;
    for step in &run.steps {
        let status = match step.status {
            StepStatus::Ok => "ok",
            StepStatus::Failed => "FAILED",
        };
        println!("{:<12} {:<7} {:>8.1}s", step.step, status, step.seconds);
        if let Some(err) = &step.error {
            println!("   - {err}");
        }
    }
    println!("Run log: {}", run.log_path.display());

    Ok(if run.failed_step().is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

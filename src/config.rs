use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use clap::{ArgAction, Parser, ValueEnum};

use crate::datasets::{self, DatasetSpec};
use crate::error::PipelineError;
use crate::rolling::WindowPolicy;

const DEFAULT_THREADS: usize = 4;
const DEFAULT_MEM_LIMIT: &str = "6GB";
const SEASON_START_MONTH: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum Stage {
    Download,
    Extract,
    Bronze,
    Silver,
    LinesReady,
    Gold,
    Warehouse,
}

impl Stage {
    pub const ORDER: [Stage; 7] = [
        Stage::Download,
        Stage::Extract,
        Stage::Bronze,
        Stage::Silver,
        Stage::LinesReady,
        Stage::Gold,
        Stage::Warehouse,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Bronze => "bronze",
            Stage::Silver => "silver",
            Stage::LinesReady => "lines_ready",
            Stage::Gold => "gold",
            Stage::Warehouse => "warehouse",
        }
    }
}

/// MoneyPuck game-by-game warehouse pipeline
#[derive(Parser, Debug, Clone)]
#[command(name = "nhl_warehouse", version, about)]
pub struct PipelineArgs {
    /// Root directory for raw, staged and warehouse data
    #[arg(long, env = "NHL_DATA_ROOT", default_value = "./data/NHL_MoneyPuck")]
    pub data_root: PathBuf,

    /// Scratch directory where stage outputs are built before being synced
    #[arg(long, env = "NHL_LOCAL_ROOT", default_value = "./tmp_nhl")]
    pub local_root: PathBuf,

    /// Suffix for bronze/silver/gold/logs directories; empty for plain names
    #[arg(long, env = "PIPELINE_TAG", default_value = "v3")]
    pub pipeline_tag: String,

    /// Warehouse SQLite file (defaults to <data_root>/warehouse/nhl_warehouse.sqlite)
    #[arg(long, env = "NHL_WAREHOUSE_DB")]
    pub warehouse_db: Option<PathBuf>,

    /// Worker threads for the embedded SQL engine and batch standardization
    #[arg(long, env = "NHL_THREADS", default_value_t = DEFAULT_THREADS)]
    pub threads: usize,

    /// Memory budget for the embedded SQL engine, e.g. 512MB or 6GB
    #[arg(long, env = "NHL_MEM_LIMIT", default_value = DEFAULT_MEM_LIMIT)]
    pub mem_limit: String,

    /// Suppress partially populated rolling windows
    #[arg(long, env = "NHL_STRICT_ROLLING")]
    pub strict_rolling: bool,

    /// Drop non regular-season games while standardizing per-game datasets
    #[arg(long, env = "NHL_RS_ONLY_SILVER", default_value_t = true, action = ArgAction::Set)]
    pub rs_only_in_silver: bool,

    /// Re-apply the regular-season predicate when building gold partitions
    #[arg(long, env = "NHL_RS_ONLY_GOLD", default_value_t = true, action = ArgAction::Set)]
    pub rs_only_in_gold: bool,

    /// Rebuild static (historical) datasets in every stage
    #[arg(long, env = "NHL_FORCE_STATIC")]
    pub force_static: bool,

    /// Always refresh rolling (current-season) datasets in every stage
    #[arg(long, env = "NHL_ROLLING_REFRESH", default_value_t = true, action = ArgAction::Set)]
    pub rolling_refresh: bool,

    /// Re-extract archives even when their stamp is unchanged
    #[arg(long, env = "NHL_FORCE_EXTRACT")]
    pub force_extract: bool,

    /// Override the detected current season start year
    #[arg(long, env = "NHL_CURRENT_SEASON")]
    pub current_season: Option<i32>,

    /// Stages to skip
    #[arg(long, value_enum, value_delimiter = ',')]
    pub skip: Vec<Stage>,
}

#[derive(Debug, Clone)]
pub struct Paths {
    pub data_root: PathBuf,
    pub local_root: PathBuf,
    pub raw: PathBuf,
    pub extracted: PathBuf,
    pub bronze: PathBuf,
    pub silver: PathBuf,
    pub gold: PathBuf,
    pub logs: PathBuf,
    pub warehouse_db: PathBuf,
}

impl Paths {
    pub fn new(data_root: &Path, local_root: &Path, tag: &str) -> Self {
        let tagged = |name: &str| {
            if tag.is_empty() {
                data_root.join(name)
            } else {
                data_root.join(format!("{name}_{tag}"))
            }
        };
        Self {
            data_root: data_root.to_path_buf(),
            local_root: local_root.to_path_buf(),
            raw: data_root.join("raw"),
            extracted: data_root.join("extracted"),
            bronze: tagged("bronze"),
            silver: tagged("silver"),
            gold: tagged("gold"),
            logs: tagged("logs"),
            warehouse_db: data_root.join("warehouse").join("nhl_warehouse.sqlite"),
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.data_root,
            &self.raw,
            &self.extracted,
            &self.bronze,
            &self.silver,
            &self.gold,
            &self.logs,
            &self.local_root,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcePair {
    pub static_sources: bool,
    pub rolling_sources: bool,
}

impl ForcePair {
    pub fn for_source(self, rolling: bool) -> bool {
        if rolling {
            self.rolling_sources
        } else {
            self.static_sources
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub download: ForcePair,
    pub extract: bool,
    pub bronze: ForcePair,
    pub silver: ForcePair,
    pub gold: ForcePair,
}

impl RefreshPolicy {
    pub fn uniform(force_static: bool, rolling_refresh: bool, force_extract: bool) -> Self {
        let pair = ForcePair {
            static_sources: force_static,
            rolling_sources: rolling_refresh,
        };
        Self {
            download: pair,
            extract: force_extract,
            bronze: pair,
            silver: pair,
            gold: pair,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    pub threads: usize,
    pub memory_limit_bytes: u64,
}

/// Immutable settings shared by every stage of one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub paths: Paths,
    pub run_id: String,
    pub current_season: i32,
    pub refresh_seasons: BTreeSet<i32>,
    pub window_policy: WindowPolicy,
    pub rs_only_in_silver: bool,
    pub rs_only_in_gold: bool,
    pub refresh: RefreshPolicy,
    pub stages: BTreeSet<Stage>,
    pub engine: EngineLimits,
    pub datasets: Vec<DatasetSpec>,
}

impl PipelineConfig {
    pub fn new(data_root: &Path, local_root: &Path, today: NaiveDate) -> Self {
        let current_season = current_season_start(today);
        Self {
            paths: Paths::new(data_root, local_root, "v3"),
            run_id: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            current_season,
            refresh_seasons: BTreeSet::from([current_season]),
            window_policy: WindowPolicy::Partial,
            rs_only_in_silver: true,
            rs_only_in_gold: true,
            refresh: RefreshPolicy::uniform(false, true, false),
            stages: Stage::ORDER.into_iter().collect(),
            engine: EngineLimits {
                threads: DEFAULT_THREADS,
                memory_limit_bytes: 6 * 1024 * 1024 * 1024,
            },
            datasets: datasets::registry(current_season),
        }
    }

    pub fn from_args(args: &PipelineArgs) -> Result<Self> {
        let today = Local::now().date_naive();
        let mut cfg = Self::new(&args.data_root, &args.local_root, today);
        cfg.paths = Paths::new(&args.data_root, &args.local_root, args.pipeline_tag.trim());
        if let Some(db) = &args.warehouse_db {
            cfg.paths.warehouse_db = db.clone();
        }
        if let Some(season) = args.current_season {
            cfg.current_season = season;
            cfg.refresh_seasons = BTreeSet::from([season]);
            cfg.datasets = datasets::registry(season);
        }
        if args.threads == 0 {
            return Err(PipelineError::Config("threads must be at least 1".into()).into());
        }
        cfg.engine = EngineLimits {
            threads: args.threads,
            memory_limit_bytes: parse_mem_limit(&args.mem_limit)?,
        };
        cfg.window_policy = if args.strict_rolling {
            WindowPolicy::Strict
        } else {
            WindowPolicy::Partial
        };
        cfg.rs_only_in_silver = args.rs_only_in_silver;
        cfg.rs_only_in_gold = args.rs_only_in_gold;
        cfg.refresh =
            RefreshPolicy::uniform(args.force_static, args.rolling_refresh, args.force_extract);
        cfg.stages = Stage::ORDER
            .into_iter()
            .filter(|s| !args.skip.contains(s))
            .collect();
        Ok(cfg)
    }

    pub fn stage_enabled(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn season_label(&self) -> String {
        format!(
            "{}-{:02}",
            self.current_season,
            (self.current_season + 1).rem_euclid(100)
        )
    }
}

/// Seasons start in the fall; from July onwards the new season is current.
pub fn current_season_start(today: NaiveDate) -> i32 {
    if today.month() >= SEASON_START_MONTH {
        today.year()
    } else {
        today.year() - 1
    }
}

pub fn parse_mem_limit(raw: &str) -> Result<u64> {
    let t = raw.trim().to_ascii_uppercase();
    let t = t.strip_suffix('B').unwrap_or(&t);
    let (digits, mult) = match t.chars().last() {
        Some('K') => (&t[..t.len() - 1], 1024u64),
        Some('M') => (&t[..t.len() - 1], 1024u64.pow(2)),
        Some('G') => (&t[..t.len() - 1], 1024u64.pow(3)),
        Some('T') => (&t[..t.len() - 1], 1024u64.pow(4)),
        _ => (t, 1u64),
    };
    let value = digits
        .trim()
        .parse::<f64>()
        .map_err(|_| PipelineError::Config(format!("bad memory limit {raw:?}")))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(PipelineError::Config(format!("bad memory limit {raw:?}")).into());
    }
    Ok((value * mult as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn season_rolls_over_in_july() {
        let june = NaiveDate::from_ymd_opt(2025, 6, 30).expect("date");
        let july = NaiveDate::from_ymd_opt(2025, 7, 1).expect("date");
        assert_eq!(current_season_start(june), 2024);
        assert_eq!(current_season_start(july), 2025);
    }

    #[test]
    fn memory_limits_parse() {
        assert_eq!(parse_mem_limit("6GB").expect("6GB"), 6 * 1024 * 1024 * 1024);
        assert_eq!(parse_mem_limit("512mb").expect("512mb"), 512 * 1024 * 1024);
        assert_eq!(parse_mem_limit("2048").expect("bytes"), 2048);
        assert!(parse_mem_limit("lots").is_err());
        assert!(parse_mem_limit("0GB").is_err());
    }

    #[test]
    fn tagged_paths() {
        let p = Paths::new(Path::new("/d"), Path::new("/l"), "v3");
        assert_eq!(p.bronze, PathBuf::from("/d/bronze_v3"));
        assert_eq!(p.raw, PathBuf::from("/d/raw"));
        let plain = Paths::new(Path::new("/d"), Path::new("/l"), "");
        assert_eq!(plain.gold, PathBuf::from("/d/gold"));
    }

    #[test]
    fn args_build_config() {
        let args = PipelineArgs::try_parse_from([
            "nhl_warehouse",
            "--data-root",
            "/tmp/nhl",
            "--strict-rolling",
            "--current-season",
            "2024",
            "--skip",
            "download,extract",
        ])
        .expect("args");
        let cfg = PipelineConfig::from_args(&args).expect("config");
        assert_eq!(cfg.window_policy, WindowPolicy::Strict);
        assert_eq!(cfg.current_season, 2024);
        assert_eq!(cfg.season_label(), "2024-25");
        assert!(cfg.refresh_seasons.contains(&2024));
        assert!(!cfg.stage_enabled(Stage::Download));
        assert!(cfg.stage_enabled(Stage::Gold));
    }
}

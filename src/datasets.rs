use serde::{Deserialize, Serialize};

const MONEYPUCK_BASE: &str = "https://moneypuck.com/moneypuck/playerData";
const MIRROR_BASE: &str = "https://peter-tanner.com/moneypuck/downloads";

pub const CSV_CHUNKSIZE_DEFAULT: usize = 200_000;

pub const LINES_GAME_READY_KEY: &str = "lines_game_ready";
pub const LINES_SEASON_READY_KEY: &str = "lines_season_ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Csv,
    Zip,
}

impl SourceKind {
    pub fn extension(self) -> &'static str {
        match self {
            SourceKind::Csv => "csv",
            SourceKind::Zip => "zip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLevel {
    Season,
    Gbg,
    Lookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Static,
    Rolling,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSpec {
    pub key: String,
    pub kind: SourceKind,
    pub level: DataLevel,
    pub source_type: SourceType,
    pub urls: Vec<String>,
    pub chunk_size: Option<usize>,
}

impl DatasetSpec {
    fn new(
        key: &str,
        kind: SourceKind,
        level: DataLevel,
        source_type: SourceType,
        url: String,
    ) -> Self {
        Self {
            key: key.to_string(),
            kind,
            level,
            source_type,
            urls: vec![url],
            chunk_size: None,
        }
    }

    fn chunked(mut self, rows: usize) -> Self {
        self.chunk_size = Some(rows);
        self
    }

    pub fn is_rolling(&self) -> bool {
        self.source_type == SourceType::Rolling
    }

    pub fn is_game_level(&self) -> bool {
        self.level == DataLevel::Gbg
    }

    pub fn raw_file_name(&self) -> String {
        format!("{}.{}", self.key, self.kind.extension())
    }

    pub fn chunk_rows(&self) -> usize {
        self.chunk_size.unwrap_or(CSV_CHUNKSIZE_DEFAULT)
    }
}

/// Per-game datasets are keyed `gbg_*`; the standardizer's regular-season filter
/// applies to those only.
pub fn is_game_level_key(key: &str) -> bool {
    key.starts_with("gbg_")
}

pub fn registry(current_season: i32) -> Vec<DatasetSpec> {
    use DataLevel::*;
    use SourceKind::*;
    use SourceType::*;

    let season = current_season;
    let summary = |kind: &str| format!("{MONEYPUCK_BASE}/seasonSummary/{season}/regular/{kind}.csv");
    let hist_summary =
        |kind: &str| format!("{MIRROR_BASE}/historicalOneRowPerSeason/{kind}_2008_to_2024.zip");
    let gbg_current = |kind: &str| format!("{MIRROR_BASE}/seasonPlayersSummary/{kind}/{season}.zip");
    let gbg_hist = |kind: &str| format!("{MIRROR_BASE}/seasonPlayersSummary/{kind}/2008_to_2024.zip");

    vec![
        DatasetSpec::new("season_skaters_current", Csv, Season, Rolling, summary("skaters")),
        DatasetSpec::new("season_goalies_current", Csv, Season, Rolling, summary("goalies")),
        DatasetSpec::new("season_lines_current", Csv, Season, Rolling, summary("lines")),
        DatasetSpec::new("season_teams_current", Csv, Season, Rolling, summary("teams")),
        DatasetSpec::new("season_skaters_hist_zip", Zip, Season, Static, hist_summary("skaters")),
        DatasetSpec::new("season_goalies_hist_zip", Zip, Season, Static, hist_summary("goalies")),
        DatasetSpec::new("season_lines_hist_zip", Zip, Season, Static, hist_summary("lines")),
        DatasetSpec::new("season_teams_hist_zip", Zip, Season, Static, hist_summary("teams")),
        DatasetSpec::new("gbg_skaters_current_zip", Zip, Gbg, Rolling, gbg_current("skaters")),
        DatasetSpec::new("gbg_goalies_current_zip", Zip, Gbg, Rolling, gbg_current("goalies")),
        DatasetSpec::new("gbg_lines_current_zip", Zip, Gbg, Rolling, gbg_current("lines")),
        DatasetSpec::new("gbg_skaters_hist_zip", Zip, Gbg, Static, gbg_hist("skaters")).chunked(120_000),
        DatasetSpec::new("gbg_goalies_hist_zip", Zip, Gbg, Static, gbg_hist("goalies")),
        DatasetSpec::new("gbg_lines_hist_zip", Zip, Gbg, Static, gbg_hist("lines")).chunked(150_000),
        DatasetSpec::new(
            "gbg_teams_all",
            Csv,
            Gbg,
            Rolling,
            format!("{MONEYPUCK_BASE}/careers/gameByGame/all_teams.csv"),
        ),
        DatasetSpec::new(
            "data_dictionary_players",
            Csv,
            Lookup,
            Static,
            format!("{MIRROR_BASE}/MoneyPuckDataDictionaryForPlayers.csv"),
        ),
        DatasetSpec::new(
            "player_bios",
            Csv,
            Lookup,
            Rolling,
            format!("{MONEYPUCK_BASE}/playerBios/allPlayersLookup.csv"),
        ),
    ]
}

pub fn find<'a>(datasets: &'a [DatasetSpec], key: &str) -> Option<&'a DatasetSpec> {
    datasets.iter().find(|d| d.key == key)
}

use std::collections::HashMap;
use std::fmt;

const TEAM_ALIASES: &[(&str, &str)] = &[
    ("TB", "TBL"),
    ("TBL", "TBL"),
    ("LA", "LAK"),
    ("LAK", "LAK"),
    ("NJ", "NJD"),
    ("NJD", "NJD"),
    ("SJ", "SJS"),
    ("SJS", "SJS"),
    ("PHX", "ARI"),
];

const COMBO_ID_LEN: usize = 7;
const COMBO_ID_LEAD: u8 = b'8';
const MAX_COMBO_MEMBERS: usize = 3;

const REGULAR_SEASON_GAME_TYPE: &str = "02";

/// Canonical three-letter team code. Punctuation and spaces are stripped before
/// the alias lookup, so `T.B`, `tb` and `TBL` all land on `TBL`.
pub fn canonicalize_team(raw: &str) -> String {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|ch| *ch != '.' && !ch.is_whitespace())
        .flat_map(|ch| ch.to_uppercase())
        .collect();
    TEAM_ALIASES
        .iter()
        .find(|(alias, _)| *alias == stripped)
        .map(|(_, code)| code.to_string())
        .unwrap_or(stripped)
}

/// Recovers member player ids from a composite line id. Ids are 7 digits with a
/// leading `8`; duplicates are dropped and at most three are returned.
pub fn decode_combination_ids(composite: &str) -> Vec<String> {
    let raw = composite.trim();
    let raw = raw.strip_suffix(".0").unwrap_or(raw);
    let bytes = raw.as_bytes();

    let mut out: Vec<String> = Vec::new();
    let mut idx = 0usize;
    while idx + COMBO_ID_LEN <= bytes.len() {
        let window = &bytes[idx..idx + COMBO_ID_LEN];
        if window[0] == COMBO_ID_LEAD && window.iter().all(u8::is_ascii_digit) {
            let id = String::from_utf8_lossy(window).into_owned();
            if !out.contains(&id) {
                out.push(id);
            }
            idx += COMBO_ID_LEN;
        } else {
            idx += 1;
        }
    }
    out.truncate(MAX_COMBO_MEMBERS);
    out
}

/// Expected number of members for a declared unit type.
pub fn expected_unit_size(position: &str) -> usize {
    if position.trim().eq_ignore_ascii_case("pair") {
        2
    } else {
        3
    }
}

/// `team__unit__id-id[-id]` with ids sorted, or `None` when the member count
/// doesn't match a 2- or 3-player unit.
pub fn combination_key(team: &str, unit_type: &str, member_ids: &[String]) -> Option<String> {
    let ids = combination_ids_key(member_ids)?;
    Some(format!(
        "{}__{}__{}",
        team,
        unit_type.trim().to_lowercase(),
        ids
    ))
}

pub fn combination_ids_key(member_ids: &[String]) -> Option<String> {
    let mut ids: Vec<&str> = member_ids
        .iter()
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .collect();
    if ids.len() != member_ids.len() || !(2..=3).contains(&ids.len()) {
        return None;
    }
    ids.sort_unstable();
    Some(ids.join("-"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Situation {
    All,
    FiveOnFive,
    PowerPlay,
    PenaltyKill,
}

impl Situation {
    pub const ALL: [Situation; 4] = [
        Situation::All,
        Situation::FiveOnFive,
        Situation::PowerPlay,
        Situation::PenaltyKill,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "all" => Some(Situation::All),
            "5v5" | "5on5" => Some(Situation::FiveOnFive),
            "5on4" => Some(Situation::PowerPlay),
            "4on5" => Some(Situation::PenaltyKill),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Situation::All => "all",
            Situation::FiveOnFive => "5v5",
            Situation::PowerPlay => "5on4",
            Situation::PenaltyKill => "4on5",
        }
    }

    /// Partition directories are walked in name order, matching how they sort on disk.
    pub fn sorted_by_name() -> Vec<Situation> {
        let mut out = Self::ALL.to_vec();
        out.sort_by_key(|s| s.as_str());
        out
    }
}

impl fmt::Display for Situation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Game ids are `SSSSTTNNNN`: season, game type, game number. Regular season is type `02`;
/// a present, non-zero playoff flag also disqualifies the row.
pub fn is_regular_season(game_id: &str, playoff_flag: Option<i64>) -> bool {
    let trimmed = game_id.trim();
    let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    if trimmed.is_empty() {
        return false;
    }
    let padded = format!("{trimmed:0>10}");
    let game_type = padded.get(4..6).unwrap_or("");
    game_type == REGULAR_SEASON_GAME_TYPE && playoff_flag.unwrap_or(0) == 0
}

pub fn to_snake_case(col: &str) -> String {
    let replaced = col.trim().replace('%', "pct").replace('/', "_per_");
    let mut out = String::with_capacity(replaced.len());
    let mut last_underscore = false;
    for ch in replaced.chars() {
        let mapped = if ch.is_alphanumeric() || ch == '_' { ch } else { '_' };
        if mapped == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.extend(mapped.to_lowercase());
    }
    out.trim_matches('_').to_string()
}

/// Disambiguates repeated names with `__1`, `__2`, ... suffixes.
pub fn make_unique(cols: &[String]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(cols.len());
    for col in cols {
        match seen.get_mut(col) {
            Some(count) => {
                *count += 1;
                out.push(format!("{col}__{count}"));
            }
            None => {
                seen.insert(col.clone(), 0);
                out.push(col.clone());
            }
        }
    }
    out
}

/// `(stat / toi) * 60`, undefined for a non-positive denominator.
pub fn per60(stat: Option<f64>, toi: Option<f64>) -> Option<f64> {
    let toi = toi?;
    if toi.is_nan() || toi <= 0.0 {
        return None;
    }
    Some(stat? / toi * 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_aliases_collapse() {
        assert_eq!(canonicalize_team("T.B"), "TBL");
        assert_eq!(canonicalize_team(" l.a "), "LAK");
        assert_eq!(canonicalize_team("N.J"), "NJD");
        assert_eq!(canonicalize_team("PHX"), "ARI");
        assert_eq!(canonicalize_team("bos"), "BOS");
        assert_eq!(canonicalize_team("St. L"), "STL");
    }

    #[test]
    fn team_canonicalization_is_idempotent() {
        for raw in ["T.B", "tb", "S.J", "phx", "Mtl", "a.b.c", "", "  x y  ", "L.A"] {
            let once = canonicalize_team(raw);
            assert_eq!(canonicalize_team(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn decodes_concatenated_ids() {
        assert_eq!(
            decode_combination_ids("847121484712158471216"),
            vec!["8471214", "8471215", "8471216"]
        );
        assert_eq!(
            decode_combination_ids("84712148471215.0"),
            vec!["8471214", "8471215"]
        );
        assert_eq!(decode_combination_ids("8471214-8471214"), vec!["8471214"]);
        assert!(decode_combination_ids("").is_empty());
        assert!(decode_combination_ids("1234567").is_empty());
    }

    #[test]
    fn decode_truncates_to_three() {
        let ids = decode_combination_ids("8000001800000280000038000004");
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[2], "8000003");
    }

    #[test]
    fn combination_key_ignores_member_order() {
        let a = vec!["8471215".to_string(), "8471214".to_string()];
        let b = vec!["8471214".to_string(), "8471215".to_string()];
        assert_eq!(
            combination_key("BOS", "Pair", &a),
            combination_key("BOS", "pair", &b)
        );
        assert_eq!(
            combination_key("BOS", "pair", &a).as_deref(),
            Some("BOS__pair__8471214-8471215")
        );

        let perms = [
            ["8000003", "8000001", "8000002"],
            ["8000001", "8000003", "8000002"],
            ["8000002", "8000001", "8000003"],
        ];
        let keys: Vec<_> = perms
            .iter()
            .map(|p| {
                let ids: Vec<String> = p.iter().map(|s| s.to_string()).collect();
                combination_key("TOR", "line", &ids)
            })
            .collect();
        assert!(keys.iter().all(|k| k == &keys[0]));
        assert!(combination_key("TOR", "line", &["8000001".to_string()]).is_none());
    }

    #[test]
    fn regular_season_decode() {
        assert!(is_regular_season("2024020001", None));
        assert!(is_regular_season("2024020001", Some(0)));
        assert!(!is_regular_season("2024020001", Some(1)));
        assert!(!is_regular_season("2024030111", None));
        assert!(!is_regular_season("2024010005", None));
        assert!(!is_regular_season("", None));
    }

    #[test]
    fn situation_folds_legacy_alias() {
        assert_eq!(Situation::parse("5on5"), Some(Situation::FiveOnFive));
        assert_eq!(Situation::parse(" 5v5 "), Some(Situation::FiveOnFive));
        assert_eq!(Situation::parse("other"), None);
        assert_eq!(
            Situation::sorted_by_name()
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>(),
            vec!["4on5", "5on4", "5v5", "all"]
        );
    }

    #[test]
    fn snake_case_headers() {
        assert_eq!(to_snake_case("I_F_xGoals"), "i_f_xgoals");
        assert_eq!(to_snake_case("Corsi %"), "corsi_pct");
        assert_eq!(to_snake_case("Goals/60"), "goals_per_60");
        assert_eq!(to_snake_case(" on-ice  xG "), "on_ice_xg");
        let cols = vec!["a".to_string(), "b".to_string(), "a".to_string(), "a".to_string()];
        assert_eq!(make_unique(&cols), vec!["a", "b", "a__1", "a__2"]);
    }

    #[test]
    fn per60_guards_denominator() {
        assert_eq!(per60(Some(3.0), Some(40.0)), Some(4.5));
        assert_eq!(per60(Some(3.0), Some(0.0)), None);
        assert_eq!(per60(Some(3.0), Some(-1.0)), None);
        assert_eq!(per60(None, Some(10.0)), None);
        assert_eq!(per60(Some(1.0), None), None);
    }
}

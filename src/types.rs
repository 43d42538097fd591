use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

// ── Constants ──────────────────────────────────────────────────────────

pub const SYNC_EVENT_CAPACITY: usize = 64;
pub const REMOTE_EVENT_BUFFER: usize = 256;
pub const REALTIME_READ_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_SIMULATION_TICK_MS: u64 = 50;
pub const SIMULATION_TICK_LIMIT: u64 = 100_000;

/// Set-result tag meaning "not decided yet".
pub const SET_UNDECIDED: u8 = 0;

// ── Ids and shared state aliases ───────────────────────────────────────

pub type MatchId = String;
pub type DivisionId = String;
pub type TeamId = String;

/// Immutable snapshot of every cached match, swapped as a whole on each mutation.
pub type MatchSnapshot = Arc<HashMap<MatchId, Match>>;
pub type SharedMatches = Arc<Mutex<HashMap<MatchId, Match>>>;
pub type SharedIgnoreSlot = Arc<Mutex<Option<MatchId>>>;

// ── Bracket enums ──────────────────────────────────────────────────────

/// Winners-bracket vs losers-bracket partition of a double-elimination graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Lane {
    #[default]
    Winners,
    Losers,
}

impl Lane {
    pub fn from_losers_flag(losers: bool) -> Self {
        if losers {
            Lane::Losers
        } else {
            Lane::Winners
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Lane::Winners => Lane::Losers,
            Lane::Losers => Lane::Winners,
        }
    }
}

/// Which outgoing pointer of a match an edge occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeKind {
    /// Carries the winner forward (`winnerNextMatchId`).
    Winner,
    /// Drops the loser into another match (`loserNextMatchId`).
    Loser,
}

impl EdgeKind {
    pub fn opposite(self) -> Self {
        match self {
            EdgeKind::Winner => EdgeKind::Loser,
            EdgeKind::Loser => EdgeKind::Winner,
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::Winner => f.write_str("winner"),
            EdgeKind::Loser => f.write_str("loser"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Team {
    One,
    Two,
}

impl Team {
    pub fn from_is_team1(is_team1: bool) -> Self {
        if is_team1 {
            Team::One
        } else {
            Team::Two
        }
    }

    /// Tag stored in `setResults` for a set this team won.
    pub fn tag(self) -> u8 {
        match self {
            Team::One => 1,
            Team::Two => 2,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Team::One => Team::Two,
            Team::Two => Team::One,
        }
    }
}

// ── Match entity ───────────────────────────────────────────────────────

/// One node of the bracket graph.
///
/// Edges are weak id references into the division-scoped arena. They are
/// authored from the "next" side; `previous_*` pointers are derived by
/// whoever lays the graph out (see `MatchGraph::derive_previous`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: MatchId,
    pub match_number: u32,
    pub division_id: DivisionId,
    #[serde(default)]
    pub losers_bracket: bool,
    #[serde(default)]
    pub team1_id: Option<TeamId>,
    #[serde(default)]
    pub team2_id: Option<TeamId>,
    #[serde(default, rename = "refId")]
    pub referee_id: Option<String>,
    #[serde(default, rename = "field")]
    pub field_id: Option<String>,
    #[serde(default)]
    pub team1_points: Vec<u32>,
    #[serde(default)]
    pub team2_points: Vec<u32>,
    #[serde(default)]
    pub set_results: Vec<u8>,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, alias = "refCheckedIn")]
    pub referee_checked_in: Option<bool>,
    #[serde(default)]
    pub winner_next_match_id: Option<MatchId>,
    #[serde(default)]
    pub loser_next_match_id: Option<MatchId>,
    #[serde(default)]
    pub previous_left_match_id: Option<MatchId>,
    #[serde(default)]
    pub previous_right_match_id: Option<MatchId>,
}

impl Match {
    pub fn new(
        id: impl Into<MatchId>,
        match_number: u32,
        division_id: impl Into<DivisionId>,
        start: DateTime<Utc>,
    ) -> Self {
        Match {
            id: id.into(),
            match_number,
            division_id: division_id.into(),
            losers_bracket: false,
            team1_id: None,
            team2_id: None,
            referee_id: None,
            field_id: None,
            team1_points: Vec::new(),
            team2_points: Vec::new(),
            set_results: Vec::new(),
            start,
            end: None,
            referee_checked_in: None,
            winner_next_match_id: None,
            loser_next_match_id: None,
            previous_left_match_id: None,
            previous_right_match_id: None,
        }
    }

    pub fn lane(&self) -> Lane {
        Lane::from_losers_flag(self.losers_bracket)
    }

    pub fn next(&self, edge: EdgeKind) -> Option<&MatchId> {
        match edge {
            EdgeKind::Winner => self.winner_next_match_id.as_ref(),
            EdgeKind::Loser => self.loser_next_match_id.as_ref(),
        }
    }

    pub fn set_next(&mut self, edge: EdgeKind, target: Option<MatchId>) {
        match edge {
            EdgeKind::Winner => self.winner_next_match_id = target,
            EdgeKind::Loser => self.loser_next_match_id = target,
        }
    }

    /// A match with neither next-pointer set is the last match of its path.
    pub fn is_terminal(&self) -> bool {
        self.winner_next_match_id.is_none() && self.loser_next_match_id.is_none()
    }

    pub fn is_referee_checked_in(&self) -> bool {
        self.referee_checked_in == Some(true)
    }

    pub fn team(&self, team: Team) -> Option<&TeamId> {
        match team {
            Team::One => self.team1_id.as_ref(),
            Team::Two => self.team2_id.as_ref(),
        }
    }

    pub fn team_mut(&mut self, team: Team) -> &mut Option<TeamId> {
        match team {
            Team::One => &mut self.team1_id,
            Team::Two => &mut self.team2_id,
        }
    }

    pub fn points_mut(&mut self, team: Team) -> &mut Vec<u32> {
        match team {
            Team::One => &mut self.team1_points,
            Team::Two => &mut self.team2_points,
        }
    }

    pub fn sets_won(&self, team: Team) -> usize {
        let tag = team.tag();
        self.set_results.iter().filter(|result| **result == tag).count()
    }

    /// Number of sets already decided; this is the index of the set in play.
    pub fn decided_sets(&self) -> usize {
        self.set_results
            .iter()
            .filter(|result| **result != SET_UNDECIDED)
            .count()
    }
}

// ── Config types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub remote_url: String,
    pub realtime_url: String,
    pub api_key: String,
    pub tournament_id: String,
    pub log_dir: String,
    pub log_filter: String,
    pub simulation_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            realtime_url: String::new(),
            api_key: String::new(),
            tournament_id: String::new(),
            log_dir: "logs".to_string(),
            log_filter: "info".to_string(),
            simulation_tick_ms: DEFAULT_SIMULATION_TICK_MS,
        }
    }
}

use crate::error::ScoreError;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ── Tournament scoring config ──────────────────────────────────────────

/// Per-lane set rules for one tournament. Index `i` of every per-set array
/// applies to set `i`; arrays must cover the lane's set count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentScoringConfig {
  pub winner_set_count: usize,
  pub loser_set_count: usize,
  pub winner_bracket_points_to_victory: Vec<u32>,
  pub loser_bracket_points_to_victory: Vec<u32>,
  pub winner_score_limits_per_set: Vec<u32>,
  pub loser_score_limits_per_set: Vec<u32>,
}

impl TournamentScoringConfig {
  /// Same rules for every set in both lanes.
  pub fn uniform(winner_sets: usize, loser_sets: usize, points_to_victory: u32, score_limit: u32) -> Self {
    Self {
      winner_set_count: winner_sets,
      loser_set_count: loser_sets,
      winner_bracket_points_to_victory: vec![points_to_victory; winner_sets],
      loser_bracket_points_to_victory: vec![points_to_victory; loser_sets],
      winner_score_limits_per_set: vec![score_limit; winner_sets],
      loser_score_limits_per_set: vec![score_limit; loser_sets],
    }
  }

  pub fn from_json(raw: &str) -> Result<Self, ScoreError> {
    let config =
      serde_json::from_str::<Self>(raw).map_err(|e| ScoreError::InvalidConfig(e.to_string()))?;
    config.validated()
  }

  pub fn validated(self) -> Result<Self, ScoreError> {
    for lane in [Lane::Winners, Lane::Losers] {
      let count = self.set_count(lane);
      if count == 0 {
        return Err(ScoreError::InvalidConfig(format!("{lane:?} lane has no sets")));
      }
      let (floors, limits) = self.lane_arrays(lane);
      if floors.len() < count || limits.len() < count {
        return Err(ScoreError::InvalidConfig(format!(
          "{lane:?} lane needs {count} per-set entries, got {} points-to-victory and {} limits",
          floors.len(),
          limits.len()
        )));
      }
      for set in 0..count {
        if floors[set] == 0 || limits[set] < floors[set] {
          return Err(ScoreError::InvalidConfig(format!(
            "{lane:?} set {set}: limit {} below points-to-victory {}",
            limits[set], floors[set]
          )));
        }
      }
    }
    Ok(self)
  }

  pub fn set_count(&self, lane: Lane) -> usize {
    match lane {
      Lane::Winners => self.winner_set_count,
      Lane::Losers => self.loser_set_count,
    }
  }

  /// Set wins needed to take the match: `ceil(set_count / 2)`.
  pub fn sets_to_win(&self, lane: Lane) -> usize {
    self.set_count(lane).div_ceil(2)
  }

  pub fn points_to_victory(&self, lane: Lane, set: usize) -> Result<u32, ScoreError> {
    self.per_set(lane, set).map(|(floor, _)| floor)
  }

  pub fn score_limit(&self, lane: Lane, set: usize) -> Result<u32, ScoreError> {
    self.per_set(lane, set).map(|(_, limit)| limit)
  }

  fn lane_arrays(&self, lane: Lane) -> (&[u32], &[u32]) {
    match lane {
      Lane::Winners => (
        &self.winner_bracket_points_to_victory,
        &self.winner_score_limits_per_set,
      ),
      Lane::Losers => (
        &self.loser_bracket_points_to_victory,
        &self.loser_score_limits_per_set,
      ),
    }
  }

  fn per_set(&self, lane: Lane, set: usize) -> Result<(u32, u32), ScoreError> {
    let configured = self.set_count(lane);
    let (floors, limits) = self.lane_arrays(lane);
    match (floors.get(set), limits.get(set)) {
      (Some(floor), Some(limit)) if set < configured => Ok((*floor, *limit)),
      _ => Err(ScoreError::SetOutOfRange { set, configured }),
    }
  }
}

// ── Match state ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
  NotStarted,
  InProgress { current_set: usize },
  Complete { winner: Team },
}

/// Result of one scoring intent. Intents that are not allowed in the
/// current state are reported, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreOutcome {
  PointScored { set: usize },
  PointRemoved { set: usize },
  SetWon { set: usize, winner: Team },
  MatchWon { winner: Team },
  RefereeNotCheckedIn,
  AlreadyComplete,
  NothingToRemove,
}

impl ScoreOutcome {
  /// True when the match was mutated and should be committed.
  pub fn changed(self) -> bool {
    matches!(
      self,
      ScoreOutcome::PointScored { .. }
        | ScoreOutcome::PointRemoved { .. }
        | ScoreOutcome::SetWon { .. }
        | ScoreOutcome::MatchWon { .. }
    )
  }
}

// ── Scoring machine ────────────────────────────────────────────────────

/// Applies scoring intents to a match under one tournament config. The
/// lane rules come from the match's own `losers_bracket` flag, never from
/// the lane being viewed.
#[derive(Debug, Clone, Copy)]
pub struct ScoringMachine<'a> {
  config: &'a TournamentScoringConfig,
}

impl<'a> ScoringMachine<'a> {
  pub fn new(config: &'a TournamentScoringConfig) -> Self {
    Self { config }
  }

  pub fn winner(&self, m: &Match) -> Option<Team> {
    let needed = self.config.sets_to_win(m.lane());
    [Team::One, Team::Two]
      .into_iter()
      .find(|team| m.sets_won(*team) >= needed)
  }

  pub fn state(&self, m: &Match) -> MatchState {
    if let Some(winner) = self.winner(m) {
      return MatchState::Complete { winner };
    }
    if !m.is_referee_checked_in() {
      return MatchState::NotStarted;
    }
    MatchState::InProgress {
      current_set: m.decided_sets(),
    }
  }

  pub fn is_finished(&self, m: &Match) -> bool {
    self.winner(m).is_some()
  }

  pub fn can_increment(&self, m: &Match) -> bool {
    matches!(self.state(m), MatchState::InProgress { current_set } if current_set < self.config.set_count(m.lane()))
  }

  /// Marks the referee present. Returns false when already checked in.
  pub fn confirm_referee_check_in(&self, m: &mut Match) -> bool {
    if m.is_referee_checked_in() {
      return false;
    }
    m.referee_checked_in = Some(true);
    info!(match_id = %m.id, "referee checked in");
    true
  }

  pub fn increment_score(&self, m: &mut Match, team: Team, now: DateTime<Utc>) -> Result<ScoreOutcome, ScoreError> {
    if self.is_finished(m) {
      return Ok(ScoreOutcome::AlreadyComplete);
    }
    if !m.is_referee_checked_in() {
      info!(match_id = %m.id, "score ignored, referee not checked in");
      return Ok(ScoreOutcome::RefereeNotCheckedIn);
    }

    let lane = m.lane();
    let set = m.decided_sets();
    let floor = self.config.points_to_victory(lane, set)?;
    let limit = self.config.score_limit(lane, set)?;
    pad_sets(m, self.config.set_count(lane));

    m.points_mut(team)[set] += 1;
    let (one, two) = (m.team1_points[set], m.team2_points[set]);
    debug!(match_id = %m.id, set, one, two, "point scored");
    if one == two {
      return Ok(ScoreOutcome::PointScored { set });
    }

    let (leader, lead, trail) = if one > two {
      (Team::One, one, two)
    } else {
      (Team::Two, two, one)
    };
    let set_won = (lead - trail >= 2 && lead >= floor) || lead >= limit;
    if !set_won {
      return Ok(ScoreOutcome::PointScored { set });
    }

    m.set_results[set] = leader.tag();
    if m.sets_won(leader) >= self.config.sets_to_win(lane) {
      m.end = Some(now);
      info!(match_id = %m.id, winner = leader.tag(), "match complete");
      return Ok(ScoreOutcome::MatchWon { winner: leader });
    }
    info!(match_id = %m.id, set, winner = leader.tag(), "set complete");
    Ok(ScoreOutcome::SetWon { set, winner: leader })
  }

  /// Takes one point back from the set in play. Decided sets stay decided
  /// and points never go below zero.
  pub fn decrement_score(&self, m: &mut Match, team: Team) -> Result<ScoreOutcome, ScoreError> {
    if self.is_finished(m) {
      return Ok(ScoreOutcome::AlreadyComplete);
    }
    if !m.is_referee_checked_in() {
      return Ok(ScoreOutcome::RefereeNotCheckedIn);
    }
    let lane = m.lane();
    let set = m.decided_sets();
    self.config.points_to_victory(lane, set)?;
    match m.points_mut(team).get_mut(set) {
      Some(points) if *points > 0 => {
        *points -= 1;
        debug!(match_id = %m.id, set, "point removed");
        Ok(ScoreOutcome::PointRemoved { set })
      }
      _ => Ok(ScoreOutcome::NothingToRemove),
    }
  }
}

fn pad_sets(m: &mut Match, count: usize) {
  if m.team1_points.len() < count {
    m.team1_points.resize(count, 0);
  }
  if m.team2_points.len() < count {
    m.team2_points.resize(count, 0);
  }
  if m.set_results.len() < count {
    m.set_results.resize(count, SET_UNDECIDED);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
  }

  fn live_match(losers: bool) -> Match {
    let mut m = Match::new("m-1", 1, "div-1", at());
    m.losers_bracket = losers;
    m.referee_checked_in = Some(true);
    m
  }

  fn score_to(machine: &ScoringMachine, m: &mut Match, one: u32, two: u32) -> ScoreOutcome {
    let mut last = ScoreOutcome::NothingToRemove;
    let (mut a, mut b) = (0, 0);
    // alternate so neither side reaches the floor early
    while a < one || b < two {
      if a < one && (a <= b || b >= two) {
        a += 1;
        last = machine.increment_score(m, Team::One, at()).unwrap();
      } else {
        b += 1;
        last = machine.increment_score(m, Team::Two, at()).unwrap();
      }
    }
    last
  }

  #[test]
  fn test_set_needs_floor_and_two_point_margin() {
    let config = TournamentScoringConfig::uniform(1, 1, 21, 30);
    let machine = ScoringMachine::new(&config);

    let mut m = live_match(false);
    assert_eq!(score_to(&machine, &mut m, 21, 19), ScoreOutcome::MatchWon { winner: Team::One });
    assert!(m.end.is_some());
    assert_eq!(m.set_results, vec![1]);

    let mut m = live_match(false);
    assert_eq!(score_to(&machine, &mut m, 21, 20), ScoreOutcome::PointScored { set: 0 });
    assert_eq!(machine.state(&m), MatchState::InProgress { current_set: 0 });
    assert!(m.end.is_none());
  }

  #[test]
  fn test_score_limit_ends_a_set_without_margin() {
    let config = TournamentScoringConfig::uniform(1, 1, 21, 25);
    let machine = ScoringMachine::new(&config);
    let mut m = live_match(false);
    assert_eq!(score_to(&machine, &mut m, 24, 24), ScoreOutcome::PointScored { set: 0 });
    assert_eq!(
      machine.increment_score(&mut m, Team::Two, at()).unwrap(),
      ScoreOutcome::MatchWon { winner: Team::Two }
    );
    assert_eq!((m.team1_points[0], m.team2_points[0]), (24, 25));
  }

  #[test]
  fn test_best_of_five_needs_three_sets() {
    let config = TournamentScoringConfig::uniform(5, 3, 11, 15);
    let machine = ScoringMachine::new(&config);
    let mut m = live_match(false);
    for set in 0..2 {
      assert_eq!(
        score_to(&machine, &mut m, 11, 0),
        ScoreOutcome::SetWon { set, winner: Team::One }
      );
      assert_eq!(machine.state(&m), MatchState::InProgress { current_set: set + 1 });
    }
    assert_eq!(m.team1_points.len(), 5);
    assert_eq!(score_to(&machine, &mut m, 0, 11), ScoreOutcome::SetWon { set: 2, winner: Team::Two });
    assert_eq!(score_to(&machine, &mut m, 11, 3), ScoreOutcome::MatchWon { winner: Team::One });
    assert_eq!(m.sets_won(Team::One), 3);
    assert_eq!(machine.state(&m), MatchState::Complete { winner: Team::One });
  }

  #[test]
  fn test_losers_lane_rules_follow_the_match_flag() {
    let config = TournamentScoringConfig::uniform(3, 1, 11, 15);
    let machine = ScoringMachine::new(&config);
    let mut m = live_match(true);
    assert_eq!(score_to(&machine, &mut m, 11, 5), ScoreOutcome::MatchWon { winner: Team::One });
    let mut m = live_match(false);
    assert_eq!(score_to(&machine, &mut m, 11, 5), ScoreOutcome::SetWon { set: 0, winner: Team::One });
  }

  #[test]
  fn test_scoring_without_referee_is_a_no_op() {
    let config = TournamentScoringConfig::uniform(3, 3, 21, 30);
    let machine = ScoringMachine::new(&config);
    let mut m = live_match(false);
    m.referee_checked_in = None;
    let before = m.clone();
    assert_eq!(
      machine.increment_score(&mut m, Team::One, at()).unwrap(),
      ScoreOutcome::RefereeNotCheckedIn
    );
    assert_eq!(machine.decrement_score(&mut m, Team::One).unwrap(), ScoreOutcome::RefereeNotCheckedIn);
    assert_eq!(m, before);
    assert_eq!(machine.state(&m), MatchState::NotStarted);
    assert!(!machine.can_increment(&m));

    assert!(machine.confirm_referee_check_in(&mut m));
    assert!(!machine.confirm_referee_check_in(&mut m));
    assert!(machine.can_increment(&m));
    assert_eq!(
      machine.increment_score(&mut m, Team::One, at()).unwrap(),
      ScoreOutcome::PointScored { set: 0 }
    );
    assert_eq!(m.team1_points, vec![1, 0, 0]);
    assert_eq!(m.set_results, vec![0, 0, 0]);
  }

  #[test]
  fn test_completed_match_accepts_no_more_points() {
    let config = TournamentScoringConfig::uniform(1, 1, 3, 5);
    let machine = ScoringMachine::new(&config);
    let mut m = live_match(false);
    score_to(&machine, &mut m, 3, 0);
    let done = m.clone();
    assert_eq!(machine.increment_score(&mut m, Team::Two, at()).unwrap(), ScoreOutcome::AlreadyComplete);
    assert_eq!(machine.decrement_score(&mut m, Team::One).unwrap(), ScoreOutcome::AlreadyComplete);
    assert_eq!(m, done);
    assert!(!machine.can_increment(&m));
  }

  #[test]
  fn test_decrement_stops_at_zero_and_keeps_decided_sets() {
    let config = TournamentScoringConfig::uniform(3, 3, 3, 5);
    let machine = ScoringMachine::new(&config);
    let mut m = live_match(false);
    assert_eq!(machine.decrement_score(&mut m, Team::One).unwrap(), ScoreOutcome::NothingToRemove);
    score_to(&machine, &mut m, 3, 0);
    assert_eq!(m.set_results[0], 1);
    assert_eq!(machine.decrement_score(&mut m, Team::One).unwrap(), ScoreOutcome::NothingToRemove);
    assert_eq!(m.team1_points[0], 3);
    machine.increment_score(&mut m, Team::Two, at()).unwrap();
    assert_eq!(
      machine.decrement_score(&mut m, Team::Two).unwrap(),
      ScoreOutcome::PointRemoved { set: 1 }
    );
    assert_eq!(m.team2_points[1], 0);
    assert_eq!(m.set_results[0], 1);
  }

  #[test]
  fn test_points_and_sets_never_shrink_while_scoring() {
    let config = TournamentScoringConfig::uniform(3, 3, 5, 7);
    let machine = ScoringMachine::new(&config);
    let mut m = live_match(false);
    let mut sets = 0;
    for step in 0..40 {
      let team = if step % 3 == 0 { Team::Two } else { Team::One };
      let before = m.clone();
      let outcome = machine.increment_score(&mut m, team, at()).unwrap();
      if outcome == ScoreOutcome::AlreadyComplete {
        break;
      }
      assert!(m.decided_sets() >= sets);
      sets = m.decided_sets();
      for (old, new) in before.team1_points.iter().zip(&m.team1_points) {
        assert!(new >= old);
      }
    }
    assert!(machine.is_finished(&m));
  }

  #[test]
  fn test_out_of_range_set_is_an_error_and_leaves_the_match_alone() {
    let config = TournamentScoringConfig::uniform(3, 3, 21, 30);
    let machine = ScoringMachine::new(&config);
    let mut m = live_match(false);
    // three decided sets with no majority reached through a remote edit
    m.set_results = vec![1, 2, 3];
    let before = m.clone();
    assert_eq!(
      machine.increment_score(&mut m, Team::One, at()),
      Err(ScoreError::SetOutOfRange { set: 3, configured: 3 })
    );
    assert_eq!(m, before);
  }

  #[test]
  fn test_config_validation_and_json() {
    let raw = r#"{
      "winnerSetCount": 3,
      "loserSetCount": 1,
      "winnerBracketPointsToVictory": [21, 21, 15],
      "loserBracketPointsToVictory": [21],
      "winnerScoreLimitsPerSet": [30, 30, 20],
      "loserScoreLimitsPerSet": [30]
    }"#;
    let config = TournamentScoringConfig::from_json(raw).unwrap();
    assert_eq!(config.sets_to_win(Lane::Winners), 2);
    assert_eq!(config.sets_to_win(Lane::Losers), 1);
    assert_eq!(config.points_to_victory(Lane::Winners, 2), Ok(15));
    assert_eq!(config.score_limit(Lane::Winners, 2), Ok(20));
    assert_eq!(
      config.points_to_victory(Lane::Losers, 1),
      Err(ScoreError::SetOutOfRange { set: 1, configured: 1 })
    );

    let mut short = TournamentScoringConfig::uniform(3, 3, 21, 30);
    short.winner_score_limits_per_set.pop();
    assert!(matches!(short.validated(), Err(ScoreError::InvalidConfig(_))));
    let inverted = TournamentScoringConfig::uniform(3, 3, 21, 20);
    assert!(matches!(inverted.validated(), Err(ScoreError::InvalidConfig(_))));
    assert_eq!(TournamentScoringConfig::uniform(4, 2, 1, 1).sets_to_win(Lane::Winners), 2);
  }
}

use crate::config::{normalize_match_id, now};
use crate::error::ScoreError;
use crate::graph::MatchGraph;
use crate::rounds::{generate_rounds, Round};
use crate::scoring::{ScoreOutcome, ScoringMachine, TournamentScoringConfig};
use crate::sync::SyncCoordinator;
use crate::types::*;
use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

/// What the user is looking at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewSelection {
  pub division_id: Option<DivisionId>,
  pub lane: Lane,
  pub match_id: Option<MatchId>,
}

#[derive(Clone)]
struct SessionViews {
  selection: Arc<Mutex<ViewSelection>>,
  scoring: Arc<TournamentScoringConfig>,
  rounds: Arc<watch::Sender<Vec<Round>>>,
  match_finished: Arc<watch::Sender<bool>>,
  can_increment: Arc<watch::Sender<bool>>,
}

impl SessionViews {
  fn selection(&self) -> ViewSelection {
    self.selection.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  fn with_selection<R>(&self, f: impl FnOnce(&mut ViewSelection) -> R) -> R {
    let mut guard = self.selection.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
  }

  fn refresh(&self, snapshot: &HashMap<MatchId, Match>) {
    let selection = self.selection();
    let rounds = match &selection.division_id {
      Some(division_id) => layout(snapshot, division_id, selection.lane),
      None => Vec::new(),
    };
    publish_if_changed(&self.rounds, rounds);

    let machine = ScoringMachine::new(&self.scoring);
    let selected = selection.match_id.as_ref().and_then(|id| snapshot.get(id));
    publish_if_changed(&self.match_finished, selected.is_some_and(|m| machine.is_finished(m)));
    publish_if_changed(&self.can_increment, selected.is_some_and(|m| machine.can_increment(m)));
  }
}

fn publish_if_changed<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
  tx.send_if_modified(|current| {
    if *current == value {
      return false;
    }
    *current = value;
    true
  });
}

/// Rounds for one division and lane, with previous pointers re-derived
/// from the next-pointers first.
pub fn layout(snapshot: &HashMap<MatchId, Match>, division_id: &str, lane: Lane) -> Vec<Round> {
  let mut graph = MatchGraph::from_matches(
    snapshot
      .values()
      .filter(|m| m.division_id == division_id)
      .cloned(),
  );
  graph.derive_previous();
  generate_rounds(&graph.into_matches(), lane)
}

/// Turns user intents into coordinator calls and keeps the derived views
/// (rounds, finished flag, increment gate) current.
pub struct BracketSession {
  coordinator: SyncCoordinator,
  views: SessionViews,
  refresher: Option<JoinHandle<()>>,
}

impl BracketSession {
  pub fn new(coordinator: SyncCoordinator, scoring: TournamentScoringConfig) -> Self {
    let (rounds, _) = watch::channel(Vec::new());
    let (match_finished, _) = watch::channel(false);
    let (can_increment, _) = watch::channel(false);
    Self {
      coordinator,
      views: SessionViews {
        selection: Arc::new(Mutex::new(ViewSelection::default())),
        scoring: Arc::new(scoring),
        rounds: Arc::new(rounds),
        match_finished: Arc::new(match_finished),
        can_increment: Arc::new(can_increment),
      },
      refresher: None,
    }
  }

  /// Recomputes the views on every snapshot the coordinator publishes.
  pub fn start(&mut self) {
    if self.refresher.is_some() {
      return;
    }
    let mut snapshots = self.coordinator.watch_matches();
    let views = self.views.clone();
    self.refresher = Some(self.coordinator.runtime().spawn(async move {
      loop {
        let snapshot = snapshots.borrow_and_update().clone();
        views.refresh(&snapshot);
        if snapshots.changed().await.is_err() {
          break;
        }
      }
    }));
  }

  pub fn stop(&mut self) {
    if let Some(task) = self.refresher.take() {
      task.abort();
    }
  }

  pub fn coordinator(&self) -> &SyncCoordinator {
    &self.coordinator
  }

  pub fn scoring(&self) -> Arc<TournamentScoringConfig> {
    self.views.scoring.clone()
  }

  pub fn selection(&self) -> ViewSelection {
    self.views.selection()
  }

  pub fn select_division(&self, division_id: &str) {
    let division_id = division_id.trim().to_string();
    self.views.with_selection(|s| {
      if s.division_id.as_deref() != Some(division_id.as_str()) {
        s.match_id = None;
      }
      s.division_id = Some(division_id);
    });
    self.refresh();
  }

  pub fn toggle_lane(&self) -> Lane {
    let lane = self.views.with_selection(|s| {
      s.lane = s.lane.toggled();
      s.lane
    });
    debug!(?lane, "lane toggled");
    self.refresh();
    lane
  }

  pub fn select_match(&self, match_id: Option<&str>) {
    let match_id = match_id.map(normalize_match_id).filter(|id| !id.is_empty());
    self.views.with_selection(|s| s.match_id = match_id);
    self.refresh();
  }

  pub fn increment_score(&self, is_team1: bool) -> Result<ScoreOutcome, ScoreError> {
    let mut m = self.selected_match()?;
    let machine = ScoringMachine::new(&self.views.scoring);
    let outcome = machine.increment_score(&mut m, Team::from_is_team1(is_team1), now())?;
    if outcome.changed() {
      let match_id = m.id.clone();
      self.coordinator.commit_local(m);
      if let ScoreOutcome::MatchWon { winner } = outcome {
        self.advance(&match_id, winner);
      }
    }
    self.refresh();
    Ok(outcome)
  }

  pub fn decrement_score(&self, is_team1: bool) -> Result<ScoreOutcome, ScoreError> {
    let mut m = self.selected_match()?;
    let machine = ScoringMachine::new(&self.views.scoring);
    let outcome = machine.decrement_score(&mut m, Team::from_is_team1(is_team1))?;
    if outcome.changed() {
      self.coordinator.commit_local(m);
    }
    self.refresh();
    Ok(outcome)
  }

  pub fn confirm_referee_check_in(&self) -> Result<bool, ScoreError> {
    let mut m = self.selected_match()?;
    let changed = ScoringMachine::new(&self.views.scoring).confirm_referee_check_in(&mut m);
    if changed {
      self.coordinator.commit_local(m);
    }
    self.refresh();
    Ok(changed)
  }

  pub fn matches(&self) -> watch::Receiver<MatchSnapshot> {
    self.coordinator.watch_matches()
  }

  pub fn rounds(&self) -> watch::Receiver<Vec<Round>> {
    self.views.rounds.subscribe()
  }

  pub fn match_finished(&self) -> watch::Receiver<bool> {
    self.views.match_finished.subscribe()
  }

  pub fn can_increment(&self) -> watch::Receiver<bool> {
    self.views.can_increment.subscribe()
  }

  fn selected_match(&self) -> Result<Match, ScoreError> {
    let id = self.selection().match_id.ok_or(ScoreError::NoMatchSelected)?;
    self.coordinator.get(&id).ok_or(ScoreError::UnknownMatch(id))
  }

  fn refresh(&self) {
    self.views.refresh(&self.coordinator.snapshot());
  }

  /// Moves winner and loser of a finished match into their next matches.
  fn advance(&self, match_id: &str, winner: Team) {
    let Some(done) = self.coordinator.get(match_id) else {
      return;
    };
    let mut graph = MatchGraph::from_matches(self.coordinator.division(&done.division_id));
    graph.derive_previous();
    for next in graph.propagate_result(match_id, winner) {
      info!(from = match_id, to = %next.id, "advancing teams");
      self.coordinator.apply_local(next.clone());
      self.coordinator.write_remote(next);
    }
  }
}

impl Drop for BracketSession {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::tests::double_elim;
  use crate::remote::MatchPatch;
  use crate::sync::tests::{coordinator, MockRemote};
  use std::time::Duration;

  fn session(remote: Arc<MockRemote>, config: TournamentScoringConfig) -> BracketSession {
    let mut matches = double_elim();
    for m in matches.iter_mut().filter(|m| m.id == "W1") {
      m.team1_id = Some("red".to_string());
      m.team2_id = Some("blue".to_string());
    }
    BracketSession::new(coordinator(remote, matches), config)
  }

  fn round_ids(rounds: &[Round]) -> Vec<Vec<Option<String>>> {
    rounds
      .iter()
      .map(|round| round.iter().map(|slot| slot.as_ref().map(|m| m.id.clone())).collect())
      .collect()
  }

  async fn settle() {
    for _ in 0..16 {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test]
  async fn test_division_and_lane_drive_the_rounds_view() {
    let s = session(Arc::new(MockRemote::default()), TournamentScoringConfig::uniform(3, 3, 21, 30));
    let rounds = s.rounds();
    assert!(rounds.borrow().is_empty());

    s.select_division("div-1");
    assert_eq!(rounds.borrow().len(), 3);
    assert_eq!(round_ids(&rounds.borrow())[2], vec![Some("GF".to_string())]);

    assert_eq!(s.toggle_lane(), Lane::Losers);
    assert_eq!(rounds.borrow().len(), 4);
    assert_eq!(s.toggle_lane(), Lane::Winners);
    assert_eq!(rounds.borrow().len(), 3);

    s.select_division("div-2");
    assert!(rounds.borrow().is_empty());
  }

  #[tokio::test]
  async fn test_intents_need_a_selected_match() {
    let s = session(Arc::new(MockRemote::default()), TournamentScoringConfig::uniform(3, 3, 21, 30));
    assert_eq!(s.increment_score(true), Err(ScoreError::NoMatchSelected));
    s.select_match(Some("nope"));
    assert_eq!(
      s.confirm_referee_check_in(),
      Err(ScoreError::UnknownMatch("nope".to_string()))
    );
  }

  #[tokio::test]
  async fn test_scoring_waits_for_the_referee() {
    let remote = Arc::new(MockRemote::default());
    let s = session(remote.clone(), TournamentScoringConfig::uniform(3, 3, 21, 30));
    s.select_match(Some("W1"));
    assert_eq!(s.increment_score(true), Ok(ScoreOutcome::RefereeNotCheckedIn));
    assert!(!*s.can_increment().borrow());
    settle().await;
    assert!(remote.written_ids().is_empty());

    assert_eq!(s.confirm_referee_check_in(), Ok(true));
    assert!(*s.can_increment().borrow());
    assert_eq!(s.coordinator().ignored_match().as_deref(), Some("W1"));
    settle().await;
    assert_eq!(remote.written_ids(), vec!["W1"]);
    assert_eq!(s.coordinator().ignored_match(), None);
  }

  #[tokio::test]
  async fn test_winning_a_match_advances_both_teams() {
    let remote = Arc::new(MockRemote::default());
    let s = session(remote.clone(), TournamentScoringConfig::uniform(1, 1, 3, 5));
    s.select_division("div-1");
    s.select_match(Some("W1"));
    s.confirm_referee_check_in().unwrap();

    assert_eq!(s.increment_score(false), Ok(ScoreOutcome::PointScored { set: 0 }));
    assert_eq!(s.decrement_score(false), Ok(ScoreOutcome::PointRemoved { set: 0 }));
    for _ in 0..2 {
      assert_eq!(s.increment_score(true), Ok(ScoreOutcome::PointScored { set: 0 }));
    }
    assert_eq!(s.increment_score(true), Ok(ScoreOutcome::MatchWon { winner: Team::One }));
    assert!(*s.match_finished().borrow());
    assert!(!*s.can_increment().borrow());
    assert_eq!(s.increment_score(true), Ok(ScoreOutcome::AlreadyComplete));

    let sync = s.coordinator();
    assert!(sync.get("W1").unwrap().end.is_some());
    assert_eq!(sync.get("W3").unwrap().team1_id.as_deref(), Some("red"));
    assert_eq!(sync.get("L1").unwrap().team1_id.as_deref(), Some("blue"));

    settle().await;
    let written = remote.written_ids();
    assert!(written.contains(&"W3".to_string()));
    assert!(written.contains(&"L1".to_string()));
    assert_eq!(written.iter().filter(|id| *id == "W1").count(), 6);
  }

  #[tokio::test]
  async fn test_remote_changes_refresh_views_in_the_background() {
    let mut s = session(Arc::new(MockRemote::default()), TournamentScoringConfig::uniform(3, 3, 21, 30));
    s.start();
    s.select_match(Some("W1"));
    let mut can_increment = s.can_increment();
    assert!(!*can_increment.borrow_and_update());

    let patch = MatchPatch {
      referee_checked_in: Some(Some(true)),
      ..MatchPatch::default()
    };
    s.coordinator().on_remote_update("W1", &patch);
    tokio::time::timeout(Duration::from_secs(2), can_increment.wait_for(|ready| *ready))
      .await
      .unwrap()
      .unwrap();
    s.stop();
  }
}

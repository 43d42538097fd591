use crate::error::ScoreError;
use crate::scoring::{ScoreOutcome, ScoringMachine, TournamentScoringConfig};
use crate::sync::SyncCoordinator;
use crate::types::*;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::{
  collections::{BTreeMap, HashSet},
  sync::Arc,
  time::Duration,
};
use tokio::{
  sync::{mpsc, oneshot},
  task::JoinHandle,
};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationConfig {
  pub seed: u64,
  /// Simulated time per tick.
  pub tick_ms: u64,
  /// Wall-clock pause between ticks; 0 runs as fast as possible.
  pub pacing_ms: u64,
  pub max_ticks: u64,
  /// Probability that team 1 takes a point.
  pub team1_weight: f64,
  /// Push every change to the remote instead of the local cache only.
  pub write_through: bool,
}

impl Default for SimulationConfig {
  fn default() -> Self {
    SimulationConfig {
      seed: 1337,
      tick_ms: DEFAULT_SIMULATION_TICK_MS,
      pacing_ms: 0,
      max_ticks: SIMULATION_TICK_LIMIT,
      team1_weight: 0.5,
      write_through: false,
    }
  }
}

impl SimulationConfig {
  pub fn from_engine(config: &EngineConfig) -> Self {
    SimulationConfig {
      tick_ms: config.simulation_tick_ms,
      ..SimulationConfig::default()
    }
  }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchRun {
  pub winner: Option<Team>,
  pub points_played: u32,
  pub ticks: u64,
  pub error: Option<ScoreError>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationReport {
  pub ticks: u64,
  pub finished_at: DateTime<Utc>,
  pub matches: BTreeMap<MatchId, MatchRun>,
}

impl SimulationReport {
  pub fn all_finished(&self) -> bool {
    self.matches.values().all(|run| run.winner.is_some())
  }
}

#[derive(Debug)]
struct Tick {
  number: u64,
  now: DateTime<Utc>,
  ack: oneshot::Sender<TickAck>,
}

#[derive(Clone, Debug, PartialEq)]
enum TickAck {
  Playing,
  Finished,
  Failed,
}

#[derive(Clone, Debug)]
struct SimRng {
  state: u64,
}

impl SimRng {
  fn new(seed: u64) -> Self {
    let mut state = seed;
    if state == 0 {
      state = 0x9E37_79B9_7F4A_7C15;
    }
    SimRng { state }
  }

  /// Independent stream per match so results do not depend on scheduling.
  fn for_match(seed: u64, index: usize) -> Self {
    let mut rng = SimRng::new(seed ^ (index as u64 + 1).wrapping_mul(0x2545_F491_4F6C_DD1D));
    rng.next_u64();
    rng
  }

  fn next_u64(&mut self) -> u64 {
    let mut x = self.state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    self.state = x;
    x
  }

  fn next_f64(&mut self) -> f64 {
    let v = self.next_u64() >> 11;
    (v as f64) / ((1u64 << 53) as f64)
  }
}

/// Plays every listed match to completion against one shared coordinator.
///
/// A time keeper advances a simulated clock and hands each live match a
/// tick; a match task checks its referee in, scores one point per tick and
/// acknowledges. The next tick starts only after every live match has
/// answered.
pub async fn run_simulation(
  coordinator: SyncCoordinator,
  scoring: Arc<TournamentScoringConfig>,
  match_ids: Vec<MatchId>,
  config: SimulationConfig,
  start: DateTime<Utc>,
) -> SimulationReport {
  let tick_len = ChronoDuration::milliseconds(i64::try_from(config.tick_ms).unwrap_or(i64::MAX).min(i64::from(u32::MAX)));
  let mut live = Vec::with_capacity(match_ids.len());
  let mut tasks: Vec<(MatchId, JoinHandle<MatchRun>)> = Vec::with_capacity(match_ids.len());
  for (index, match_id) in match_ids.into_iter().enumerate() {
    let (tx, rx) = mpsc::channel::<Tick>(1);
    let player = MatchPlayer {
      coordinator: coordinator.clone(),
      scoring: scoring.clone(),
      match_id: match_id.clone(),
      rng: SimRng::for_match(config.seed, index),
      team1_weight: config.team1_weight,
      write_through: config.write_through,
    };
    tasks.push((match_id.clone(), tokio::spawn(player.play(rx))));
    live.push((match_id, tx));
  }
  info!(matches = live.len(), seed = config.seed, "simulation started");

  let mut clock = start;
  let mut tick = 0u64;
  while !live.is_empty() && tick < config.max_ticks {
    tick += 1;
    clock += tick_len;
    let mut pending = Vec::with_capacity(live.len());
    for (match_id, tx) in &live {
      let (ack, answer) = oneshot::channel();
      let sent = tx
        .send(Tick {
          number: tick,
          now: clock,
          ack,
        })
        .await;
      if sent.is_ok() {
        pending.push((match_id.clone(), answer));
      }
    }
    let mut playing = HashSet::new();
    for (match_id, answer) in pending {
      if answer.await == Ok(TickAck::Playing) {
        playing.insert(match_id);
      }
    }
    live.retain(|(match_id, _)| playing.contains(match_id));
    if config.pacing_ms > 0 {
      tokio::time::sleep(Duration::from_millis(config.pacing_ms)).await;
    }
  }
  if !live.is_empty() {
    warn!(tick, live = live.len(), "simulation stopped at tick limit");
  }
  drop(live);

  let mut matches = BTreeMap::new();
  for (match_id, task) in tasks {
    let run = task.await.unwrap_or_else(|e| {
      warn!(match_id = %match_id, error = %e, "match task ended abnormally");
      MatchRun::default()
    });
    matches.insert(match_id, run);
  }
  info!(ticks = tick, "simulation finished");
  SimulationReport {
    ticks: tick,
    finished_at: clock,
    matches,
  }
}

struct MatchPlayer {
  coordinator: SyncCoordinator,
  scoring: Arc<TournamentScoringConfig>,
  match_id: MatchId,
  rng: SimRng,
  team1_weight: f64,
  write_through: bool,
}

impl MatchPlayer {
  async fn play(mut self, mut ticks: mpsc::Receiver<Tick>) -> MatchRun {
    let mut run = MatchRun::default();
    while let Some(tick) = ticks.recv().await {
      run.ticks = tick.number;
      let ack = self.step(&mut run, tick.now);
      let done = ack != TickAck::Playing;
      let _ = tick.ack.send(ack);
      if done {
        break;
      }
    }
    debug!(match_id = %self.match_id, ticks = run.ticks, "match task done");
    run
  }

  fn step(&mut self, run: &mut MatchRun, now: DateTime<Utc>) -> TickAck {
    let machine = ScoringMachine::new(&self.scoring);
    let Some(mut m) = self.coordinator.get(&self.match_id) else {
      run.error = Some(ScoreError::UnknownMatch(self.match_id.clone()));
      return TickAck::Failed;
    };
    let checked_in = machine.confirm_referee_check_in(&mut m);
    let team = if self.rng.next_f64() < self.team1_weight {
      Team::One
    } else {
      Team::Two
    };
    let outcome = match machine.increment_score(&mut m, team, now) {
      Ok(outcome) => outcome,
      Err(err) => {
        warn!(match_id = %self.match_id, error = %err, "simulated point rejected");
        run.error = Some(err);
        return TickAck::Failed;
      }
    };
    let winner = machine.winner(&m);
    if checked_in || outcome.changed() {
      if self.write_through {
        self.coordinator.commit_local(m);
      } else {
        self.coordinator.apply_local(m);
      }
    }
    match outcome {
      ScoreOutcome::PointScored { .. } | ScoreOutcome::SetWon { .. } => {
        run.points_played += 1;
        TickAck::Playing
      }
      ScoreOutcome::MatchWon { winner } => {
        run.points_played += 1;
        run.winner = Some(winner);
        TickAck::Finished
      }
      ScoreOutcome::AlreadyComplete => {
        run.winner = winner;
        TickAck::Finished
      }
      ScoreOutcome::RefereeNotCheckedIn | ScoreOutcome::PointRemoved { .. } | ScoreOutcome::NothingToRemove => {
        TickAck::Playing
      }
    }
  }
}

use crate::config::normalize_match_id;
use crate::error::GraphError;
use crate::types::*;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Maximum structural in-degree of a match (`previousLeft` + `previousRight`).
pub const MAX_IN_DEGREE: usize = 2;

const EDGES: [EdgeKind; 2] = [EdgeKind::Winner, EdgeKind::Loser];

/// Division-scoped arena of matches. Edges are id references; every
/// traversal goes through an id lookup.
#[derive(Debug, Clone, Default)]
pub struct MatchGraph {
  matches: HashMap<MatchId, Match>,
}

impl MatchGraph {
  pub fn from_matches(matches: impl IntoIterator<Item = Match>) -> Self {
    MatchGraph {
      matches: matches.into_iter().map(|m| (m.id.clone(), m)).collect(),
    }
  }

  pub fn get(&self, id: &str) -> Option<&Match> {
    self.matches.get(id)
  }

  /// All matches ordered by `match_number`, then id.
  pub fn into_matches(self) -> Vec<Match> {
    let mut out = self.matches.into_values().collect::<Vec<_>>();
    out.sort_by(|a, b| a.match_number.cmp(&b.match_number).then_with(|| a.id.cmp(&b.id)));
    out
  }

  /// Number of present matches whose next-pointers target `id`.
  pub fn in_degree(&self, id: &str) -> usize {
    GraphView::new(self.matches.values()).incoming(id, None)
  }

  pub fn valid_targets(&self, source_id: &str, edge: EdgeKind) -> HashSet<MatchId> {
    GraphView::new(self.matches.values()).valid_targets(source_id, edge)
  }

  /// Commits `source --edge--> target` after validation, then re-derives
  /// the previous pointers.
  pub fn link(&mut self, source_id: &str, target_id: &str, edge: EdgeKind) -> Result<(), GraphError> {
    let source_id = normalize_match_id(source_id);
    let target_id = normalize_match_id(target_id);
    if !self.matches.contains_key(&source_id) {
      return Err(GraphError::UnknownMatch(source_id));
    }
    if !self.matches.contains_key(&target_id) {
      return Err(GraphError::UnknownMatch(target_id));
    }
    if source_id == target_id {
      return Err(GraphError::SelfLink(source_id));
    }
    if !self.valid_targets(&source_id, edge).contains(&target_id) {
      debug!(source = %source_id, target = %target_id, %edge, "rejected bracket edge");
      return Err(GraphError::InvalidTarget {
        from: source_id,
        to: target_id,
        edge,
      });
    }
    if let Some(source) = self.matches.get_mut(&source_id) {
      source.set_next(edge, Some(target_id));
    }
    self.derive_previous();
    Ok(())
  }

  /// Clears one outgoing edge, returning the previous target.
  pub fn unlink(&mut self, source_id: &str, edge: EdgeKind) -> Result<Option<MatchId>, GraphError> {
    let source_id = normalize_match_id(source_id);
    let source = self
      .matches
      .get_mut(&source_id)
      .ok_or_else(|| GraphError::UnknownMatch(source_id.clone()))?;
    let old = source.next(edge).cloned();
    source.set_next(edge, None);
    self.derive_previous();
    Ok(old)
  }

  /// Recomputes `previous_left`/`previous_right` from the next-pointers.
  ///
  /// An existing slot is kept when it still names a match that feeds this
  /// one, or when it names a match absent from the arena (partial graphs
  /// while editing). Free slots are filled in `match_number` order.
  pub fn derive_previous(&mut self) {
    let mut feeders: HashMap<MatchId, Vec<(u32, MatchId)>> = HashMap::new();
    for m in self.matches.values() {
      for edge in EDGES {
        if let Some(target) = m.next(edge) {
          if self.matches.contains_key(target) {
            feeders
              .entry(target.clone())
              .or_default()
              .push((m.match_number, m.id.clone()));
          }
        }
      }
    }

    let present = self.matches.keys().cloned().collect::<HashSet<_>>();
    for m in self.matches.values_mut() {
      let mut pending = feeders.remove(&m.id).unwrap_or_default();
      pending.sort();
      let mut keep = |slot: &Option<MatchId>| -> Option<MatchId> {
        let id = slot.as_ref()?;
        if !present.contains(id) {
          return Some(id.clone());
        }
        let pos = pending.iter().position(|(_, feeder)| feeder == id)?;
        Some(pending.remove(pos).1)
      };
      let mut left = keep(&m.previous_left_match_id);
      let mut right = keep(&m.previous_right_match_id);
      let mut rest = pending.into_iter().map(|(_, id)| id);
      if left.is_none() {
        left = rest.next();
      }
      if right.is_none() {
        right = rest.next();
      }
      m.previous_left_match_id = left;
      m.previous_right_match_id = right;
    }
  }

  /// Moves the teams of a finished match along its outgoing edges.
  ///
  /// The winner goes to `winner_next`, the loser to `loser_next`. The slot
  /// follows the previous pointer of the target (left feeds team 1, right
  /// feeds team 2); the first free slot is used otherwise. Returns the
  /// matches that changed.
  pub fn propagate_result(&mut self, id: &str, winner: Team) -> Vec<Match> {
    let Some(done) = self.matches.get(id).cloned() else {
      return Vec::new();
    };
    let mut changed = Vec::new();
    for (edge, team) in [(EdgeKind::Winner, winner), (EdgeKind::Loser, winner.other())] {
      let Some(target_id) = done.next(edge) else {
        continue;
      };
      let Some(team_id) = done.team(team).cloned() else {
        continue;
      };
      let Some(target) = self.matches.get_mut(target_id) else {
        continue;
      };
      let from_left = target.previous_left_match_id.as_deref() == Some(done.id.as_str());
      let from_right = target.previous_right_match_id.as_deref() == Some(done.id.as_str());
      let slot = match (from_left, from_right) {
        (true, true) => match edge {
          EdgeKind::Winner => Team::One,
          EdgeKind::Loser => Team::Two,
        },
        (true, false) => Team::One,
        (false, true) => Team::Two,
        (false, false) => {
          if target.team1_id.is_none() || target.team1_id.as_ref() == Some(&team_id) {
            Team::One
          } else {
            Team::Two
          }
        }
      };
      let entry = target.team_mut(slot);
      if entry.as_ref() != Some(&team_id) {
        *entry = Some(team_id);
        changed.push(target.clone());
      }
    }
    changed
  }
}

/// Edge candidates for `source_id` among `nodes`: every match that could
/// legally become the target of a new `edge` from the source.
pub fn valid_targets(source_id: &str, edge: EdgeKind, nodes: &[Match]) -> HashSet<MatchId> {
  GraphView::new(nodes.iter()).valid_targets(source_id, edge)
}

struct GraphView<'a> {
  by_id: HashMap<&'a str, &'a Match>,
  // target -> (feeder, edge)
  reverse: HashMap<&'a str, Vec<(&'a Match, EdgeKind)>>,
}

impl<'a> GraphView<'a> {
  fn new(nodes: impl Iterator<Item = &'a Match>) -> Self {
    let by_id = nodes.map(|m| (m.id.as_str(), m)).collect::<HashMap<_, _>>();
    let mut reverse: HashMap<&'a str, Vec<(&'a Match, EdgeKind)>> = HashMap::new();
    for m in by_id.values().copied() {
      for edge in EDGES {
        if let Some(target) = m.next(edge) {
          if let Some(target) = by_id.get(target.as_str()).copied() {
            reverse.entry(target.id.as_str()).or_default().push((m, edge));
          }
        }
      }
    }
    GraphView { by_id, reverse }
  }

  /// Incoming structural edges of `id`, ignoring the edge that `skip`
  /// names (the pointer about to be overwritten).
  fn incoming(&self, id: &str, skip: Option<(&str, EdgeKind)>) -> usize {
    self.feeders(id, skip).count()
  }

  fn feeders<'s>(
    &'s self,
    id: &str,
    skip: Option<(&'s str, EdgeKind)>,
  ) -> impl Iterator<Item = &'a Match> + 's {
    self
      .reverse
      .get(id)
      .into_iter()
      .flatten()
      .filter(move |(feeder, edge)| skip != Some((feeder.id.as_str(), *edge)))
      .map(|(feeder, _)| *feeder)
  }

  /// Every match from which `id` is reachable along next-pointers.
  fn ancestors(&self, id: &str) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
      for (feeder, _) in self.reverse.get(current).into_iter().flatten() {
        if seen.insert(feeder.id.as_str()) {
          stack.push(feeder.id.as_str());
        }
      }
    }
    seen
  }

  fn valid_targets(&self, source_id: &str, edge: EdgeKind) -> HashSet<MatchId> {
    let source_id = normalize_match_id(source_id);
    let Some(source) = self.by_id.get(source_id.as_str()).copied() else {
      return HashSet::new();
    };
    let skip = Some((source.id.as_str(), edge));
    let opposite_next = source.next(edge.opposite()).map(String::as_str);
    let upstream = self.ancestors(&source.id);
    let feeds_opposite = opposite_next.map(|next| self.ancestors(next)).unwrap_or_default();

    let mut out = HashSet::new();
    for candidate in self.by_id.values().copied() {
      let id = candidate.id.as_str();
      if id == source.id {
        continue;
      }
      // winner and loser paths of one match never share a target
      if opposite_next == Some(id) {
        continue;
      }
      if self.incoming(id, skip) >= MAX_IN_DEGREE {
        continue;
      }
      if upstream.contains(id) || feeds_opposite.contains(id) {
        continue;
      }
      if !self.lane_allows(source, candidate, edge) {
        continue;
      }
      out.insert(candidate.id.clone());
    }
    out
  }

  /// Lane consistency of `source --edge--> target`. Crossings are legal
  /// only for a winners-lane loser dropping into the losers lane, or for
  /// the losers final's winner joining the grand final: a winners-lane
  /// match that is terminal (or only feeds its reset) and is already fed
  /// by the winners final's winner edge.
  fn lane_allows(&self, source: &Match, target: &Match, edge: EdgeKind) -> bool {
    if source.losers_bracket == target.losers_bracket {
      return true;
    }
    match edge {
      EdgeKind::Loser => !source.losers_bracket && target.losers_bracket,
      EdgeKind::Winner => {
        source.losers_bracket
          && is_grand_final(target)
          && self
            .feeders(&target.id, Some((source.id.as_str(), edge)))
            .any(|feeder| {
              feeder.id != source.id
                && !feeder.losers_bracket
                && feeder.next(EdgeKind::Winner).map(String::as_str) == Some(target.id.as_str())
            })
      }
    }
  }
}

/// Terminal, or feeding both of its results into one reset match.
fn is_grand_final(m: &Match) -> bool {
  match (m.next(EdgeKind::Winner), m.next(EdgeKind::Loser)) {
    (None, None) => true,
    (Some(a), Some(b)) => a == b,
    _ => false,
  }
}

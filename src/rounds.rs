use crate::types::*;
use std::collections::{HashMap, HashSet};

/// One display column. `None` is a placeholder that keeps the columns
/// aligned where a subtree is missing or belongs to the other lane.
pub type Round = Vec<Option<Match>>;

/// Column entry while walking backwards. `Hidden` is a match of the other
/// lane: drawn as a placeholder, it still claims a pair in the earlier
/// column. `Empty` claims nothing, so placeholder-only subtrees stop growing.
#[derive(Clone, Copy)]
enum Slot<'a> {
  Drawn(&'a Match),
  Hidden,
  Empty,
}

/// Lays one lane of a division out as rounds, earliest round first.
///
/// Starts from the terminal matches of the lane and walks the previous
/// pointers backwards, one column per step. Each drawn or hidden match of
/// a column owns the next pair of the earlier column, in order. Every
/// match appears at most once; a match reachable twice (or through a
/// malformed cycle) is shown only where it was first reached.
pub fn generate_rounds(matches: &[Match], lane: Lane) -> Vec<Round> {
  let index = matches.iter().map(|m| (m.id.as_str(), m)).collect::<HashMap<_, _>>();

  let mut seeds = matches
    .iter()
    .filter(|m| m.is_terminal() && valid_match(m, lane, &index))
    .collect::<Vec<_>>();
  seeds.sort_by(|a, b| a.match_number.cmp(&b.match_number).then_with(|| a.id.cmp(&b.id)));

  let mut visited = seeds.iter().map(|m| m.id.as_str()).collect::<HashSet<_>>();
  let mut current = seeds.into_iter().map(Slot::Drawn).collect::<Vec<_>>();
  if current.is_empty() {
    return Vec::new();
  }

  let mut rounds = Vec::new();
  loop {
    let mut next = Vec::with_capacity(current.len() * 2);
    for slot in &current {
      match slot {
        Slot::Empty => {}
        Slot::Hidden => next.extend([Slot::Empty, Slot::Empty]),
        Slot::Drawn(m) => {
          for previous in [&m.previous_left_match_id, &m.previous_right_match_id] {
            let found = previous
              .as_deref()
              .and_then(|id| index.get(id).copied())
              .filter(|prev| !visited.contains(prev.id.as_str()));
            next.push(match found {
              Some(prev) if valid_match(prev, lane, &index) => {
                visited.insert(prev.id.as_str());
                Slot::Drawn(prev)
              }
              Some(_) => Slot::Hidden,
              None => Slot::Empty,
            });
          }
        }
      }
    }
    rounds.push(
      current
        .iter()
        .map(|slot| match slot {
          Slot::Drawn(m) => Some((*m).clone()),
          Slot::Hidden | Slot::Empty => None,
        })
        .collect::<Round>(),
    );
    if !next.iter().any(|slot| matches!(slot, Slot::Drawn(_))) {
      break;
    }
    current = next;
  }

  rounds.reverse();
  rounds
}

/// Whether `m` is drawn in `lane`.
///
/// A match belongs to its own lane. The losers view also shows the match
/// that joins the two lanes (a grand-final reset fed twice by the same
/// match, or a merge of feeders from different lanes) and true first-round
/// matches, so drop-ins have somewhere to come from.
pub fn valid_match(m: &Match, lane: Lane, index: &HashMap<&str, &Match>) -> bool {
  if m.lane() == lane {
    return true;
  }
  if lane != Lane::Losers {
    return false;
  }
  let left = m.previous_left_match_id.as_deref();
  let right = m.previous_right_match_id.as_deref();
  if left.is_some() && left == right {
    return true;
  }
  if left.is_none() && right.is_none() {
    return true;
  }
  let lane_of = |id: Option<&str>| id.and_then(|id| index.get(id)).map(|prev| prev.lane());
  let left_lane = lane_of(left);
  left_lane.is_some() && left_lane != lane_of(right)
}

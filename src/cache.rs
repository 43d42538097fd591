use crate::types::*;
use std::{collections::HashMap, sync::Mutex};

/// Local match store keyed by id. Reads are served from here before the
/// remote answers.
pub trait LocalCache: Send + Sync {
    fn upsert(&self, m: Match);
    fn get_by_id(&self, id: &str) -> Option<Match>;
    fn get_by_division(&self, division_id: &str) -> Vec<Match>;
    fn all(&self) -> Vec<Match>;
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    matches: Mutex<HashMap<MatchId, Match>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_matches(matches: impl IntoIterator<Item = Match>) -> Self {
        let cache = Self::new();
        for m in matches {
            cache.upsert(m);
        }
        cache
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<MatchId, Match>> {
        self.matches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LocalCache for MemoryCache {
    fn upsert(&self, m: Match) {
        self.guard().insert(m.id.clone(), m);
    }

    fn get_by_id(&self, id: &str) -> Option<Match> {
        self.guard().get(id.trim()).cloned()
    }

    fn get_by_division(&self, division_id: &str) -> Vec<Match> {
        let mut out = self
            .guard()
            .values()
            .filter(|m| m.division_id == division_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|m| m.match_number);
        out
    }

    fn all(&self) -> Vec<Match> {
        self.guard().values().cloned().collect()
    }
}

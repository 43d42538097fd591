//! Error types for the bracket engine.
//!
//! Nothing here is fatal: every failure is scoped to one operation and
//! the caller may re-issue the intent.

use crate::types::{EdgeKind, MatchId};
use thiserror::Error;

/// A bracket edit that would break a graph invariant. Rejected edges are
/// never applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("match {0} is not part of this division")]
    UnknownMatch(MatchId),

    #[error("match {0} cannot feed itself")]
    SelfLink(MatchId),

    #[error("{edge} edge {from} -> {to} would violate the bracket structure")]
    InvalidTarget {
        from: MatchId,
        to: MatchId,
        edge: EdgeKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("match {0} not found")]
    UnknownMatch(MatchId),

    #[error("set index {set} is outside the {configured} configured sets")]
    SetOutOfRange { set: usize, configured: usize },

    #[error("invalid scoring config: {0}")]
    InvalidConfig(String),

    #[error("no match selected")]
    NoMatchSelected,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("realtime channel error: {0}")]
    Realtime(String),
}

impl SyncError {
    /// Static label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
            Self::Realtime(_) => "realtime",
        }
    }
}

pub mod types;
pub mod error;
pub mod config;
pub mod graph;
pub mod rounds;
pub mod scoring;
pub mod cache;
pub mod remote;
pub mod sync;
pub mod session;
pub mod simulation;

pub use cache::{LocalCache, MemoryCache};
pub use config::{load_config, load_engine_config};
pub use error::{GraphError, ScoreError, SyncError};
pub use graph::{valid_targets, MatchGraph};
pub use remote::{HttpRemoteStore, MatchPatch, RemoteEvent, RemoteStore, RemoteSubscription};
pub use rounds::{generate_rounds, valid_match, Round};
pub use scoring::{MatchState, ScoreOutcome, ScoringMachine, TournamentScoringConfig};
pub use session::{BracketSession, ViewSelection};
pub use simulation::{run_simulation, SimulationConfig, SimulationReport};
pub use sync::{RemoteOutcome, SubscriptionHandle, SyncCoordinator, SyncEvent};
pub use types::*;

use chrono::{DateTime, Utc};
use std::{fs, path::PathBuf, sync::Arc};
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Daily-rolling file log under `config.log_dir`. `RUST_LOG` overrides
/// `config.log_filter`. Keep the guard alive for the life of the process.
pub fn init_logging(config: &EngineConfig) -> Result<WorkerGuard, String> {
    let logs_dir = PathBuf::from(&config.log_dir);
    fs::create_dir_all(&logs_dir).map_err(|e| format!("create log dir {}: {e}", logs_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&logs_dir, "bracket-engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_writer(non_blocking)
        .with_ansi(false)
        .try_init()
        .map_err(|e| e.to_string())?;
    info!("bracket engine starting");
    log_config_warnings(config);
    Ok(guard)
}

fn log_config_warnings(config: &EngineConfig) {
    if config.remote_url.trim().is_empty() {
        warn!("BRACKET_REMOTE_URL not set; running from the local cache only");
    }
    if config.api_key.trim().is_empty() {
        warn!("BRACKET_API_KEY not set; remote calls will be unauthenticated");
    }
    if config.realtime_url.trim().is_empty() {
        warn!("BRACKET_REALTIME_URL not set; remote changes will not be pushed");
    }
}

pub fn realtime_channel(tournament_id: &str) -> String {
    format!("tournament:{}", tournament_id.trim())
}

/// A running session plus its realtime subscription.
pub struct Engine {
    pub session: BracketSession,
    subscription: Option<SubscriptionHandle>,
    simulation: SimulationConfig,
}

impl Engine {
    pub fn is_live(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Plays the listed matches against the session's coordinator with the
    /// configured tick length.
    pub async fn simulate(&self, match_ids: Vec<MatchId>, start: DateTime<Utc>) -> SimulationReport {
        run_simulation(
            self.session.coordinator().clone(),
            self.session.scoring(),
            match_ids,
            self.simulation.clone(),
            start,
        )
        .await
    }

    pub fn shutdown(mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
        self.session.stop();
        info!("bracket engine stopped");
    }
}

/// Wires the HTTP remote, an in-memory cache and a session together.
/// Remote failures are logged and the engine keeps serving what it has.
pub async fn connect(config: &EngineConfig, scoring: TournamentScoringConfig) -> Engine {
    let remote = Arc::new(HttpRemoteStore::new(config));
    let cache = Arc::new(MemoryCache::new());
    let coordinator = SyncCoordinator::new(cache, remote, Handle::current());

    let tournament_id = config.tournament_id.trim();
    if tournament_id.is_empty() {
        coordinator.load_cached();
    } else if let Err(err) = coordinator.load(tournament_id).await {
        warn!(tournament_id, error = %err, "initial load failed; serving cache");
    }

    let subscription = if config.realtime_url.trim().is_empty() || tournament_id.is_empty() {
        None
    } else {
        match coordinator.subscribe(&realtime_channel(tournament_id)).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(tournament_id, error = %err, "realtime subscribe failed");
                None
            }
        }
    };

    let mut session = BracketSession::new(coordinator, scoring);
    session.start();
    Engine {
        session,
        subscription,
        simulation: SimulationConfig::from_engine(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_init_logging_creates_the_log_dir() {
        let dir = std::env::temp_dir().join(format!("bracket-engine-logs-{}", std::process::id()));
        let config = EngineConfig {
            log_dir: dir.to_string_lossy().into_owned(),
            ..EngineConfig::default()
        };
        let guard = init_logging(&config).unwrap();
        assert!(dir.is_dir());
        drop(guard);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_realtime_channel_name() {
        assert_eq!(realtime_channel(" t-42 "), "tournament:t-42");
    }

    #[tokio::test]
    async fn test_connect_without_remote_runs_offline() {
        let engine = connect(&EngineConfig::default(), TournamentScoringConfig::uniform(3, 3, 21, 30)).await;
        assert!(!engine.is_live());
        assert!(engine.session.coordinator().snapshot().is_empty());
        assert_eq!(engine.session.selection(), ViewSelection::default());
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simulate_uses_configured_tick_length() {
        let config = EngineConfig {
            simulation_tick_ms: 250,
            ..EngineConfig::default()
        };
        let engine = connect(&config, TournamentScoringConfig::uniform(1, 1, 3, 5)).await;
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        engine.session.coordinator().apply_local(Match::new("m-1", 1, "div-1", start));

        let report = engine.simulate(vec!["m-1".to_string()], start).await;
        assert!(report.all_finished());
        assert_eq!(
            report.finished_at,
            start + chrono::Duration::milliseconds(250 * report.ticks as i64)
        );
        engine.shutdown();
    }
}

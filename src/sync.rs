use crate::cache::LocalCache;
use crate::config::normalize_match_id;
use crate::error::SyncError;
use crate::remote::{MatchPatch, RemoteStore};
use crate::types::*;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, MutexGuard,
    },
};
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Notifications for observers. Nothing here needs an answer; failures
/// are reported and the caller decides whether to retry.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Loaded { count: usize },
    RemoteApplied(MatchId),
    EchoSuppressed(MatchId),
    UnknownMatch(MatchId),
    WriteCompleted(MatchId),
    WriteFailed { match_id: MatchId, message: String },
    FetchFailed(String),
    SubscribeFailed(String),
    SubscriptionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    Unchanged,
    EchoSuppressed,
    UnknownMatch,
}

/// Keeps a realtime subscription alive. Closing (or dropping) stops the
/// producer and the consumer task.
#[derive(Debug)]
pub struct SubscriptionHandle {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("subscription closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Merges local intents, remote pushes and the local cache into one
/// match map.
///
/// Every mutation replaces a match by id under the map lock and publishes
/// a fresh snapshot. The lock is never held across an await. A single
/// ignore slot suppresses the realtime echo of the most recent local
/// write; it is a slot, not a queue, so only one in-flight write per
/// coordinator is shielded.
#[derive(Clone)]
pub struct SyncCoordinator {
    matches: SharedMatches,
    ignore: SharedIgnoreSlot,
    cache: Arc<dyn LocalCache>,
    remote: Arc<dyn RemoteStore>,
    snapshots: Arc<watch::Sender<MatchSnapshot>>,
    events: broadcast::Sender<SyncEvent>,
    runtime: Handle,
}

impl SyncCoordinator {
    pub fn new(cache: Arc<dyn LocalCache>, remote: Arc<dyn RemoteStore>, runtime: Handle) -> Self {
        let (snapshots, _) = watch::channel(MatchSnapshot::default());
        let (events, _) = broadcast::channel(SYNC_EVENT_CAPACITY);
        Self {
            matches: SharedMatches::default(),
            ignore: SharedIgnoreSlot::default(),
            cache,
            remote,
            snapshots: Arc::new(snapshots),
            events,
            runtime,
        }
    }

    fn lock_matches(&self) -> MutexGuard<'_, HashMap<MatchId, Match>> {
        self.matches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_ignore(&self) -> MutexGuard<'_, Option<MatchId>> {
        self.ignore.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, matches: &HashMap<MatchId, Match>) {
        self.snapshots.send_replace(Arc::new(matches.clone()));
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch_matches(&self) -> watch::Receiver<MatchSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Match> {
        self.lock_matches().get(&normalize_match_id(id)).cloned()
    }

    pub fn division(&self, division_id: &str) -> Vec<Match> {
        let mut out = self
            .lock_matches()
            .values()
            .filter(|m| m.division_id == division_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.match_number.cmp(&b.match_number).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Seeds the map from the local cache.
    pub fn load_cached(&self) -> usize {
        let cached = self.cache.all();
        let count = cached.len();
        let mut guard = self.lock_matches();
        for m in cached {
            guard.insert(m.id.clone(), m);
        }
        self.publish(&guard);
        count
    }

    /// Serves the cache first, then overlays the remote snapshot.
    pub async fn load(&self, tournament_id: &str) -> Result<usize, SyncError> {
        let cached = self.load_cached();
        debug!(tournament_id, cached, "cached matches published");
        let fetched = match self.remote.get_matches(tournament_id).await {
            Ok(matches) => matches,
            Err(err) => {
                warn!(tournament_id, kind = err.kind(), error = %err, "remote fetch failed");
                self.emit(SyncEvent::FetchFailed(err.to_string()));
                return Err(err);
            }
        };
        let count = fetched.len();
        {
            let mut guard = self.lock_matches();
            for m in fetched {
                self.cache.upsert(m.clone());
                guard.insert(m.id.clone(), m);
            }
            self.publish(&guard);
        }
        info!(tournament_id, count, "matches loaded");
        self.emit(SyncEvent::Loaded { count });
        Ok(count)
    }

    pub fn set_ignore_match(&self, match_id: Option<&str>) {
        *self.lock_ignore() = match_id.map(normalize_match_id);
    }

    pub fn ignored_match(&self) -> Option<MatchId> {
        self.lock_ignore().clone()
    }

    /// Clears the ignore slot only while it still names `match_id`.
    pub fn clear_ignore_if(&self, match_id: &str) -> bool {
        let mut slot = self.lock_ignore();
        if slot.as_deref() == Some(match_id) {
            *slot = None;
            return true;
        }
        false
    }

    pub fn on_remote_update(&self, match_id: &str, patch: &MatchPatch) -> RemoteOutcome {
        let match_id = normalize_match_id(match_id);
        // lock order: matches, then ignore
        let mut guard = self.lock_matches();
        if self.lock_ignore().as_deref() == Some(match_id.as_str()) {
            drop(guard);
            debug!(match_id = %match_id, "dropping echo of local write");
            self.emit(SyncEvent::EchoSuppressed(match_id));
            return RemoteOutcome::EchoSuppressed;
        }

        let Some(mut merged) = guard.get(&match_id).cloned() else {
            drop(guard);
            debug!(match_id = %match_id, "remote update for unknown match");
            self.emit(SyncEvent::UnknownMatch(match_id));
            return RemoteOutcome::UnknownMatch;
        };
        if !patch.apply(&mut merged) {
            return RemoteOutcome::Unchanged;
        }
        self.cache.upsert(merged.clone());
        guard.insert(match_id.clone(), merged);
        self.publish(&guard);
        drop(guard);
        self.emit(SyncEvent::RemoteApplied(match_id));
        RemoteOutcome::Applied
    }

    /// Replaces the match locally (map, cache, snapshot) without a write.
    pub fn apply_local(&self, m: Match) {
        let mut guard = self.lock_matches();
        self.replace_locked(&mut guard, m);
    }

    fn replace_locked(&self, guard: &mut HashMap<MatchId, Match>, m: Match) {
        self.cache.upsert(m.clone());
        guard.insert(m.id.clone(), m);
        self.publish(guard);
    }

    /// Fire-and-forget remote write. A failure is reported as an event and
    /// the local state is kept.
    pub fn write_remote(&self, m: Match) -> JoinHandle<()> {
        let this = self.clone();
        self.runtime.spawn(async move {
            let result = this.remote.update_match(&m).await;
            this.clear_ignore_if(&m.id);
            match result {
                Ok(_) => {
                    debug!(match_id = %m.id, "remote write done");
                    this.emit(SyncEvent::WriteCompleted(m.id));
                }
                Err(err) => {
                    warn!(match_id = %m.id, kind = err.kind(), error = %err, "remote write failed");
                    this.emit(SyncEvent::WriteFailed {
                        match_id: m.id,
                        message: err.to_string(),
                    });
                }
            }
        })
    }

    /// Shields the match from its own echo, applies it locally and issues
    /// the remote write.
    pub fn commit_local(&self, m: Match) -> JoinHandle<()> {
        {
            let mut guard = self.lock_matches();
            self.set_ignore_match(Some(&m.id));
            self.replace_locked(&mut guard, m.clone());
        }
        self.write_remote(m)
    }

    pub async fn subscribe(&self, channel: &str) -> Result<SubscriptionHandle, SyncError> {
        let subscription = match self.remote.subscribe(channel).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(channel, kind = err.kind(), error = %err, "subscribe failed");
                self.emit(SyncEvent::SubscribeFailed(err.to_string()));
                return Err(err);
            }
        };
        let (mut events, stop) = subscription.into_parts();
        let task_stop = stop.clone();
        let this = self.clone();
        let task = self.runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                if task_stop.load(Ordering::Acquire) {
                    break;
                }
                this.on_remote_update(&event.match_id, &event.fields);
            }
            this.emit(SyncEvent::SubscriptionClosed);
        });
        info!(channel, "subscribed to remote changes");
        Ok(SubscriptionHandle {
            stop,
            task: Some(task),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::remote::{RemoteEvent, RemoteSubscription};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::{sync::Mutex, time::Duration};
    use tokio::sync::mpsc;

    #[derive(Default)]
    pub(crate) struct MockRemote {
        pub(crate) matches: Mutex<Vec<Match>>,
        pub(crate) writes: Mutex<Vec<Match>>,
        pub(crate) fail_writes: AtomicBool,
        pub(crate) feed: Mutex<Option<mpsc::Sender<RemoteEvent>>>,
        pub(crate) stop: Mutex<Option<Arc<AtomicBool>>>,
    }

    impl MockRemote {
        pub(crate) fn written_ids(&self) -> Vec<MatchId> {
            self.writes.lock().unwrap().iter().map(|m| m.id.clone()).collect()
        }
    }

    #[async_trait]
    impl RemoteStore for MockRemote {
        async fn get_matches(&self, _tournament_id: &str) -> Result<Vec<Match>, SyncError> {
            Ok(self.matches.lock().unwrap().clone())
        }

        async fn update_match(&self, m: &Match) -> Result<Match, SyncError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SyncError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.writes.lock().unwrap().push(m.clone());
            Ok(m.clone())
        }

        async fn subscribe(&self, _channel: &str) -> Result<RemoteSubscription, SyncError> {
            let (tx, rx) = mpsc::channel(8);
            let stop = Arc::new(AtomicBool::new(false));
            *self.feed.lock().unwrap() = Some(tx);
            *self.stop.lock().unwrap() = Some(stop.clone());
            Ok(RemoteSubscription::new(rx, stop))
        }
    }

    pub(crate) fn fixture(id: &str, number: u32) -> Match {
        Match::new(id, number, "div-1", Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
    }

    pub(crate) fn coordinator(remote: Arc<MockRemote>, matches: Vec<Match>) -> SyncCoordinator {
        let cache = Arc::new(MemoryCache::with_matches(matches));
        let coordinator = SyncCoordinator::new(cache, remote, Handle::current());
        coordinator.load_cached();
        coordinator
    }

    fn field_patch(field: &str) -> MatchPatch {
        MatchPatch {
            field_id: Some(Some(field.to_string())),
            ..MatchPatch::default()
        }
    }

    #[tokio::test]
    async fn test_echo_of_ignored_match_is_dropped() {
        let remote = Arc::new(MockRemote::default());
        let sync = coordinator(remote, vec![fixture("m-1", 1), fixture("m-2", 2)]);
        let mut events = sync.events();

        sync.set_ignore_match(Some(" m-1 "));
        assert_eq!(sync.on_remote_update("m-1", &field_patch("court 4")), RemoteOutcome::EchoSuppressed);
        assert_eq!(sync.get("m-1").unwrap().field_id, None);

        assert_eq!(sync.on_remote_update("m-2", &field_patch("court 4")), RemoteOutcome::Applied);
        assert_eq!(sync.snapshot()["m-2"].field_id.as_deref(), Some("court 4"));
        assert_eq!(sync.on_remote_update("m-2", &field_patch("court 4")), RemoteOutcome::Unchanged);
        assert_eq!(sync.on_remote_update("ghost", &field_patch("x")), RemoteOutcome::UnknownMatch);

        assert_eq!(events.try_recv().unwrap(), SyncEvent::EchoSuppressed("m-1".to_string()));
        assert_eq!(events.try_recv().unwrap(), SyncEvent::RemoteApplied("m-2".to_string()));
        assert_eq!(events.try_recv().unwrap(), SyncEvent::UnknownMatch("ghost".to_string()));
    }

    #[tokio::test]
    async fn test_push_waiting_on_the_map_sees_a_new_ignore() {
        let remote = Arc::new(MockRemote::default());
        let sync = coordinator(remote, vec![fixture("m-1", 1)]);
        let patch = MatchPatch {
            team1_points: Some(vec![0, 0, 0]),
            ..MatchPatch::default()
        };

        let mut guard = sync.lock_matches();
        let pusher = {
            let sync = sync.clone();
            std::thread::spawn(move || sync.on_remote_update("m-1", &patch))
        };
        std::thread::sleep(Duration::from_millis(50));
        sync.set_ignore_match(Some("m-1"));
        if let Some(m) = guard.get_mut("m-1") {
            m.team1_points = vec![7, 0, 0];
        }
        drop(guard);

        assert_eq!(pusher.join().unwrap(), RemoteOutcome::EchoSuppressed);
        assert_eq!(sync.get("m-1").unwrap().team1_points, vec![7, 0, 0]);
        assert_eq!(sync.ignored_match().as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_commit_shields_until_write_resolves() {
        let remote = Arc::new(MockRemote::default());
        let sync = coordinator(remote.clone(), vec![fixture("m-1", 1)]);
        let mut m = sync.get("m-1").unwrap();
        m.referee_checked_in = Some(true);

        let write = sync.commit_local(m.clone());
        assert_eq!(sync.ignored_match().as_deref(), Some("m-1"));
        assert_eq!(sync.get("m-1").unwrap(), m);
        write.await.unwrap();
        assert_eq!(sync.ignored_match(), None);
        assert_eq!(remote.written_ids(), vec!["m-1"]);
    }

    #[tokio::test]
    async fn test_write_does_not_clear_a_newer_ignore() {
        let remote = Arc::new(MockRemote::default());
        let sync = coordinator(remote, vec![fixture("m-1", 1), fixture("m-2", 2)]);
        let write = sync.commit_local(fixture("m-1", 1));
        sync.set_ignore_match(Some("m-2"));
        write.await.unwrap();
        assert_eq!(sync.ignored_match().as_deref(), Some("m-2"));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_local_state() {
        let remote = Arc::new(MockRemote::default());
        remote.fail_writes.store(true, Ordering::SeqCst);
        let sync = coordinator(remote.clone(), vec![fixture("m-1", 1)]);
        let mut events = sync.events();

        let mut m = sync.get("m-1").unwrap();
        m.team1_points = vec![1, 0, 0];
        sync.commit_local(m.clone()).await.unwrap();

        assert_eq!(sync.get("m-1").unwrap().team1_points, vec![1, 0, 0]);
        assert!(remote.written_ids().is_empty());
        match events.try_recv().unwrap() {
            SyncEvent::WriteFailed { match_id, message } => {
                assert_eq!(match_id, "m-1");
                assert!(message.contains("503"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_overlays_remote_on_cache() {
        let remote = Arc::new(MockRemote::default());
        let mut fresh = fixture("m-1", 1);
        fresh.field_id = Some("court 9".to_string());
        *remote.matches.lock().unwrap() = vec![fresh];

        let cache = Arc::new(MemoryCache::with_matches(vec![fixture("m-1", 1), fixture("m-3", 3)]));
        let sync = SyncCoordinator::new(cache.clone(), remote, Handle::current());
        let mut snapshots = sync.watch_matches();
        assert_eq!(sync.load("t-1").await.unwrap(), 1);

        assert!(snapshots.has_changed().unwrap());
        let snapshot = snapshots.borrow_and_update().clone();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["m-1"].field_id.as_deref(), Some("court 9"));
        assert_eq!(
            cache.get_by_id("m-1").and_then(|m| m.field_id),
            Some("court 9".to_string())
        );
        assert_eq!(sync.division("div-1").len(), 2);
    }

    #[tokio::test]
    async fn test_subscription_applies_events_until_closed() {
        let remote = Arc::new(MockRemote::default());
        let sync = coordinator(remote.clone(), vec![fixture("m-1", 1)]);
        let mut events = sync.events();
        let mut handle = sync.subscribe("tournament:t-1").await.unwrap();

        let feed = remote.feed.lock().unwrap().clone().unwrap();
        feed.send(RemoteEvent {
            match_id: "m-1".to_string(),
            fields: field_patch("court 2"),
        })
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SyncEvent::RemoteApplied("m-1".to_string()));
        assert_eq!(sync.get("m-1").unwrap().field_id.as_deref(), Some("court 2"));

        handle.close();
        assert!(handle.is_closed());
        let stop = remote.stop.lock().unwrap().clone().unwrap();
        assert!(stop.load(Ordering::Acquire));
    }
}

use crate::error::SyncError;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::json;
use std::{
  io,
  net::TcpStream,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tungstenite::{stream::MaybeTlsStream, Message, WebSocket};

const USER_AGENT: &str = "bracket-engine";

type RealtimeSocket = WebSocket<MaybeTlsStream<TcpStream>>;

// ── Remote contract ────────────────────────────────────────────────────

/// Authoritative match store. Writes are last-write-wins at the remote.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  async fn get_matches(&self, tournament_id: &str) -> Result<Vec<Match>, SyncError>;
  async fn update_match(&self, m: &Match) -> Result<Match, SyncError>;
  async fn subscribe(&self, channel: &str) -> Result<RemoteSubscription, SyncError>;
}

/// A change pushed by the remote for one match.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
  pub match_id: MatchId,
  pub fields: MatchPatch,
}

/// Receiving end of a realtime channel. Setting the stop flag ends the
/// producer; dropping the receiver does too.
#[derive(Debug)]
pub struct RemoteSubscription {
  events: mpsc::Receiver<RemoteEvent>,
  stop: Arc<AtomicBool>,
}

impl RemoteSubscription {
  pub fn new(events: mpsc::Receiver<RemoteEvent>, stop: Arc<AtomicBool>) -> Self {
    Self { events, stop }
  }

  pub fn into_parts(self) -> (mpsc::Receiver<RemoteEvent>, Arc<AtomicBool>) {
    (self.events, self.stop)
  }
}

// ── Wire patch ─────────────────────────────────────────────────────────

/// Partial match update as it arrives from the remote. A missing key
/// leaves the field alone; an explicit `null` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPatch {
  #[serde(default)]
  pub team1_points: Option<Vec<u32>>,
  #[serde(default)]
  pub team2_points: Option<Vec<u32>>,
  #[serde(default)]
  pub set_results: Option<Vec<u8>>,
  #[serde(default, deserialize_with = "nullable")]
  pub team1_id: Option<Option<TeamId>>,
  #[serde(default, deserialize_with = "nullable")]
  pub team2_id: Option<Option<TeamId>>,
  #[serde(default, rename = "field", deserialize_with = "nullable")]
  pub field_id: Option<Option<String>>,
  #[serde(default, rename = "refId", deserialize_with = "nullable")]
  pub referee_id: Option<Option<String>>,
  #[serde(default, alias = "refCheckedIn", deserialize_with = "nullable")]
  pub referee_checked_in: Option<Option<bool>>,
  #[serde(default)]
  pub start: Option<DateTime<Utc>>,
  #[serde(default, deserialize_with = "nullable")]
  pub end: Option<Option<DateTime<Utc>>>,
}

fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
  D: Deserializer<'de>,
  T: Deserialize<'de>,
{
  Option::<T>::deserialize(deserializer).map(Some)
}

fn overwrite<T: Clone>(target: &mut T, value: &Option<T>) {
  if let Some(value) = value {
    *target = value.clone();
  }
}

impl MatchPatch {
  pub fn from_value(value: serde_json::Value) -> Result<Self, SyncError> {
    Ok(serde_json::from_value(value)?)
  }

  /// Merges the patch into `m`. Returns false when nothing changed.
  pub fn apply(&self, m: &mut Match) -> bool {
    let before = m.clone();
    overwrite(&mut m.team1_points, &self.team1_points);
    overwrite(&mut m.team2_points, &self.team2_points);
    overwrite(&mut m.set_results, &self.set_results);
    overwrite(&mut m.team1_id, &self.team1_id);
    overwrite(&mut m.team2_id, &self.team2_id);
    overwrite(&mut m.field_id, &self.field_id);
    overwrite(&mut m.referee_id, &self.referee_id);
    overwrite(&mut m.referee_checked_in, &self.referee_checked_in);
    overwrite(&mut m.start, &self.start);
    overwrite(&mut m.end, &self.end);
    *m != before
  }
}

// ── HTTP + websocket adapter ───────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum MatchesBody {
  List(Vec<Match>),
  Wrapped { matches: Vec<Match> },
}

impl MatchesBody {
  fn into_matches(self) -> Vec<Match> {
    match self {
      MatchesBody::List(matches) | MatchesBody::Wrapped { matches } => matches,
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeFrame {
  #[serde(default)]
  match_id: Option<String>,
  #[serde(default)]
  fields: Option<MatchPatch>,
}

/// REST for reads and writes, a websocket for pushes.
pub struct HttpRemoteStore {
  client: reqwest::Client,
  base_url: String,
  realtime_url: String,
  api_key: String,
}

impl HttpRemoteStore {
  pub fn new(config: &EngineConfig) -> Self {
    Self {
      client: reqwest::Client::new(),
      base_url: config.remote_url.trim().trim_end_matches('/').to_string(),
      realtime_url: config.realtime_url.trim().to_string(),
      api_key: config.api_key.trim().to_string(),
    }
  }

  fn endpoint(&self, path: &str) -> String {
    format!("{}/{}", self.base_url, path.trim_start_matches('/'))
  }

  async fn send<T: DeserializeOwned>(&self, label: &str, request: reqwest::RequestBuilder) -> Result<T, SyncError> {
    let resp = request
      .bearer_auth(&self.api_key)
      .header("User-Agent", USER_AGENT)
      .send()
      .await
      .map_err(|e| {
        warn!(label, error = %e, "remote request failed");
        SyncError::Http(e)
      })?;
    let status = resp.status();
    let body = resp.text().await?;
    debug!(label, %status, bytes = body.len(), "remote response");
    if !status.is_success() {
      return Err(SyncError::Status {
        status: status.as_u16(),
        body,
      });
    }
    serde_json::from_str(&body).map_err(|e| {
      warn!(label, error = %e, "remote response did not parse");
      SyncError::Decode(e)
    })
  }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
  async fn get_matches(&self, tournament_id: &str) -> Result<Vec<Match>, SyncError> {
    let url = self.endpoint(&format!("tournaments/{}/matches", tournament_id.trim()));
    let body: MatchesBody = self.send("get_matches", self.client.get(url)).await?;
    Ok(body.into_matches())
  }

  async fn update_match(&self, m: &Match) -> Result<Match, SyncError> {
    let url = self.endpoint(&format!("matches/{}", m.id));
    self.send("update_match", self.client.put(url).json(m)).await
  }

  async fn subscribe(&self, channel: &str) -> Result<RemoteSubscription, SyncError> {
    if self.realtime_url.is_empty() {
      return Err(SyncError::Realtime("realtime url not configured".to_string()));
    }
    let url = self.realtime_url.clone();
    let channel = channel.to_string();
    let api_key = self.api_key.clone();
    let socket = tokio::task::spawn_blocking(move || open_realtime(&url, &channel, &api_key))
      .await
      .map_err(|e| SyncError::Realtime(e.to_string()))??;

    let (tx, rx) = mpsc::channel(REMOTE_EVENT_BUFFER);
    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = stop.clone();
    std::thread::spawn(move || read_realtime(socket, tx, reader_stop));
    Ok(RemoteSubscription::new(rx, stop))
  }
}

fn open_realtime(url: &str, channel: &str, api_key: &str) -> Result<RealtimeSocket, SyncError> {
  let (mut socket, _) =
    tungstenite::connect(url).map_err(|e| SyncError::Realtime(format!("connect {url}: {e}")))?;
  let frame = json!({
    "type": "subscribe",
    "channel": channel,
    "apiKey": api_key,
  });
  socket
    .send(Message::Text(frame.to_string()))
    .map_err(|e| SyncError::Realtime(e.to_string()))?;
  set_read_timeout(&socket, Duration::from_millis(REALTIME_READ_TIMEOUT_MS))
    .map_err(|e| SyncError::Realtime(format!("read timeout: {e}")))?;
  info!(channel, "realtime channel open");
  Ok(socket)
}

fn set_read_timeout(socket: &RealtimeSocket, timeout: Duration) -> io::Result<()> {
  match socket.get_ref() {
    MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(timeout)),
    MaybeTlsStream::Rustls(stream) => stream.get_ref().set_read_timeout(Some(timeout)),
    _ => Ok(()),
  }
}

fn read_realtime(mut socket: RealtimeSocket, tx: mpsc::Sender<RemoteEvent>, stop: Arc<AtomicBool>) {
  while !stop.load(Ordering::Acquire) && !tx.is_closed() {
    match socket.read() {
      Ok(Message::Text(text)) => match parse_realtime_frame(&text) {
        Ok(Some(event)) => {
          if tx.blocking_send(event).is_err() {
            break;
          }
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "skipping realtime frame"),
      },
      Ok(Message::Close(_)) => {
        info!("realtime channel closed by remote");
        break;
      }
      Ok(_) => {}
      Err(tungstenite::Error::Io(e))
        if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
      Err(err) => {
        warn!(error = %err, "realtime read failed");
        break;
      }
    }
  }
  let _ = socket.close(None);
  debug!("realtime reader stopped");
}

/// Frames without a match id (acks, heartbeats) yield `None`.
pub fn parse_realtime_frame(text: &str) -> Result<Option<RemoteEvent>, SyncError> {
  let frame = serde_json::from_str::<RealtimeFrame>(text)?;
  let Some(match_id) = frame.match_id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) else {
    return Ok(None);
  };
  Ok(Some(RemoteEvent {
    match_id,
    fields: frame.fields.unwrap_or_default(),
  }))
}

use crate::types::*;
use chrono::{DateTime, Utc};
use std::{
  env, fs,
  path::{Path, PathBuf},
};

pub fn config_path() -> PathBuf {
  if let Some(raw) = env_default("BRACKET_ENGINE_CONFIG") {
    return PathBuf::from(raw);
  }
  PathBuf::from("config.json")
}

pub fn env_default(key: &str) -> Option<String> {
  env::var(key)
    .ok()
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
}

pub fn apply_env_defaults(mut config: EngineConfig) -> EngineConfig {
  fill_from_env(&mut config.remote_url, "BRACKET_REMOTE_URL");
  fill_from_env(&mut config.realtime_url, "BRACKET_REALTIME_URL");
  fill_from_env(&mut config.api_key, "BRACKET_API_KEY");
  fill_from_env(&mut config.tournament_id, "BRACKET_TOURNAMENT_ID");
  fill_from_env(&mut config.log_dir, "BRACKET_LOG_DIR");
  if config.simulation_tick_ms == 0 {
    config.simulation_tick_ms = DEFAULT_SIMULATION_TICK_MS;
  }
  config
}

fn fill_from_env(field: &mut String, key: &str) {
  if field.trim().is_empty() {
    if let Some(value) = env_default(key) {
      *field = value;
    }
  }
}

pub fn load_config() -> Result<EngineConfig, String> {
  load_config_from(&config_path())
}

/// `.env` first, then the JSON file, then env defaults for blank fields.
pub fn load_engine_config() -> Result<EngineConfig, String> {
  load_env_file();
  load_config()
}

pub fn load_config_from(path: &Path) -> Result<EngineConfig, String> {
  if !path.is_file() {
    return Ok(apply_env_defaults(EngineConfig::default()));
  }
  let data = fs::read_to_string(path).map_err(|e| format!("read config {}: {e}", path.display()))?;
  let config =
    serde_json::from_str::<EngineConfig>(&data).map_err(|e| format!("parse config {}: {e}", path.display()))?;
  Ok(apply_env_defaults(config))
}

pub fn save_config(path: &Path, config: &EngineConfig) -> Result<(), String> {
  let payload = serde_json::to_string_pretty(config).map_err(|e| e.to_string())?;
  fs::write(path, payload).map_err(|e| format!("write config {}: {e}", path.display()))
}

/// Reads `.env` from the working directory. Variables already present in
/// the environment win.
pub fn load_env_file() {
  load_env_file_from(Path::new(".env"));
}

pub fn load_env_file_from(env_path: &Path) {
  if !env_path.is_file() {
    return;
  }
  let contents = match fs::read_to_string(env_path) {
    Ok(data) => data,
    Err(_) => return,
  };
  for line in contents.lines() {
    if let Some((key, value)) = parse_env_line(line) {
      if env::var_os(&key).is_none() {
        env::set_var(key, value);
      }
    }
  }
}

pub fn parse_env_line(line: &str) -> Option<(String, String)> {
  let trimmed = line.trim();
  if trimmed.is_empty() || trimmed.starts_with('#') {
    return None;
  }
  let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
  let (key, raw_value) = trimmed.split_once('=')?;
  let key = key.trim();
  if key.is_empty() {
    return None;
  }
  let mut value = raw_value.trim();
  if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
    value = &value[1..value.len() - 1];
  } else if value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2 {
    value = &value[1..value.len() - 1];
  } else if let Some(idx) = value.find('#') {
    value = value[..idx].trim_end();
  }
  Some((key.to_string(), value.to_string()))
}

pub fn now() -> DateTime<Utc> {
  Utc::now()
}

/// Ids arrive from editors and the wire with stray whitespace.
pub fn normalize_match_id(raw: &str) -> MatchId {
  raw.trim().to_string()
}

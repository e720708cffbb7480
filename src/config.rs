use crate::bracket::match_rounds;
use crate::controller::platform_rounds;
use crate::error::{KnockoutError, KnockoutResult};
use crate::tiebreak::TieBreakConfig;
use crate::types::*;
use chrono::Local;
use std::{
  env,
  fs,
  io::Write,
  path::PathBuf,
  time::{SystemTime, UNIX_EPOCH},
};

const ALLOWED_CLOCK_INIT: [u32; 33] = [
  0, 15, 30, 45, 60, 90, 120, 180, 240, 300, 360, 420, 480, 600, 900, 1200, 1500, 1800, 2400, 3000, 3600,
  4200, 4800, 5400, 6000, 6600, 7200, 7800, 8400, 9000, 9600, 10200, 10800,
];
const VARIANTS: [&str; 10] = [
  "standard",
  "chess960",
  "crazyhouse",
  "antichess",
  "atomic",
  "horde",
  "kingOfTheHill",
  "racingKings",
  "threeCheck",
  "fromPosition",
];
const CHAT_FOR: [u32; 4] = [0, 10, 20, 30];

pub fn repo_root() -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn resolve_repo_path(raw: &str) -> PathBuf {
  let path = PathBuf::from(raw);
  if path.is_absolute() {
    path
  } else {
    repo_root().join(path)
  }
}

pub fn config_path() -> PathBuf {
  match env_default("KNOCKOUT_CONFIG_PATH") {
    Some(raw) => resolve_repo_path(&raw),
    None => repo_root().join("config.json"),
  }
}

pub fn session_path() -> PathBuf {
  match env_default("KNOCKOUT_SESSION_PATH") {
    Some(raw) => resolve_repo_path(&raw),
    None => repo_root().join("session.json"),
  }
}

pub fn logs_dir() -> PathBuf {
  repo_root().join("logs")
}

pub fn env_default(key: &str) -> Option<String> {
  env::var(key)
    .ok()
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
}

pub fn apply_env_defaults(mut config: KnockoutConfig) -> KnockoutConfig {
  if config.lichess_token.trim().is_empty() {
    if let Some(value) = env_default("LICHESS_TOKEN") {
      config.lichess_token = value;
    }
  }
  if config.team_id.trim().is_empty() {
    if let Some(value) = env_default("LICHESS_TEAM_ID") {
      config.team_id = value;
    }
  }
  config
}

pub fn load_config_inner() -> Result<KnockoutConfig, String> {
  let path = config_path();
  if !path.is_file() {
    return Ok(apply_env_defaults(KnockoutConfig::default()));
  }
  let data = fs::read_to_string(&path).map_err(|e| format!("read config {}: {e}", path.display()))?;
  let config =
    serde_json::from_str::<KnockoutConfig>(&data).map_err(|e| format!("parse config {}: {e}", path.display()))?;
  Ok(apply_env_defaults(config))
}

pub fn load_env_file() {
  let env_path = repo_root().join(".env");
  if !env_path.is_file() {
    return;
  }
  let contents = match fs::read_to_string(&env_path) {
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

pub fn now_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}

pub fn api_log_path() -> PathBuf {
  logs_dir().join("lichess_api.log")
}

pub fn append_api_log(label: &str, payload: &str) {
  let dir = logs_dir();
  if fs::create_dir_all(&dir).is_err() {
    return;
  }
  let path = api_log_path();
  let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
  let entry = format!("[{timestamp}] {label}\n{payload}\n\n");
  if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(&path) {
    let _ = file.write_all(entry.as_bytes());
  }
}

pub fn log_env_warnings() {
  let config = load_config_inner().unwrap_or_else(|_| KnockoutConfig::default());
  let mut warnings = Vec::new();

  if config.lichess_token.trim().is_empty() {
    warnings.push("LICHESS_TOKEN not set and no token in config, the event cannot be created");
  }
  if config.team_id.trim().is_empty() {
    warnings.push("LICHESS_TEAM_ID not set and no team in config, the event cannot be created");
  }

  for msg in warnings {
    tracing::warn!("{}", msg);
  }
}

/// Check a config before anything touches the platform.
pub fn validate_config(config: &KnockoutConfig) -> KnockoutResult<()> {
  let invalid = |msg: &str| Err(KnockoutError::InvalidConfig(msg.to_string()));

  if config.lichess_token.trim().is_empty() {
    return invalid("Lichess token missing");
  }
  let team_ok = !config.team_id.is_empty()
    && config
      .team_id
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '-');
  if !team_ok {
    return invalid("Invalid Lichess team ID");
  }
  let name_ok = config
    .event_name
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | ',' | '.' | '-'));
  if !name_ok {
    return invalid("Illegal event name");
  }
  let name_len = config.event_name.chars().count();
  if name_len != 0 && !(2..=30).contains(&name_len) {
    return invalid("Event name has improper length");
  }

  TieBreakConfig::new(config.tie_break, config.games_per_match, config.armageddon)?;

  if config.minutes_to_start < 5 {
    return invalid("Minutes to start too short (less than 5 minutes)");
  }
  if config.minutes_to_start > 60 * 24 * 7 {
    return invalid("Minutes to start too long (more than a week)");
  }
  if config.min_participants < MIN_FIELD_SIZE {
    return invalid("Minimum number of participants too low (must be at least 4)");
  }
  if config.min_participants > config.max_participants {
    return invalid("Minimum number of participants higher than maximum");
  }
  if config.max_participants > MAX_FIELD_SIZE {
    return invalid("Maximum number of participants too high (must be at most 2048)");
  }
  if config.games_per_match == 0 {
    return invalid("Need at least 1 game per match");
  }
  if config.games_per_match > MAX_GAMES_PER_MATCH {
    return invalid("Too many games per match");
  }
  let rounds = platform_rounds(
    match_rounds(config.max_participants),
    config.games_per_match,
    config.armageddon,
  );
  if rounds < 3 {
    return invalid("Parameters indicate not enough rounds");
  }
  if rounds > 100 {
    return invalid("Parameters indicate too many rounds");
  }

  if !ALLOWED_CLOCK_INIT.contains(&config.clock_init) {
    return invalid("Invalid initial clock time");
  }
  if config.clock_increment > 120 {
    return invalid("Increment too high");
  }
  if config.clock_init + config.clock_increment == 0 {
    return invalid("Cannot play 0+0");
  }
  let degenerate = matches!((config.clock_init, config.clock_increment), (0, 1) | (15, 0));
  if degenerate && config.variant != "standard" && config.rated {
    return invalid("Degenerate variant time controls cannot be rated");
  }
  if !VARIANTS.contains(&config.variant.as_str()) {
    return invalid("Improper chess variant specified");
  }
  if !CHAT_FOR.contains(&config.chat_for) {
    return invalid("Improper chatFor parameter (must be 0/10/20/30)");
  }
  if config.api_attempts == 0 {
    return invalid("apiAttempts must be at least 1");
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tiebreak::TieBreakPolicy;

  fn valid() -> KnockoutConfig {
    KnockoutConfig {
      lichess_token: "lip_token".to_string(),
      team_id: "knockout-club".to_string(),
      event_name: "Friday KO".to_string(),
      ..KnockoutConfig::default()
    }
  }

  #[test]
  fn test_parse_env_line() {
    assert_eq!(
      parse_env_line("export LICHESS_TOKEN=\"lip_abc\""),
      Some(("LICHESS_TOKEN".to_string(), "lip_abc".to_string()))
    );
    assert_eq!(
      parse_env_line("LICHESS_TEAM_ID=my-team # comment"),
      Some(("LICHESS_TEAM_ID".to_string(), "my-team".to_string()))
    );
    assert_eq!(parse_env_line("# nothing"), None);
    assert_eq!(parse_env_line("=value"), None);
  }

  #[test]
  fn test_default_config_with_credentials_is_valid() {
    assert_eq!(validate_config(&valid()), Ok(()));
  }

  #[test]
  fn test_color_tie_break_needs_odd_match_length() {
    let config = KnockoutConfig {
      tie_break: TieBreakPolicy::Color,
      games_per_match: 2,
      ..valid()
    };
    assert!(matches!(
      validate_config(&config),
      Err(KnockoutError::InvalidTieBreakConfig(_))
    ));
  }

  #[test]
  fn test_rejects_bad_input() {
    let cases = vec![
      KnockoutConfig { team_id: "bad team".to_string(), ..valid() },
      KnockoutConfig { event_name: "X".to_string(), ..valid() },
      KnockoutConfig { event_name: "Bad!".to_string(), ..valid() },
      KnockoutConfig { minutes_to_start: 4, ..valid() },
      KnockoutConfig { min_participants: 3, ..valid() },
      KnockoutConfig { min_participants: 20, ..valid() },
      KnockoutConfig { max_participants: 4096, ..valid() },
      KnockoutConfig { games_per_match: 21, ..valid() },
      KnockoutConfig { clock_init: 200, ..valid() },
      KnockoutConfig { clock_increment: 121, ..valid() },
      KnockoutConfig { clock_init: 0, clock_increment: 0, ..valid() },
      KnockoutConfig { clock_init: 15, clock_increment: 0, variant: "atomic".to_string(), ..valid() },
      KnockoutConfig { variant: "fischer".to_string(), ..valid() },
      KnockoutConfig { chat_for: 15, ..valid() },
      KnockoutConfig { max_participants: 4, games_per_match: 1, ..valid() },
    ];
    for config in cases {
      assert!(
        matches!(validate_config(&config), Err(KnockoutError::InvalidConfig(_))),
        "accepted {config:?}"
      );
    }
  }

  #[test]
  fn test_unrated_degenerate_variant_is_fine() {
    let config = KnockoutConfig {
      clock_init: 15,
      clock_increment: 0,
      variant: "atomic".to_string(),
      rated: false,
      ..valid()
    };
    assert_eq!(validate_config(&config), Ok(()));
  }
}

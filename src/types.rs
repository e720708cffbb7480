use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::controller::BracketEvent;
use crate::tiebreak::TieBreakPolicy;

// ── Constants ──────────────────────────────────────────────────────────

pub const MIN_FIELD_SIZE: usize = 4;
pub const MAX_FIELD_SIZE: usize = 2048;
pub const MAX_GAMES_PER_MATCH: u32 = 20;
pub const LICHESS_API_URL: &str = "https://lichess.org";
pub const LICHESS_USER_AGENT: &str = "swiss-knockout";
pub const REGISTRATION_CLOSE_LEAD_MS: u64 = 30_000;
pub const START_TIME_ROUNDING_MS: u64 = 600_000;
pub const NEAR_START_WINDOW_MS: u64 = 60_000;
pub const SLOW_REGISTRATION_POLL_MS: u64 = 10_000;
pub const ROUND_START_DELAY_MS: u64 = 15_000;
pub const DEFAULT_STATE_SERVER_ADDR: &str = "127.0.0.1:17890";

// ── Shared state type aliases ──────────────────────────────────────────

pub type SharedBracketState = Arc<Mutex<Option<BracketEvent>>>;

// ── Competitors ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

/// One line of the registration feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub username: String,
    pub rating: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompetitorStatus {
    Active,
    Eliminated,
    ByeAdvanced,
    Withdrawn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Competitor {
    pub username: String,
    pub rating: u32,
    pub seed: u32,
    pub status: CompetitorStatus,
}

impl Competitor {
    pub fn new(username: impl Into<String>, rating: u32, seed: u32) -> Self {
        Competitor {
            username: username.into(),
            rating,
            seed,
            status: CompetitorStatus::Active,
        }
    }

    pub fn key(&self) -> String {
        normalize_username(&self.username)
    }
}

/// Platform usernames are case-insensitive.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

// ── Platform feeds ─────────────────────────────────────────────────────

/// Outcome of a feed game, seen from `player1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeedOutcome {
    Player1Won,
    Draw,
    Player2Won,
}

/// One game of a platform round. `player2 == None` is a walkover for `player1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedGame {
    pub player1: String,
    pub player2: Option<String>,
    pub color1: Option<Color>,
    pub result: FeedOutcome,
    pub game_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
}

/// One line of a pairing announcement; `player1` has `color1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingAnnouncement {
    pub player1: String,
    pub player2: String,
    pub color1: Color,
}

impl PairingAnnouncement {
    pub fn white(&self) -> &str {
        match self.color1 {
            Color::White => &self.player1,
            Color::Black => &self.player2,
        }
    }

    pub fn black(&self) -> &str {
        match self.color1 {
            Color::White => &self.player2,
            Color::Black => &self.player1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStatus {
    /// Last platform round that has started (1-based, 0 before the start)
    pub round: u32,
    pub ongoing: u32,
    pub finished: bool,
}

// ── Config types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KnockoutConfig {
    pub lichess_token: String,
    pub team_id: String,
    pub event_name: String,
    pub min_participants: usize,
    pub max_participants: usize,
    pub start_at_max: bool,
    pub games_per_match: u32,
    pub tie_break: TieBreakPolicy,
    pub armageddon: bool,
    pub randomize_seeds: bool,
    pub rated: bool,
    pub variant: String,
    pub clock_init: u32,
    pub clock_increment: u32,
    pub chat_for: u32,
    pub minutes_to_start: u64,
    pub poll_interval_ms: u64,
    pub api_attempts: u32,
    pub api_delay_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub deadline_minutes: Option<u64>,
    pub state_server_addr: String,
    pub bracket_dir: String,
}

impl Default for KnockoutConfig {
    fn default() -> Self {
        Self {
            lichess_token: String::new(),
            team_id: String::new(),
            event_name: "Knockout".to_string(),
            min_participants: MIN_FIELD_SIZE,
            max_participants: 16,
            start_at_max: true,
            games_per_match: 2,
            tie_break: TieBreakPolicy::Rating,
            armageddon: false,
            randomize_seeds: false,
            rated: true,
            variant: "standard".to_string(),
            clock_init: 180,
            clock_increment: 2,
            chat_for: 20,
            minutes_to_start: 30,
            poll_interval_ms: 3_000,
            api_attempts: 5,
            api_delay_ms: 3_000,
            max_backoff_ms: 60_000,
            request_timeout_ms: 20_000,
            deadline_minutes: None,
            state_server_addr: DEFAULT_STATE_SERVER_ADDR.to_string(),
            bracket_dir: "brackets".to_string(),
        }
    }
}

// ── Lichess response types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LichessErrorBody {
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LichessSwissCreated {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LichessSwissInfo {
    pub id: Option<String>,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub nb_ongoing: u32,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LichessSwissResultLine {
    pub username: String,
    pub rating: Option<u32>,
    pub points: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LichessGameLine {
    pub id: String,
    pub created_at: Option<u64>,
    pub status: Option<String>,
    pub winner: Option<String>,
    pub players: Option<LichessGamePlayers>,
}

#[derive(Debug, Deserialize)]
pub struct LichessGamePlayers {
    pub white: Option<LichessGamePlayer>,
    pub black: Option<LichessGamePlayer>,
}

#[derive(Debug, Deserialize)]
pub struct LichessGamePlayer {
    pub user: Option<LichessUser>,
}

#[derive(Debug, Deserialize)]
pub struct LichessUser {
    pub name: Option<String>,
    pub id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_colors() {
        let pairing = PairingAnnouncement {
            player1: "alice".to_string(),
            player2: "bob".to_string(),
            color1: Color::Black,
        };
        assert_eq!(pairing.white(), "bob");
        assert_eq!(pairing.black(), "alice");
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: KnockoutConfig =
            serde_json::from_str(r#"{ "teamId": "my-team", "gamesPerMatch": 3, "tieBreak": "color" }"#).unwrap();
        assert_eq!(config.team_id, "my-team");
        assert_eq!(config.games_per_match, 3);
        assert_eq!(config.tie_break, TieBreakPolicy::Color);
        assert_eq!(config.max_participants, 16);
        assert_eq!(config.api_attempts, 5);
    }

    #[test]
    fn test_competitor_status_serializes_kebab_case() {
        let value = serde_json::to_value(CompetitorStatus::ByeAdvanced).unwrap();
        assert_eq!(value, "bye-advanced");
    }
}

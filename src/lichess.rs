use crate::config::{append_api_log, now_ms};
use crate::bracket::match_rounds;
use crate::controller::{platform_rounds, SwissPlatform};
use crate::error::{KnockoutError, KnockoutResult};
use crate::tiebreak::TieBreakPolicy;
use crate::types::*;
use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::{thread::sleep, time::Duration};
use tracing::{debug, info, warn};

/// Swiss event host on lichess.org, driven through the team Swiss API.
pub struct LichessClient {
  client: Client,
  base_url: String,
  token: String,
  event_id: String,
  clock_init: u32,
  clock_increment: u32,
  nb_rounds: u32,
  starts_at_ms: u64,
  /// Last round handed to schedule-next-round
  scheduled_round: u32,
}

impl LichessClient {
  pub fn new(config: &KnockoutConfig) -> KnockoutResult<Self> {
    let client = Client::builder()
      .timeout(Duration::from_millis(config.request_timeout_ms))
      .user_agent(LICHESS_USER_AGENT)
      .build()?;
    Ok(LichessClient {
      client,
      base_url: LICHESS_API_URL.to_string(),
      token: config.lichess_token.trim().to_string(),
      event_id: String::new(),
      clock_init: config.clock_init,
      clock_increment: config.clock_increment,
      nb_rounds: 3,
      starts_at_ms: 0,
      scheduled_round: 0,
    })
  }

  /// Point the client at an event created by an earlier run.
  pub fn attach(&mut self, event_id: &str, starts_at_ms: u64, nb_rounds: u32) {
    self.event_id = event_id.to_string();
    self.starts_at_ms = starts_at_ms;
    self.nb_rounds = nb_rounds.max(3);
  }

  pub fn event_url(&self) -> String {
    format!("{}/swiss/{}", self.base_url, self.event_id)
  }

  /// Create the Swiss event that hosts the knock-out; retried like every other call.
  pub fn create_event(&mut self, config: &KnockoutConfig, starts_at_ms: u64) -> KnockoutResult<String> {
    let max_rounds = platform_rounds(
      match_rounds(config.max_participants),
      config.games_per_match,
      config.armageddon,
    );
    let form = vec![
      ("name", config.event_name.clone()),
      ("clock.limit", config.clock_init.to_string()),
      ("clock.increment", config.clock_increment.to_string()),
      ("nbRounds", max_rounds.to_string()),
      ("startsAt", starts_at_ms.to_string()),
      ("roundInterval", "99999999".to_string()),
      ("variant", config.variant.clone()),
      ("description", event_description(config)),
      ("rated", config.rated.to_string()),
      ("chatFor", config.chat_for.to_string()),
    ];
    let path = format!("/api/swiss/new/{}", config.team_id);
    let mut last_err = KnockoutError::Platform("no attempt made".to_string());
    for attempt in 0..config.api_attempts.max(1) {
      if attempt > 0 {
        sleep(Duration::from_millis(config.api_delay_ms));
      }
      match self.post_json::<LichessSwissCreated>(&path, &form) {
        Ok(created) => {
          self.event_id = created.id;
          self.nb_rounds = max_rounds;
          self.starts_at_ms = starts_at_ms;
          info!("Created event {}", self.event_url());
          return Ok(self.event_id.clone());
        }
        Err(err) => {
          warn!("Creating the event failed (attempt {}): {err}", attempt + 1);
          last_err = err;
        }
      }
    }
    Err(KnockoutError::RetriesExhausted {
      attempts: config.api_attempts.max(1),
      last: last_err.to_string(),
    })
  }

  fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
    builder.header("Authorization", format!("Bearer {}", self.token))
  }

  fn send(&self, label: &str, builder: RequestBuilder, request_log: String) -> KnockoutResult<String> {
    append_api_log(&format!("Lichess {label} request"), &request_log);
    let resp = self.authorized(builder).send().map_err(|e| {
      append_api_log("Lichess error", &format!("send failed: {e}"));
      KnockoutError::from(e)
    })?;
    let status = resp.status();
    let body = resp.text().map_err(|e| {
      append_api_log("Lichess error", &format!("read failed: {e}"));
      KnockoutError::Platform(format!("Lichess read failed: {e}"))
    })?;
    append_api_log(&format!("Lichess {label} response"), &format!("status: {status}\nbody:\n{body}"));
    if !status.is_success() {
      let message = serde_json::from_str::<LichessErrorBody>(&body)
        .ok()
        .and_then(|parsed| parsed.error)
        .unwrap_or(body);
      return Err(KnockoutError::Platform(format!("Lichess error {status}: {message}")));
    }
    Ok(body)
  }

  fn get_text(&self, path: &str) -> KnockoutResult<String> {
    let url = format!("{}{path}", self.base_url);
    let request_log = format!("GET {url}\nAuthorization: Bearer [redacted]");
    self.send("GET", self.client.get(&url), request_log)
  }

  fn post_form(&self, path: &str, form: &[(&str, String)]) -> KnockoutResult<String> {
    let url = format!("{}{path}", self.base_url);
    let fields = form
      .iter()
      .map(|(key, value)| format!("{key}: {value}"))
      .collect::<Vec<_>>()
      .join("\n");
    let request_log = format!("POST {url}\nAuthorization: Bearer [redacted]\nform:\n{fields}");
    self.send("POST", self.client.post(&url).form(form), request_log)
  }

  fn post_json<T: DeserializeOwned>(&self, path: &str, form: &[(&str, String)]) -> KnockoutResult<T> {
    let body = self.post_form(path, form)?;
    serde_json::from_str(&body).map_err(|e| {
      append_api_log("Lichess error", &format!("parse failed: {e}"));
      KnockoutError::Platform(format!("Lichess parse failed: {e}"))
    })
  }

  /// Edit the event; Lichess wants the clock on every edit.
  fn edit(&self, extra: Vec<(&str, String)>) -> KnockoutResult<()> {
    let mut form = vec![
      ("clock.limit", self.clock_init.to_string()),
      ("clock.increment", self.clock_increment.to_string()),
      ("nbRounds", self.nb_rounds.to_string()),
    ];
    form.extend(extra);
    self.post_form(&format!("/api/swiss/{}/edit", self.event_id), &form)?;
    Ok(())
  }

  fn require_event(&self) -> KnockoutResult<()> {
    if self.event_id.is_empty() {
      return Err(KnockoutError::InvalidState("no Lichess event created yet".to_string()));
    }
    Ok(())
  }
}

impl SwissPlatform for LichessClient {
  fn event_id(&self) -> &str {
    &self.event_id
  }

  fn registrations(&mut self) -> KnockoutResult<Vec<Registration>> {
    self.require_event()?;
    let body = self.get_text(&format!("/api/swiss/{}/results", self.event_id))?;
    let lines = parse_ndjson::<LichessSwissResultLine>(&body)?;
    Ok(
      lines
        .into_iter()
        .map(|line| Registration {
          username: line.username,
          rating: line.rating.unwrap_or(1500),
        })
        .collect(),
    )
  }

  fn close_registration(&mut self, competitors: &[Competitor], platform_rounds: u32) -> KnockoutResult<()> {
    self.require_event()?;
    self.nb_rounds = platform_rounds.max(3);
    let allow_list = competitors
      .iter()
      .map(|competitor| competitor.username.clone())
      .collect::<Vec<_>>()
      .join("\n");
    let soon = now_ms() + REGISTRATION_CLOSE_LEAD_MS;
    if self.starts_at_ms > soon {
      debug!("Moving the start forward to {soon}");
      self.starts_at_ms = soon;
    }
    self.edit(vec![
      ("conditions.allowList", allow_list),
      ("startsAt", self.starts_at_ms.to_string()),
    ])
  }

  fn announce(&mut self, round: u32, pairings: &[PairingAnnouncement]) -> KnockoutResult<()> {
    self.require_event()?;
    let manual = manual_pairings_text(pairings);
    self.edit(vec![("manualPairings", manual.clone())])?;
    if round <= 1 {
      self.edit(vec![
        ("manualPairings", manual.clone()),
        ("startsAt", self.starts_at_ms.to_string()),
      ])?;
    } else if self.scheduled_round < round {
      let date = now_ms() + ROUND_START_DELAY_MS;
      self.post_form(
        &format!("/api/swiss/{}/schedule-next-round", self.event_id),
        &[("date", date.to_string())],
      )?;
      self.scheduled_round = round;
    } else {
      debug!("Round {round} is already scheduled");
    }
    // Lichess occasionally drops the pairings when the round is scheduled.
    if let Err(err) = self.edit(vec![("manualPairings", manual)]) {
      warn!("Re-sending the pairings of round {round} failed: {err}");
    }
    Ok(())
  }

  fn round_status(&mut self) -> KnockoutResult<RoundStatus> {
    self.require_event()?;
    let body = self.get_text(&format!("/api/swiss/{}", self.event_id))?;
    let info = serde_json::from_str::<LichessSwissInfo>(&body)
      .map_err(|e| KnockoutError::Platform(format!("Lichess parse failed: {e}")))?;
    Ok(RoundStatus {
      round: info.round,
      ongoing: info.nb_ongoing,
      finished: info.status.as_deref() == Some("finished"),
    })
  }

  fn round_results(&mut self, round: u32, pairings: &[PairingAnnouncement]) -> KnockoutResult<Vec<FeedGame>> {
    self.require_event()?;
    let body = self.get_text(&format!("/api/swiss/{}/games?moves=false&pgnInJson=false", self.event_id))?;
    let games = parse_ndjson::<LichessGameLine>(&body)?;
    Ok(latest_pairing_games(&games, pairings, round))
  }

  fn terminate(&mut self) -> KnockoutResult<()> {
    self.require_event()?;
    self.post_form(&format!("/api/swiss/{}/terminate", self.event_id), &[])?;
    Ok(())
  }
}

pub fn event_description(config: &KnockoutConfig) -> String {
  let games = if config.games_per_match == 1 {
    "1 game".to_string()
  } else {
    format!("{} games", config.games_per_match)
  };
  let tie_break = match config.tie_break {
    TieBreakPolicy::Color => "In case of a tie, the player with more black games advances.",
    TieBreakPolicy::Rating => "In case of a tie, the lower-rated player advances.",
  };
  let mut text = format!(
    "Knock-out tournament for up to {} players. Each match consists of {games}. {tie_break}",
    config.max_participants
  );
  if config.armageddon {
    text.push_str(" Equal tie-breaks are settled by an Armageddon game where a draw counts for black.");
  }
  text.push_str(" Registration closes 30 seconds before the start.");
  text
}

pub fn parse_ndjson<T: DeserializeOwned>(body: &str) -> KnockoutResult<Vec<T>> {
  body
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .map(|line| {
      serde_json::from_str(line).map_err(|e| KnockoutError::Platform(format!("Lichess ndjson parse failed: {e}")))
    })
    .collect()
}

/// One `white black` line per pairing.
pub fn manual_pairings_text(pairings: &[PairingAnnouncement]) -> String {
  pairings
    .iter()
    .map(|pairing| format!("{} {}", pairing.white(), pairing.black()))
    .collect::<Vec<_>>()
    .join("\n")
}

fn player_name(player: Option<&LichessGamePlayer>) -> Option<String> {
  let user = player?.user.as_ref()?;
  user.name.clone().or_else(|| user.id.clone())
}

fn is_finished(status: Option<&str>) -> bool {
  !matches!(status, None | Some("created") | Some("started"))
}

/// Convert a finished Lichess game into a feed entry for `round`.
pub fn feed_game_from_line(line: &LichessGameLine, round: u32) -> Option<FeedGame> {
  if !is_finished(line.status.as_deref()) {
    return None;
  }
  let players = line.players.as_ref()?;
  let white = player_name(players.white.as_ref())?;
  let black = player_name(players.black.as_ref())?;
  let winner = line.winner.as_deref();

  if line.status.as_deref() == Some("noStart") {
    let present = match winner {
      Some("white") => white,
      Some("black") => black,
      _ => return None,
    };
    return Some(FeedGame {
      player1: present,
      player2: None,
      color1: None,
      result: FeedOutcome::Player1Won,
      game_index: round,
      game_id: Some(line.id.clone()),
    });
  }

  let result = match winner {
    Some("white") => FeedOutcome::Player1Won,
    Some("black") => FeedOutcome::Player2Won,
    _ => FeedOutcome::Draw,
  };
  Some(FeedGame {
    player1: white,
    player2: Some(black),
    color1: Some(Color::White),
    result,
    game_index: round,
    game_id: Some(line.id.clone()),
  })
}

/// Newest finished game of every announced pairing, in either color order.
pub fn latest_pairing_games(games: &[LichessGameLine], pairings: &[PairingAnnouncement], round: u32) -> Vec<FeedGame> {
  let mut sorted = games.iter().collect::<Vec<_>>();
  sorted.sort_by_key(|line| std::cmp::Reverse(line.created_at.unwrap_or(0)));

  let mut out = Vec::new();
  for pairing in pairings {
    let wanted = [normalize_username(&pairing.player1), normalize_username(&pairing.player2)];
    let found = sorted.iter().find_map(|line| {
      let players = line.players.as_ref()?;
      let white = normalize_username(&player_name(players.white.as_ref())?);
      let black = normalize_username(&player_name(players.black.as_ref())?);
      let same_pair = (white == wanted[0] && black == wanted[1]) || (white == wanted[1] && black == wanted[0]);
      if !same_pair {
        return None;
      }
      feed_game_from_line(line, round)
    });
    match found {
      Some(game) => out.push(game),
      None => debug!("No finished game yet for {} - {}", pairing.white(), pairing.black()),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  const GAMES: &str = r#"
{"id":"g1","createdAt":1000,"status":"mate","winner":"white","players":{"white":{"user":{"name":"Alice","id":"alice"}},"black":{"user":{"name":"Bob","id":"bob"}}}}
{"id":"g2","createdAt":2000,"status":"draw","players":{"white":{"user":{"name":"Bob","id":"bob"}},"black":{"user":{"name":"Alice","id":"alice"}}}}
{"id":"g3","createdAt":2100,"status":"noStart","winner":"black","players":{"white":{"user":{"name":"Carol","id":"carol"}},"black":{"user":{"name":"Dave","id":"dave"}}}}
{"id":"g4","createdAt":2200,"status":"started","players":{"white":{"user":{"name":"Erin","id":"erin"}},"black":{"user":{"name":"Fred","id":"fred"}}}}
"#;

  fn pairing(white: &str, black: &str) -> PairingAnnouncement {
    PairingAnnouncement {
      player1: white.to_string(),
      player2: black.to_string(),
      color1: Color::White,
    }
  }

  #[test]
  fn test_retried_announce_schedules_round_once() {
    use axum::{extract::State, http::StatusCode, routing::post, Router};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Hits {
      edits: u32,
      schedules: u32,
    }
    type SharedHits = Arc<Mutex<Hits>>;

    // the re-send after scheduling is the second edit and fails
    async fn edit(State(hits): State<SharedHits>) -> (StatusCode, &'static str) {
      let mut hits = hits.lock().unwrap();
      hits.edits += 1;
      if hits.edits == 2 {
        (StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"busy"}"#)
      } else {
        (StatusCode::OK, "{}")
      }
    }

    async fn schedule(State(hits): State<SharedHits>) -> (StatusCode, &'static str) {
      hits.lock().unwrap().schedules += 1;
      (StatusCode::OK, "{}")
    }

    let hits = SharedHits::default();
    let app = Router::new()
      .route("/api/swiss/:id/edit", post(edit))
      .route("/api/swiss/:id/schedule-next-round", post(schedule))
      .with_state(hits.clone());
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    std::thread::spawn(move || {
      let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
      runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();
        axum::serve(listener, app).await.unwrap();
      });
    });

    let mut client = LichessClient::new(&KnockoutConfig::default()).unwrap();
    client.base_url = format!("http://{addr}");
    client.attach("evt", 0, 6);
    let pairings = [pairing("alice", "bob")];

    assert_eq!(client.announce(2, &pairings), Ok(()));
    assert_eq!(client.announce(2, &pairings), Ok(()));
    let hits = hits.lock().unwrap();
    assert_eq!(hits.schedules, 1);
    assert_eq!(hits.edits, 4);
  }

  #[test]
  fn test_latest_game_per_pairing() {
    let games = parse_ndjson::<LichessGameLine>(GAMES).unwrap();
    assert_eq!(games.len(), 4);
    let feed = latest_pairing_games(
      &games,
      &[pairing("bob", "alice"), pairing("dave", "carol"), pairing("erin", "fred")],
      2,
    );
    assert_eq!(feed.len(), 2);

    assert_eq!(feed[0].game_id.as_deref(), Some("g2"));
    assert_eq!(feed[0].player1, "Bob");
    assert_eq!(feed[0].result, FeedOutcome::Draw);
    assert_eq!(feed[0].game_index, 2);

    assert_eq!(feed[1].player1, "Dave");
    assert_eq!(feed[1].player2, None);
    assert_eq!(feed[1].result, FeedOutcome::Player1Won);
  }

  #[test]
  fn test_black_win_is_player2() {
    let line = LichessGameLine {
      id: "x".to_string(),
      created_at: Some(1),
      status: Some("resign".to_string()),
      winner: Some("black".to_string()),
      players: Some(LichessGamePlayers {
        white: Some(LichessGamePlayer {
          user: Some(LichessUser { name: Some("A".to_string()), id: None }),
        }),
        black: Some(LichessGamePlayer {
          user: Some(LichessUser { name: None, id: Some("b".to_string()) }),
        }),
      }),
    };
    let game = feed_game_from_line(&line, 5).unwrap();
    assert_eq!(game.player2.as_deref(), Some("b"));
    assert_eq!(game.result, FeedOutcome::Player2Won);
    assert_eq!(game.color1, Some(Color::White));
  }

  #[test]
  fn test_manual_pairings_put_white_first() {
    let pairings = vec![
      pairing("alice", "bob"),
      PairingAnnouncement {
        player1: "carol".to_string(),
        player2: "dave".to_string(),
        color1: Color::Black,
      },
    ];
    assert_eq!(manual_pairings_text(&pairings), "alice bob\ndave carol");
  }

  #[test]
  fn test_description_names_tie_break() {
    let config = KnockoutConfig {
      max_participants: 32,
      games_per_match: 1,
      ..KnockoutConfig::default()
    };
    let text = event_description(&config);
    assert!(text.starts_with("Knock-out tournament for up to 32 players. Each match consists of 1 game."));
    assert!(text.contains("lower-rated player advances"));

    let color = KnockoutConfig {
      tie_break: TieBreakPolicy::Color,
      games_per_match: 3,
      ..KnockoutConfig::default()
    };
    assert!(event_description(&color).contains("more black games"));
  }

  #[test]
  fn test_registrations_parse() {
    let body = "{\"username\":\"Alice\",\"rating\":2100,\"points\":0}\n\n{\"username\":\"Bob\"}\n";
    let lines = parse_ndjson::<LichessSwissResultLine>(body).unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1].rating, None);
    assert!(parse_ndjson::<LichessSwissResultLine>("{oops").is_err());
  }
}

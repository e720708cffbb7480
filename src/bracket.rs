use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{KnockoutError, KnockoutResult};
use crate::types::{Competitor, CompetitorStatus, MAX_FIELD_SIZE, MIN_FIELD_SIZE};

// ── Identifiers ────────────────────────────────────────────────────────

/// Position of a match in the arena. Both indices are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchId {
  pub round: u32,
  pub position: u32,
}

impl MatchId {
  pub fn new(round: u32, position: u32) -> Self {
    MatchId { round, position }
  }
}

impl fmt::Display for MatchId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "R{}M{}", self.round + 1, self.position + 1)
  }
}

// ── Slots and matches ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotOrigin {
  Seeded,
  Bye,
  WinnerOf(MatchId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
  pub round: u32,
  pub position: u32,
  /// Seed of the competitor holding the slot
  pub occupant: Option<u32>,
  pub origin: SlotOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchStatus {
  Pending,
  InProgress,
  DecidedEarly,
  Complete,
}

impl MatchStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, MatchStatus::DecidedEarly | MatchStatus::Complete)
  }
}

/// Result of one game. `side` is 0 for the top slot of the match, 1 for the bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GameResult {
  Win { side: usize },
  Draw,
  /// Opponent did not show up; `side` gets the point
  Walkover { side: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
  /// 1-based within the match
  pub game_number: u32,
  /// Side playing white, none for a walkover
  pub white: Option<usize>,
  pub result: GameResult,
  #[serde(default)]
  pub armageddon: bool,
}

impl GameRecord {
  pub fn played(game_number: u32, white: usize, result: GameResult) -> Self {
    GameRecord {
      game_number,
      white: Some(white),
      result,
      armageddon: false,
    }
  }

  pub fn walkover(game_number: u32, side: usize) -> Self {
    GameRecord {
      game_number,
      white: None,
      result: GameResult::Walkover { side },
      armageddon: false,
    }
  }

  pub fn armageddon(game_number: u32, white: usize, result: GameResult) -> Self {
    GameRecord {
      game_number,
      white: Some(white),
      result,
      armageddon: true,
    }
  }

  /// Points per side: win 1, draw ½, loss 0.
  pub fn points(&self) -> [f64; 2] {
    match self.result {
      GameResult::Win { side } | GameResult::Walkover { side } => {
        let mut points = [0.0, 0.0];
        points[side] = 1.0;
        points
      }
      GameResult::Draw => [0.5, 0.5],
    }
  }

  /// Side that advances from an Armageddon game; black takes draws.
  pub fn armageddon_winner(&self) -> Option<usize> {
    match self.result {
      GameResult::Win { side } | GameResult::Walkover { side } => Some(side),
      GameResult::Draw => self.white.map(|white| 1 - white),
    }
  }

  /// Sides are 0 or 1, and only a walkover may omit white.
  fn has_valid_sides(&self) -> bool {
    let white_ok = match self.white {
      Some(white) => white <= 1,
      None => matches!(self.result, GameResult::Walkover { .. }),
    };
    white_ok && self.side().map_or(true, |side| side <= 1)
  }

  fn side(&self) -> Option<usize> {
    match self.result {
      GameResult::Win { side } | GameResult::Walkover { side } => Some(side),
      GameResult::Draw => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecidedBy {
  Score,
  Rating,
  Color,
  Seed,
  Armageddon,
  Bye,
}

/// Final outcome handed to `BracketTree::record_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
  /// Seed of the winner
  pub winner: u32,
  pub score: [f64; 2],
  pub games: Vec<GameRecord>,
  pub decided_by: DecidedBy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
  pub id: MatchId,
  /// Seeds on the top and bottom side, none while the feeding match is open
  pub sides: [Option<u32>; 2],
  pub bye: bool,
  pub games: Vec<GameRecord>,
  pub score: [f64; 2],
  pub status: MatchStatus,
  pub winner: Option<u32>,
  pub decided_by: Option<DecidedBy>,
  /// Side given white for the Armageddon decider
  pub armageddon_white: Option<usize>,
}

impl Match {
  fn new(id: MatchId) -> Self {
    Match {
      id,
      sides: [None, None],
      bye: false,
      games: Vec::new(),
      score: [0.0, 0.0],
      status: MatchStatus::Pending,
      winner: None,
      decided_by: None,
      armageddon_white: None,
    }
  }

  pub fn side_of(&self, seed: u32) -> Option<usize> {
    self.sides.iter().position(|side| *side == Some(seed))
  }

  pub fn regular_games(&self) -> usize {
    self.games.iter().filter(|game| !game.armageddon).count()
  }

  pub fn loser(&self) -> Option<u32> {
    let winner = self.winner?;
    let side = self.side_of(winner)?;
    self.sides[1 - side]
  }

  fn is_ready(&self) -> bool {
    self.sides[0].is_some() && (self.bye || self.sides[1].is_some())
  }
}

/// One entry of `BracketTree::pairings_for_round`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pairing<'a> {
  pub match_id: MatchId,
  pub a: &'a Competitor,
  /// None for a bye
  pub b: Option<&'a Competitor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketSnapshot {
  pub size: usize,
  pub rounds: usize,
  pub games_per_match: u32,
  /// First round with an undecided match, none once finished
  pub current_round: Option<u32>,
  pub competitors: Vec<Competitor>,
  pub slots: Vec<Slot>,
  pub matches: Vec<Match>,
  pub champion: Option<String>,
}

// ── Bracket tree ───────────────────────────────────────────────────────

/// Single-elimination bracket stored as an arena of slots and matches.
///
/// `slots[r]` has `size >> r` entries for `r` in `0..=rounds`; the last
/// round is the champion's slot. `matches[r][p]` pairs `slots[r][2p]` and
/// `slots[r][2p + 1]` and its winner moves to `slots[r + 1][p]`.
#[derive(Debug, Clone)]
pub struct BracketTree {
  competitors: Vec<Competitor>,
  size: usize,
  rounds: usize,
  games_per_match: u32,
  slots: Vec<Vec<Slot>>,
  matches: Vec<Vec<Match>>,
}

impl BracketTree {
  /// Build the bracket from competitors in seed order (best first).
  ///
  /// Seeds are reassigned densely from the order given. Byes take the
  /// places of the missing seeds above N, so they face the top seeds and are
  /// decided immediately.
  pub fn seed(competitors: Vec<Competitor>, games_per_match: u32) -> KnockoutResult<Self> {
    let count = competitors.len();
    if !(MIN_FIELD_SIZE..=MAX_FIELD_SIZE).contains(&count) {
      return Err(KnockoutError::InvalidFieldSize {
        count,
        min: MIN_FIELD_SIZE,
        max: MAX_FIELD_SIZE,
      });
    }
    if games_per_match == 0 {
      return Err(KnockoutError::InvalidConfig(
        "games per match must be at least 1".to_string(),
      ));
    }
    let mut seen = HashSet::new();
    for competitor in &competitors {
      if !seen.insert(competitor.key()) {
        return Err(KnockoutError::InvalidConfig(format!(
          "{} is registered twice",
          competitor.username
        )));
      }
    }

    let competitors = competitors
      .into_iter()
      .enumerate()
      .map(|(idx, mut competitor)| {
        competitor.seed = idx as u32 + 1;
        competitor.status = CompetitorStatus::Active;
        competitor
      })
      .collect::<Vec<_>>();

    let size = next_power_of_two(count);
    let rounds = size.trailing_zeros() as usize;
    let order = seed_positions(size as u32);

    let mut slots = Vec::with_capacity(rounds + 1);
    slots.push(
      order
        .iter()
        .enumerate()
        .map(|(position, &seed)| Slot {
          round: 0,
          position: position as u32,
          occupant: (seed as usize <= count).then_some(seed),
          origin: if seed as usize <= count {
            SlotOrigin::Seeded
          } else {
            SlotOrigin::Bye
          },
        })
        .collect::<Vec<_>>(),
    );
    for round in 1..=rounds {
      let width = size >> round;
      slots.push(
        (0..width)
          .map(|position| Slot {
            round: round as u32,
            position: position as u32,
            occupant: None,
            origin: SlotOrigin::WinnerOf(MatchId::new(round as u32 - 1, position as u32)),
          })
          .collect(),
      );
    }

    let matches = (0..rounds)
      .map(|round| {
        let width = size >> (round + 1);
        (0..width)
          .map(|position| Match::new(MatchId::new(round as u32, position as u32)))
          .collect::<Vec<_>>()
      })
      .collect::<Vec<_>>();

    let mut tree = BracketTree {
      competitors,
      size,
      rounds,
      games_per_match,
      slots,
      matches,
    };

    for position in 0..tree.matches[0].len() {
      let top = tree.slots[0][position * 2].clone();
      let bottom = tree.slots[0][position * 2 + 1].clone();
      let game_match = &mut tree.matches[0][position];
      game_match.sides = [top.occupant, bottom.occupant];
      let bye_side = match (top.origin, bottom.origin) {
        (_, SlotOrigin::Bye) => Some(0),
        (SlotOrigin::Bye, _) => Some(1),
        _ => None,
      };
      if let Some(side) = bye_side {
        game_match.bye = true;
        if side == 1 {
          game_match.sides.swap(0, 1);
        }
        tree.finalize_bye_match(position);
      }
    }

    Ok(tree)
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn rounds(&self) -> usize {
    self.rounds
  }

  pub fn games_per_match(&self) -> u32 {
    self.games_per_match
  }

  pub fn competitors(&self) -> &[Competitor] {
    &self.competitors
  }

  pub fn competitor(&self, seed: u32) -> Option<&Competitor> {
    let idx = (seed as usize).checked_sub(1)?;
    self.competitors.get(idx)
  }

  pub fn competitor_by_name(&self, username: &str) -> Option<&Competitor> {
    let key = crate::types::normalize_username(username);
    self.competitors.iter().find(|competitor| competitor.key() == key)
  }

  pub fn get_match(&self, id: MatchId) -> Option<&Match> {
    self
      .matches
      .get(id.round as usize)
      .and_then(|round| round.get(id.position as usize))
  }

  pub fn matches_in_round(&self, round: u32) -> &[Match] {
    self
      .matches
      .get(round as usize)
      .map(|round| round.as_slice())
      .unwrap_or(&[])
  }

  pub fn slots_in_round(&self, round: u32) -> &[Slot] {
    self
      .slots
      .get(round as usize)
      .map(|round| round.as_slice())
      .unwrap_or(&[])
  }

  /// Matches of round `r` with both sides known, byes included.
  pub fn pairings_for_round(&self, round: u32) -> Vec<Pairing<'_>> {
    self
      .matches_in_round(round)
      .iter()
      .filter(|game_match| game_match.is_ready())
      .filter_map(|game_match| {
        let a = self.competitor(game_match.sides[0]?)?;
        let b = match game_match.sides[1] {
          Some(seed) => Some(self.competitor(seed)?),
          None => None,
        };
        Some(Pairing {
          match_id: game_match.id,
          a,
          b,
        })
      })
      .collect()
  }

  pub fn round_is_terminal(&self, round: u32) -> bool {
    self
      .matches_in_round(round)
      .iter()
      .all(|game_match| game_match.status.is_terminal())
  }

  pub fn current_round(&self) -> Option<u32> {
    (0..self.rounds as u32).find(|round| !self.round_is_terminal(*round))
  }

  pub fn is_complete(&self) -> bool {
    self
      .final_match()
      .map(|game_match| game_match.winner.is_some())
      .unwrap_or(false)
  }

  pub fn winner(&self) -> Option<&Competitor> {
    self.final_match()?.winner.and_then(|seed| self.competitor(seed))
  }

  pub fn runner_up(&self) -> Option<&Competitor> {
    self.final_match()?.loser().and_then(|seed| self.competitor(seed))
  }

  /// Add the next game of a match and decide it once the score is out of reach.
  ///
  /// Re-sending a game already recorded is a no-op; a different game under the
  /// same number is a conflict.
  pub fn record_game(&mut self, id: MatchId, game: GameRecord) -> KnockoutResult<MatchStatus> {
    let games_per_match = self.games_per_match;
    let game_match = self.match_mut(id)?;

    if let Some(existing) = game_match
      .games
      .iter()
      .find(|existing| existing.game_number == game.game_number)
    {
      if *existing == game {
        return Ok(game_match.status);
      }
      return Err(KnockoutError::ConflictingResult(id));
    }
    if game_match.status.is_terminal() {
      return Err(KnockoutError::AlreadyDecided(id));
    }
    if game_match.bye || game_match.sides.iter().any(Option::is_none) {
      return Err(KnockoutError::InvalidState(format!(
        "match {id} has no opponent to play"
      )));
    }
    let expected = game_match.games.len() as u32 + 1;
    if game.game_number != expected {
      return Err(KnockoutError::InvalidState(format!(
        "match {id} expects game {expected}, got game {}",
        game.game_number
      )));
    }
    if game.game_number > games_per_match {
      if !game.armageddon || game_match.armageddon_white.is_none() {
        return Err(KnockoutError::InvalidState(format!(
          "match {id} has no Armageddon game scheduled"
        )));
      }
    } else if game.armageddon {
      return Err(KnockoutError::InvalidState(format!(
        "game {} of match {id} is a regular game",
        game.game_number
      )));
    }
    if !game.has_valid_sides() {
      return Err(KnockoutError::InvalidState(format!(
        "game {} of match {id} names an unknown side",
        game.game_number
      )));
    }

    let points = game.points();
    game_match.score[0] += points[0];
    game_match.score[1] += points[1];
    game_match.games.push(game);
    game_match.status = MatchStatus::InProgress;
    let sides = game_match.sides;

    let decision = if game.armageddon {
      game
        .armageddon_winner()
        .map(|side| (side, DecidedBy::Armageddon, MatchStatus::Complete))
    } else {
      let remaining = games_per_match.saturating_sub(game_match.regular_games() as u32) as f64;
      let [a, b] = game_match.score;
      let leader = if a > b + remaining {
        Some(0)
      } else if b > a + remaining {
        Some(1)
      } else {
        None
      };
      leader.map(|side| {
        let status = if remaining > 0.0 {
          MatchStatus::DecidedEarly
        } else {
          MatchStatus::Complete
        };
        (side, DecidedBy::Score, status)
      })
    };

    for seed in sides.into_iter().flatten() {
      self.mark_playing(seed);
    }
    match decision {
      Some((side, decided_by, status)) => {
        self.decide(id, side, decided_by, status);
        Ok(status)
      }
      None => Ok(MatchStatus::InProgress),
    }
  }

  /// Schedule an Armageddon decider for a level match, `white` being a side.
  pub fn assign_armageddon(&mut self, id: MatchId, white: usize) -> KnockoutResult<()> {
    let games_per_match = self.games_per_match as usize;
    let game_match = self.match_mut(id)?;
    match game_match.armageddon_white {
      Some(existing) if existing == white => return Ok(()),
      Some(_) => return Err(KnockoutError::ConflictingResult(id)),
      None => {}
    }
    if game_match.status.is_terminal() {
      return Err(KnockoutError::AlreadyDecided(id));
    }
    if white > 1 {
      return Err(KnockoutError::InvalidState(format!(
        "match {id} has no side {white}"
      )));
    }
    if game_match.regular_games() < games_per_match || game_match.score[0] != game_match.score[1] {
      return Err(KnockoutError::InvalidState(format!(
        "match {id} is not level after all games"
      )));
    }
    game_match.armageddon_white = Some(white);
    game_match.status = MatchStatus::InProgress;
    Ok(())
  }

  /// Set the final outcome of a match and move the winner up.
  pub fn record_result(&mut self, id: MatchId, result: MatchResult) -> KnockoutResult<()> {
    let games_per_match = self.games_per_match as usize;
    let game_match = self.match_mut(id)?;
    if game_match.sides.iter().any(Option::is_none) && !game_match.bye {
      return Err(KnockoutError::InvalidState(format!(
        "match {id} is still waiting for an opponent"
      )));
    }
    let Some(side) = game_match.side_of(result.winner) else {
      return Err(KnockoutError::InvalidState(format!(
        "seed {} does not play in match {id}",
        result.winner
      )));
    };

    if let Some(winner) = game_match.winner {
      if winner != result.winner {
        return Err(KnockoutError::ConflictingResult(id));
      }
      let identical = game_match.score == result.score
        && game_match.games == result.games
        && game_match.decided_by == Some(result.decided_by);
      if identical {
        return Ok(());
      }
      return Err(KnockoutError::AlreadyDecided(id));
    }

    if let Some(game) = result.games.iter().find(|game| !game.has_valid_sides()) {
      return Err(KnockoutError::InvalidState(format!(
        "game {} of match {id} names an unknown side",
        game.game_number
      )));
    }

    let regular = result.games.iter().filter(|game| !game.armageddon).count();
    let status = if result.decided_by == DecidedBy::Score && regular < games_per_match {
      MatchStatus::DecidedEarly
    } else {
      MatchStatus::Complete
    };
    game_match.games = result.games;
    game_match.score = result.score;
    let sides = game_match.sides;
    for seed in sides.into_iter().flatten() {
      self.mark_playing(seed);
    }
    self.decide(id, side, result.decided_by, status);
    Ok(())
  }

  pub fn snapshot(&self) -> BracketSnapshot {
    BracketSnapshot {
      size: self.size,
      rounds: self.rounds,
      games_per_match: self.games_per_match,
      current_round: self.current_round(),
      competitors: self.competitors.clone(),
      slots: self.slots.iter().flatten().cloned().collect(),
      matches: self.matches.iter().flatten().cloned().collect(),
      champion: self.winner().map(|competitor| competitor.username.clone()),
    }
  }

  fn final_match(&self) -> Option<&Match> {
    self.matches.last()?.first()
  }

  fn match_mut(&mut self, id: MatchId) -> KnockoutResult<&mut Match> {
    self
      .matches
      .get_mut(id.round as usize)
      .and_then(|round| round.get_mut(id.position as usize))
      .ok_or(KnockoutError::UnknownMatch(id))
  }

  fn competitor_mut(&mut self, seed: u32) -> Option<&mut Competitor> {
    let idx = (seed as usize).checked_sub(1)?;
    self.competitors.get_mut(idx)
  }

  fn mark_playing(&mut self, seed: u32) {
    if let Some(competitor) = self.competitor_mut(seed) {
      if competitor.status == CompetitorStatus::ByeAdvanced {
        competitor.status = CompetitorStatus::Active;
      }
    }
  }

  fn finalize_bye_match(&mut self, position: usize) {
    let id = MatchId::new(0, position as u32);
    let game_match = &mut self.matches[0][position];
    game_match.sides[1] = None;
    let Some(seed) = game_match.sides[0] else {
      return;
    };
    self.decide(id, 0, DecidedBy::Bye, MatchStatus::Complete);
    if let Some(competitor) = self.competitor_mut(seed) {
      competitor.status = CompetitorStatus::ByeAdvanced;
    }
  }

  fn decide(&mut self, id: MatchId, side: usize, decided_by: DecidedBy, status: MatchStatus) {
    let round = id.round as usize;
    let position = id.position as usize;
    let (winner, loser, walkover_loss) = {
      let game_match = &mut self.matches[round][position];
      let winner = game_match.sides[side];
      game_match.winner = winner;
      game_match.decided_by = Some(decided_by);
      game_match.status = status;
      let walkover_loss = game_match
        .games
        .iter()
        .any(|game| game.result == GameResult::Walkover { side });
      (winner, game_match.sides[1 - side], walkover_loss)
    };

    if let Some(seed) = loser {
      if let Some(competitor) = self.competitor_mut(seed) {
        competitor.status = if walkover_loss {
          CompetitorStatus::Withdrawn
        } else {
          CompetitorStatus::Eliminated
        };
      }
    }

    let Some(winner) = winner else {
      return;
    };
    let parent = position / 2;
    if let Some(slot) = self.slots.get_mut(round + 1).and_then(|slots| slots.get_mut(parent)) {
      slot.occupant = Some(winner);
    }
    if let Some(next) = self.matches.get_mut(round + 1).and_then(|matches| matches.get_mut(parent)) {
      next.sides[position % 2] = Some(winner);
    }
  }
}

/// Standard bracket order: seeds of each first-round pair sum to `size + 1`
/// and the top two seeds sit in opposite halves.
pub fn seed_positions(size: u32) -> Vec<u32> {
  let mut seeds = vec![1u32];
  while seeds.len() < size as usize {
    let n = seeds.len() as u32;
    let mut next = Vec::with_capacity(seeds.len() * 2);
    for seed in seeds.iter().copied() {
      next.push(seed);
      next.push((n * 2 + 1).saturating_sub(seed));
    }
    seeds = next;
  }
  seeds
}

pub fn next_power_of_two(n: usize) -> usize {
  n.max(1).next_power_of_two()
}

/// Number of match rounds for a field of `count`.
pub fn match_rounds(count: usize) -> usize {
  next_power_of_two(count).trailing_zeros() as usize
}

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bracket::{BracketSnapshot, BracketTree, MatchResult};
use crate::error::{KnockoutError, KnockoutResult};
use crate::pairing::{resolve_round, MatchTally, OpenMatch};
use crate::session::{LedgerEntry, SessionJournal};
use crate::tiebreak::{break_tie, TieBreakConfig, TieBreakOutcome};
use crate::types::*;

// ── Collaborator seams ─────────────────────────────────────────────────

/// Swiss-only tournament host the controller drives round by round.
pub trait SwissPlatform {
    fn event_id(&self) -> &str;

    /// Everyone currently registered, in join order.
    fn registrations(&mut self) -> KnockoutResult<Vec<Registration>>;

    /// Restrict the event to the seeded field and fix its round count.
    fn close_registration(&mut self, competitors: &[Competitor], platform_rounds: u32) -> KnockoutResult<()>;

    /// Push the pairings of one platform round and schedule it.
    fn announce(&mut self, round: u32, pairings: &[PairingAnnouncement]) -> KnockoutResult<()>;

    fn round_status(&mut self) -> KnockoutResult<RoundStatus>;

    /// Games of `round` for the announced pairings.
    fn round_results(&mut self, round: u32, pairings: &[PairingAnnouncement]) -> KnockoutResult<Vec<FeedGame>>;

    fn terminate(&mut self) -> KnockoutResult<()>;
}

pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        crate::config::now_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Operator abort, checked between poll attempts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives a bracket-state event after seeding and after every recorded result.
pub trait BracketListener {
    fn on_event(&mut self, event: &BracketEvent);
}

// ── Lifecycle ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "round", rename_all = "kebab-case")]
pub enum TournamentState {
    Registering,
    Seeding,
    RoundInProgress(u32),
    RoundComplete(u32),
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketEvent {
    pub event_id: String,
    pub state: TournamentState,
    pub platform_round: u32,
    pub emitted_at_ms: u64,
    pub bracket: BracketSnapshot,
}

/// What one call to `TournamentController::advance` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing to do yet; poll again later
    Waiting { retry_in_ms: u64 },
    Seeded,
    /// Platform event restricted to the field, first round next
    Started,
    Announced(u32),
    Ingested(u32),
    RoundComplete(u32),
    RoundStarted(u32),
    Finished,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub min_participants: usize,
    pub max_participants: usize,
    pub start_at_max: bool,
    pub tie_break: TieBreakConfig,
    pub randomize_seeds: bool,
    pub starts_at_ms: u64,
    pub poll_interval_ms: u64,
    pub api_attempts: u32,
    pub api_delay_ms: u64,
    pub max_backoff_ms: u64,
    pub deadline_ms: Option<u64>,
}

impl ControllerOptions {
    pub fn from_config(config: &KnockoutConfig, now_ms: u64) -> KnockoutResult<Self> {
        let tie_break = TieBreakConfig::new(config.tie_break, config.games_per_match, config.armageddon)?;
        Ok(ControllerOptions {
            min_participants: config.min_participants.max(MIN_FIELD_SIZE),
            max_participants: config.max_participants.min(MAX_FIELD_SIZE),
            start_at_max: config.start_at_max,
            tie_break,
            randomize_seeds: config.randomize_seeds,
            starts_at_ms: scheduled_start_ms(now_ms, config.minutes_to_start),
            poll_interval_ms: config.poll_interval_ms,
            api_attempts: config.api_attempts.max(1),
            api_delay_ms: config.api_delay_ms,
            max_backoff_ms: config.max_backoff_ms,
            deadline_ms: config.deadline_minutes.map(|minutes| now_ms + minutes * 60_000),
        })
    }

    pub fn games_per_match(&self) -> u32 {
        self.tie_break.games_per_match
    }
}

/// Start time `minutes` ahead, rounded down to a multiple of ten minutes.
pub fn scheduled_start_ms(now_ms: u64, minutes: u64) -> u64 {
    let target = now_ms + minutes * 60_000;
    target / START_TIME_ROUNDING_MS * START_TIME_ROUNDING_MS
}

/// Swiss rounds needed to play out `match_rounds` knock-out rounds.
pub fn platform_rounds(match_rounds: usize, games_per_match: u32, armageddon: bool) -> u32 {
    match_rounds as u32 * (games_per_match + u32::from(armageddon))
}

/// Side with white in regular game `game_number` (1-based) of a match.
pub fn white_side(top_gets_white: bool, game_number: u32) -> usize {
    if ((game_number + 1) % 2 == 0) == top_gets_white {
        0
    } else {
        1
    }
}

pub fn backoff_ms(base_ms: u64, max_ms: u64, failures: u32) -> u64 {
    let exponent = failures.saturating_sub(1).min(16);
    base_ms.saturating_mul(1u64 << exponent).min(max_ms)
}

/// Order the field: rating descending (join order on ties) or shuffled.
pub fn assign_seeds<R: Rng + ?Sized>(registrants: &[Registration], randomize: bool, rng: &mut R) -> Vec<Competitor> {
    let mut ordered = registrants.to_vec();
    if randomize {
        ordered.shuffle(rng);
    } else {
        ordered.sort_by(|a, b| b.rating.cmp(&a.rating));
    }
    ordered
        .into_iter()
        .enumerate()
        .map(|(idx, registration)| Competitor::new(registration.username, registration.rating, idx as u32 + 1))
        .collect()
}

// ── Controller ─────────────────────────────────────────────────────────

pub struct TournamentController<P, C, R> {
    platform: P,
    clock: C,
    rng: R,
    options: ControllerOptions,
    state: TournamentState,
    registrants: Vec<Registration>,
    bracket: Option<BracketTree>,
    color_bits: Vec<bool>,
    platform_round: u32,
    pending_round: Option<u32>,
    round_starts: Vec<u32>,
    announced: BTreeSet<u32>,
    ledger: Vec<LedgerEntry>,
    feed: Vec<FeedGame>,
    listeners: Vec<Box<dyn BracketListener>>,
    cancel: CancelToken,
    journal_path: Option<PathBuf>,
    terminated: bool,
}

impl<P: SwissPlatform, C: Clock, R: Rng> TournamentController<P, C, R> {
    pub fn new(platform: P, clock: C, rng: R, options: ControllerOptions) -> Self {
        TournamentController {
            platform,
            clock,
            rng,
            options,
            state: TournamentState::Registering,
            registrants: Vec::new(),
            bracket: None,
            color_bits: Vec::new(),
            platform_round: 0,
            pending_round: None,
            round_starts: Vec::new(),
            announced: BTreeSet::new(),
            ledger: Vec::new(),
            feed: Vec::new(),
            listeners: Vec::new(),
            cancel: CancelToken::default(),
            journal_path: None,
            terminated: false,
        }
    }

    /// Rebuild a controller from its journal: re-seed, replay, continue.
    pub fn resume(
        platform: P,
        clock: C,
        rng: R,
        options: ControllerOptions,
        journal: SessionJournal,
    ) -> KnockoutResult<Self> {
        if journal.event_id != platform.event_id() {
            return Err(KnockoutError::Session(format!(
                "journal belongs to event {}, platform runs {}",
                journal.event_id,
                platform.event_id()
            )));
        }
        if journal.games_per_match != options.games_per_match() {
            return Err(KnockoutError::Session(format!(
                "journal was recorded with {} games per match, config says {}",
                journal.games_per_match,
                options.games_per_match()
            )));
        }

        let mut controller = Self::new(platform, clock, rng, options);
        if !journal.competitors.is_empty() {
            let mut bracket = BracketTree::seed(journal.competitors.clone(), journal.games_per_match)?;
            let applied = journal.replay(&mut bracket)?;
            info!(
                "Resumed event {} with {} competitors, replayed {applied} ledger entries",
                journal.event_id,
                bracket.competitors().len()
            );
            controller.bracket = Some(bracket);
        }
        controller.options.starts_at_ms = journal.starts_at_ms;
        controller.state = journal.state;
        controller.registrants = journal.registrants;
        controller.color_bits = journal.color_bits;
        controller.platform_round = journal.platform_round;
        controller.pending_round = journal.pending_round;
        controller.round_starts = journal.round_starts;
        controller.announced = journal.announced.into_iter().collect();
        controller.ledger = journal.ledger;
        controller.feed = journal.feed;
        Ok(controller)
    }

    pub fn with_journal(mut self, path: PathBuf) -> Self {
        self.journal_path = Some(path);
        self
    }

    pub fn add_listener(&mut self, listener: Box<dyn BracketListener>) {
        self.listeners.push(listener);
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> TournamentState {
        self.state
    }

    pub fn bracket(&self) -> Option<&BracketTree> {
        self.bracket.as_ref()
    }

    pub fn registrants(&self) -> &[Registration] {
        &self.registrants
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_round(&self) -> u32 {
        self.platform_round
    }

    pub fn session(&self) -> SessionJournal {
        SessionJournal {
            event_id: self.platform.event_id().to_string(),
            games_per_match: self.options.games_per_match(),
            starts_at_ms: self.options.starts_at_ms,
            state: self.state,
            registrants: self.registrants.clone(),
            competitors: self
                .bracket
                .as_ref()
                .map(|bracket| bracket.competitors().to_vec())
                .unwrap_or_default(),
            color_bits: self.color_bits.clone(),
            platform_round: self.platform_round,
            pending_round: self.pending_round,
            round_starts: self.round_starts.clone(),
            announced: self.announced.iter().copied().collect(),
            ledger: self.ledger.clone(),
            feed: self.feed.clone(),
            saved_at_ms: self.clock.now_ms(),
        }
    }

    // ── Registration ───────────────────────────────────────────────────

    /// Add one registrant; false when already present or the field is full.
    pub fn register(&mut self, registration: Registration) -> KnockoutResult<bool> {
        if self.state != TournamentState::Registering {
            return Err(KnockoutError::InvalidState("registration is closed".to_string()));
        }
        let key = normalize_username(&registration.username);
        if self
            .registrants
            .iter()
            .any(|existing| normalize_username(&existing.username) == key)
        {
            return Ok(false);
        }
        if self.registrants.len() >= self.options.max_participants {
            debug!("{} joined after the field filled up", registration.username);
            return Ok(false);
        }
        info!("Adding player {}", registration.username);
        self.registrants.push(registration);
        Ok(true)
    }

    /// Mirror the platform's registration list: drop leavers, append joiners.
    /// Returns whether the list changed.
    pub fn sync_registrations(&mut self, feed: Vec<Registration>) -> KnockoutResult<bool> {
        let present = feed
            .iter()
            .map(|registration| normalize_username(&registration.username))
            .collect::<HashSet<_>>();
        let before = self.registrants.len();
        self.registrants.retain(|registration| {
            let keep = present.contains(&normalize_username(&registration.username));
            if !keep {
                info!("Removing player {}", registration.username);
            }
            keep
        });
        let mut changed = self.registrants.len() != before;
        for registration in feed {
            changed |= self.register(registration)?;
        }
        Ok(changed)
    }

    pub fn should_close(&self, now_ms: u64) -> bool {
        let full = self.registrants.len() >= self.options.max_participants;
        (self.options.start_at_max && full)
            || now_ms + REGISTRATION_CLOSE_LEAD_MS >= self.options.starts_at_ms
    }

    /// Close registration and seed the bracket.
    pub fn close_registration(&mut self) -> KnockoutResult<()> {
        if self.state != TournamentState::Registering {
            return Err(KnockoutError::InvalidState(format!(
                "cannot close registration in state {:?}",
                self.state
            )));
        }
        let count = self.registrants.len();
        if count < self.options.min_participants {
            warn!(
                "Only {count} players registered, at least {} needed; cancelling the event",
                self.options.min_participants
            );
            self.terminate_platform();
            self.state = TournamentState::Finished;
            return Err(KnockoutError::InvalidFieldSize {
                count,
                min: self.options.min_participants,
                max: self.options.max_participants,
            });
        }

        let competitors = assign_seeds(&self.registrants, self.options.randomize_seeds, &mut self.rng);
        let bracket = BracketTree::seed(competitors, self.options.games_per_match())?;
        self.color_bits = (0..bracket.rounds()).map(|_| self.rng.random_bool(0.5)).collect();
        info!(
            "Registration closed with {count} players, {} match rounds, top gets white: {:?}",
            bracket.rounds(),
            self.color_bits
        );
        log_participants(&bracket);
        self.bracket = Some(bracket);
        self.state = TournamentState::Seeding;
        self.emit();
        Ok(())
    }

    // ── Round loop ─────────────────────────────────────────────────────

    /// One poll/retry transition. Safe to call again after any error.
    pub fn advance(&mut self) -> KnockoutResult<Step> {
        let step = match self.state {
            TournamentState::Registering => self.advance_registration()?,
            TournamentState::Seeding => self.start_event()?,
            TournamentState::RoundInProgress(round) => self.advance_round(round)?,
            TournamentState::RoundComplete(round) => self.next_round(round)?,
            TournamentState::Finished => return Ok(Step::Finished),
        };
        if !matches!(step, Step::Waiting { .. }) {
            self.save_session()?;
        }
        Ok(step)
    }

    /// Drive the event to the end, sleeping between polls.
    pub fn run(&mut self) -> KnockoutResult<Competitor> {
        let mut failures = 0u32;
        loop {
            self.check_cancelled()?;
            match self.advance() {
                Ok(Step::Finished) => return self.champion(),
                Ok(Step::Waiting { retry_in_ms }) => {
                    failures = 0;
                    self.pause(retry_in_ms)?;
                }
                Ok(step) => {
                    failures = 0;
                    debug!("Controller step: {step:?}");
                }
                Err(err) if err.is_transient() => {
                    failures += 1;
                    if failures >= self.options.api_attempts {
                        error!("Giving up after {failures} attempts: {err}");
                        return Err(KnockoutError::RetriesExhausted {
                            attempts: failures,
                            last: err.to_string(),
                        });
                    }
                    let delay = backoff_ms(self.options.api_delay_ms, self.options.max_backoff_ms, failures);
                    warn!(
                        "Attempt {failures}/{} failed: {err}. Trying again in {delay} ms",
                        self.options.api_attempts
                    );
                    self.pause(delay)?;
                }
                Err(err) => {
                    error!("Tournament stopped: {err}");
                    if matches!(
                        err,
                        KnockoutError::UnknownMatch(_)
                            | KnockoutError::AlreadyDecided(_)
                            | KnockoutError::ConflictingResult(_)
                            | KnockoutError::InvalidState(_)
                    ) {
                        self.terminate_platform();
                    }
                    return Err(err);
                }
            }
        }
    }

    pub fn champion(&self) -> KnockoutResult<Competitor> {
        self.bracket
            .as_ref()
            .and_then(|bracket| bracket.winner())
            .cloned()
            .ok_or_else(|| KnockoutError::InvalidState("tournament has no champion yet".to_string()))
    }

    fn advance_registration(&mut self) -> KnockoutResult<Step> {
        let feed = self.platform.registrations()?;
        if self.sync_registrations(feed.clone())? {
            self.save_session()?;
        }
        let now = self.clock.now_ms();
        if self.should_close(now) {
            self.close_registration()?;
            if let Some(bracket) = self.bracket.as_ref() {
                for registration in &feed {
                    if bracket.competitor_by_name(&registration.username).is_none() {
                        info!("Sorry {}, you were too late", registration.username);
                    }
                }
            }
            return Ok(Step::Seeded);
        }

        let time_left = self.options.starts_at_ms.saturating_sub(now);
        let spots_left = self.options.max_participants.saturating_sub(self.registrants.len()) * 100
            / self.options.max_participants.max(1);
        let close = time_left < NEAR_START_WINDOW_MS || (self.options.start_at_max && spots_left < 30);
        let retry_in_ms = if close {
            self.options.api_delay_ms
        } else {
            SLOW_REGISTRATION_POLL_MS
        };
        debug!(
            "Waiting for start ({}/{} players, {} s left)",
            self.registrants.len(),
            self.options.max_participants,
            time_left / 1000
        );
        Ok(Step::Waiting { retry_in_ms })
    }

    fn start_event(&mut self) -> KnockoutResult<Step> {
        let Some(bracket) = self.bracket.as_ref() else {
            return Err(KnockoutError::InvalidState("seeding without a bracket".to_string()));
        };
        let rounds = platform_rounds(
            bracket.rounds(),
            self.options.games_per_match(),
            self.options.tie_break.armageddon,
        );
        self.platform.close_registration(bracket.competitors(), rounds)?;
        info!("Event {} started with {rounds} platform rounds", self.platform.event_id());
        self.state = TournamentState::RoundInProgress(0);
        self.emit();
        Ok(Step::Started)
    }

    fn advance_round(&mut self, round: u32) -> KnockoutResult<Step> {
        let open = self.open_matches(round)?;
        if open.is_empty() {
            self.pending_round = None;
            self.state = TournamentState::RoundComplete(round);
            info!("Match round {} complete", round + 1);
            self.emit();
            return Ok(Step::RoundComplete(round));
        }
        match self.pending_round {
            None => self.announce_next(round),
            Some(platform_round) => self.collect_results(round, platform_round, &open),
        }
    }

    fn next_round(&mut self, round: u32) -> KnockoutResult<Step> {
        let Some(bracket) = self.bracket.as_ref() else {
            return Err(KnockoutError::InvalidState("no bracket to advance".to_string()));
        };
        if (round as usize) + 1 < bracket.rounds() {
            self.state = TournamentState::RoundInProgress(round + 1);
            info!("Starting match round {}", round + 2);
            self.emit();
            return Ok(Step::RoundStarted(round + 1));
        }

        match (bracket.winner(), bracket.runner_up()) {
            (Some(winner), Some(runner_up)) => {
                info!("Winner: {} (runner-up {})", winner.username, runner_up.username)
            }
            _ => {
                return Err(KnockoutError::InvalidState(
                    "last round complete without a champion".to_string(),
                ))
            }
        }
        self.state = TournamentState::Finished;
        self.emit();
        Ok(Step::Finished)
    }

    fn announce_next(&mut self, round: u32) -> KnockoutResult<Step> {
        let next = self.platform_round + 1;
        let pairings = self.announcements(round)?;
        if !self.announced.contains(&next) {
            self.platform.announce(next, &pairings)?;
            self.announced.insert(next);
        }
        if self.round_starts.len() == round as usize {
            self.round_starts.push(next);
        }
        self.platform_round = next;
        self.pending_round = Some(next);
        info!(
            "Announced platform round {next} ({} games) for match round {}",
            pairings.len(),
            round + 1
        );
        for pairing in &pairings {
            debug!("{:>20} - {:<20}", pairing.white(), pairing.black());
        }
        Ok(Step::Announced(next))
    }

    fn collect_results(&mut self, round: u32, platform_round: u32, open: &[OpenMatch]) -> KnockoutResult<Step> {
        let status = self.platform.round_status()?;
        if status.round < platform_round || status.ongoing > 0 {
            if status.finished {
                return Err(KnockoutError::InvalidState(format!(
                    "platform event finished before round {platform_round} was played"
                )));
            }
            debug!(
                "Waiting for platform round {platform_round} ({} games ongoing)",
                status.ongoing
            );
            return Ok(Step::Waiting {
                retry_in_ms: self.options.poll_interval_ms,
            });
        }

        let pairings = self.announcements(round)?;
        let games = self.platform.round_results(platform_round, &pairings)?;
        self.ingest_feed(games);
        let tallies = resolve_round(open, &self.feed, platform_round, self.options.games_per_match())?;
        for tally in tallies {
            self.apply_tally(tally)?;
        }
        self.pending_round = None;
        if let Some(bracket) = self.bracket.as_ref() {
            log_matches(bracket, round);
        }
        self.emit();
        Ok(Step::Ingested(platform_round))
    }

    fn open_matches(&self, round: u32) -> KnockoutResult<Vec<OpenMatch>> {
        let bracket = self.require_bracket()?;
        let first_round = self
            .round_starts
            .get(round as usize)
            .copied()
            .unwrap_or(self.platform_round + 1);
        let mut open = Vec::new();
        for game_match in bracket.matches_in_round(round) {
            if game_match.status.is_terminal() {
                continue;
            }
            let [Some(a), Some(b)] = game_match.sides else {
                return Err(KnockoutError::InvalidState(format!(
                    "match {} is missing a competitor",
                    game_match.id
                )));
            };
            let name = |seed: u32| {
                bracket
                    .competitor(seed)
                    .map(|competitor| competitor.username.clone())
                    .ok_or_else(|| KnockoutError::InvalidState(format!("unknown seed {seed}")))
            };
            open.push(OpenMatch {
                match_id: game_match.id,
                players: [name(a)?, name(b)?],
                first_round,
            });
        }
        Ok(open)
    }

    /// Pairings for the next game of every open match, white first.
    fn announcements(&self, round: u32) -> KnockoutResult<Vec<PairingAnnouncement>> {
        let bracket = self.require_bracket()?;
        let top_gets_white = self.color_bits.get(round as usize).copied().unwrap_or(true);
        let mut pairings = Vec::new();
        for open in self.open_matches(round)? {
            let Some(game_match) = bracket.get_match(open.match_id) else {
                return Err(KnockoutError::UnknownMatch(open.match_id));
            };
            let game_number = game_match.games.len() as u32 + 1;
            let white = match game_match.armageddon_white {
                Some(white) if game_number > bracket.games_per_match() => white,
                _ => white_side(top_gets_white, game_number),
            };
            let [top, bottom] = open.players;
            let (player1, player2) = if white == 0 { (top, bottom) } else { (bottom, top) };
            pairings.push(PairingAnnouncement {
                player1,
                player2,
                color1: Color::White,
            });
        }
        Ok(pairings)
    }

    /// Append new feed games, skipping ones already seen.
    fn ingest_feed(&mut self, games: Vec<FeedGame>) {
        for game in games {
            let duplicate = self.feed.iter().any(|seen| match (&seen.game_id, &game.game_id) {
                (Some(a), Some(b)) => a == b,
                _ => {
                    seen.game_index == game.game_index
                        && normalize_username(&seen.player1) == normalize_username(&game.player1)
                        && seen.player2.as_deref().map(normalize_username)
                            == game.player2.as_deref().map(normalize_username)
                }
            });
            if duplicate {
                debug!("Skipping feed game already ingested: {:?}", game.game_id);
                continue;
            }
            self.feed.push(game);
        }
    }

    fn apply_tally(&mut self, tally: MatchTally) -> KnockoutResult<()> {
        let id = tally.match_id;
        let games_per_match = self.options.games_per_match() as usize;
        let Some(bracket) = self.bracket.as_mut() else {
            return Err(KnockoutError::InvalidState("no bracket to record into".to_string()));
        };

        for game in &tally.games {
            let game_match = bracket.get_match(id).ok_or(KnockoutError::UnknownMatch(id))?;
            if game_match.status.is_terminal() {
                break;
            }
            if (game.game_number as usize) <= game_match.games.len() {
                continue;
            }
            bracket.record_game(id, *game)?;
            self.ledger.push(LedgerEntry::Game {
                match_id: id,
                game: *game,
            });
        }

        let game_match = bracket.get_match(id).ok_or(KnockoutError::UnknownMatch(id))?;
        if game_match.status.is_terminal()
            || game_match.regular_games() < games_per_match
            || game_match.armageddon_white.is_some()
        {
            return Ok(());
        }

        let [Some(a), Some(b)] = game_match.sides else {
            return Err(KnockoutError::InvalidState(format!("match {id} is missing a competitor")));
        };
        let current = MatchTally::from_games(id, game_match.games.clone());
        let (Some(first), Some(second)) = (bracket.competitor(a), bracket.competitor(b)) else {
            return Err(KnockoutError::InvalidState(format!("match {id} names an unknown seed")));
        };
        match break_tie(&self.options.tie_break, [first, second], &current, &mut self.rng)? {
            TieBreakOutcome::Winner { side, decided_by } => {
                let winner = if side == 0 { a } else { b };
                let result = MatchResult {
                    winner,
                    score: current.score,
                    games: current.games,
                    decided_by,
                };
                info!("Match {id} tied, seed {winner} advances by {decided_by:?}");
                bracket.record_result(id, result.clone())?;
                self.ledger.push(LedgerEntry::Result { match_id: id, result });
            }
            TieBreakOutcome::Armageddon { white } => {
                info!("Match {id} tied, Armageddon with side {white} on white");
                bracket.assign_armageddon(id, white)?;
                self.ledger.push(LedgerEntry::Armageddon { match_id: id, white });
            }
        }
        Ok(())
    }

    fn require_bracket(&self) -> KnockoutResult<&BracketTree> {
        self.bracket
            .as_ref()
            .ok_or_else(|| KnockoutError::InvalidState("bracket is not seeded yet".to_string()))
    }

    fn emit(&mut self) {
        let Some(bracket) = self.bracket.as_ref() else {
            return;
        };
        let event = BracketEvent {
            event_id: self.platform.event_id().to_string(),
            state: self.state,
            platform_round: self.platform_round,
            emitted_at_ms: self.clock.now_ms(),
            bracket: bracket.snapshot(),
        };
        for listener in self.listeners.iter_mut() {
            listener.on_event(&event);
        }
    }

    /// Rewrite the journal, if one is attached.
    pub fn save_session(&self) -> KnockoutResult<()> {
        match &self.journal_path {
            Some(path) => self.session().save(path),
            None => Ok(()),
        }
    }

    fn terminate_platform(&mut self) {
        if self.terminated {
            return;
        }
        match self.platform.terminate() {
            Ok(()) => {
                self.terminated = true;
                info!("Terminated event {}", self.platform.event_id());
            }
            Err(err) => warn!("Failed to terminate event {}: {err}", self.platform.event_id()),
        }
    }

    fn check_cancelled(&self) -> KnockoutResult<()> {
        if self.cancel.is_cancelled() {
            info!("Run cancelled by operator");
            return Err(KnockoutError::Cancelled);
        }
        if let Some(deadline) = self.options.deadline_ms {
            if self.clock.now_ms() >= deadline {
                info!("Run cancelled at the wall-clock deadline");
                return Err(KnockoutError::Cancelled);
            }
        }
        Ok(())
    }

    /// Sleep in short slices so a cancel is noticed between polls.
    fn pause(&self, ms: u64) -> KnockoutResult<()> {
        let mut left = ms;
        while left > 0 {
            self.check_cancelled()?;
            let slice = left.min(1_000);
            self.clock.sleep_ms(slice);
            left -= slice;
        }
        self.check_cancelled()
    }
}

fn log_participants(bracket: &BracketTree) {
    info!("=== LIST OF PARTICIPANTS ===");
    for competitor in bracket.competitors() {
        info!("{:>4}. {:<20} ({:>4})", competitor.seed, competitor.username, competitor.rating);
    }
}

fn log_matches(bracket: &BracketTree, round: u32) {
    info!("=== MATCHES OF ROUND {} ===", round + 1);
    for game_match in bracket.matches_in_round(round) {
        let name = |side: usize| {
            game_match.sides[side]
                .and_then(|seed| bracket.competitor(seed))
                .map(|competitor| competitor.username.as_str())
                .unwrap_or("BYE")
        };
        let games = game_match
            .games
            .iter()
            .map(|game| {
                let points = game.points();
                format!("{}-{}", points[0], points[1])
            })
            .collect::<Vec<_>>()
            .join(",");
        info!(
            "{:>20} - {:<20} : {games} [{:?}]",
            name(0),
            name(1),
            game_match.status
        );
    }
}

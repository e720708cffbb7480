use serde::Serialize;

use crate::bracket::{GameRecord, GameResult, MatchId};
use crate::error::{KnockoutError, KnockoutResult};
use crate::types::{normalize_username, Color, FeedGame, FeedOutcome};

/// A match the controller is waiting on, identified by its two usernames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMatch {
    pub match_id: MatchId,
    pub players: [String; 2],
    /// First platform round in which this match was played
    pub first_round: u32,
}

/// Games, score and color balance of one match as seen in the platform feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchTally {
    pub match_id: MatchId,
    pub games: Vec<GameRecord>,
    pub score: [f64; 2],
    /// Regular games played with white, per side
    pub whites: [u32; 2],
    pub leader: Option<usize>,
}

impl MatchTally {
    pub fn from_games(match_id: MatchId, games: Vec<GameRecord>) -> Self {
        let mut score = [0.0, 0.0];
        let mut whites = [0, 0];
        for game in &games {
            let points = game.points();
            score[0] += points[0];
            score[1] += points[1];
            if game.armageddon {
                continue;
            }
            if let Some(white) = game.white {
                whites[white] += 1;
            }
        }
        let leader = if score[0] > score[1] {
            Some(0)
        } else if score[1] > score[0] {
            Some(1)
        } else {
            None
        };
        MatchTally {
            match_id,
            games,
            score,
            whites,
            leader,
        }
    }

    pub fn regular_games(&self) -> usize {
        self.games.iter().filter(|game| !game.armageddon).count()
    }
}

/// Pick the games of one match out of the whole-field feed.
///
/// Every game between the two players from `open.first_round` up to `round`
/// belongs to the match, since two competitors meet at most once in a
/// knock-out. Games past
/// `games_per_match` are Armageddon deciders. Fails with `PairingNotFound`
/// when the feed has nothing for the pair in `round` itself.
pub fn resolve_match(
    open: &OpenMatch,
    feed: &[FeedGame],
    round: u32,
    games_per_match: u32,
) -> KnockoutResult<MatchTally> {
    let keys = [
        normalize_username(&open.players[0]),
        normalize_username(&open.players[1]),
    ];
    let side_of = |name: &str| -> Option<usize> {
        let key = normalize_username(name);
        keys.iter().position(|k| *k == key)
    };

    let mut entries: Vec<(&FeedGame, usize, Option<usize>)> = Vec::new();
    let window = open.first_round..=round;
    for game in feed.iter().filter(|game| window.contains(&game.game_index)) {
        let Some(side1) = side_of(&game.player1) else {
            continue;
        };
        let side2 = match game.player2.as_deref() {
            Some(name) => match side_of(name) {
                Some(side) if side != side1 => Some(side),
                _ => continue,
            },
            None => None,
        };
        if entries.iter().any(|(seen, _, _)| seen.game_index == game.game_index) {
            continue;
        }
        entries.push((game, side1, side2));
    }

    if !entries.iter().any(|(game, _, _)| game.game_index == round) {
        return Err(KnockoutError::PairingNotFound {
            round,
            player_a: open.players[0].clone(),
            player_b: open.players[1].clone(),
        });
    }

    entries.sort_by_key(|(game, _, _)| game.game_index);
    let games = entries
        .into_iter()
        .enumerate()
        .map(|(idx, (game, side1, side2))| {
            let game_number = idx as u32 + 1;
            let armageddon = game_number > games_per_match;
            let Some(side2) = side2 else {
                let mut record = GameRecord::walkover(game_number, side1);
                record.armageddon = armageddon;
                return record;
            };
            let white = match game.color1 {
                Some(Color::Black) => side2,
                _ => side1,
            };
            let result = match game.result {
                FeedOutcome::Player1Won => GameResult::Win { side: side1 },
                FeedOutcome::Player2Won => GameResult::Win { side: side2 },
                FeedOutcome::Draw => GameResult::Draw,
            };
            let mut record = GameRecord::played(game_number, white, result);
            record.armageddon = armageddon;
            record
        })
        .collect();

    Ok(MatchTally::from_games(open.match_id, games))
}

/// Resolve every open match of a platform round, failing on the first gap.
pub fn resolve_round(
    open: &[OpenMatch],
    feed: &[FeedGame],
    round: u32,
    games_per_match: u32,
) -> KnockoutResult<Vec<MatchTally>> {
    open
        .iter()
        .map(|open| resolve_match(open, feed, round, games_per_match))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_game(p1: &str, p2: &str, color1: Color, result: FeedOutcome, round: u32) -> FeedGame {
        FeedGame {
            player1: p1.to_string(),
            player2: Some(p2.to_string()),
            color1: Some(color1),
            result,
            game_index: round,
            game_id: None,
        }
    }

    fn open(a: &str, b: &str) -> OpenMatch {
        OpenMatch {
            match_id: MatchId::new(0, 0),
            players: [a.to_string(), b.to_string()],
            first_round: 1,
        }
    }

    #[test]
    fn test_partitions_whole_field_feed() {
        let feed = vec![
            feed_game("Alice", "Bob", Color::White, FeedOutcome::Player1Won, 1),
            feed_game("Carol", "Dave", Color::White, FeedOutcome::Draw, 1),
            feed_game("bob", "alice", Color::White, FeedOutcome::Draw, 2),
            feed_game("Dave", "Carol", Color::White, FeedOutcome::Player2Won, 2),
        ];
        let tally = resolve_match(&open("alice", "BOB"), &feed, 2, 2).unwrap();
        assert_eq!(tally.games.len(), 2);
        assert_eq!(tally.score, [1.5, 0.5]);
        assert_eq!(tally.whites, [1, 1]);
        assert_eq!(tally.leader, Some(0));
        assert_eq!(tally.games[1].white, Some(1));
        assert_eq!(tally.games[1].result, GameResult::Draw);
    }

    #[test]
    fn test_player2_color_is_inferred() {
        let feed = vec![feed_game("alice", "bob", Color::Black, FeedOutcome::Player2Won, 1)];
        let tally = resolve_match(&open("alice", "bob"), &feed, 1, 1).unwrap();
        assert_eq!(tally.games[0].white, Some(1));
        assert_eq!(tally.games[0].result, GameResult::Win { side: 1 });
        assert_eq!(tally.whites, [0, 1]);
    }

    #[test]
    fn test_missing_pairing_for_round_is_reported() {
        let feed = vec![feed_game("alice", "bob", Color::White, FeedOutcome::Draw, 1)];
        let err = resolve_match(&open("alice", "bob"), &feed, 2, 2).unwrap_err();
        assert_eq!(
            err,
            KnockoutError::PairingNotFound {
                round: 2,
                player_a: "alice".to_string(),
                player_b: "bob".to_string(),
            }
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_walkover_credits_present_side() {
        let feed = vec![FeedGame {
            player1: "bob".to_string(),
            player2: None,
            color1: None,
            result: FeedOutcome::Player1Won,
            game_index: 4,
            game_id: None,
        }];
        let tally = resolve_match(&open("alice", "bob"), &feed, 4, 1).unwrap();
        assert_eq!(tally.score, [0.0, 1.0]);
        assert_eq!(tally.whites, [0, 0]);
        assert_eq!(tally.games[0].result, GameResult::Walkover { side: 1 });
    }

    #[test]
    fn test_games_past_match_length_are_armageddon() {
        let feed = vec![
            feed_game("alice", "bob", Color::White, FeedOutcome::Player1Won, 1),
            feed_game("bob", "alice", Color::White, FeedOutcome::Player1Won, 2),
            feed_game("alice", "bob", Color::Black, FeedOutcome::Draw, 3),
        ];
        let tally = resolve_match(&open("alice", "bob"), &feed, 3, 2).unwrap();
        assert_eq!(tally.regular_games(), 2);
        assert!(tally.games[2].armageddon);
        assert_eq!(tally.games[2].white, Some(1));
        assert_eq!(tally.whites, [1, 1]);
    }

    #[test]
    fn test_future_rounds_are_ignored() {
        let feed = vec![
            feed_game("alice", "bob", Color::White, FeedOutcome::Player1Won, 1),
            feed_game("bob", "alice", Color::White, FeedOutcome::Player1Won, 2),
        ];
        let tally = resolve_match(&open("alice", "bob"), &feed, 1, 2).unwrap();
        assert_eq!(tally.games.len(), 1);
        assert_eq!(tally.score, [1.0, 0.0]);
    }

    #[test]
    fn test_earlier_match_rounds_are_ignored() {
        let feed = vec![
            FeedGame {
                player1: "alice".to_string(),
                player2: None,
                color1: None,
                result: FeedOutcome::Player1Won,
                game_index: 1,
                game_id: None,
            },
            feed_game("alice", "bob", Color::White, FeedOutcome::Draw, 2),
        ];
        let mut later = open("alice", "bob");
        later.first_round = 2;
        let tally = resolve_match(&later, &feed, 2, 1).unwrap();
        assert_eq!(tally.games.len(), 1);
        assert_eq!(tally.score, [0.5, 0.5]);
    }

    #[test]
    fn test_resolve_round_fails_on_first_gap() {
        let feed = vec![feed_game("alice", "bob", Color::White, FeedOutcome::Draw, 1)];
        let matches = vec![
            open("alice", "bob"),
            OpenMatch {
                match_id: MatchId::new(0, 1),
                players: ["carol".to_string(), "dave".to_string()],
                first_round: 1,
            },
        ];
        assert!(matches!(
            resolve_round(&matches, &feed, 1, 1),
            Err(KnockoutError::PairingNotFound { .. })
        ));
    }
}

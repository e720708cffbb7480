use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bracket::DecidedBy;
use crate::error::{KnockoutError, KnockoutResult};
use crate::pairing::MatchTally;
use crate::types::Competitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreakPolicy {
    /// Lower-rated competitor advances
    #[default]
    Rating,
    /// Competitor with fewer white games advances
    Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TieBreakConfig {
    pub policy: TieBreakPolicy,
    pub games_per_match: u32,
    pub armageddon: bool,
}

impl TieBreakConfig {
    pub fn new(policy: TieBreakPolicy, games_per_match: u32, armageddon: bool) -> KnockoutResult<Self> {
        let config = TieBreakConfig {
            policy,
            games_per_match,
            armageddon,
        };
        config.validate()?;
        Ok(config)
    }

    /// Color counts only separate two players when the match length is odd.
    pub fn validate(&self) -> KnockoutResult<()> {
        if self.games_per_match == 0 {
            return Err(KnockoutError::InvalidTieBreakConfig(
                "games per match must be at least 1".to_string(),
            ));
        }
        if self.policy == TieBreakPolicy::Color && self.games_per_match % 2 == 0 {
            return Err(KnockoutError::InvalidTieBreakConfig(format!(
                "color tie-break needs an odd number of games per match, got {}",
                self.games_per_match
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreakOutcome {
    Winner { side: usize, decided_by: DecidedBy },
    /// One more game with forced colors; black advances on a draw
    Armageddon { white: usize },
}

/// Decide a match whose regular games are all played.
///
/// A match that is not actually level goes to the leader on score. Equal
/// ratings (rating policy) or equal white counts (color policy) go to an
/// Armageddon game when enabled, otherwise to the better seed.
pub fn break_tie<R: Rng + ?Sized>(
    config: &TieBreakConfig,
    competitors: [&Competitor; 2],
    tally: &MatchTally,
    rng: &mut R,
) -> KnockoutResult<TieBreakOutcome> {
    if tally.regular_games() < config.games_per_match as usize {
        return Err(KnockoutError::InvalidState(format!(
            "match {} has played {} of {} games, no tie-break yet",
            tally.match_id,
            tally.regular_games(),
            config.games_per_match
        )));
    }
    if let Some(side) = tally.leader {
        return Ok(TieBreakOutcome::Winner {
            side,
            decided_by: DecidedBy::Score,
        });
    }

    let decided = match config.policy {
        TieBreakPolicy::Rating => {
            let [a, b] = competitors;
            if a.rating < b.rating {
                Some(0)
            } else if b.rating < a.rating {
                Some(1)
            } else {
                None
            }
        }
        TieBreakPolicy::Color => {
            let [a, b] = tally.whites;
            if a < b {
                Some(0)
            } else if b < a {
                Some(1)
            } else {
                None
            }
        }
    };

    if let Some(side) = decided {
        let decided_by = match config.policy {
            TieBreakPolicy::Rating => DecidedBy::Rating,
            TieBreakPolicy::Color => DecidedBy::Color,
        };
        return Ok(TieBreakOutcome::Winner { side, decided_by });
    }

    if config.armageddon {
        let white = if rng.random_bool(0.5) { 0 } else { 1 };
        return Ok(TieBreakOutcome::Armageddon { white });
    }

    let side = if competitors[0].seed <= competitors[1].seed { 0 } else { 1 };
    Ok(TieBreakOutcome::Winner {
        side,
        decided_by: DecidedBy::Seed,
    })
}

//! Error taxonomy shared by the bracket engine and the controller.

use thiserror::Error;

use crate::bracket::MatchId;

/// Errors raised while running a knock-out event.
///
/// Pure components (bracket, pairing resolver, tie-breaker) never retry;
/// they report one of these and the controller decides what happens next.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KnockoutError {
    /// Field too small or too large to seed a bracket
    #[error("Invalid field size {count} (must be between {min} and {max})")]
    InvalidFieldSize { count: usize, min: usize, max: usize },

    /// Tie-break policy cannot work with the configured match length
    #[error("Invalid tie-break configuration: {0}")]
    InvalidTieBreakConfig(String),

    /// Any other configuration problem caught before the run starts
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown match {0}")]
    UnknownMatch(MatchId),

    /// Match already has a winner and the new input differs in detail
    #[error("Match {0} is already decided")]
    AlreadyDecided(MatchId),

    /// Match already has a different winner
    #[error("Conflicting result for match {0}")]
    ConflictingResult(MatchId),

    /// Platform feed has no game for an announced pairing (yet)
    #[error("No game between {player_a} and {player_b} in platform round {round}")]
    PairingNotFound {
        round: u32,
        player_a: String,
        player_b: String,
    },

    /// Network, HTTP or decoding failure talking to the platform
    #[error("Platform error: {0}")]
    Platform(String),

    /// Operation called in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Tournament run cancelled")]
    Cancelled,

    /// Session journal could not be read or written
    #[error("Session error: {0}")]
    Session(String),
}

impl KnockoutError {
    /// Whether the controller may retry the failed step.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KnockoutError::PairingNotFound { .. } | KnockoutError::Platform(_)
        )
    }
}

impl From<reqwest::Error> for KnockoutError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            KnockoutError::Platform(format!("request timed out: {err}"))
        } else {
            KnockoutError::Platform(err.to_string())
        }
    }
}

pub type KnockoutResult<T> = Result<T, KnockoutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let pairing = KnockoutError::PairingNotFound {
            round: 3,
            player_a: "alice".to_string(),
            player_b: "bob".to_string(),
        };
        assert!(pairing.is_transient());
        assert!(KnockoutError::Platform("502".to_string()).is_transient());

        assert!(!KnockoutError::InvalidFieldSize { count: 3, min: 4, max: 2048 }.is_transient());
        assert!(!KnockoutError::UnknownMatch(MatchId::new(0, 0)).is_transient());
        assert!(!KnockoutError::ConflictingResult(MatchId::new(1, 0)).is_transient());
        assert!(!KnockoutError::InvalidTieBreakConfig("even".to_string()).is_transient());
    }

    #[test]
    fn test_messages_name_the_match() {
        let err = KnockoutError::AlreadyDecided(MatchId::new(2, 1));
        assert_eq!(err.to_string(), "Match R3M2 is already decided");
    }
}

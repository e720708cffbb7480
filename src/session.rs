//! Resumable record of a running event.
//!
//! The journal keeps the seeded field plus every bracket mutation in the
//! order it happened. Replaying it onto a freshly seeded bracket rebuilds the
//! exact state, and replaying it twice changes nothing.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::bracket::{BracketTree, GameRecord, MatchId, MatchResult};
use crate::controller::TournamentState;
use crate::error::{KnockoutError, KnockoutResult};
use crate::types::{Competitor, FeedGame, Registration};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LedgerEntry {
    #[serde(rename_all = "camelCase")]
    Game { match_id: MatchId, game: GameRecord },
    #[serde(rename_all = "camelCase")]
    Armageddon { match_id: MatchId, white: usize },
    #[serde(rename_all = "camelCase")]
    Result { match_id: MatchId, result: MatchResult },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionJournal {
    pub event_id: String,
    pub games_per_match: u32,
    pub starts_at_ms: u64,
    pub state: TournamentState,
    /// Players registered so far, in join order
    #[serde(default)]
    pub registrants: Vec<Registration>,
    /// Field in seed order, empty while registration is open
    pub competitors: Vec<Competitor>,
    /// Per match round: whether the top side gets white in game 1
    pub color_bits: Vec<bool>,
    pub platform_round: u32,
    pub pending_round: Option<u32>,
    /// First platform round of each match round
    pub round_starts: Vec<u32>,
    pub announced: Vec<u32>,
    pub ledger: Vec<LedgerEntry>,
    pub feed: Vec<FeedGame>,
    pub saved_at_ms: u64,
}

impl SessionJournal {
    /// Apply the ledger to `bracket`; returns the number of entries applied.
    pub fn replay(&self, bracket: &mut BracketTree) -> KnockoutResult<usize> {
        for entry in &self.ledger {
            match entry {
                LedgerEntry::Game { match_id, game } => {
                    bracket.record_game(*match_id, *game)?;
                }
                LedgerEntry::Armageddon { match_id, white } => {
                    bracket.assign_armageddon(*match_id, *white)?;
                }
                LedgerEntry::Result { match_id, result } => {
                    bracket.record_result(*match_id, result.clone())?;
                }
            }
        }
        Ok(self.ledger.len())
    }

    /// Read a journal; a missing file means there is nothing to resume.
    pub fn load(path: &Path) -> KnockoutResult<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let data = fs::read_to_string(path)
            .map_err(|e| KnockoutError::Session(format!("read session {}: {e}", path.display())))?;
        let journal = serde_json::from_str::<SessionJournal>(&data)
            .map_err(|e| KnockoutError::Session(format!("parse session {}: {e}", path.display())))?;
        Ok(Some(journal))
    }

    /// Write through a temp file so a crash never leaves half a journal.
    pub fn save(&self, path: &Path) -> KnockoutResult<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .map_err(|e| KnockoutError::Session(format!("create {}: {e}", dir.display())))?;
            }
        }
        let payload = serde_json::to_string_pretty(self).map_err(|e| KnockoutError::Session(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)
            .map_err(|e| KnockoutError::Session(format!("write session {}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .map_err(|e| KnockoutError::Session(format!("replace session {}: {e}", path.display())))?;
        Ok(())
    }
}

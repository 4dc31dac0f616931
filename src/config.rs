//! Difficulty calibration: mapping a target human rating to concrete engine
//! configuration, and scoped full-strength overrides for hints.
//!
//! The rating breakpoints are tuned policy, not contract. What callers may
//! rely on is the shape: a higher rating never yields a lower skill level or
//! a tighter depth ceiling.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::session::EngineSession;

/// Floor applied to think time when formatting `go` commands.
pub const MIN_MOVE_TIME_MS: u64 = 100;

/// Think time for normal play.
pub const DEFAULT_MOVE_TIME_MS: u64 = 1000;

/// Think time for full-strength hint searches.
pub const HINT_MOVE_TIME_MS: u64 = 5000;

/// Fixed search depth for full-strength hint searches.
pub const HINT_DEPTH: u32 = 18;

/// Below this rating the depth ceiling is the load-bearing limiter: strong
/// engines given generous think time still find near-optimal moves at low
/// configured skill, so time control alone cannot produce weak play.
const SHALLOW_DEPTH_RATING: u32 = 1000;

/// At or above this rating no strength limiting is applied at all.
const FULL_STRENGTH_RATING: u32 = 2600;

/// Stockfish-family engines accept UCI_Elo no lower than this; ratings below
/// it are covered by the depth ceiling instead.
const MIN_UCI_ELO: u32 = 1320;
const MAX_UCI_ELO: u32 = 3190;

/// Concrete engine configuration for one strength target.
///
/// Mutated only through the calibrator and [`StrengthOverride`]; the session
/// reads it when issuing a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfiguration {
    /// UCI `Skill Level` (0-20), unset at full strength.
    pub skill_level: Option<u8>,
    /// UCI `UCI_LimitStrength` toggle.
    pub limit_strength: bool,
    /// UCI `UCI_Elo` target, only meaningful with `limit_strength`.
    pub target_elo: Option<u32>,
    /// Fixed search depth ceiling for `go depth`.
    pub depth_ceiling: Option<u32>,
    /// Think time per move in milliseconds.
    pub move_time_ms: u64,
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self::full_strength()
    }
}

impl EngineConfiguration {
    /// Full-strength configuration used for hint searches: no limits, deep
    /// fixed-depth search with a generous think time.
    pub fn full_strength() -> Self {
        Self {
            skill_level: None,
            limit_strength: false,
            target_elo: None,
            depth_ceiling: Some(HINT_DEPTH),
            move_time_ms: HINT_MOVE_TIME_MS,
        }
    }

    /// Deterministic, monotonic mapping from a target rating to engine
    /// configuration.
    ///
    /// Ratings below the lowest bucket clamp to the weakest supported
    /// configuration; ratings at or above [`FULL_STRENGTH_RATING`] get no
    /// strength limit and no depth ceiling.
    pub fn for_rating(rating: u32) -> Self {
        if rating >= FULL_STRENGTH_RATING {
            return Self {
                skill_level: None,
                limit_strength: false,
                target_elo: None,
                depth_ceiling: None,
                move_time_ms: DEFAULT_MOVE_TIME_MS,
            };
        }

        let config = Self {
            skill_level: Some(Self::skill_level_for(rating)),
            limit_strength: true,
            target_elo: Some(rating.clamp(MIN_UCI_ELO, MAX_UCI_ELO)),
            depth_ceiling: if rating < SHALLOW_DEPTH_RATING {
                Some(Self::depth_limit_for(rating))
            } else {
                None
            },
            move_time_ms: DEFAULT_MOVE_TIME_MS,
        };
        debug!("Calibrated configuration for rating {}: {:?}", rating, config);
        config
    }

    fn skill_level_for(rating: u32) -> u8 {
        (rating.saturating_sub(600) / 100).min(20) as u8
    }

    fn depth_limit_for(rating: u32) -> u32 {
        (rating / 200).clamp(1, 8)
    }

    /// Reject configurations no engine search can honor.
    pub fn validate(&self) -> EngineResult<()> {
        if self.move_time_ms == 0 {
            return Err(EngineError::InvalidConfiguration(
                "think time must be positive".to_string(),
            ));
        }
        if let Some(skill) = self.skill_level {
            if skill > 20 {
                return Err(EngineError::InvalidConfiguration(format!(
                    "skill level {} out of range 0-20",
                    skill
                )));
            }
        }
        if let Some(depth) = self.depth_ceiling {
            if depth == 0 {
                return Err(EngineError::InvalidConfiguration(
                    "depth ceiling must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Think time with the floor applied.
    pub fn effective_move_time_ms(&self) -> u64 {
        self.move_time_ms.max(MIN_MOVE_TIME_MS)
    }

    /// `setoption` command lines for this configuration.
    ///
    /// Order matters: `Skill Level`, then `UCI_LimitStrength`, then
    /// `UCI_Elo`, since engines apply the Elo target only while strength
    /// limiting is on. `UCI_LimitStrength` is always emitted so restoring a
    /// saved configuration also turns the toggle back off.
    pub fn setoption_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(skill) = self.skill_level {
            lines.push(format!("setoption name Skill Level value {}", skill));
        }
        lines.push(format!(
            "setoption name UCI_LimitStrength value {}",
            self.limit_strength
        ));
        if let Some(elo) = self.target_elo {
            lines.push(format!("setoption name UCI_Elo value {}", elo));
        }
        lines
    }

    /// `go` command for this configuration.
    pub fn go_command(&self) -> String {
        match self.depth_ceiling {
            Some(depth) => format!(
                "go depth {} movetime {}",
                depth,
                self.effective_move_time_ms()
            ),
            None => format!("go movetime {}", self.effective_move_time_ms()),
        }
    }
}

/// Scoped full-strength override with guaranteed restoration.
///
/// Returned by [`StrengthOverride::apply`]; holds the configuration that was
/// active before the override. Restoring consumes the guard and re-sends the
/// saved configuration, including the strength-limit toggle and Elo target,
/// so a hint never leaves the engine stronger or weaker than the user's
/// chosen difficulty.
#[must_use = "an unrestored override leaves the engine at the wrong strength"]
pub struct StrengthOverride {
    saved: EngineConfiguration,
    restored: bool,
}

impl StrengthOverride {
    /// Push `config` to the session and capture the configuration that was
    /// active before it.
    pub async fn apply(
        session: &mut EngineSession,
        config: EngineConfiguration,
    ) -> EngineResult<Self> {
        let saved = session.configuration().clone();
        session.apply_configuration(config).await?;
        Ok(Self {
            saved,
            restored: false,
        })
    }

    /// The configuration that will be restored.
    pub fn saved(&self) -> &EngineConfiguration {
        &self.saved
    }

    /// Restore the exact configuration that was active before the override.
    pub async fn restore(mut self, session: &mut EngineSession) -> EngineResult<()> {
        self.restored = true;
        session.apply_configuration(self.saved.clone()).await
    }
}

impl Drop for StrengthOverride {
    fn drop(&mut self) {
        if !self.restored {
            warn!(
                "strength override dropped without restore; engine left at override strength"
            );
        }
    }
}

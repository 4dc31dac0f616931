//! Move orchestration: the human-vs-engine game lifecycle, and the bridge
//! from protocol-session results into board moves.
//!
//! The rules engine (move legality, board state) is an external collaborator
//! reached only through [`RulesEngine`]; this module never second-guesses its
//! verdicts.

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info, warn};
use shakmaty::{Color, Role, Square};

use crate::config::EngineConfiguration;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EngineStatus, EventBus};
use crate::session::{AnalysisResult, EngineSession, SearchCancelHandle, HANDSHAKE_TIMEOUT};

/// Slack added on top of the configured think time when waiting for a
/// bestmove, covering engine-side overhead.
const SEARCH_DEADLINE_SLACK: Duration = Duration::from_secs(2);

/// Record of a move the rules engine accepted.
#[derive(Debug, Clone)]
pub struct AppliedMove {
    pub san: String,
}

/// Boundary to the external move-legality/board-state engine.
///
/// The orchestrator is a source of moves and a consumer of FEN strings; it
/// holds no board state of its own.
pub trait RulesEngine: Send {
    fn current_fen(&self) -> String;
    fn side_to_move(&self) -> Color;
    fn apply_move(
        &mut self,
        from: Square,
        to: Square,
        promotion: Option<Role>,
    ) -> EngineResult<AppliedMove>;
}

/// Transient human-vs-engine game session; recreated per game.
#[derive(Debug, Clone, Copy)]
pub struct EngineGame {
    pub engine_color: Color,
    pub active: bool,
}

/// Sequences whose-turn logic, triggers engine moves, and manages the game
/// lifecycle around one [`EngineSession`].
pub struct MoveOrchestrator<R: RulesEngine> {
    session: EngineSession,
    cancel: SearchCancelHandle,
    rules: R,
    game: Option<EngineGame>,
    rating: u32,
    events: EventBus,
}

impl<R: RulesEngine> MoveOrchestrator<R> {
    /// Wrap an initialized session, calibrating it for `rating`.
    pub async fn new(mut session: EngineSession, rules: R, rating: u32) -> EngineResult<Self> {
        session
            .apply_configuration(EngineConfiguration::for_rating(rating))
            .await?;
        let cancel = session.cancel_handle();
        let events = session.events().clone();
        Ok(Self {
            session,
            cancel,
            rules,
            game: None,
            rating,
            events,
        })
    }

    /// Launch the engine binary, complete the handshake, and calibrate.
    pub async fn connect(path: PathBuf, rules: R, rating: u32) -> EngineResult<Self> {
        let session = EngineSession::connect(path, EventBus::new(), HANDSHAKE_TIMEOUT).await?;
        Self::new(session, rules, rating).await
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut R {
        &mut self.rules
    }

    pub fn session(&self) -> &EngineSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut EngineSession {
        &mut self.session
    }

    /// Handle for cancelling an in-flight search from another task.
    pub fn cancel_handle(&self) -> SearchCancelHandle {
        self.cancel.clone()
    }

    /// Re-calibrate normal play for a new target rating.
    pub async fn set_rating(&mut self, rating: u32) -> EngineResult<()> {
        info!("Re-calibrating engine for rating {}", rating);
        self.rating = rating;
        self.session
            .apply_configuration(EngineConfiguration::for_rating(rating))
            .await
    }

    pub fn configured_rating(&self) -> u32 {
        self.rating
    }

    /// Start a game against the engine. If the engine's side is to move
    /// first, a search is requested immediately.
    pub async fn start_game(&mut self, engine_color: Color) -> EngineResult<()> {
        info!("Starting engine game, engine plays {:?}", engine_color);
        self.game = Some(EngineGame {
            engine_color,
            active: true,
        });

        if self.rules.side_to_move() == engine_color {
            let fen = self.rules.current_fen();
            self.play_engine_move(&fen).await?;
        }
        Ok(())
    }

    /// End the game session and cancel any in-flight search. Idempotent.
    pub fn stop_game(&mut self) {
        if self.game.take().is_some() {
            info!("Stopping engine game");
        }
        self.cancel.cancel();
    }

    pub fn is_playing(&self) -> bool {
        self.game.map_or(false, |g| g.active)
    }

    /// Called when the opponent's move has been applied to the board. When
    /// the game is active and it is now the engine's turn, searches
    /// `new_fen` and applies the resulting move.
    pub async fn on_opponent_move_applied(
        &mut self,
        new_fen: &str,
        side_to_move: Color,
    ) -> EngineResult<()> {
        let Some(game) = self.game else {
            return Ok(());
        };
        if !game.active || side_to_move != game.engine_color {
            return Ok(());
        }
        self.play_engine_move(new_fen).await
    }

    /// Full-strength hint for the given position.
    ///
    /// The strength override is restored on every path out of the search,
    /// including timeout and error, so normal play resumes at the user's
    /// chosen difficulty.
    pub async fn request_hint(&mut self, fen: &str) -> EngineResult<AnalysisResult> {
        debug!("Hint requested for {}", fen);
        self.session.set_position(fen).await?;

        let guard = crate::config::StrengthOverride::apply(
            &mut self.session,
            EngineConfiguration::full_strength(),
        )
        .await?;
        let deadline = search_deadline(self.session.configuration());
        let outcome = self.session.search(deadline).await;
        let restored = guard.restore(&mut self.session).await;

        // The search error wins; a restore failure only matters when the
        // search itself succeeded.
        let result = outcome?;
        restored?;

        self.events.emit(EngineEvent::HintReady {
            uci: result.best_move.to_string(),
            from: result.best_move.from.to_string(),
            to: result.best_move.to.to_string(),
        });
        Ok(result)
    }

    /// Snapshot for the UI layer.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            ready: self.session.is_ready() || self.session.is_analyzing(),
            analyzing: self.session.is_analyzing(),
            playing_as_engine: self.is_playing(),
            engine_color: self.game.map(|g| color_name(g.engine_color).to_string()),
            configured_rating: self.rating,
        }
    }

    /// Stop any game in progress and release the engine process.
    pub async fn shutdown(&mut self) {
        self.stop_game();
        self.session.shutdown().await;
    }

    async fn play_engine_move(&mut self, fen: &str) -> EngineResult<()> {
        self.session.set_position(fen).await?;
        self.events.emit(EngineEvent::Thinking);

        let deadline = search_deadline(self.session.configuration());
        let result = self.session.search(deadline).await?;
        let mv = result.best_move;

        match self.rules.apply_move(mv.from, mv.to, mv.promotion) {
            Ok(applied) => {
                debug!("Engine move {} applied as {}", mv, applied.san);
                self.events.emit(EngineEvent::MoveMade {
                    uci: mv.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                // Retrying with the same FEN would reproduce the same move;
                // a rejected move means coordinator and board are desynced.
                warn!("Rules engine rejected {}: {}", mv, e);
                let err = EngineError::IllegalMove(format!("{} ({})", mv, e));
                self.events.emit(EngineEvent::Error {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }
}

fn search_deadline(config: &EngineConfiguration) -> Duration {
    Duration::from_millis(config.effective_move_time_ms()) + SEARCH_DEADLINE_SLACK
}

fn color_name(color: Color) -> &'static str {
    match color {
        Color::White => "white",
        Color::Black => "black",
    }
}

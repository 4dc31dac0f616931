//! UCI engine coordinator for a desktop chess tutor.
//!
//! Wraps a UCI chess engine (Stockfish or compatible) running as a child
//! process and exposes it as an async API: handshake and lifecycle
//! management, position/search requests with timeouts and cancellation,
//! rating-based difficulty calibration, and a move orchestrator that plays
//! the engine's side of a human-vs-engine game.
//!
//! The layers, bottom up:
//!
//! - [`transport`]: the child process and its line-oriented stdio pipes.
//! - [`session`]: the UCI protocol state machine, one request at a time.
//! - [`config`]: difficulty calibration and the scoped hint override.
//! - [`orchestrator`]: game lifecycle against an external rules engine.
//! - [`events`]: the broadcast bus the UI layer subscribes to.

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod session;
pub mod transport;

pub use config::{EngineConfiguration, StrengthOverride};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EngineLog, EngineStatus, EventBus};
pub use orchestrator::{AppliedMove, EngineGame, MoveOrchestrator, RulesEngine};
pub use session::{
    AnalysisResult, AnalysisSnapshot, EngineMove, EngineSession, Evaluation, SearchCancelHandle,
    SessionState,
};
pub use transport::ProcessTransport;

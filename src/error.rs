use crate::session::SessionState;

/// Error taxonomy for the engine coordinator.
///
/// Launch, handshake and transport failures are fatal for the subsystem and
/// propagate to the caller as unavailable status; search timeouts and
/// illegal-move desyncs are scoped to a single request and leave the session
/// usable.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to launch engine process: {0}")]
    Launch(std::io::Error),

    #[error("no stdin handle available")]
    NoStdin,

    #[error("no stdout handle available")]
    NoStdout,

    #[error("engine handshake timed out (no uciok/readyok); check that the binary exists and is executable")]
    HandshakeTimeout,

    #[error("engine search timed out (no bestmove within deadline)")]
    SearchTimeout,

    #[error("engine process exited or stream closed")]
    TransportClosed,

    #[error("search cancelled")]
    Cancelled,

    #[error("invalid session state: expected {expected:?}, got {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("engine move rejected by rules engine (position desync): {0}")]
    IllegalMove(String),

    #[error("unusable move token from engine: {0}")]
    InvalidMoveToken(String),

    #[error("invalid engine configuration: {0}")]
    InvalidConfiguration(String),

    #[error("FEN parsing error: {0}")]
    FenParsing(#[from] shakmaty::fen::ParseFenError),

    #[error("position setup error: {0}")]
    PositionSetup(#[from] shakmaty::PositionError<shakmaty::Chess>),

    #[error("UCI move parsing error: {0}")]
    UciMoveParsing(#[from] shakmaty::uci::ParseUciMoveError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Whether the failure tears down the whole subsystem, as opposed to
    /// being recoverable within the current session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Launch(_)
                | EngineError::NoStdin
                | EngineError::NoStdout
                | EngineError::HandshakeTimeout
                | EngineError::TransportClosed
        )
    }
}

//! Protocol session: request/response discipline over UCI's asynchronous,
//! streaming protocol.
//!
//! The session owns the transport and the single outstanding request. All
//! other components interact with the engine only through its operations;
//! the one exception is [`SearchCancelHandle`], which may send `stop` from
//! another task without waiting on the session.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, Position, Role, Square};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use vampirc_uci::{parse_one, UciInfoAttribute, UciMessage};

use crate::config::EngineConfiguration;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EngineLog, EventBus};
use crate::transport::ProcessTransport;

/// Default budget for the `uci`/`isready` handshake; generous enough to
/// tolerate slow process startup.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra time past the search deadline before a missing `bestmove` is
/// declared a timeout; a `stop` is sent when the deadline itself expires.
pub const SEARCH_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Bounded wait for a `bestmove` after cancellation, so an engine that does
/// not acknowledge `stop` cannot hang the caller.
pub const STOP_GRACE: Duration = Duration::from_millis(500);

/// Minimum interval between analysis-progress events, to keep a fast engine
/// from flooding subscribers.
const MIN_EVENT_INTERVAL: Duration = Duration::from_millis(50);

/// Protocol session states. Transitions are checked in one place; illegal
/// ones surface as `EngineError::InvalidState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No commands sent yet.
    Uninitialized,
    /// `uci` sent; waiting for `uciok` then `readyok`, in that order.
    Handshaking,
    /// Idle, accepts a new search request.
    Ready,
    /// One search in flight; accepts `stop` but no new search.
    Searching,
    /// Terminal; all pending requests failed.
    Shutdown,
}

/// Engine evaluation, keeping mate distances distinct from centipawns.
///
/// Normalized to White's perspective: positive favors White.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Evaluation {
    Centipawns(i32),
    MateIn(i32),
}

impl Default for Evaluation {
    fn default() -> Self {
        Evaluation::Centipawns(0)
    }
}

impl Evaluation {
    /// Same evaluation seen from the other side.
    pub fn flipped(self) -> Self {
        match self {
            Evaluation::Centipawns(cp) => Evaluation::Centipawns(-cp),
            Evaluation::MateIn(n) => Evaluation::MateIn(-n),
        }
    }
}

/// A move decoded from a UCI long-algebraic token such as `e2e4` or `e7e8q`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineMove {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<Role>,
}

impl EngineMove {
    /// Decode a four- or five-character move token.
    pub fn from_token(token: &str) -> EngineResult<Self> {
        match UciMove::from_ascii(token.as_bytes())? {
            UciMove::Normal {
                from,
                to,
                promotion,
            } => Ok(Self {
                from,
                to,
                promotion,
            }),
            // Null moves and drops never come out of a normal game search.
            _ => Err(EngineError::InvalidMoveToken(token.to_string())),
        }
    }
}

impl fmt::Display for EngineMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.from, self.to)?;
        if let Some(role) = self.promotion {
            write!(f, "{}", role.char())?;
        }
        Ok(())
    }
}

/// One line of live search progress, as reported by an `info` line.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSnapshot {
    pub depth: u32,
    pub evaluation: Evaluation,
    pub nodes: u64,
    pub pv: Vec<String>,
}

/// Completed search result. Immutable once produced.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub best_move: EngineMove,
    pub evaluation: Evaluation,
    pub depth: u32,
    pub nodes: u64,
    pub pv: Vec<String>,
}

/// Cancels an in-flight search from outside the session.
///
/// Idempotent: cancelling when nothing is in flight is a no-op. The handle
/// writes `stop` straight to the command sink, so it never waits on a lock
/// held for the duration of a search.
#[derive(Debug, Clone)]
pub struct SearchCancelHandle {
    analyzing: Arc<AtomicBool>,
    stop_tx: Arc<watch::Sender<()>>,
    sink: mpsc::UnboundedSender<String>,
}

impl SearchCancelHandle {
    pub fn cancel(&self) {
        if !self.analyzing.load(Ordering::SeqCst) {
            debug!("Cancel requested with no search in flight, ignoring");
            return;
        }
        info!("Cancelling in-flight search");
        // Raw sink bypasses the session, so the newline is added here.
        let _ = self.sink.send("stop\n".to_string());
        let _ = self.stop_tx.send(());
    }
}

/// Holds `ready`/`searching` state and the single pending request.
pub struct EngineSession {
    transport: ProcessTransport,
    state: SessionState,
    config: EngineConfiguration,
    events: EventBus,
    logs: Vec<EngineLog>,
    /// Side to move in the last position sent; engine scores are reported
    /// from this side's perspective.
    side_to_move: Color,
    analyzing: Arc<AtomicBool>,
    stop_tx: Arc<watch::Sender<()>>,
    stop_rx: watch::Receiver<()>,
    progress_tap: Option<mpsc::UnboundedSender<AnalysisSnapshot>>,
    last_progress_event: Option<Instant>,
}

impl EngineSession {
    pub fn new(transport: ProcessTransport, events: EventBus) -> Self {
        let (stop_tx, stop_rx) = watch::channel(());
        Self {
            transport,
            state: SessionState::Uninitialized,
            config: EngineConfiguration::default(),
            events,
            logs: Vec::new(),
            side_to_move: Color::White,
            analyzing: Arc::new(AtomicBool::new(false)),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            progress_tap: None,
            last_progress_event: None,
        }
    }

    /// Spawn the engine process and drive the session to `Ready`.
    pub async fn connect(
        path: PathBuf,
        events: EventBus,
        handshake_budget: Duration,
    ) -> EngineResult<Self> {
        let transport = ProcessTransport::spawn(path).await?;
        let mut session = Self::new(transport, events);
        session.initialize(handshake_budget).await?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn is_analyzing(&self) -> bool {
        self.analyzing.load(Ordering::SeqCst)
    }

    pub fn configuration(&self) -> &EngineConfiguration {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// GUI/engine traffic ledger, oldest first.
    pub fn logs(&self) -> &[EngineLog] {
        &self.logs
    }

    pub fn cancel_handle(&self) -> SearchCancelHandle {
        SearchCancelHandle {
            analyzing: self.analyzing.clone(),
            stop_tx: self.stop_tx.clone(),
            sink: self.transport.command_sink(),
        }
    }

    /// Drive `Uninitialized → Ready` through the two-step handshake.
    ///
    /// Fails with `HandshakeTimeout` when either acknowledgment is missing
    /// within the budget; the usual causes are a missing or non-executable
    /// binary, surfaced earlier by `connect`, or an engine that is not
    /// actually speaking UCI.
    pub async fn initialize(&mut self, budget: Duration) -> EngineResult<()> {
        self.expect_state(SessionState::Uninitialized)?;
        self.state = SessionState::Handshaking;

        match timeout(budget, self.handshake()).await {
            Ok(Ok(())) => {
                info!("Engine handshake complete, session ready");
                self.state = SessionState::Ready;
                self.events.emit(EngineEvent::Ready);
                Ok(())
            }
            Ok(Err(e)) => {
                self.fail_fatally(&e);
                Err(e)
            }
            Err(_) => {
                let e = EngineError::HandshakeTimeout;
                self.fail_fatally(&e);
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> EngineResult<()> {
        self.send("uci")?;
        let mut identify_acked = false;

        loop {
            let line = self
                .transport
                .next_line()
                .await
                .ok_or(EngineError::TransportClosed)?;
            self.logs.push(EngineLog::Engine(line.clone()));

            match parse_one(&line) {
                UciMessage::UciOk => {
                    debug!("Received uciok, probing readiness");
                    identify_acked = true;
                    self.send("isready")?;
                }
                UciMessage::ReadyOk if identify_acked => return Ok(()),
                UciMessage::ReadyOk => {
                    // Out-of-order ack is a protocol violation; it must not
                    // advance the handshake.
                    warn!("readyok before uciok, ignoring out-of-order ack");
                }
                _ => {}
            }
        }
    }

    /// Send `position fen <FEN>`. Valid only when `Ready`; the FEN is
    /// validated locally before anything reaches the engine.
    pub async fn set_position(&mut self, fen: &str) -> EngineResult<()> {
        self.expect_state(SessionState::Ready)?;

        let parsed: shakmaty::fen::Fen = fen.parse()?;
        let pos: Chess = match parsed.into_position(CastlingMode::Chess960) {
            Ok(p) => p,
            Err(e) => e.ignore_too_much_material()?,
        };
        self.side_to_move = pos.turn();

        self.send(&format!("position fen {}", fen))
    }

    /// Push a configuration's option commands and record it as active.
    ///
    /// Engines read options only between searches, so this is rejected
    /// while one is in flight.
    pub async fn apply_configuration(&mut self, config: EngineConfiguration) -> EngineResult<()> {
        if self.state == SessionState::Searching {
            return Err(EngineError::InvalidState {
                expected: SessionState::Ready,
                actual: self.state,
            });
        }
        config.validate()?;

        for line in config.setoption_lines() {
            self.send(&line)?;
        }
        self.config = config;
        Ok(())
    }

    /// Run one search with the active configuration.
    ///
    /// `Ready → Searching → Ready`. Option commands are re-issued
    /// immediately before `go`. If no `bestmove` arrives by `deadline`, a
    /// `stop` is sent and the engine gets [`SEARCH_GRACE_PERIOD`] to reply;
    /// past that the request resolves as `SearchTimeout` and the session is
    /// usable again. A reply arriving later still is discarded by the next
    /// search's drain, never misattributed.
    pub async fn search(&mut self, deadline: Duration) -> EngineResult<AnalysisResult> {
        self.expect_state(SessionState::Ready)?;

        let mut stale = 0usize;
        while let Some(line) = self.transport.try_next_line() {
            self.logs.push(EngineLog::Engine(line));
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} stale engine lines before search", stale);
        }

        for line in self.config.setoption_lines() {
            self.send(&line)?;
        }
        let go = self.config.go_command();
        self.send(&go)?;

        // A cancel fired between searches must not abort this one.
        self.stop_rx.borrow_and_update();
        self.state = SessionState::Searching;
        self.analyzing.store(true, Ordering::SeqCst);
        self.last_progress_event = None;

        // Shared across the deadline and grace waits, so info lines seen
        // before the deadline still back the result when the bestmove only
        // arrives in reply to stop.
        let mut latest = AnalysisSnapshot::default();
        let outcome = match timeout(deadline, self.wait_for_bestmove(&mut latest)).await {
            Ok(res) => res,
            Err(_) => {
                debug!("Search deadline expired, sending stop");
                let _ = self.transport.send("stop");
                match timeout(SEARCH_GRACE_PERIOD, self.wait_for_bestmove(&mut latest)).await {
                    Ok(res) => res,
                    Err(_) => Err(EngineError::SearchTimeout),
                }
            }
        };

        self.analyzing.store(false, Ordering::SeqCst);
        // Dropping the tap ends the snapshot stream at bestmove (or failure).
        self.progress_tap = None;

        match outcome {
            Ok(result) => {
                debug!(
                    "Search complete: bestmove={}, depth={}",
                    result.best_move, result.depth
                );
                self.state = SessionState::Ready;
                Ok(result)
            }
            Err(e) if e.is_fatal() => {
                self.fail_fatally(&e);
                Err(e)
            }
            Err(e) => {
                // Timeout and cancellation are scoped to this one request.
                self.state = SessionState::Ready;
                Err(e)
            }
        }
    }

    /// Live progress of the next search: one snapshot per `info` line,
    /// ending when the search resolves.
    pub fn analysis_stream(&mut self) -> mpsc::UnboundedReceiver<AnalysisSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress_tap = Some(tx);
        rx
    }

    /// Tear the session down and release the engine process.
    pub async fn shutdown(&mut self) {
        info!("Shutting down engine session");
        self.state = SessionState::Shutdown;
        self.analyzing.store(false, Ordering::SeqCst);
        self.transport.stop().await;
    }

    async fn wait_for_bestmove(
        &mut self,
        latest: &mut AnalysisSnapshot,
    ) -> EngineResult<AnalysisResult> {
        loop {
            tokio::select! {
                biased;
                line = self.transport.next_line() => {
                    let line = line.ok_or(EngineError::TransportClosed)?;
                    if let Some(result) = self.handle_search_line(&line, latest)? {
                        return Ok(result);
                    }
                }
                changed = self.stop_rx.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::TransportClosed);
                    }
                    debug!("Cancel observed, waiting out the stop grace period");
                    return match timeout(STOP_GRACE, self.drain_until_bestmove(latest)).await {
                        Ok(res) => res,
                        Err(_) => Err(EngineError::Cancelled),
                    };
                }
            }
        }
    }

    async fn drain_until_bestmove(
        &mut self,
        latest: &mut AnalysisSnapshot,
    ) -> EngineResult<AnalysisResult> {
        loop {
            let line = self
                .transport
                .next_line()
                .await
                .ok_or(EngineError::TransportClosed)?;
            if let Some(result) = self.handle_search_line(&line, latest)? {
                return Ok(result);
            }
        }
    }

    fn handle_search_line(
        &mut self,
        line: &str,
        latest: &mut AnalysisSnapshot,
    ) -> EngineResult<Option<AnalysisResult>> {
        self.logs.push(EngineLog::Engine(line.to_string()));

        match parse_one(line) {
            UciMessage::Info(attrs) => {
                if let Some(snapshot) = self.snapshot_from_attrs(attrs) {
                    *latest = snapshot.clone();
                    if let Some(tap) = &self.progress_tap {
                        if tap.send(snapshot.clone()).is_err() {
                            self.progress_tap = None;
                        }
                    }
                    if self.should_emit_progress() {
                        self.events.emit(EngineEvent::AnalysisProgress {
                            depth: snapshot.depth,
                            evaluation: snapshot.evaluation,
                        });
                        self.last_progress_event = Some(Instant::now());
                    }
                }
                Ok(None)
            }
            UciMessage::BestMove { best_move, .. } => {
                let token = best_move.to_string();
                let decoded = EngineMove::from_token(&token)?;
                Ok(Some(AnalysisResult {
                    best_move: decoded,
                    evaluation: latest.evaluation,
                    depth: latest.depth,
                    nodes: latest.nodes,
                    pv: latest.pv.clone(),
                }))
            }
            // Unrecognized lines are ignored, not errors.
            _ => Ok(None),
        }
    }

    fn snapshot_from_attrs(&self, attrs: Vec<UciInfoAttribute>) -> Option<AnalysisSnapshot> {
        let mut snapshot = AnalysisSnapshot::default();
        let mut seen_any = false;

        for attr in attrs {
            match attr {
                UciInfoAttribute::Depth(depth) => {
                    snapshot.depth = depth as u32;
                    seen_any = true;
                }
                UciInfoAttribute::Nodes(nodes) => {
                    snapshot.nodes = nodes as u64;
                    seen_any = true;
                }
                UciInfoAttribute::Pv(moves) => {
                    snapshot.pv = moves.iter().map(|m| m.to_string()).collect();
                    seen_any = true;
                }
                UciInfoAttribute::Score { cp, mate, .. } => {
                    // Mate distances stay distinct from centipawns; collapsing
                    // them into one number loses what callers need.
                    if let Some(mate) = mate {
                        snapshot.evaluation = Evaluation::MateIn(mate as i32);
                    } else if let Some(cp) = cp {
                        snapshot.evaluation = Evaluation::Centipawns(cp as i32);
                    }
                    seen_any = true;
                }
                _ => {}
            }
        }

        if !seen_any {
            return None;
        }
        if self.side_to_move == Color::Black {
            snapshot.evaluation = snapshot.evaluation.flipped();
        }
        Some(snapshot)
    }

    fn should_emit_progress(&self) -> bool {
        self.last_progress_event
            .map_or(true, |t| t.elapsed() >= MIN_EVENT_INTERVAL)
    }

    fn send(&mut self, line: &str) -> EngineResult<()> {
        self.transport.send(line)?;
        self.logs.push(EngineLog::Gui(line.to_string()));
        Ok(())
    }

    fn expect_state(&self, expected: SessionState) -> EngineResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn fail_fatally(&mut self, e: &EngineError) {
        warn!("Session failed fatally: {}", e);
        self.state = SessionState::Shutdown;
        self.analyzing.store(false, Ordering::SeqCst);
        self.events.emit(EngineEvent::Error {
            reason: e.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfiguration;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    const STARTPOS: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    fn scripted_session() -> (
        EngineSession,
        UnboundedReceiver<String>,
        UnboundedSender<String>,
    ) {
        let (transport, commands, lines) = ProcessTransport::scripted();
        (EngineSession::new(transport, EventBus::new()), commands, lines)
    }

    /// Script task speaking the handshake and answering `go` with the given
    /// response lines.
    fn spawn_handshake_script(
        mut commands: UnboundedReceiver<String>,
        lines: UnboundedSender<String>,
        go_replies: Vec<&'static str>,
    ) {
        tokio::spawn(async move {
            while let Some(cmd) = commands.recv().await {
                let cmd = cmd.trim().to_string();
                if cmd == "uci" {
                    let _ = lines.send("id name scripted".to_string());
                    let _ = lines.send("uciok".to_string());
                } else if cmd == "isready" {
                    let _ = lines.send("readyok".to_string());
                } else if cmd.starts_with("go") {
                    for reply in &go_replies {
                        let _ = lines.send(reply.to_string());
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn test_handshake_in_order_reaches_ready() {
        let (mut session, commands, lines) = scripted_session();
        spawn_handshake_script(commands, lines, Vec::new());

        session.initialize(Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_reversed_acks_never_report_ready() {
        let (mut session, mut commands, lines) = scripted_session();
        tokio::spawn(async move {
            // readyok first is a protocol violation; after the real uciok no
            // further readyok ever comes, so the handshake must time out.
            while let Some(cmd) = commands.recv().await {
                if cmd.trim() == "uci" {
                    let _ = lines.send("readyok".to_string());
                    let _ = lines.send("uciok".to_string());
                }
            }
        });

        let result = session.initialize(Duration::from_millis(300)).await;
        assert!(matches!(result, Err(EngineError::HandshakeTimeout)));
        assert_ne!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_initialize_times_out_close_to_budget() {
        let (mut session, _commands, _lines) = scripted_session();

        let budget = Duration::from_millis(300);
        let started = Instant::now();
        let result = session.initialize(budget).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(EngineError::HandshakeTimeout)));
        assert!(elapsed >= budget, "failed early at {:?}", elapsed);
        assert!(
            elapsed < budget + Duration::from_millis(500),
            "failed late at {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_transport_close_during_handshake_is_fatal() {
        let (mut session, commands, lines) = scripted_session();
        drop(commands);
        drop(lines);

        let result = session.initialize(Duration::from_secs(1)).await;
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Shutdown);
    }

    #[tokio::test]
    async fn test_search_resolves_on_bestmove_with_snapshot() {
        let (mut session, commands, lines) = scripted_session();
        spawn_handshake_script(
            commands,
            lines,
            vec![
                "info depth 1 score cp 10 nodes 50 pv e2e4",
                "info depth 2 score cp 34 nodes 1200 pv e2e4 e7e5",
                "bestmove e2e4 ponder e7e5",
            ],
        );

        session.initialize(Duration::from_secs(1)).await.unwrap();
        session.set_position(STARTPOS).await.unwrap();
        session
            .apply_configuration(EngineConfiguration::for_rating(400))
            .await
            .unwrap();
        let mut stream = session.analysis_stream();

        let result = session.search(Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.best_move.to_string(), "e2e4");
        assert_eq!(result.depth, 2);
        assert_eq!(result.nodes, 1200);
        assert_eq!(result.evaluation, Evaluation::Centipawns(34));
        assert_eq!(result.pv, vec!["e2e4".to_string(), "e7e5".to_string()]);
        assert_eq!(session.state(), SessionState::Ready);

        // Finite stream: snapshots, then closed at bestmove.
        assert_eq!(stream.recv().await.unwrap().depth, 1);
        assert_eq!(stream.recv().await.unwrap().depth, 2);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mate_score_stays_distinct_from_centipawns() {
        let (mut session, commands, lines) = scripted_session();
        spawn_handshake_script(
            commands,
            lines,
            vec![
                "info depth 5 score mate 3 nodes 900 pv d1h5",
                "bestmove d1h5",
            ],
        );

        session.initialize(Duration::from_secs(1)).await.unwrap();
        session.set_position(STARTPOS).await.unwrap();
        let result = session.search(Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.evaluation, Evaluation::MateIn(3));
    }

    #[tokio::test]
    async fn test_black_to_move_score_is_flipped_to_white_perspective() {
        let (mut session, commands, lines) = scripted_session();
        spawn_handshake_script(
            commands,
            lines,
            vec!["info depth 3 score cp 50 nodes 10 pv e7e5", "bestmove e7e5"],
        );

        session.initialize(Duration::from_secs(1)).await.unwrap();
        session
            .set_position("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1")
            .await
            .unwrap();
        let result = session.search(Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.evaluation, Evaluation::Centipawns(-50));
    }

    #[tokio::test]
    async fn test_search_timeout_recovers_and_discards_late_reply() {
        let (mut session, mut commands, lines) = scripted_session();
        let lines_for_script = lines.clone();
        tokio::spawn(async move {
            let mut go_count = 0u32;
            while let Some(cmd) = commands.recv().await {
                let cmd = cmd.trim().to_string();
                if cmd == "uci" {
                    let _ = lines_for_script.send("uciok".to_string());
                } else if cmd == "isready" {
                    let _ = lines_for_script.send("readyok".to_string());
                } else if cmd.starts_with("go") {
                    go_count += 1;
                    // First search: stay silent so it times out. Second
                    // search: answer normally.
                    if go_count == 2 {
                        let _ = lines_for_script
                            .send("info depth 2 score cp 1 nodes 5 pv g1f3".to_string());
                        let _ = lines_for_script.send("bestmove g1f3".to_string());
                    }
                }
            }
        });

        session.initialize(Duration::from_secs(1)).await.unwrap();
        session.set_position(STARTPOS).await.unwrap();

        let result = session.search(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(EngineError::SearchTimeout)));
        assert_eq!(session.state(), SessionState::Ready);

        // Late reply to the first search lands in the buffer now; the next
        // search must drain it rather than resolve with it.
        lines.send("bestmove a2a3".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = session.search(Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.best_move.to_string(), "g1f3");
    }

    #[tokio::test]
    async fn test_deadline_stop_reply_keeps_pre_deadline_info() {
        let (mut session, mut commands, lines) = scripted_session();
        tokio::spawn(async move {
            // Engine that keeps thinking past the deadline and only produces
            // its bestmove in reply to stop, the way real engines do.
            while let Some(cmd) = commands.recv().await {
                let cmd = cmd.trim().to_string();
                if cmd == "uci" {
                    let _ = lines.send("uciok".to_string());
                } else if cmd == "isready" {
                    let _ = lines.send("readyok".to_string());
                } else if cmd.starts_with("go") {
                    let _ =
                        lines.send("info depth 5 score cp 42 nodes 999 pv e2e4".to_string());
                } else if cmd == "stop" {
                    let _ = lines.send("bestmove e2e4".to_string());
                }
            }
        });

        session.initialize(Duration::from_secs(1)).await.unwrap();
        session.set_position(STARTPOS).await.unwrap();

        let result = session.search(Duration::from_millis(150)).await.unwrap();
        assert_eq!(result.best_move.to_string(), "e2e4");
        // Info reported before the deadline must back the result, not be
        // replaced by zeroed defaults.
        assert_eq!(result.depth, 5);
        assert_eq!(result.evaluation, Evaluation::Centipawns(42));
        assert_eq!(result.nodes, 999);
        assert_eq!(result.pv, vec!["e2e4".to_string()]);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_cancel_resolves_with_engine_stop_reply() {
        let (mut session, mut commands, lines) = scripted_session();
        tokio::spawn(async move {
            while let Some(cmd) = commands.recv().await {
                let cmd = cmd.trim().to_string();
                if cmd == "uci" {
                    let _ = lines.send("uciok".to_string());
                } else if cmd == "isready" {
                    let _ = lines.send("readyok".to_string());
                } else if cmd == "stop" {
                    let _ = lines.send("bestmove b1c3".to_string());
                }
                // go: think forever until stopped
            }
        });

        session.initialize(Duration::from_secs(1)).await.unwrap();
        session.set_position(STARTPOS).await.unwrap();

        let handle = session.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let result = session.search(Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.best_move.to_string(), "b1c3");
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_cancel_with_unresponsive_engine_resolves_cancelled() {
        let (mut session, commands, lines) = scripted_session();
        spawn_handshake_script(commands, lines, Vec::new());

        session.initialize(Duration::from_secs(1)).await.unwrap();
        session.set_position(STARTPOS).await.unwrap();

        let handle = session.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let result = session.search(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        // Force-resolved after the bounded grace, not after the deadline.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let (mut session, commands, lines) = scripted_session();
        spawn_handshake_script(
            commands,
            lines,
            vec!["info depth 1 score cp 0 nodes 1 pv e2e4", "bestmove e2e4"],
        );

        let handle = session.cancel_handle();
        handle.cancel();
        handle.cancel();

        session.initialize(Duration::from_secs(1)).await.unwrap();
        session.set_position(STARTPOS).await.unwrap();
        let result = session.search(Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.best_move.to_string(), "e2e4");
    }

    #[tokio::test]
    async fn test_search_rejected_before_initialization() {
        let (mut session, _commands, _lines) = scripted_session();
        let result = session.search(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(EngineError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_set_position_rejects_garbage_fen() {
        let (mut session, commands, lines) = scripted_session();
        spawn_handshake_script(commands, lines, Vec::new());
        session.initialize(Duration::from_secs(1)).await.unwrap();

        assert!(session.set_position("not a fen").await.is_err());
    }

    #[test]
    fn test_move_token_decode() {
        let mv = EngineMove::from_token("e7e8q").unwrap();
        assert_eq!(mv.from, Square::E7);
        assert_eq!(mv.to, Square::E8);
        assert_eq!(mv.promotion, Some(Role::Queen));

        let mv = EngineMove::from_token("g1f3").unwrap();
        assert_eq!(mv.from, Square::G1);
        assert_eq!(mv.to, Square::F3);
        assert_eq!(mv.promotion, None);

        assert!(EngineMove::from_token("zz99").is_err());
        assert!(EngineMove::from_token("0000").is_err());
    }

    #[test]
    fn test_evaluation_serializes_with_kind_tag() {
        let mate = serde_json::to_string(&Evaluation::MateIn(3)).unwrap();
        assert!(mate.contains("mateIn"));
        let cp = serde_json::to_string(&Evaluation::Centipawns(300)).unwrap();
        assert!(cp.contains("centipawns"));
        assert_ne!(mate, cp);
    }
}

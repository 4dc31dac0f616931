//! Events and status produced for the UI/chat layer.
//!
//! The coordinator never pushes results through callbacks registered by other
//! components; instead it emits `EngineEvent`s on a broadcast bus that any
//! number of consumers may subscribe to. Search results themselves travel on
//! the request future, not on the bus.

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::session::Evaluation;

/// Subscribable events emitted by the coordinator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum EngineEvent {
    /// Handshake completed, engine accepts requests.
    Ready,
    /// Subsystem-level failure; engine-dependent controls should degrade.
    Error { reason: String },
    /// A search was started on behalf of the game session.
    Thinking,
    /// The engine's move was applied to the board.
    MoveMade { uci: String },
    /// Live search progress for status displays.
    AnalysisProgress { depth: u32, evaluation: Evaluation },
    /// A full-strength hint search completed.
    HintReady {
        uci: String,
        from: String,
        to: String,
    },
}

/// Snapshot of the coordinator exposed to the UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub ready: bool,
    pub analyzing: bool,
    pub playing_as_engine: bool,
    pub engine_color: Option<String>,
    pub configured_rating: u32,
}

/// Log entry for GUI-to-engine or engine-to-GUI traffic.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum EngineLog {
    Gui(String),
    Engine(String),
}

/// Broadcast bus for [`EngineEvent`].
///
/// Cloning the bus shares the underlying channel. Lagging subscribers drop
/// old events rather than applying backpressure to the engine conversation.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers. Emission with no
    /// subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        debug!("Emitting event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

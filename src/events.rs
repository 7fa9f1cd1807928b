//! Observation events emitted by the server.
//!
//! Consumers (the CLI logger, test harnesses) subscribe through
//! [`EventBus::subscribe`]; the core never blocks on slow subscribers.

use tokio::sync::broadcast;
use uuid::Uuid;

/// How an inbound request's lifecycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The response was written to completion.
    Finished,
    /// The client went away before the response completed.
    ClosedEarly,
}

/// Events emitted for observation and logging.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The resolved set of absolute glob patterns being watched.
    MockGlobs(Vec<String>),
    /// A watched file changed and its registry entry was reloaded or removed.
    MockUpdated(String),
    /// The initial scan completed; emitted exactly once.
    Loaded,
    /// A non-fatal or startup-fatal error.
    Error(String),
    /// An inbound request entered the mock pipeline.
    MockStart {
        correlation_id: Uuid,
        method: String,
        url: String,
    },
    /// An inbound request's response lifecycle ended.
    MockEnd {
        correlation_id: Uuid,
        outcome: RequestOutcome,
        url: String,
    },
    /// An upstream proxy call returned.
    ProxyResponse { correlation_id: Uuid, status: u16 },
}

/// Broadcast hub for [`ServerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Subscribe to all events emitted from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Dropped silently when nobody is listening.
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

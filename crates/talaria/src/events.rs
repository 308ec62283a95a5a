//! Structured scan events.
//!
//! The orchestrator publishes these on a best-effort basis; the presentation
//! layer may subscribe to fan them out to browsers. Nothing in the engine
//! depends on anyone listening.

use serde::Serialize;
use tokio::sync::broadcast;

/// Events emitted over the course of a scan.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    ScanStarted,
    TargetSkipped {
        service: String,
    },
    UpdateFound {
        service: String,
        change: String,
    },
    CommitPushed {
        commit_hash: String,
        update_count: usize,
    },
    ScanCompleted {
        update_count: usize,
    },
    ScanFailed {
        message: String,
    },
}

/// Publish-subscribe sink for [`ScanEvent`]s.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<ScanEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }

    /// Send an event to whoever is listening. A send with no subscribers is
    /// not an error.
    pub fn publish(&self, event: ScanEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

//! Server status and the typed events the fleet publishes.
//!
//! Subscribers get a `tokio::sync::broadcast` receiver. Publishing never
//! blocks; a subscriber that falls behind sees `RecvError::Lagged`.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::protocol::JsonRpcNotification;

/// Lifecycle state of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Reported by the manager for ids it does not know.
    NotFound,
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened in the fleet.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    StatusChanged {
        server_id: String,
        old: ServerStatus,
        new: ServerStatus,
    },
    Error {
        server_id: String,
        message: String,
    },
    RestartScheduled {
        server_id: String,
        attempt: u32,
    },
    RestartExhausted {
        server_id: String,
        attempts: u32,
    },
    /// A notification pushed by a running server.
    Notification {
        server_id: String,
        notification: JsonRpcNotification,
    },
    ServersDiscovered {
        files: usize,
        server_ids: Vec<String>,
    },
    DiscoveryFailed {
        path: PathBuf,
        message: String,
    },
}

impl FleetEvent {
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::StatusChanged { server_id, .. }
            | Self::Error { server_id, .. }
            | Self::RestartScheduled { server_id, .. }
            | Self::RestartExhausted { server_id, .. }
            | Self::Notification { server_id, .. } => Some(server_id),
            Self::ServersDiscovered { .. } | Self::DiscoveryFailed { .. } => None,
        }
    }
}

/// Cloneable publishing side of the fleet event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: FleetEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn status_changed(&self, server_id: &str, old: ServerStatus, new: ServerStatus) {
        if old != new {
            self.emit(FleetEvent::StatusChanged {
                server_id: server_id.to_string(),
                old,
                new,
            });
        }
    }

    pub(crate) fn error(&self, server_id: &str, message: impl Into<String>) {
        self.emit(FleetEvent::Error {
            server_id: server_id.to_string(),
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_silent() {
        let sink = EventSink::new(4);
        sink.error("a", "boom");
    }

    #[tokio::test]
    async fn unchanged_status_is_not_published() {
        let sink = EventSink::new(4);
        let mut rx = sink.subscribe();
        sink.status_changed("a", ServerStatus::Running, ServerStatus::Running);
        sink.status_changed("a", ServerStatus::Running, ServerStatus::Error);

        match rx.recv().await.unwrap() {
            FleetEvent::StatusChanged { old, new, .. } => {
                assert_eq!(old, ServerStatus::Running);
                assert_eq!(new, ServerStatus::Error);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn status_display() {
        assert_eq!(ServerStatus::NotFound.to_string(), "not found");
        assert_eq!(ServerStatus::Running.to_string(), "running");
    }
}

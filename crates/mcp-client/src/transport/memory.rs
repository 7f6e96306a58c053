//! In-process transport: a pair of channels standing in for a pipe.
//!
//! Used to host an MCP server inside the same process (see
//! [`crate::server`]) and by the test suites to script server behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{EventSender, Transport, TransportError, TransportEvent};
use crate::protocol::JsonRpcMessage;

/// Client side of an in-process connection.
pub struct InProcessTransport {
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    inbound: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    forwarder: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Server side of an in-process connection.
pub struct InProcessServerEnd {
    /// Frames written by the client.
    pub incoming: mpsc::UnboundedReceiver<JsonRpcMessage>,
    /// Frames delivered to the client.
    pub outgoing: mpsc::UnboundedSender<JsonRpcMessage>,
}

impl InProcessServerEnd {
    pub async fn recv(&mut self) -> Option<JsonRpcMessage> {
        self.incoming.recv().await
    }

    /// Returns false once the client side is gone.
    pub fn send(&self, message: impl Into<JsonRpcMessage>) -> bool {
        self.outgoing.send(message.into()).is_ok()
    }
}

impl InProcessTransport {
    /// Create a connected pair of endpoints.
    pub fn pair() -> (Self, InProcessServerEnd) {
        let (to_server, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_server) = mpsc::unbounded_channel();
        let transport = Self {
            outbound: parking_lot::Mutex::new(Some(to_server)),
            inbound: parking_lot::Mutex::new(Some(from_server)),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            forwarder: parking_lot::Mutex::new(None),
        };
        (transport, InProcessServerEnd { incoming, outgoing })
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn connect(&self, events: EventSender, _cancel: &CancellationToken) -> Result<(), TransportError> {
        let Some(mut inbound) = self.inbound.lock().take() else {
            return Err(TransportError::AlreadyConnected);
        };
        let connected = self.connected.clone();
        let shutdown = self.shutdown.clone();
        connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    next = inbound.recv() => next,
                };
                match next {
                    Some(message) => {
                        if events.send(TransportEvent::Message(message)).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = events
                            .send(TransportEvent::Error(TransportError::ConnectionClosed(
                                "in-process server closed".into(),
                            )))
                            .await;
                        return;
                    }
                }
            }
        });
        *self.forwarder.lock() = Some(task);
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage, cancel: &CancellationToken) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(message.clone())
            .map_err(|_| TransportError::ConnectionClosed("in-process server closed".into()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        // Dropping the sender ends the server's receive loop.
        self.outbound.lock().take();
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "in-process"
    }
}

impl Drop for InProcessTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.forwarder.get_mut().take() {
            task.abort();
        }
    }
}

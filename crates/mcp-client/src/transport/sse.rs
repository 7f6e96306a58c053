//! SSE transport: server-sent events in, HTTP POST out.
//!
//! `connect` opens a `GET` on the event stream and keeps it open. Events
//! named `message` (or unnamed) carry JSON-RPC frames; an `endpoint` event
//! announces where frames should be POSTed. Until one arrives, frames go to
//! `{base}/message`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{EventSender, Transport, TransportError, TransportEvent};
use crate::protocol::JsonRpcMessage;

pub struct SseTransport {
    stream_url: Url,
    post_url: Arc<parking_lot::RwLock<Url>>,
    http: reqwest::Client,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    /// Kept so inline JSON replies to a POST reach the client too.
    events: parking_lot::Mutex<Option<EventSender>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// `url` is either the event-stream endpoint itself (path ending in
    /// `/sse`) or a base URL, in which case `/sse` is appended.
    pub fn new(url: &str, http: reqwest::Client) -> Result<Self, TransportError> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| TransportError::ConnectFailed(format!("invalid url '{url}': {e}")))?;
        let stream_url = stream_endpoint(&parsed)?;
        let post_url = stream_url
            .join("message")
            .map_err(|e| TransportError::ConnectFailed(format!("invalid url '{url}': {e}")))?;

        Ok(Self {
            stream_url,
            post_url: Arc::new(parking_lot::RwLock::new(post_url)),
            http,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            events: parking_lot::Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
        })
    }

    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    pub fn post_url(&self) -> Url {
        self.post_url.read().clone()
    }
}

fn stream_endpoint(url: &Url) -> Result<Url, TransportError> {
    let path = url.path().trim_end_matches('/');
    if path.ends_with("/sse") {
        return Ok(url.clone());
    }
    let mut base = url.clone();
    base.set_path(&format!("{path}/"));
    base.join("sse")
        .map_err(|e| TransportError::ConnectFailed(format!("invalid url '{url}': {e}")))
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self, events: EventSender, cancel: &CancellationToken) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        if self.shutdown.is_cancelled() {
            return Err(TransportError::ConnectFailed("transport was already closed".into()));
        }

        tracing::debug!(url = %self.stream_url, "opening MCP event stream");
        let request = self
            .http
            .get(self.stream_url.clone())
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = tokio::select! {
            r = request => r.map_err(|e| TransportError::ConnectFailed(e.to_string()))?,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };
        if !response.status().is_success() {
            return Err(TransportError::ConnectFailed(format!(
                "GET {} returned {}",
                self.stream_url,
                response.status()
            )));
        }

        *self.events.lock() = Some(events.clone());
        self.connected.store(true, Ordering::SeqCst);
        let task = tokio::spawn(read_event_stream(
            response,
            events,
            self.stream_url.clone(),
            self.post_url.clone(),
            self.connected.clone(),
            self.shutdown.clone(),
        ));
        *self.reader.lock() = Some(task);
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage, cancel: &CancellationToken) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let url = self.post_url();
        let request = self.http.post(url.clone()).json(message).send();
        let response = tokio::select! {
            r = request => r?,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("POST {url} returned {status}")));
        }

        // Some servers answer inline instead of over the stream.
        let inline_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        if inline_json {
            let body = response.text().await?;
            if !body.trim().is_empty() {
                let event = match JsonRpcMessage::parse(&body) {
                    Ok(m) => TransportEvent::Message(m),
                    Err(e) => TransportEvent::Error(TransportError::Malformed {
                        frame: body.chars().take(200).collect(),
                        reason: e.to_string(),
                    }),
                };
                let events = self.events.lock().clone();
                if let Some(events) = events {
                    let _ = events.send(event).await;
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.events.lock().take();
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "sse"
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.reader.get_mut().take() {
            task.abort();
        }
    }
}

async fn read_event_stream(
    mut response: reqwest::Response,
    events: EventSender,
    stream_url: Url,
    post_url: Arc<parking_lot::RwLock<Url>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut buffer: Vec<u8> = Vec::new();

    let reason = loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => return,
            chunk = response.chunk() => chunk,
        };
        match chunk {
            Ok(Some(bytes)) => {
                buffer.extend_from_slice(&bytes);
                for event in drain_events(&mut buffer) {
                    match event.event.as_str() {
                        "endpoint" => match stream_url.join(event.data.trim()) {
                            Ok(url) => {
                                tracing::debug!(url = %url, "MCP server announced message endpoint");
                                *post_url.write() = url;
                            }
                            Err(e) => {
                                tracing::warn!(data = %event.data, error = %e, "ignoring bad endpoint event");
                            }
                        },
                        "" | "message" => {
                            let item = match JsonRpcMessage::parse(&event.data) {
                                Ok(m) => TransportEvent::Message(m),
                                Err(e) => TransportEvent::Error(TransportError::Malformed {
                                    frame: event.data.chars().take(200).collect(),
                                    reason: e.to_string(),
                                }),
                            };
                            if events.send(item).await.is_err() {
                                return;
                            }
                        }
                        other => {
                            tracing::debug!(event = %other, "ignoring SSE event");
                        }
                    }
                }
            }
            Ok(None) => break "event stream ended".to_string(),
            Err(e) => break format!("event stream failed: {e}"),
        }
    };

    if shutdown.is_cancelled() {
        return;
    }
    connected.store(false, Ordering::SeqCst);
    tracing::warn!(url = %stream_url, reason = %reason, "MCP event stream closed");
    let _ = events
        .send(TransportEvent::Error(TransportError::ConnectionClosed(reason)))
        .await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One complete server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    /// Value of the `event:` line, empty when absent.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Extract complete events from a raw SSE byte buffer.
///
/// Events are delimited by a blank line (`\n\n` or `\r\n\r\n`). The buffer
/// is drained in-place: consumed bytes are removed and any trailing partial
/// event remains for the next call. Only complete events are decoded, so a
/// UTF-8 sequence split across network chunks survives intact. Events
/// without data and comment lines are dropped.
pub(crate) fn drain_events(buffer: &mut Vec<u8>) -> Vec<SseEvent> {
    let mut events = Vec::new();

    while let Some((end, delimiter)) = event_boundary(buffer) {
        let raw: Vec<u8> = buffer.drain(..end + delimiter).collect();
        let block = String::from_utf8_lossy(&raw[..end]);

        let mut name = String::new();
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(value) = line.strip_prefix("data:") {
                data.push(value.strip_prefix(' ').unwrap_or(value));
            } else if let Some(value) = line.strip_prefix("event:") {
                name = value.trim().to_string();
            }
        }
        if !data.is_empty() {
            events.push(SseEvent {
                event: name,
                data: data.join("\n"),
            });
        }
    }

    events
}

/// Offset and length of the first blank-line delimiter in `buffer`.
fn event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    (0..buffer.len()).find_map(|i| {
        let rest = &buffer[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\n\r\n") {
            Some((i, 3))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_named_event() {
        let mut buf = b"event: message\ndata: {\"hello\":\"world\"}\n\n".to_vec();
        let events = drain_events(&mut buf);
        assert_eq!(
            events,
            vec![SseEvent {
                event: "message".into(),
                data: "{\"hello\":\"world\"}".into()
            }]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_multiple_events() {
        let mut buf = b"data: first\n\nevent: endpoint\ndata: /message?sessionId=1\n\n".to_vec();
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "");
        assert_eq!(events[1].event, "endpoint");
        assert_eq!(events[1].data, "/message?sessionId=1");
    }

    #[test]
    fn drain_partial_event_stays_in_buffer() {
        let mut buf = b"data: complete\n\ndata: partial".to_vec();
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(buf, b"data: partial");
    }

    #[test]
    fn drain_joins_multiline_data_and_skips_comments() {
        let mut buf = b": keepalive\n\ndata: line one\ndata: line two\nid: 3\n\n".to_vec();
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn drain_incremental_buffering() {
        let mut buf = b"data: chunk1".to_vec();
        assert!(drain_events(&mut buf).is_empty());
        buf.extend_from_slice(b"\n\ndata: chunk2\n\n");
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn multibyte_character_split_across_chunks_survives() {
        let frame = "data: {\"text\":\"café\"}\n\n".as_bytes();
        let split = frame.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut buf = frame[..split].to_vec();
        assert!(drain_events(&mut buf).is_empty());
        buf.extend_from_slice(&frame[split..]);
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"café\"}");
    }

    #[test]
    fn crlf_delimiter_split_across_chunks() {
        let mut buf = b"event: message\r\ndata: one\r".to_vec();
        assert!(drain_events(&mut buf).is_empty());
        buf.extend_from_slice(b"\n\r\ndata: two\r\n\r\n");
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
        assert!(buf.is_empty());
    }

    #[test]
    fn base_url_gets_sse_suffix() {
        let t = SseTransport::new("http://localhost:8080", reqwest::Client::new()).unwrap();
        assert_eq!(t.stream_url().as_str(), "http://localhost:8080/sse");
        assert_eq!(t.post_url().as_str(), "http://localhost:8080/message");

        let t = SseTransport::new("http://localhost:8080/api/", reqwest::Client::new()).unwrap();
        assert_eq!(t.stream_url().as_str(), "http://localhost:8080/api/sse");
        assert_eq!(t.post_url().as_str(), "http://localhost:8080/api/message");
    }

    #[test]
    fn explicit_sse_url_is_kept() {
        let t = SseTransport::new("http://localhost:8080/mcp/sse", reqwest::Client::new()).unwrap();
        assert_eq!(t.stream_url().as_str(), "http://localhost:8080/mcp/sse");
        assert_eq!(t.post_url().as_str(), "http://localhost:8080/mcp/message");
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(SseTransport::new("not a url", reqwest::Client::new()).is_err());
    }
}

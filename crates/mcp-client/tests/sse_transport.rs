use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mf_domain::config::ServerConfig;
use mf_mcp_client::protocol::{
    Implementation, JsonRpcError, JsonRpcMessage, McpToolDef, ServerCapabilities, ToolCallContent, ToolCallResult,
};
use mf_mcp_client::server::{handle_request, rpc_error, McpServerHandler};
use mf_mcp_client::transport::{SseTransport, Transport, TransportEvent};
use mf_mcp_client::{ClientOptions, FleetEvent, FleetManager, FleetOptions, McpClient, ServerStatus};

struct Echo;

#[async_trait]
impl McpServerHandler for Echo {
    fn server_info(&self) -> Implementation {
        Implementation {
            name: "echo".into(),
            version: "2.0.0".into(),
        }
    }

    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities::default()
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>, JsonRpcError> {
        Ok(vec![McpToolDef {
            name: "echo".into(),
            description: "Echo the text argument".into(),
            input_schema: json!({ "type": "object", "properties": { "text": { "type": "string" } } }),
        }])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, JsonRpcError> {
        if name != "echo" {
            return Err(rpc_error(-32602, format!("unknown tool: {name}")));
        }
        let text = arguments.get("text").and_then(Value::as_str).unwrap_or_default();
        Ok(ToolCallResult {
            content: vec![ToolCallContent::text(text)],
            is_error: false,
        })
    }
}

/// Minimal SSE MCP endpoint. Replies go over the event stream unless
/// `inline` is set, in which case they are returned as the POST body.
#[derive(Clone)]
struct TestServer {
    inline: bool,
    stream: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    sessions: Arc<Mutex<Vec<Option<String>>>>,
}

impl TestServer {
    fn new(inline: bool) -> Self {
        Self {
            inline,
            stream: Arc::new(Mutex::new(None)),
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// End the event stream from the server side.
    fn hang_up(&self) {
        self.stream.lock().take();
    }
}

async fn open_stream(State(server): State<TestServer>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<String>(16);
    *server.stream.lock() = Some(tx);

    let endpoint = stream::once(async {
        Ok::<_, Infallible>(Event::default().event("endpoint").data("/mcp/messages?session=1"))
    });
    let frames = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(Event::default().event("message").data(frame)), rx))
    });
    Sse::new(endpoint.chain(frames))
}

async fn post_message(
    State(server): State<TestServer>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    server.sessions.lock().push(query.get("session").cloned());

    let Ok(JsonRpcMessage::Request(request)) = JsonRpcMessage::parse(&body) else {
        return StatusCode::ACCEPTED.into_response();
    };
    let response = handle_request(&Echo, request).await;
    if server.inline {
        return Json(response).into_response();
    }

    let frame = serde_json::to_string(&response).unwrap();
    let tx = server.stream.lock().clone();
    if let Some(tx) = tx {
        let _ = tx.send(frame).await;
    }
    StatusCode::ACCEPTED.into_response()
}

/// One notification whose "é" is split between two network writes.
async fn split_stream() -> Response {
    let frame = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"text\":\"café\"}}\n\n";
    let bytes = frame.as_bytes();
    let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;
    let chunks = vec![bytes[..split].to_vec(), bytes[split..].to_vec()];
    let body = stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, Infallible>(chunk)
    });
    ([(header::CONTENT_TYPE, "text/event-stream")], Body::from_stream(body)).into_response()
}

async fn spawn_server(server: TestServer) -> SocketAddr {
    let app = Router::new()
        .route("/mcp/sse", get(open_stream))
        .route("/split/sse", get(split_stream))
        .route("/mcp/message", post(post_message))
        .route("/mcp/messages", post(post_message))
        .with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client_for(addr: SocketAddr) -> McpClient {
    let transport = SseTransport::new(&format!("http://{addr}/mcp"), reqwest::Client::new()).unwrap();
    McpClient::new(Box::new(transport), ClientOptions::default())
}

#[tokio::test]
async fn replies_over_the_event_stream() {
    let server = TestServer::new(false);
    let addr = spawn_server(server.clone()).await;
    let client = client_for(addr);
    let cancel = CancellationToken::new();

    let init = client.connect(&cancel).await.unwrap();
    assert_eq!(init.server_info.map(|i| i.name).as_deref(), Some("echo"));

    let tools = client.list_tools(&cancel).await.unwrap();
    assert_eq!(tools[0].name, "echo");

    let result = client
        .call_tool("echo", json!({ "text": "over sse" }), &cancel)
        .await
        .unwrap();
    assert_eq!(result.first_text(), Some("over sse"));

    // Once announced, the endpoint event's URL is used for every POST.
    let last = server.sessions.lock().last().cloned().flatten();
    assert_eq!(last.as_deref(), Some("1"));
    client.close().await.unwrap();
}

#[tokio::test]
async fn inline_post_replies_are_accepted() {
    let addr = spawn_server(TestServer::new(true)).await;
    let client = client_for(addr);
    let cancel = CancellationToken::new();

    client.connect(&cancel).await.unwrap();
    let result = client
        .call_tool("echo", json!({ "text": "inline" }), &cancel)
        .await
        .unwrap();
    assert_eq!(result.first_text(), Some("inline"));
    client.close().await.unwrap();
}

#[tokio::test]
async fn fleet_marks_server_errored_when_stream_ends() {
    let server = TestServer::new(false);
    let addr = spawn_server(server.clone()).await;
    let fleet = FleetManager::new(FleetOptions::default());
    let mut events = fleet.subscribe();
    let cancel = CancellationToken::new();

    let mut config = ServerConfig::new("remote").with_url(format!("http://{addr}/mcp"));
    config.auto_restart = false;
    fleet.start_server(config, &cancel).await.unwrap();
    assert_eq!(fleet.get_server_status("remote"), ServerStatus::Running);

    server.hang_up();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(FleetEvent::StatusChanged { new: ServerStatus::Error, .. }) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("server never moved to error");
    assert_eq!(fleet.get_server_status("remote"), ServerStatus::Error);
    fleet.shutdown().await;
}

#[tokio::test]
async fn failed_stream_connect_leaves_nothing_registered() {
    let addr = spawn_server(TestServer::new(false)).await;
    let fleet = FleetManager::new(FleetOptions::default());
    let config = ServerConfig::new("missing").with_url(format!("http://{addr}/elsewhere"));

    let result = fleet.start_server(config, &CancellationToken::new()).await;
    assert!(result.is_err());
    assert_eq!(fleet.get_server_status("missing"), ServerStatus::NotFound);
}

#[tokio::test]
async fn characters_split_across_chunks_arrive_intact() {
    let addr = spawn_server(TestServer::new(false)).await;
    let transport = SseTransport::new(&format!("http://{addr}/split/sse"), reqwest::Client::new()).unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    transport.connect(tx, &CancellationToken::new()).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event from the stream")
        .expect("event channel closed");
    let TransportEvent::Message(JsonRpcMessage::Notification(notification)) = event else {
        panic!("expected a notification, got {event:?}");
    };
    assert_eq!(notification.params.unwrap()["text"], "café");
    transport.disconnect().await.unwrap();
}

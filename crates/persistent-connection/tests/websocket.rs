use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use persistent_connection::{
    BoxError, ClientConfig, ConnectParams, Connector, Event, PersistentConnection, Query,
    RepoInfo, TokenProvider, Transport, TransportEvents, WebSocketConnector,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

struct FixedToken(&'static str);

#[async_trait]
impl TokenProvider for FixedToken {
    async fn get_token(&self, _force_refresh: bool) -> Result<Option<String>, BoxError> {
        Ok(Some(self.0.to_string()))
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// What the mock server observed over one connection.
#[derive(Debug)]
struct Observed {
    uri: String,
    authorization: Option<String>,
    actions: Vec<String>,
}

/// Accept one connection, say hello, ack every request, push one data
/// update after the listen, and run until the client closes.
async fn serve_one(listener: TcpListener) -> Observed {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut uri = String::new();
    let mut authorization = None;
    let mut ws = tokio_tungstenite::accept_hdr_async(
        tcp,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            uri = req.uri().to_string();
            authorization = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(resp)
        },
    )
    .await
    .unwrap();

    send_json(
        &mut ws,
        json!({
            "t": "c",
            "d": {"t": "h", "d": {"ts": now_ms(), "v": "5", "h": "127.0.0.1", "s": "sess-9"}}
        }),
    )
    .await;

    let mut actions = Vec::new();
    while let Some(frame) = ws.next().await {
        let text = match frame {
            Ok(tungstenite::Message::Text(text)) => text,
            Ok(tungstenite::Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        if text.as_str() == "0" {
            continue;
        }
        let envelope: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(envelope["t"], "d");
        let request = &envelope["d"];
        let id = request["r"].as_u64().unwrap();
        let action = request["a"].as_str().unwrap().to_string();
        let data = if action == "q" { json!({}) } else { Value::Null };
        send_json(
            &mut ws,
            json!({"t": "d", "d": {"r": id, "b": {"s": "ok", "d": data}}}),
        )
        .await;
        if action == "q" {
            send_json(
                &mut ws,
                json!({"t": "d", "d": {"a": "d", "b": {"p": "/a", "d": "hello"}}}),
            )
            .await;
        }
        actions.push(action);
    }
    Observed {
        uri,
        authorization,
        actions,
    }
}

#[tokio::test]
async fn websocket_connector_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(serve_one(listener));

    let mut repo = RepoInfo::new(format!("127.0.0.1:{port}"), "ns");
    repo.secure = false;
    let config = ClientConfig::new(
        repo,
        Arc::new(WebSocketConnector::default()),
        Arc::new(FixedToken("tok")),
    );
    let mut client = PersistentConnection::new(config);

    let mut status = client.listen(Query::default_at("/a"), String::new, None);
    let first = tokio::time::timeout(Duration::from_secs(10), status.next())
        .await
        .unwrap();
    assert_eq!(first, Some(Ok(json!({}))));

    let update = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match client.next_event().await {
                Some(Event::DataUpdate { path, data, .. }) => return (path, data),
                Some(_) => continue,
                None => panic!("event loop exited"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(update, ("/a".to_string(), json!("hello")));

    client.close();
    let observed = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap();
    assert!(observed.uri.starts_with("/.ws?"), "{}", observed.uri);
    assert!(observed.uri.contains("v=5"));
    assert!(observed.uri.contains("ns=ns"));
    assert_eq!(observed.authorization.as_deref(), Some("Bearer tok"));
    assert_eq!(observed.actions, vec!["s", "gauth", "q"]);
}

/// Delegates to the real connector and counts attempts.
struct Counting {
    inner: WebSocketConnector,
    attempts: Arc<AtomicUsize>,
}

impl Connector for Counting {
    fn connect(&self, params: ConnectParams, events: TransportEvents) -> Box<dyn Transport> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(params, events)
    }
}

#[tokio::test]
async fn refused_connection_is_retried() {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut repo = RepoInfo::new(format!("127.0.0.1:{port}"), "ns");
    repo.secure = false;
    let attempts = Arc::new(AtomicUsize::new(0));
    let config = ClientConfig::new(
        repo,
        Arc::new(Counting {
            inner: WebSocketConnector::default(),
            attempts: Arc::clone(&attempts),
        }),
        Arc::new(FixedToken("tok")),
    );
    let client = PersistentConnection::new(config);
    let mut put = client.put("/x", json!(1), None);

    // First retry waits at most the 1s floor.
    tokio::time::timeout(Duration::from_secs(10), async {
        while attempts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
    // Never sent, so still outstanding.
    assert_eq!(put.try_result(), None);
}

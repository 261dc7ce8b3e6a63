use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_transport::websocket::{ConnectionState, WebSocketConfig, WebSocketTransport};
use agent_transport::{AgentTransport, ErrorKind, InvokeOptions, Params, StreamOptions};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// Minimal capability host. Every request is answered from its own task, so
/// replies come back in completion order rather than request order.
struct Peer {
    url: String,
    connections: Arc<AtomicUsize>,
}

impl Peer {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));

        let accepted = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(tcp));
            }
        });

        Self { url, connections }
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(tcp: TcpStream) {
    let api_key = Arc::new(Mutex::new(None::<String>));
    let captured = Arc::clone(&api_key);
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *captured.lock().unwrap() = req
            .headers()
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        Ok(resp)
    };
    let Ok(socket) = accept_hdr_async(tcp, callback).await else {
        return;
    };

    let (mut sink, mut inbound) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = inbound.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        if capability(&frame) == "hangup" {
            break;
        }
        let key = api_key.lock().unwrap().clone();
        tokio::spawn(respond(frame, key, tx.clone()));
    }
    writer.abort();
}

fn capability(frame: &Value) -> &str {
    frame
        .get("capability")
        .or_else(|| frame.get("method"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

async fn respond(frame: Value, api_key: Option<String>, tx: mpsc::UnboundedSender<Message>) {
    let id = frame["id"].clone();
    let json_rpc = frame.get("jsonrpc").is_some();
    let params = frame["params"].clone();
    let reply = |mut body: Value| {
        body["id"] = id.clone();
        if json_rpc {
            body["jsonrpc"] = json!("2.0");
        }
        tx.send(Message::text(body.to_string())).is_ok()
    };

    match capability(&frame) {
        "echo" => {
            reply(json!({"result": {"params": params, "tenant": frame.get("tenant")}}));
        }
        "whoami" => {
            reply(json!({"result": api_key}));
        }
        "sleep" => {
            let ms = params["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            reply(json!({"result": ms}));
        }
        "count" => {
            for i in 0..params["n"].as_u64().unwrap_or(0) {
                reply(json!({"chunk": i}));
            }
            reply(json!({"complete": true}));
        }
        "tagged" => {
            let tag = params["tag"].as_str().unwrap_or_default().to_owned();
            for i in 0..params["n"].as_u64().unwrap_or(0) {
                reply(json!({"chunk": format!("{tag}-{i}"), "streaming": true}));
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            reply(json!({"complete": true}));
        }
        "count_typed" => {
            reply(json!({"chunk": "only"}));
            reply(json!({"type": "complete"}));
        }
        "drip" => {
            for i in 0..200 {
                if !reply(json!({"chunk": i})) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            reply(json!({"complete": true}));
        }
        "fail" => {
            reply(json!({"error": {"type": "bad_input", "message": "nope"}}));
        }
        "stream_fail" => {
            reply(json!({"chunk": 1}));
            reply(json!({"error": "generator exploded"}));
        }
        "late" => {
            let _ = tx.send(Message::text(
                json!({"id": "not-a-pending-id", "result": "stray"}).to_string(),
            ));
            reply(json!({"result": "on time"}));
        }
        "silent" => {}
        other => {
            reply(json!({"error": {"type": "not_found", "message": format!("unknown capability {other}")}}));
        }
    }
}

fn transport() -> WebSocketTransport {
    WebSocketTransport::new(WebSocketConfig::new().with_protocol("ws")).unwrap()
}

fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

#[tokio::test]
async fn concurrent_calls_share_one_connection_and_resolve_out_of_order() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let call = |ms: u64| {
        transport.invoke(&peer.url, "sleep", params(json!({"ms": ms})), InvokeOptions::new())
    };

    let (slow, fast, medium) = tokio::join!(call(300), call(10), call(150));
    assert_eq!(slow.unwrap(), json!(300));
    assert_eq!(fast.unwrap(), json!(10));
    assert_eq!(medium.unwrap(), json!(150));

    assert_eq!(peer.connections(), 1);
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(transport.pending_requests(), 0);
}

#[tokio::test]
async fn completed_stream_closes_idle_connection() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let chunks: Vec<Value> = transport
        .stream(&peer.url, "count", params(json!({"n": 3})), StreamOptions::new())
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(chunks, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(transport.connected_endpoint(), None);
}

#[tokio::test]
async fn persistent_mode_keeps_connection_for_later_calls() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let chunks: Vec<_> = transport
        .stream(
            &peer.url,
            "count_typed",
            Params::new(),
            StreamOptions::new().with_close_on_complete(false),
        )
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(transport.state(), ConnectionState::Connected);

    let result = transport
        .invoke(&peer.url, "echo", params(json!({"x": 1})), InvokeOptions::new())
        .await
        .unwrap();
    assert_eq!(result["params"], json!({"x": 1}));
    assert_eq!(peer.connections(), 1);
}

#[tokio::test]
async fn remote_errors_fail_only_their_request() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let err = transport
        .invoke(&peer.url, "fail", Params::new(), InvokeOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invocation);
    let remote = err.remote_error().unwrap();
    assert_eq!(remote.kind(), "bad_input");
    assert_eq!(remote.message(), "nope");

    let result = transport
        .invoke(&peer.url, "echo", Params::new(), InvokeOptions::new())
        .await
        .unwrap();
    assert_eq!(result["params"], json!({}));
}

#[tokio::test]
async fn stream_errors_end_the_sequence() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let items: Vec<_> = transport
        .stream(&peer.url, "stream_fail", Params::new(), StreamOptions::new())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), &json!(1));
    assert_eq!(items[1].as_ref().unwrap_err().kind(), ErrorKind::Invocation);
}

#[tokio::test]
async fn timed_out_call_is_removed_from_pending_table() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let err = transport
        .invoke(
            &peer.url,
            "silent",
            Params::new(),
            InvokeOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert_eq!(transport.pending_requests(), 0);
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn abandoned_stream_is_deregistered() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let mut chunks = transport
        .stream(&peer.url, "drip", Params::new(), StreamOptions::new())
        .await
        .unwrap();
    assert_eq!(chunks.next().await.unwrap().unwrap(), json!(0));
    assert_eq!(chunks.next().await.unwrap().unwrap(), json!(1));
    assert_eq!(transport.pending_requests(), 1);

    drop(chunks);
    assert_eq!(transport.pending_requests(), 0);

    // Later chunks for the abandoned id are dropped; the connection stays usable.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let result = transport
        .invoke(&peer.url, "sleep", params(json!({"ms": 1})), InvokeOptions::new())
        .await
        .unwrap();
    assert_eq!(result, json!(1));
}

#[tokio::test]
async fn disconnect_fails_every_pending_request() {
    let peer = Peer::spawn().await;
    let transport = transport();

    let waiting = transport.invoke(
        &peer.url,
        "sleep",
        params(json!({"ms": 5000})),
        InvokeOptions::new(),
    );
    let hangup = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport
            .invoke(&peer.url, "hangup", Params::new(), InvokeOptions::new())
            .await
    };
    let (waiting, hangup) = tokio::join!(waiting, hangup);
    assert_eq!(waiting.unwrap_err().kind(), ErrorKind::Connection);
    assert_eq!(hangup.unwrap_err().kind(), ErrorKind::Connection);
    assert_eq!(transport.pending_requests(), 0);

    let result = transport
        .invoke(&peer.url, "sleep", params(json!({"ms": 1})), InvokeOptions::new())
        .await
        .unwrap();
    assert_eq!(result, json!(1));
    assert_eq!(peer.connections(), 2);
}

#[tokio::test]
async fn frames_for_unknown_ids_are_dropped() {
    let peer = Peer::spawn().await;
    let result = transport()
        .invoke(&peer.url, "late", Params::new(), InvokeOptions::new())
        .await
        .unwrap();
    assert_eq!(result, json!("on time"));
}

#[tokio::test]
async fn json_rpc_framing_and_extra_fields() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let mut extra = Map::new();
    extra.insert("tenant".into(), json!("acme"));
    extra.insert("id".into(), json!("must-not-win"));

    let result = transport
        .invoke(
            &peer.url,
            "echo",
            params(json!({"q": "rust"})),
            InvokeOptions::new()
                .with_json_rpc(true)
                .with_message_format(extra),
        )
        .await
        .unwrap();
    assert_eq!(result, json!({"params": {"q": "rust"}, "tenant": "acme"}));
}

#[tokio::test]
async fn headers_travel_on_the_handshake() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let result = transport
        .invoke(
            &peer.url,
            "whoami",
            Params::new(),
            InvokeOptions::new().with_header("X-Api-Key", "secret"),
        )
        .await
        .unwrap();
    assert_eq!(result, json!("secret"));
}

#[tokio::test]
async fn switching_endpoints_reconnects() {
    let first = Peer::spawn().await;
    let second = Peer::spawn().await;
    let transport = transport();

    transport
        .invoke(&first.url, "echo", Params::new(), InvokeOptions::new())
        .await
        .unwrap();
    assert_eq!(transport.connected_endpoint().as_deref(), Some(first.url.as_str()));

    transport
        .invoke(&second.url, "echo", Params::new(), InvokeOptions::new())
        .await
        .unwrap();
    assert_eq!(transport.connected_endpoint().as_deref(), Some(second.url.as_str()));
    assert_eq!(first.connections(), 1);
    assert_eq!(second.connections(), 1);
}

#[tokio::test]
async fn close_disconnects() {
    let peer = Peer::spawn().await;
    let transport = transport();
    transport
        .invoke(&peer.url, "echo", Params::new(), InvokeOptions::new())
        .await
        .unwrap();
    transport.close().await;
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(transport.connected_endpoint(), None);
}

#[tokio::test]
async fn interleaved_streams_see_only_their_own_chunks() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let (transport, url) = (&transport, &peer.url);
    let collect = |tag: &'static str| async move {
        transport
            .stream(url, "tagged", params(json!({"tag": tag, "n": 20})), StreamOptions::new())
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect::<Vec<Value>>()
            .await
    };

    let (left, right) = tokio::join!(collect("left"), collect("right"));
    let expected = |tag: &str| (0..20).map(|i| json!(format!("{tag}-{i}"))).collect::<Vec<_>>();
    assert_eq!(left, expected("left"));
    assert_eq!(right, expected("right"));
    assert_eq!(peer.connections(), 1);
}

#[tokio::test]
async fn late_reply_after_timeout_is_dropped() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let err = transport
        .invoke(
            &peer.url,
            "sleep",
            params(json!({"ms": 200})),
            InvokeOptions::new().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert_eq!(transport.pending_requests(), 0);

    // The reply for the timed-out id arrives while this call is pending.
    let result = transport
        .invoke(&peer.url, "sleep", params(json!({"ms": 300})), InvokeOptions::new())
        .await
        .unwrap();
    assert_eq!(result, json!(300));
    assert_eq!(transport.pending_requests(), 0);
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn disconnect_fails_a_pending_stream() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let mut chunks = transport
        .stream(&peer.url, "drip", Params::new(), StreamOptions::new())
        .await
        .unwrap();
    assert_eq!(chunks.next().await.unwrap().unwrap(), json!(0));

    let hangup = transport
        .invoke(&peer.url, "hangup", Params::new(), InvokeOptions::new())
        .await;
    assert_eq!(hangup.unwrap_err().kind(), ErrorKind::Connection);

    let mut failure = None;
    while let Some(item) = chunks.next().await {
        if let Err(err) = item {
            failure = Some(err);
            break;
        }
    }
    assert_eq!(failure.unwrap().kind(), ErrorKind::Connection);
    assert!(chunks.next().await.is_none());
    assert_eq!(transport.pending_requests(), 0);
}

#[tokio::test]
async fn bounded_buffer_delivers_every_chunk_to_a_slow_consumer() {
    let peer = Peer::spawn().await;
    let transport = transport();
    let mut chunks = transport
        .stream(
            &peer.url,
            "count",
            params(json!({"n": 40})),
            StreamOptions::new().with_buffer(NonZeroUsize::new(1).unwrap()),
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(chunk) = chunks.next().await {
        seen.push(chunk.unwrap());
        if seen.len() == 1 {
            // The receive loop waits for space instead of dropping chunks.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    assert_eq!(seen, (0..40).map(|i| json!(i)).collect::<Vec<_>>());
}

//! End-to-end tests over a real WebSocket: each test binds its own listener
//! on an ephemeral port and speaks the wire protocol with tokio-tungstenite.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use hostpulse_agent::{ws, AppState, Config};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(cfg: Config) -> SocketAddr {
    let state = AppState::new(&cfg).expect("state");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = ws::serve(listener, state).await;
    });
    addr
}

fn ring_only() -> Config {
    Config {
        port: 0,
        token: None,
        db_dir: None,
        log_every: 0,
    }
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (client, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    client
}

async fn recv_json(client: &mut WsClient) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("recv timed out")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("frame is json");
        }
    }
}

/// Send one request and wait for its correlated response, letting any
/// interleaved notifications pass by.
async fn call(client: &mut WsClient, id: u64, method: &str, params: Value) -> Value {
    let frame = json!({ "id": id, "method": method, "params": params }).to_string();
    client.send(Message::Text(frame)).await.expect("send");
    loop {
        let v = recv_json(client).await;
        if v.get("id").and_then(Value::as_u64) == Some(id) {
            return v;
        }
    }
}

/// Count notifications by event name for `window`.
async fn count_events(client: &mut WsClient, event: &str, window: Duration) -> usize {
    let deadline = Instant::now() + window;
    let mut n = 0;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return n;
        }
        match timeout(left, client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let v: Value = serde_json::from_str(&text).expect("frame is json");
                if v.get("event").and_then(Value::as_str) == Some(event) {
                    n += 1;
                }
            }
            Ok(Some(Ok(_))) => {}
            _ => return n,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_then_snapshot() {
    let addr = spawn_server(ring_only()).await;
    let mut client = connect(addr).await;

    let resp = call(
        &mut client,
        1,
        "hello",
        json!({ "app_version": "test", "protocol_version": 1, "token": "local" }),
    )
    .await;
    assert_eq!(resp["ok"], true);
    assert!(!resp["result"]["session_id"].as_str().unwrap().is_empty());

    let resp = call(&mut client, 2, "snapshot", json!({})).await;
    assert_eq!(resp["ok"], true);
    let r = &resp["result"];
    assert!(r["ts"].as_i64().unwrap() > 0);
    // Default snapshot set is cpu + memory.
    assert!(r["cpu"]["usage_percent"].is_number());
    assert!(r["memory"]["total_mb"].as_i64().unwrap() > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_errors_travel_the_wire() {
    let cfg = Config {
        token: Some("s3cret".into()),
        ..ring_only()
    };
    let addr = spawn_server(cfg).await;
    let mut client = connect(addr).await;

    let resp = call(
        &mut client,
        1,
        "hello",
        json!({ "protocol_version": 1, "token": "wrong" }),
    )
    .await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "unauthorized");

    let resp = call(
        &mut client,
        2,
        "hello",
        json!({ "protocol_version": 99, "token": "s3cret" }),
    )
    .await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "not_supported");

    // The connection survives rejected handshakes.
    let resp = call(
        &mut client,
        3,
        "hello",
        json!({ "protocol_version": 1, "token": "s3cret" }),
    )
    .await;
    assert_eq!(resp["ok"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn undecodable_frames_are_dropped_not_fatal() {
    let addr = spawn_server(ring_only()).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text("this is not json".into()))
        .await
        .expect("send");
    let resp = call(&mut client, 1, "get_config", json!({})).await;
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["result"]["base_interval_ms"], 1000);
}

#[tokio::test(flavor = "multi_thread")]
async fn bridge_handshake_warms_up_a_stream() {
    let addr = spawn_server(ring_only()).await;
    let mut client = connect(addr).await;

    let resp = call(
        &mut client,
        1,
        "hello",
        json!({
            "app_version": "test",
            "protocol_version": 1,
            "token": "local",
            "capabilities": ["metrics_stream"],
        }),
    )
    .await;
    assert_eq!(resp["ok"], true);

    // Warm-up auto-starts cpu+mem+disk+network and the push loop begins
    // streaming; well within 5s we expect state, repeated metrics, and the
    // scheduler-mediated modules showing up once their first run completes.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_state = false;
    let mut metrics = 0;
    let mut saw_disk = false;
    let mut saw_network = false;
    while Instant::now() < deadline && (!saw_state || metrics < 2 || !saw_disk || !saw_network) {
        let left = deadline.saturating_duration_since(Instant::now());
        let text = match timeout(left, client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(_))) => continue,
            _ => break,
        };
        let v: Value = serde_json::from_str(&text).expect("frame is json");
        match v.get("event").and_then(Value::as_str) {
            Some("state") => {
                assert_eq!(v["data"]["phase"], "start");
                assert_eq!(
                    v["data"]["extra"]["modules"],
                    serde_json::json!(["cpu", "mem", "disk", "network"])
                );
                saw_state = true;
            }
            Some("metrics") => {
                assert!(v["data"]["ts"].as_i64().unwrap() > 0);
                assert!(v["data"]["seq"].as_i64().unwrap() > 0);
                saw_disk |= v["data"]["disk"].is_object();
                saw_network |= v["data"]["network"].is_object();
                metrics += 1;
            }
            _ => {}
        }
    }
    assert!(saw_state, "no state notification after bridge hello");
    assert!(metrics >= 2, "expected a metrics stream, got {metrics}");
    assert!(saw_disk, "disk data never appeared in the warm-up stream");
    assert!(saw_network, "network data never appeared in the warm-up stream");
}

#[tokio::test(flavor = "multi_thread")]
async fn burst_mode_raises_the_cadence() {
    let addr = spawn_server(ring_only()).await;
    let mut client = connect(addr).await;

    call(
        &mut client,
        1,
        "hello",
        json!({
            "protocol_version": 1,
            "token": "local",
            "capabilities": ["metrics_stream"],
        }),
    )
    .await;
    // Let the warm-up settle before measuring.
    count_events(&mut client, "metrics", Duration::from_millis(900)).await;

    let resp = call(
        &mut client,
        2,
        "burst_subscribe",
        json!({ "interval_ms": 100, "ttl_ms": 3000 }),
    )
    .await;
    assert_eq!(resp["ok"], true);
    assert!(resp["result"]["expires_at"].as_i64().unwrap() > 0);

    // Push loop at 100ms plus the redundancy ticker: even with suppression
    // windows and scheduler jitter, 3s of burst yields far more than the
    // three notifications a 1s base interval would.
    let n = count_events(&mut client, "metrics", Duration::from_secs(3)).await;
    assert!(n >= 25, "burst cadence too slow: {n} notifications in 3s");
}

#[tokio::test(flavor = "multi_thread")]
async fn pushed_metrics_become_queryable_history() {
    let addr = spawn_server(ring_only()).await;
    let mut client = connect(addr).await;

    call(
        &mut client,
        1,
        "hello",
        json!({
            "protocol_version": 1,
            "token": "local",
            "capabilities": ["metrics_stream"],
        }),
    )
    .await;
    call(
        &mut client,
        2,
        "set_config",
        json!({ "base_interval_ms": 100 }),
    )
    .await;

    // Accumulate a couple of seconds of pushed samples.
    let pushed = count_events(&mut client, "metrics", Duration::from_secs(2)).await;
    assert!(pushed >= 3, "expected pushed samples, got {pushed}");

    let resp = call(
        &mut client,
        3,
        "query_history",
        json!({ "from_ts": 0, "to_ts": 0 }),
    )
    .await;
    assert_eq!(resp["ok"], true);
    let items = resp["result"]["items"].as_array().unwrap();
    assert!(
        items.len() >= 2,
        "pushed samples should be in history, got {}",
        items.len()
    );
}

//! End-to-end tests: a real server, real WebSocket clients, and the full
//! pipeline from submit through broadcast to compaction.
//!
//! The server runs over the local backends (file operation log, directory
//! object store, in-memory metadata) so no external services are needed.

use std::sync::Arc;
use std::time::Duration;

use draftly_collab::{
    server, BaselineStore, Config, Context, MetadataStore, Operation, OperationLog,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    base_url: String,
    host: String,
    ctx: Arc<Context>,
    _dir: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_testing(dir.path().join("cache"));
    let oplog = Arc::new(OperationLog::file(dir.path().join("operations.log")));
    let baselines = Arc::new(
        BaselineStore::local(dir.path().join("objects"), dir.path().join("cache"))
            .await
            .unwrap(),
    );
    let metadata = Arc::new(MetadataStore::in_memory());
    let ctx = Context::assemble(config, oplog, baselines, metadata)
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server::router(ctx.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base_url: format!("ws://{addr}"),
        host: addr.to_string(),
        ctx,
        _dir: dir,
    }
}

async fn connect(server: &TestServer, room: &str, username: &str) -> Client {
    let url = format!("{}/ws/{room}?username={username}", server.base_url);
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws
}

async fn send_op(client: &mut Client, op: &Operation) {
    let payload = serde_json::to_string(op).unwrap();
    client.send(Message::Text(payload.into())).await.unwrap();
}

async fn send_raw(client: &mut Client, payload: &str) {
    client
        .send(Message::Text(payload.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON text frame, skipping transport frames.
async fn recv_json(client: &mut Client) -> serde_json::Value {
    timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting for frame: {other:?}"),
            }
        }
    })
    .await
    .expect("frame within timeout")
}

async fn close(mut client: Client) {
    let _ = client.close(None).await;
}

async fn wait_for_baseline(server: &TestServer, document_id: i64, expected: &[u8]) {
    timeout(Duration::from_secs(3), async {
        loop {
            if server.ctx.baselines.fetch(document_id).await.unwrap() == expected {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("baseline for {document_id} never became {expected:?}"));
}

async fn wait_for_eviction(server: &TestServer, room_id: &str) {
    timeout(Duration::from_secs(3), async {
        loop {
            if server.ctx.registry.get(room_id).await.is_none() {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room {room_id} never evicted"));
}

/// Fold a sequence of broadcast frames onto `start` the way the compactor
/// would, for convergence assertions.
fn fold(start: &str, frames: &[serde_json::Value]) -> String {
    let mut content = start.to_string();
    for frame in frames {
        assert_eq!(frame["type"], "operation");
        let op: Operation = serde_json::from_value(frame["operation"].clone()).unwrap();
        content = op.apply_to(&content);
    }
    content
}

#[tokio::test]
async fn test_single_client_echo_and_compaction() {
    let server = start_server().await;
    let mut alice = connect(&server, "101", "alice").await;

    send_op(&mut alice, &Operation::insert(0, "Hello", 0)).await;
    let frame = recv_json(&mut alice).await;
    assert_eq!(frame["type"], "operation");
    assert_eq!(frame["operation"]["position"], 0);
    assert_eq!(frame["operation"]["text"], "Hello");
    assert_eq!(frame["operation"]["server_version"], 0);

    close(alice).await;
    wait_for_baseline(&server, 101, b"Hello").await;
    wait_for_eviction(&server, "101").await;
    assert!(server.ctx.oplog.entries("101").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_two_clients_converge_to_server_fold() {
    let server = start_server().await;
    let mut alice = connect(&server, "102", "alice").await;
    let mut bob = connect(&server, "102", "bob").await;

    // A's insert lands first; both acknowledge it before B submits at the
    // same stale version.
    send_op(&mut alice, &Operation::insert(0, "AA", 0)).await;
    let a1 = recv_json(&mut alice).await;
    let b1 = recv_json(&mut bob).await;

    send_op(&mut bob, &Operation::insert(0, "B", 0)).await;
    let a2 = recv_json(&mut alice).await;
    let b2 = recv_json(&mut bob).await;

    // Identical total order on both clients, strictly increasing versions.
    assert_eq!(a1, b1);
    assert_eq!(a2, b2);
    assert_eq!(a2["operation"]["server_version"], 1);
    // The tie keeps B at position 0, so the fold is "BAA".
    assert_eq!(fold("", &[a1, a2]), "BAA");

    close(alice).await;
    close(bob).await;
    wait_for_baseline(&server, 102, b"BAA").await;
}

#[tokio::test]
async fn test_three_way_insert_race_converges() {
    let server = start_server().await;
    server.ctx.baselines.upload(103, b"xy").await.unwrap();
    server
        .ctx
        .metadata
        .set_baseline_key(103, "documents/103.txt")
        .await
        .unwrap();

    let mut c1 = connect(&server, "103", "u1").await;
    let mut c2 = connect(&server, "103", "u2").await;
    let mut c3 = connect(&server, "103", "u3").await;

    // All three submit against version 0; arrival order is serialized here
    // so the applied order is deterministic for the assertion.
    let submissions = [
        Operation::insert(1, "1", 0),
        Operation::insert(1, "2", 0),
        Operation::insert(2, "3", 0),
    ];

    let mut seen: Vec<Vec<serde_json::Value>> = vec![Vec::new(), Vec::new(), Vec::new()];
    for (i, op) in submissions.iter().enumerate() {
        let sender = match i {
            0 => &mut c1,
            1 => &mut c2,
            _ => &mut c3,
        };
        send_op(sender, op).await;
        for (frames, client) in seen.iter_mut().zip([&mut c1, &mut c2, &mut c3]) {
            frames.push(recv_json(client).await);
        }
    }

    // Every client observed the same order; the fold is the document.
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[1], seen[2]);
    let converged = fold("xy", &seen[0]);

    for client in [c1, c2, c3] {
        close(client).await;
    }
    wait_for_baseline(&server, 103, converged.as_bytes()).await;
}

#[tokio::test]
async fn test_delete_then_reconnect_replays_history() {
    let server = start_server().await;
    server.ctx.baselines.upload(104, b"abcdef").await.unwrap();
    server
        .ctx
        .metadata
        .set_baseline_key(104, "documents/104.txt")
        .await
        .unwrap();

    let alice = connect(&server, "104", "alice").await;
    let mut bob = connect(&server, "104", "bob").await;
    close(alice).await;

    send_op(&mut bob, &Operation::delete(2, 2, 0)).await;
    let echo = recv_json(&mut bob).await;
    assert_eq!(echo["operation"]["kind"], "delete");

    // Alice reconnects with a watermark from before the delete; the history
    // frame arrives before anything else and contains exactly that op.
    let mut alice = connect(&server, "104", "alice").await;
    let history = recv_json(&mut alice).await;
    assert_eq!(history["type"], "history");
    let operations = history["operations"].as_array().unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0]["kind"], "delete");
    assert_eq!(operations[0]["position"], 2);
    assert_eq!(operations[0]["length"], 2);

    close(alice).await;
    close(bob).await;
    wait_for_baseline(&server, 104, b"abef").await;
}

#[tokio::test]
async fn test_invalid_operation_keeps_session_open() {
    let server = start_server().await;
    let mut alice = connect(&server, "105", "alice").await;

    send_raw(
        &mut alice,
        r#"{"kind":"insert","position":-1,"text":"z","version":0}"#,
    )
    .await;
    let error = recv_json(&mut alice).await;
    assert_eq!(error["error"], "Operation validation failed");

    // No version advance and no log entry.
    let room = server.ctx.registry.get("105").await.unwrap();
    assert_eq!(room.version().await, 0);
    assert!(server.ctx.oplog.entries("105").await.unwrap().is_empty());

    // The session is still usable.
    send_op(&mut alice, &Operation::insert(0, "ok", 0)).await;
    let frame = recv_json(&mut alice).await;
    assert_eq!(frame["type"], "operation");
    assert_eq!(frame["operation"]["text"], "ok");

    close(alice).await;
}

#[tokio::test]
async fn test_malformed_json_gets_format_error() {
    let server = start_server().await;
    let mut alice = connect(&server, "110", "alice").await;

    send_raw(&mut alice, "this is not json").await;
    let error = recv_json(&mut alice).await;
    assert_eq!(error["error"], "Invalid operation format");

    close(alice).await;
}

#[tokio::test]
async fn test_room_emptying_compacts_and_fresh_rejoin() {
    let server = start_server().await;
    let mut alice = connect(&server, "106", "alice").await;
    let mut bob = connect(&server, "106", "bob").await;

    let mut frames = Vec::new();
    for (i, text) in ["a", "b", "c"].into_iter().enumerate() {
        send_op(&mut alice, &Operation::insert(i as i64, text, i as i64)).await;
        frames.push(recv_json(&mut alice).await);
        recv_json(&mut bob).await;
    }
    let expected = fold("", &frames);

    close(alice).await;
    close(bob).await;

    // Within one liveness cycle the baseline reflects the ops and the log
    // is drained.
    wait_for_baseline(&server, 106, expected.as_bytes()).await;
    wait_for_eviction(&server, "106").await;
    assert!(server.ctx.oplog.entries("106").await.unwrap().is_empty());

    // Rejoining gets a fresh room: no history, version restarts at 0.
    let mut alice = connect(&server, "106", "alice").await;
    send_op(&mut alice, &Operation::insert(0, "fresh", 0)).await;
    let frame = recv_json(&mut alice).await;
    assert_eq!(frame["type"], "operation", "no history frame precedes the echo");
    assert_eq!(frame["operation"]["server_version"], 0);
    close(alice).await;
}

#[tokio::test]
async fn test_concurrent_overlapping_deletes_documented_outcome() {
    let server = start_server().await;
    server.ctx.baselines.upload(108, b"abcdef").await.unwrap();
    server
        .ctx
        .metadata
        .set_baseline_key(108, "documents/108.txt")
        .await
        .unwrap();

    let mut alice = connect(&server, "108", "alice").await;
    let mut bob = connect(&server, "108", "bob").await;

    // Both delete overlapping ranges against version 0. Historical deletes
    // never shift later ops, so bob's delete is applied at its stated
    // position; in the fold it falls out of range and no-ops. This is the
    // known transform limitation: the server fold stays deterministic and
    // all clients receive it, but a client that does not rebase its own
    // speculative delete would diverge locally.
    send_op(&mut alice, &Operation::delete(1, 3, 0)).await;
    let a1 = recv_json(&mut alice).await;
    let b1 = recv_json(&mut bob).await;

    send_op(&mut bob, &Operation::delete(2, 2, 0)).await;
    let a2 = recv_json(&mut alice).await;
    let b2 = recv_json(&mut bob).await;

    assert_eq!(a1, b1);
    assert_eq!(a2, b2);
    assert_eq!(a2["operation"]["position"], 2, "delete passed through untransformed");
    assert_eq!(fold("abcdef", &[a1, a2]), "aef");

    close(alice).await;
    close(bob).await;
    wait_for_baseline(&server, 108, b"aef").await;
}

#[tokio::test]
async fn test_missing_username_rejects_upgrade() {
    let server = start_server().await;
    let url = format!("{}/ws/107", server.base_url);
    assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
}

#[tokio::test]
async fn test_non_numeric_room_rejects_upgrade() {
    let server = start_server().await;
    let url = format!("{}/ws/not-a-doc?username=alice", server.base_url);
    assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
}

#[tokio::test]
async fn test_health_endpoint() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let server = start_server().await;
    let mut stream = TcpStream::connect(&server.host).await.unwrap();
    stream
        .write_all(
            format!(
                "GET /health HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                server.host
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("WS Server is Live"));
}

#[tokio::test]
async fn test_reconnect_completeness_across_many_ops() {
    let server = start_server().await;
    let mut alice = connect(&server, "109", "alice").await;
    let mut bob = connect(&server, "109", "bob").await;

    send_op(&mut alice, &Operation::insert(0, "base", 0)).await;
    recv_json(&mut alice).await;
    recv_json(&mut bob).await;
    close(bob).await;

    // Bob misses K = 3 operations.
    for i in 0..3 {
        send_op(&mut alice, &Operation::insert(0, format!("m{i}"), 1 + i)).await;
        recv_json(&mut alice).await;
    }

    let mut bob = connect(&server, "109", "bob").await;
    let history = recv_json(&mut bob).await;
    assert_eq!(history["type"], "history");
    let operations = history["operations"].as_array().unwrap();
    assert_eq!(operations.len(), 3, "exactly the missed operations, in order");
    assert_eq!(operations[0]["text"], "m0");
    assert_eq!(operations[2]["text"], "m2");

    close(alice).await;
    close(bob).await;
}

//! Dialogue tests against a scripted fake monitor
//!
//! A unix listener stands in for QEMU: it sends the greeting, answers
//! `qmp_capabilities`, and then replies per command from a script,
//! interleaving event objects the way a real monitor does.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use qmp_client::{migrate, QmpClient, QmpError};

fn socket_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("qmp-test-{}-{}.sock", tag, std::process::id()))
}

/// Serve one connection: greeting, capability negotiation, then the
/// scripted replies. Each script entry is the full set of lines written in
/// response to one command; events are just extra lines.
async fn serve_script(listener: UnixListener, script: Vec<Vec<Value>>) {
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let greeting = json!({
        "QMP": { "version": { "qemu": { "major": 6, "minor": 2, "micro": 0 } }, "capabilities": [] }
    });
    write_half
        .write_all(format!("{}\n", greeting).as_bytes())
        .await
        .unwrap();

    // qmp_capabilities
    let line = lines.next_line().await.unwrap().unwrap();
    let cmd: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(cmd["execute"], "qmp_capabilities");
    write_half.write_all(b"{\"return\":{}}\n").await.unwrap();

    for replies in script {
        let _ = lines.next_line().await.unwrap().unwrap();
        for reply in replies {
            write_half
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn connect_negotiates_capabilities() {
    let path = socket_path("handshake");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    let server = tokio::spawn(serve_script(listener, vec![]));

    let client = QmpClient::connect(&path).await;
    assert!(client.is_ok(), "handshake should succeed");

    drop(client);
    server.await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn events_between_replies_are_skipped() {
    let path = socket_path("events");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let stop_event = json!({
        "event": "STOP",
        "timestamp": { "seconds": 1_700_000_000_u64, "microseconds": 0 }
    });
    let server = tokio::spawn(serve_script(
        listener,
        vec![vec![stop_event, json!({ "return": { "status": "completed" } })]],
    ));

    let mut client = QmpClient::connect(&path).await.unwrap();
    let status = client.query_migrate().await.unwrap();
    assert_eq!(status.status, "completed");

    drop(client);
    server.await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn error_replies_fail_the_command() {
    let path = socket_path("error");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let error_reply = json!({
        "error": { "class": "GenericError", "desc": "migration already in progress" }
    });
    let server = tokio::spawn(serve_script(listener, vec![vec![error_reply]]));

    let mut client = QmpClient::connect(&path).await.unwrap();
    match client.migrate("tcp:10.0.0.9:40000").await {
        Err(QmpError::Command(desc)) => assert!(desc.contains("migration already in progress")),
        other => panic!("expected a command error, got {:?}", other),
    }

    drop(client);
    server.await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn driver_polls_until_completed() {
    let path = socket_path("driver");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let script = vec![
        // migrate
        vec![json!({ "return": {} })],
        // first query-migrate: still moving memory
        vec![json!({
            "return": {
                "status": "active",
                "ram": { "transferred": 4096_u64, "total": 1_048_576_u64, "mbps": 640.0 }
            }
        })],
        // second query-migrate: done
        vec![json!({ "return": { "status": "completed" } })],
    ];
    let server = tokio::spawn(serve_script(listener, script));

    migrate::run(path.to_str().unwrap(), "tcp:10.0.0.9:40000")
        .await
        .expect("driver should complete");

    server.await.unwrap();
    let _ = std::fs::remove_file(&path);
}

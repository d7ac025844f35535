//! Control-channel round trips against a real Unix socket server.

#![cfg(unix)]

use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tempfile::TempDir;
use void_link::control::{AgentClient, TransportClient};
use void_link::Error;
use void_link_protocol::ExecRequest;

/// Serve one connection with a canned response; the handle yields the raw
/// request bytes the client sent.
fn serve_once(response: Vec<u8>) -> (TempDir, PathBuf, JoinHandle<Vec<u8>>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        stream.read_to_end(&mut request).unwrap();
        stream.write_all(&response).unwrap();
        request
    });
    (dir, path, handle)
}

fn http(status_line: &str, headers: &[&str], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status_line);
    for header in headers {
        out.push_str(header);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

#[test]
fn test_get_request_framing_and_json_body() {
    let (_dir, path, server) = serve_once(http(
        "200 OK",
        &["Content-Type: application/json"],
        br#"{"content":"hello"}"#,
    ));

    let client = TransportClient::new(&path);
    let response = client.get("/files/hello").unwrap();
    assert_eq!(response.status, 200);
    assert!(response.is_success());
    let value: serde_json::Value = response.json().unwrap();
    assert_eq!(value["content"], "hello");

    let request = String::from_utf8(server.join().unwrap()).unwrap();
    assert_eq!(
        request,
        "GET /files/hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    );
}

#[test]
fn test_binary_body_is_preserved() {
    let body: Vec<u8> = (0..=255u8).rev().chain([0x00, 0xff, 0xfe]).collect();
    let (_dir, path, server) = serve_once(http(
        "200 OK",
        &[
            "Content-Type: application/octet-stream",
            &format!("Content-Length: {}", body.len()),
        ],
        &body,
    ));

    let response = TransportClient::new(&path).get_bytes("/screenshot").unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, body);
    server.join().unwrap();
}

#[test]
fn test_non_success_is_not_a_transport_error() {
    let (_dir, path, server) = serve_once(http(
        "500 Internal Server Error",
        &["Content-Type: application/json"],
        br#"{"error":"disk full"}"#,
    ));

    let response = TransportClient::new(&path).get("/files/big").unwrap();
    assert_eq!(response.status, 500);
    assert!(!response.is_success());
    assert_eq!(response.error_message().as_deref(), Some("disk full"));
    server.join().unwrap();
}

#[test]
fn test_request_json_posts_body() {
    let (_dir, path, server) = serve_once(http(
        "201 Created",
        &["Content-Type: application/json"],
        br#"{"id":7}"#,
    ));

    let body = serde_json::json!({"name": "job"});
    let response = TransportClient::new(&path)
        .request_json("POST", "/jobs", Some(&body))
        .unwrap();
    assert_eq!(response.status, 201);
    assert!(response.is_success());
    assert_eq!(response.body["id"], 7);

    let request = server.join().unwrap();
    let text = String::from_utf8(request).unwrap();
    assert!(text.starts_with("POST /jobs HTTP/1.1\r\n"));
    assert!(text.contains("Content-Type: application/json\r\n"));
    assert!(text.contains("Content-Length: 14\r\n"));
    assert!(text.ends_with("\r\n\r\n{\"name\":\"job\"}"));
}

#[test]
fn test_request_json_rejects_non_json_body() {
    let (_dir, path, server) = serve_once(http("200 OK", &[], b"plain text"));
    let result = TransportClient::new(&path).request_json("GET", "/status", None);
    assert!(matches!(result, Err(Error::Protocol(_))));
    server.join().unwrap();
}

#[test]
fn test_garbage_response_is_malformed() {
    let (_dir, path, server) = serve_once(b"not http at all".to_vec());
    let result = TransportClient::new(&path).get("/health");
    assert!(matches!(result, Err(Error::Protocol(_))));
    server.join().unwrap();
}

#[test]
fn test_connect_refused_carries_os_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.sock");
    // Leaves the socket file behind with nobody listening.
    drop(UnixListener::bind(&path).unwrap());

    let err = TransportClient::new(&path).get("/health").unwrap_err();
    assert_eq!(err.os_code(), Some(libc::ECONNREFUSED));
}

#[test]
fn test_silent_server_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slow.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        stream.read_to_end(&mut request).unwrap();
        // Hold the connection open without answering.
        let _ = done_rx.recv();
        request
    });

    let started = std::time::Instant::now();
    let err = TransportClient::new(&path)
        .with_timeout(Duration::from_millis(200))
        .get("/health")
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, Error::Transport { .. }));
    assert_eq!(err.os_code(), Some(libc::ETIMEDOUT));

    done_tx.send(()).unwrap();
    assert!(server.join().unwrap().starts_with(b"GET /health HTTP/1.1\r\n"));
}

#[test]
fn test_socket_path_too_long() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("d".repeat(120)).join("agent.sock");
    let err = TransportClient::new(path).get("/health").unwrap_err();
    assert!(matches!(err, Error::Transport { .. }));
    assert_eq!(err.os_code(), Some(libc::ENAMETOOLONG));
}

#[test]
fn test_agent_health() {
    let (_dir, path, server) = serve_once(http(
        "200 OK",
        &["Content-Type: application/json"],
        br#"{"status":"ok","version":"0.3.1","uptime_secs":42}"#,
    ));

    let health = AgentClient::new(TransportClient::new(&path)).health().unwrap();
    assert!(health.is_ok());
    assert_eq!(health.version.as_deref(), Some("0.3.1"));
    assert_eq!(health.uptime_secs, Some(42));
    server.join().unwrap();
}

#[test]
fn test_agent_error_status() {
    let (_dir, path, server) = serve_once(http("404 Not Found", &[], b"no such file"));

    let err = AgentClient::new(TransportClient::new(&path))
        .read_file("/etc/missing")
        .unwrap_err();
    match err {
        Error::Agent { status, message } => {
            assert_eq!(status, 404);
            assert_eq!(message, "no such file");
        }
        other => panic!("expected agent error, got {:?}", other),
    }

    let request = String::from_utf8(server.join().unwrap()).unwrap();
    assert!(request.starts_with("GET /files?path=/etc/missing HTTP/1.1\r\n"));
}

#[test]
fn test_agent_write_file() {
    let (_dir, path, server) = serve_once(http("204 No Content", &[], b""));

    AgentClient::new(TransportClient::new(&path))
        .write_file("/tmp/my file", &[0x00, 0x01, 0xff])
        .unwrap();

    let request = server.join().unwrap();
    let head_end = request.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    let head = std::str::from_utf8(&request[..head_end]).unwrap();
    assert!(head.starts_with("PUT /files?path=/tmp/my%20file HTTP/1.1"));
    assert!(head.contains("Content-Type: application/octet-stream"));
    assert!(head.contains("Content-Length: 3"));
    assert_eq!(&request[head_end + 4..], &[0x00, 0x01, 0xff]);
}

#[tokio::test]
async fn test_agent_exec_async() {
    let (_dir, path, server) = serve_once(http(
        "200 OK",
        &["Content-Type: application/json"],
        br#"{"stdout":[104,105],"stderr":[],"exit_code":0}"#,
    ));

    let agent = AgentClient::new(TransportClient::new(&path));
    let response = agent
        .exec_async(ExecRequest::new("echo", &["hi"]))
        .await
        .unwrap();
    assert!(response.success());
    assert_eq!(response.stdout, b"hi");

    let request = String::from_utf8(server.join().unwrap()).unwrap();
    assert!(request.starts_with("POST /exec HTTP/1.1\r\n"));
    assert!(request.contains("\"program\":\"echo\""));
}

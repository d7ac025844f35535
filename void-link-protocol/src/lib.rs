//! Shared wire-format types for void-link host ↔ guest control traffic.
//!
//! The control channel speaks plain HTTP/1.1 over a local stream socket, one
//! exchange per connection. This crate owns both halves of that framing so
//! the host library and any guest-side tooling agree byte-for-byte.
//!
//! ## Request framing
//!
//! ```text
//! METHOD path HTTP/1.1\r\n
//! Host: localhost\r\n
//! Connection: close\r\n
//! [Content-Length: N\r\n]
//! [Content-Type: T\r\n]
//! \r\n
//! [body]
//! ```
//!
//! ## Response parsing
//!
//! Responses are parsed from the complete buffer read until the peer closed
//! its write side. Two entry points share one byte-oriented parser:
//!
//! - [`HttpResponse::parse`]: text responses; the whole buffer must be UTF-8.
//! - [`HttpResponse::parse_binary`]: arbitrary bodies; only the header block
//!   is decoded, the body is sliced from the raw bytes after `\r\n\r\n`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur while framing or parsing control-channel messages.
#[derive(Debug)]
pub enum ProtocolError {
    /// The buffer could not be decoded as an HTTP/1.x response.
    MalformedResponse(String),
    /// An I/O error occurred while reading or writing.
    Io(std::io::Error),
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MalformedResponse(msg) => write!(f, "Malformed response: {}", msg),
            ProtocolError::Io(e) => write!(f, "IO error: {}", e),
            ProtocolError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

fn malformed(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedResponse(msg.into())
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Separator between the header block and the body.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Content type used for JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type used for raw file payloads.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A single control-channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method (`GET`, `POST`, ...).
    pub method: String,
    /// Request target, including any query string.
    pub path: String,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
    /// Optional `Content-Type` header value.
    pub content_type: Option<String>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body: None,
            content_type: None,
        }
    }

    /// Attach a body. `Content-Length` is derived from it when encoding.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Encode the request into its wire form (header block + body).
    pub fn encode(&self) -> Vec<u8> {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n",
            self.method, self.path
        );
        if let Some(body) = &self.body {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        if let Some(content_type) = &self.content_type {
            head.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        head.push_str("\r\n");

        let mut buf = head.into_bytes();
        if let Some(body) = &self.body {
            buf.extend_from_slice(body);
        }
        buf
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A parsed control-channel response.
///
/// `body` is `None` when nothing followed the header block (or the stream
/// ended inside it). A chunked body that terminates immediately is an
/// explicit empty body and parses to `Some(vec![])`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Numeric status code from the status line.
    pub status: u16,
    /// Reason phrase from the status line (may be empty).
    pub reason: String,
    /// Header map. Keys keep their wire casing; duplicates are last-write-wins.
    pub headers: HashMap<String, String>,
    /// Response body, if any. An empty body framed by `Content-Length: 0`
    /// or by the end of the stream (e.g. a 204) is `None`; only a chunked
    /// body ending at its first chunk yields `Some(vec![])`.
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    Text,
    Binary,
}

impl HttpResponse {
    /// Parse a response whose body is known to be text.
    ///
    /// The whole buffer must be valid UTF-8.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        parse_response(data, BodyMode::Text)
    }

    /// Parse a response whose body may contain arbitrary bytes.
    pub fn parse_binary(data: &[u8]) -> Result<Self, ProtocolError> {
        parse_response(data, BodyMode::Binary)
    }

    /// True for 2xx status codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Exact-name header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Body as UTF-8 text, if present and valid.
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_deref()
            .and_then(|body| std::str::from_utf8(body).ok())
    }

    /// Deserialize the body as JSON. An absent body is a JSON error.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(self.body.as_deref().unwrap_or_default())?)
    }

    /// Human-readable error for a non-2xx response, `None` on success.
    ///
    /// Prefers an `error` or `message` field of a JSON body, then the body
    /// text, then the reason phrase.
    pub fn error_message(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }

        if let Ok(value) = self.json::<serde_json::Value>() {
            for key in ["error", "message"] {
                if let Some(msg) = value.get(key).and_then(serde_json::Value::as_str) {
                    return Some(msg.to_string());
                }
            }
        }

        if let Some(text) = self.text().map(str::trim).filter(|t| !t.is_empty()) {
            return Some(text.to_string());
        }

        if self.reason.is_empty() {
            Some(format!("HTTP {}", self.status))
        } else {
            Some(format!("HTTP {} {}", self.status, self.reason))
        }
    }
}

fn parse_response(data: &[u8], mode: BodyMode) -> Result<HttpResponse, ProtocolError> {
    if data.is_empty() {
        return Err(malformed("empty response"));
    }

    if mode == BodyMode::Text {
        std::str::from_utf8(data)
            .map_err(|e| malformed(format!("response is not valid UTF-8: {}", e)))?;
    }

    let (head, rest) = match find_subsequence(data, HEADER_TERMINATOR) {
        Some(idx) => (&data[..idx], Some(&data[idx + HEADER_TERMINATOR.len()..])),
        None => (data, None),
    };

    let head = std::str::from_utf8(head)
        .map_err(|e| malformed(format!("header block is not valid UTF-8: {}", e)))?;

    let mut lines = head.split("\r\n");
    let (status, reason) = parse_status_line(lines.next().unwrap_or_default())?;

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
    }

    let body = match rest {
        Some(raw) => decode_body(raw, &headers)?,
        None => None,
    };

    Ok(HttpResponse {
        status,
        reason,
        headers,
        body,
    })
}

fn parse_status_line(line: &str) -> Result<(u16, String), ProtocolError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(malformed(format!("invalid status line: {:?}", line)));
    }

    let code = parts.next().unwrap_or_default();
    let status = match code.parse::<u16>() {
        Ok(status) if code.len() == 3 && (100..=999).contains(&status) => status,
        _ => return Err(malformed(format!("invalid status code: {:?}", code))),
    };

    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((status, reason))
}

/// Case-insensitive lookup for the headers that drive body framing.
///
/// Differently-cased copies must agree; conflicting framing is malformed.
fn framing_header<'a>(
    headers: &'a HashMap<String, String>,
    name: &str,
) -> Result<Option<&'a str>, ProtocolError> {
    let mut found: Option<&str> = None;
    for (key, value) in headers {
        if !key.eq_ignore_ascii_case(name) {
            continue;
        }
        match found {
            Some(prev) if prev.trim() != value.trim() => {
                return Err(malformed(format!("conflicting {} headers", name)));
            }
            _ => found = Some(value.as_str()),
        }
    }
    Ok(found)
}

fn decode_body(
    raw: &[u8],
    headers: &HashMap<String, String>,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let chunked = framing_header(headers, "Transfer-Encoding")?
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        return decode_chunked(raw).map(Some);
    }

    if raw.is_empty() {
        return Ok(None);
    }

    match framing_header(headers, "Content-Length")? {
        Some(value) => {
            let len: usize = value
                .parse()
                .map_err(|_| malformed(format!("invalid Content-Length: {:?}", value)))?;
            if raw.len() < len {
                return Err(malformed(format!(
                    "body truncated: expected {} bytes, got {}",
                    len,
                    raw.len()
                )));
            }
            if len == 0 {
                Ok(None)
            } else {
                Ok(Some(raw[..len].to_vec()))
            }
        }
        None => Ok(Some(raw.to_vec())),
    }
}

fn decode_chunked(mut raw: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::new();
    loop {
        let line_end = find_subsequence(raw, b"\r\n")
            .ok_or_else(|| malformed("chunk size line not terminated"))?;
        let size_line = std::str::from_utf8(&raw[..line_end])
            .map_err(|_| malformed("chunk size line is not valid UTF-8"))?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| malformed(format!("invalid chunk size: {:?}", size_hex)))?;
        raw = &raw[line_end + 2..];

        if size == 0 {
            // Trailers, if any, are ignored.
            return Ok(body);
        }

        let end = size
            .checked_add(2)
            .filter(|&end| end <= raw.len())
            .ok_or_else(|| malformed("chunk truncated"))?;
        if &raw[size..end] != b"\r\n" {
            return Err(malformed("chunk truncated"));
        }
        body.extend_from_slice(&raw[..size]);
        raw = &raw[end..];
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ---------------------------------------------------------------------------
// Data types: guest agent RPC
// ---------------------------------------------------------------------------

/// Guest agent liveness report (`GET /health`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Agent-reported status, `"ok"` when healthy.
    pub status: String,
    /// Agent version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Seconds since the agent started.
    #[serde(default)]
    pub uptime_secs: Option<u64>,
}

impl AgentHealth {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Request to execute a command in the guest (`POST /exec`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Program to execute.
    pub program: String,
    /// Arguments to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Standard input data.
    #[serde(default)]
    pub stdin: Vec<u8>,
    /// Environment variables.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Working directory (optional).
    pub working_dir: Option<String>,
    /// Timeout in seconds (optional).
    pub timeout_secs: Option<u64>,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }
}

/// Response from command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
    /// Exit code.
    pub exit_code: i32,
    /// Error message if execution failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Execution duration in milliseconds.
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl ExecResponse {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding_without_body() {
        let req = HttpRequest::new("GET", "/health");
        assert_eq!(
            req.encode(),
            b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_request_encoding_with_body() {
        let req = HttpRequest::new("POST", "/exec")
            .body(&b"{}"[..])
            .content_type(CONTENT_TYPE_JSON);
        let wire = String::from_utf8(req.encode()).unwrap();
        assert_eq!(
            wire,
            "POST /exec HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
             Content-Length: 2\r\nContent-Type: application/json\r\n\r\n{}"
        );
    }

    #[test]
    fn test_parse_json_response() {
        let resp = HttpResponse::parse(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"content\":\"hello\"}",
        )
        .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert!(resp.is_success());
        assert_eq!(resp.header("Content-Type"), Some("application/json"));

        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value, serde_json::json!({ "content": "hello" }));
    }

    #[test]
    fn test_parse_no_content() {
        let resp = HttpResponse::parse(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_none());
    }

    #[test]
    fn test_parse_header_only_content_length_zero() {
        let resp =
            HttpResponse::parse_binary(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.body.is_none());
    }

    #[test]
    fn test_parse_stream_ending_inside_headers() {
        let resp = HttpResponse::parse(b"HTTP/1.1 200 OK\r\nX-Test: 1\r\n").unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("X-Test"), Some("1"));
        assert!(resp.body.is_none());
    }

    #[test]
    fn test_parse_chunked_explicit_empty_body() {
        let resp = HttpResponse::parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(resp.body, Some(Vec::new()));
    }

    #[test]
    fn test_parse_chunked_body() {
        let resp = HttpResponse::parse_binary(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(resp.text(), Some("hello world"));
    }

    #[test]
    fn test_chunk_size_overflow_is_malformed() {
        let err = HttpResponse::parse_binary(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc\r\n0\r\n\r\n",
        );
        assert!(matches!(err, Err(ProtocolError::MalformedResponse(_))));
    }

    #[test]
    fn test_truncated_chunk_is_malformed() {
        for raw in [
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n10\r\nabc"[..],
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabcXY0\r\n\r\n"[..],
        ] {
            assert!(matches!(
                HttpResponse::parse_binary(raw),
                Err(ProtocolError::MalformedResponse(_))
            ));
        }
    }

    #[test]
    fn test_conflicting_content_length_is_malformed() {
        let err = HttpResponse::parse(
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\ncontent-length: 5\r\n\r\nabcde",
        );
        assert!(matches!(err, Err(ProtocolError::MalformedResponse(_))));

        // Agreeing copies are fine.
        let resp = HttpResponse::parse(
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\ncontent-length: 3\r\n\r\nabcde",
        )
        .unwrap();
        assert_eq!(resp.body.as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_parse_binary_preserves_bytes() {
        let body: Vec<u8> = vec![0x89, 0x50, 0x4e, 0x47, 0x00, 0xff, 0xfe, 0x0d, 0x0a, 0x80];
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\n\r\n".to_vec();
        raw.extend_from_slice(&body);

        let resp = HttpResponse::parse_binary(&raw).unwrap();
        assert_eq!(resp.body.as_deref(), Some(body.as_slice()));

        // The text path refuses the same buffer.
        assert!(matches!(
            HttpResponse::parse(&raw),
            Err(ProtocolError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_body_containing_separator() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nfirst\r\n\r\nsecond";
        let resp = HttpResponse::parse_binary(raw).unwrap();
        assert_eq!(resp.body.as_deref(), Some(&b"first\r\n\r\nsecond"[..]));
    }

    #[test]
    fn test_content_length_truncates_and_rejects_short_body() {
        let resp =
            HttpResponse::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabcdef").unwrap();
        assert_eq!(resp.body.as_deref(), Some(&b"abc"[..]));

        let err = HttpResponse::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
        assert!(matches!(err, Err(ProtocolError::MalformedResponse(_))));
    }

    #[test]
    fn test_duplicate_headers_last_write_wins() {
        let resp =
            HttpResponse::parse(b"HTTP/1.1 200 OK\r\nX-Id: one\r\nX-Id: two\r\nx-id: lower\r\n\r\n")
                .unwrap();
        assert_eq!(resp.header("X-Id"), Some("two"));
        assert_eq!(resp.header("x-id"), Some("lower"));
    }

    #[test]
    fn test_malformed_status_line() {
        for raw in [
            &b"garbage\r\n\r\n"[..],
            &b""[..],
            &b"HTTP/1.1 abc Nope\r\n\r\n"[..],
            &b"HTTP/2 200 OK\r\n\r\n"[..],
            &b"\xff\xfe\r\n\r\n"[..],
        ] {
            assert!(
                matches!(
                    HttpResponse::parse(raw),
                    Err(ProtocolError::MalformedResponse(_))
                ),
                "expected failure for {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_error_message_prefers_json_field() {
        let resp = HttpResponse::parse(
            b"HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\n\r\n{\"error\":\"no such file\"}",
        )
        .unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.error_message().as_deref(), Some("no such file"));

        let resp = HttpResponse::parse(b"HTTP/1.1 500 Internal Server Error\r\n\r\n").unwrap();
        assert_eq!(
            resp.error_message().as_deref(),
            Some("HTTP 500 Internal Server Error")
        );

        let resp = HttpResponse::parse(b"HTTP/1.1 200 OK\r\n\r\nfine").unwrap();
        assert!(resp.error_message().is_none());
    }

    #[test]
    fn test_exec_response_deserializes_without_optional_fields() {
        let resp: ExecResponse =
            serde_json::from_str(r#"{"stdout":[104,105],"stderr":[],"exit_code":0}"#).unwrap();
        assert!(resp.success());
        assert_eq!(resp.stdout, b"hi");
    }
}

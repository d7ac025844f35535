//! Typed calls to the guest agent over the control socket.

use void_link_protocol::{
    AgentHealth, ExecRequest, ExecResponse, HttpResponse, CONTENT_TYPE_JSON,
    CONTENT_TYPE_OCTET_STREAM,
};

use super::client::TransportClient;
use crate::{Error, Result};

/// Guest agent RPC client. Unlike [`TransportClient`], a non-2xx status is
/// an [`Error::Agent`].
#[derive(Debug, Clone)]
pub struct AgentClient {
    transport: TransportClient,
}

impl AgentClient {
    pub fn new(transport: TransportClient) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub fn health(&self) -> Result<AgentHealth> {
        let response = check(self.transport.get("/health")?)?;
        Ok(response.json()?)
    }

    pub fn exec(&self, request: &ExecRequest) -> Result<ExecResponse> {
        let body = serde_json::to_vec(request)?;
        let response = check(self.transport.post("/exec", &body, CONTENT_TYPE_JSON)?)?;
        Ok(response.json()?)
    }

    /// [`exec`](Self::exec) on a blocking worker thread.
    pub async fn exec_async(&self, request: ExecRequest) -> Result<ExecResponse> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || client.exec(&request))
            .await
            .map_err(|e| Error::Network(format!("exec worker failed: {}", e)))?
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let response = check(self.transport.get(&files_path(path))?)?;
        Ok(response.body.unwrap_or_default())
    }

    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        check(self.transport.request(
            "PUT",
            &files_path(path),
            Some(content),
            Some(CONTENT_TYPE_OCTET_STREAM),
        )?)?;
        Ok(())
    }
}

fn check(response: HttpResponse) -> Result<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }
    Err(Error::Agent {
        status: response.status,
        message: response.error_message().unwrap_or_default(),
    })
}

fn files_path(path: &str) -> String {
    format!("/files?path={}", encode_query(path))
}

/// Percent-encode everything outside the RFC 3986 unreserved set, keeping `/`.
fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

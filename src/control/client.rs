//! Blocking request/response client for the control socket.
//!
//! Every call opens a fresh Unix stream, writes one HTTP/1.1 request,
//! half-closes, and reads until the peer closes. Nothing is pooled; the
//! stream is dropped on every exit path.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};
use void_link_protocol::{HttpRequest, HttpResponse, CONTENT_TYPE_JSON};

use crate::{Error, Result};

/// Read/write deadline applied to every exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Response whose body was decoded as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonResponse {
    pub status: u16,
    pub body: Value,
}

impl JsonResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Response whose body is kept as raw bytes. An absent body is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl BytesResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Client for one control socket path.
///
/// Non-2xx responses are returned as `Ok`; only socket and framing
/// failures are errors.
#[derive(Debug, Clone)]
pub struct TransportClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl TransportClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
        content_type: Option<&str>,
    ) -> Result<HttpResponse> {
        let mut request = HttpRequest::new(method, path);
        if let Some(body) = body {
            request = request.body(body);
        }
        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }
        self.send(&request)
    }

    /// Perform one exchange with a prepared request.
    pub fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let socket = self.socket_path.display();
        check_socket_path(&self.socket_path)?;

        let mut stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| Error::transport(format!("connect {}", socket), &e))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| Error::transport(format!("set read timeout on {}", socket), &e))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| Error::transport(format!("set write timeout on {}", socket), &e))?;

        trace!(
            "control: {} {} -> {}",
            request.method,
            request.path,
            socket
        );
        stream
            .write_all(&request.encode())
            .map_err(|e| Error::transport(format!("write to {}", socket), &e))?;
        stream
            .shutdown(Shutdown::Write)
            .map_err(|e| Error::transport(format!("shutdown write on {}", socket), &e))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .map_err(|e| Error::transport(format!("read from {}", socket), &e))?;

        let response = HttpResponse::parse_binary(&raw)?;
        debug!(
            "control: {} {} -> {} ({} bytes)",
            request.method,
            request.path,
            response.status,
            response.body.as_ref().map_or(0, Vec::len)
        );
        Ok(response)
    }

    pub fn get(&self, path: &str) -> Result<HttpResponse> {
        self.request("GET", path, None, None)
    }

    pub fn post(&self, path: &str, body: &[u8], content_type: &str) -> Result<HttpResponse> {
        self.request("POST", path, Some(body), Some(content_type))
    }

    /// Send an optional JSON body and decode the response body as JSON.
    ///
    /// Fails if the response body is absent or not JSON, whatever the status.
    pub fn request_json(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<JsonResponse> {
        let encoded = body.map(serde_json::to_vec).transpose()?;
        let content_type = encoded.as_ref().map(|_| CONTENT_TYPE_JSON);
        let response = self.request(method, path, encoded.as_deref(), content_type)?;
        Ok(JsonResponse {
            status: response.status,
            body: response.json()?,
        })
    }

    /// GET a non-JSON payload, body bytes untouched.
    pub fn get_bytes(&self, path: &str) -> Result<BytesResponse> {
        let response = self.get(path)?;
        Ok(BytesResponse {
            status: response.status,
            body: response.body.unwrap_or_default(),
        })
    }
}

/// Capacity of `sockaddr_un.sun_path`, including the trailing NUL.
fn sun_path_capacity() -> usize {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len()
}

fn check_socket_path(path: &Path) -> Result<()> {
    let len = path.as_os_str().as_bytes().len();
    if len >= sun_path_capacity() {
        return Err(Error::Transport {
            context: format!(
                "socket path is {} bytes, limit is {}: {}",
                len,
                sun_path_capacity() - 1,
                path.display()
            ),
            code: Some(libc::ENAMETOOLONG),
        });
    }
    Ok(())
}

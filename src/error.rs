//! Error types for void-link

use thiserror::Error;

/// Result type alias using void-link Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in void-link operations
#[derive(Error, Debug)]
pub enum Error {
    /// Frame or packet too short or structurally invalid
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// Control-channel framing errors (including unparseable responses)
    #[error("Protocol error: {0}")]
    Protocol(#[from] void_link_protocol::ProtocolError),

    /// Socket create/connect/read/write failures on the control channel
    #[error("Transport error ({context}): {}", os_code_description(.code))]
    Transport {
        context: String,
        code: Option<i32>,
    },

    /// A port-forward mapping collides with an enabled mapping
    #[error("Host port {port} is already forwarded by an enabled mapping")]
    PortInUse { port: u16 },

    /// Binding a host listener failed
    #[error("Failed to bind host port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// No mapping exists for the host port
    #[error("No port forward for host port {0}")]
    ForwardNotFound(u16),

    /// Opening a connection into the guest failed
    #[error("Guest connection failed: {0}")]
    GuestConnect(String),

    /// Guest agent answered with a non-2xx status
    #[error("Guest agent returned HTTP {status}: {message}")]
    Agent { status: u16, message: String },

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout waiting for operation
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML configuration parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Build a transport error from an I/O failure, keeping its OS error code.
    pub fn transport(context: impl Into<String>, err: &std::io::Error) -> Self {
        // Socket timeouts surface as EAGAIN.
        let code = match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Some(libc::ETIMEDOUT),
            std::io::ErrorKind::UnexpectedEof => {
                err.raw_os_error().or(Some(libc::ECONNRESET))
            }
            _ => err.raw_os_error(),
        };
        Error::Transport {
            context: context.into(),
            code,
        }
    }

    /// OS error code carried by a transport failure.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Transport { code, .. } => *code,
            Error::Bind { source, .. } => source.raw_os_error(),
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

fn os_code_description(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!(
            "{} (os error {})",
            std::io::Error::from_raw_os_error(code).kind(),
            code
        ),
        None => "unknown failure".to_string(),
    }
}

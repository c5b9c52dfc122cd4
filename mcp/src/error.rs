//! Gateway error types.
//!
//! Defines error variants for gateway operations: configuration, upstream
//! connection and protocol failures, lookup misses at the aggregation layer,
//! and script execution errors.

use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to connect to '{server}': {message}")]
    UpstreamConnect { server: String, message: String },

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Server disconnected: {0}")]
    ServerDisconnected(String),

    /// Lookup miss at the aggregation layer. The message is shown to the
    /// downstream client verbatim and enumerates the valid alternatives.
    #[error("{0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Script execution failed: {0}")]
    Script(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn upstream_connect(server: impl Into<String>, message: impl ToString) -> Self {
        Self::UpstreamConnect {
            server: server.into(),
            message: message.to_string(),
        }
    }
}

/// Configuration errors. One distinct variant per validation rule so a
/// misconfigured file reports exactly which rule it broke.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found or unreadable at {path}: {message}")]
    Unreadable { path: String, message: String },

    #[error("config is not valid JSON: {0}")]
    Parse(String),

    #[error("config root must be a JSON object")]
    RootNotAnObject,

    #[error("`transport` must be \"http\" or \"stdio\"")]
    InvalidTransport,

    #[error("`port` must be a number")]
    PortNotANumber,

    #[error("`host` must be a string")]
    HostNotAString,

    #[error("`mcpClients` must be an object")]
    ClientsNotAnObject,

    #[error("client '{0}': `type` must be \"http\" or \"stdio\"")]
    InvalidClientType(String),

    #[error("http client '{0}' requires a string `url`")]
    MissingUrl(String),

    #[error("http client '{name}': invalid url: {message}")]
    InvalidUrl { name: String, message: String },

    #[error("stdio client '{0}' requires a string `command`")]
    MissingCommand(String),

    #[error("PORT override is not an integer: {0}")]
    InvalidPortOverride(String),
}

//! Gateway configuration types and validation.
//!
//! The configuration document is JSON. Parsing happens in two steps: the raw
//! document is validated rule by rule so every violation maps to one
//! [`ConfigError`] kind, then the typed structures are built in document
//! order (`mcpClients` keeps its insertion order for aggregation).

use std::{collections::HashMap, fmt, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// Transport the gateway serves its own downstream client over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownstreamTransport {
    Http,
    #[default]
    Stdio,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub transport: DownstreamTransport,
    pub port: Option<u16>,
    pub host: Option<String>,
    /// Upstream clients in document order.
    pub mcp_clients: Vec<(String, ClientConfig)>,
}

/// One upstream MCP server connection.
#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientConfig {
    Http {
        url: String,
        /// Forwarded verbatim on every request to this upstream.
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, rename = "allowedTools")]
        allowed_tools: Option<Vec<String>>,
    },
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Added on top of the inherited process environment.
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, rename = "allowedTools")]
        allowed_tools: Option<Vec<String>>,
    },
}

impl ClientConfig {
    pub fn allowed_tools(&self) -> Option<&Vec<String>> {
        match self {
            ClientConfig::Http { allowed_tools, .. } => allowed_tools.as_ref(),
            ClientConfig::Stdio { allowed_tools, .. } => allowed_tools.as_ref(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientConfig::Http {
                url,
                headers,
                allowed_tools,
            } => f
                .debug_struct("Http")
                .field("url", url)
                .field("headers", &format!("{} headers", headers.len()))
                .field("allowed_tools", allowed_tools)
                .finish(),
            ClientConfig::Stdio {
                command,
                args,
                env,
                allowed_tools,
            } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("env", &format!("{} vars", env.len()))
                .field("allowed_tools", allowed_tools)
                .finish(),
        }
    }
}

impl GatewayConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let doc: Value =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(&doc)
    }

    /// Load, parse and validate a configuration file.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ConfigError::Unreadable {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
        Self::from_str(&content)
    }

    /// Build the typed configuration from a validated JSON document.
    pub fn from_value(doc: &Value) -> Result<Self, ConfigError> {
        let root = doc.as_object().ok_or(ConfigError::RootNotAnObject)?;

        let transport = match root.get("transport") {
            None => DownstreamTransport::default(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|_| ConfigError::InvalidTransport)?,
        };

        let port = match root.get("port") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .and_then(|n| u16::try_from(n).ok())
                    .ok_or(ConfigError::PortNotANumber)?,
            ),
        };

        let host = match root.get("host") {
            None => None,
            Some(value) => Some(
                value
                    .as_str()
                    .map(str::to_string)
                    .ok_or(ConfigError::HostNotAString)?,
            ),
        };

        let mut mcp_clients = Vec::new();
        if let Some(clients_value) = root.get("mcpClients") {
            let clients = clients_value
                .as_object()
                .ok_or(ConfigError::ClientsNotAnObject)?;
            for (name, client_value) in clients {
                mcp_clients.push((name.clone(), parse_client(name, client_value)?));
            }
        }

        Ok(Self {
            transport,
            port,
            host,
            mcp_clients,
        })
    }

    /// Apply `PORT` and `HOST` environment overrides on top of the loaded
    /// document.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("PORT") {
            self.port = Some(
                port.parse::<u16>()
                    .map_err(|_| ConfigError::InvalidPortOverride(port))?,
            );
        }
        if let Ok(host) = std::env::var("HOST") {
            self.host = Some(host);
        }
        Ok(())
    }
}

fn parse_client(name: &str, value: &Value) -> Result<ClientConfig, ConfigError> {
    let entry = value
        .as_object()
        .ok_or_else(|| ConfigError::InvalidClientType(name.to_string()))?;

    match entry.get("type").and_then(Value::as_str) {
        Some("http") => {
            let url = entry
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| ConfigError::MissingUrl(name.to_string()))?;
            url::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        }
        Some("stdio") => {
            if entry.get("command").and_then(Value::as_str).is_none() {
                return Err(ConfigError::MissingCommand(name.to_string()));
            }
        }
        _ => return Err(ConfigError::InvalidClientType(name.to_string())),
    }

    serde_json::from_value(value.clone())
        .map_err(|e| ConfigError::Parse(format!("client '{name}': {e}")))
}

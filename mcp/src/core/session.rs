//! Upstream client session.
//!
//! One connection to one upstream MCP server on behalf of one downstream
//! session. The session enforces the tool allowlist on listings, caches the
//! filtered tool list until a `tools/list_changed` notification invalidates
//! it, and passes every other operation through to the protocol client.

use std::{borrow::Cow, collections::HashSet, sync::Arc};

use parking_lot::{Mutex, RwLock};
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
        Implementation, Prompt, ReadResourceRequestParam, ReadResourceResult, Resource, Tool,
    },
    service::RunningService,
    RoleClient,
};
use serde_json::Map;
use tracing::{error, warn};

use super::handler::GatewayClientHandler;
use crate::error::{GatewayError, GatewayResult};

pub(crate) type McpClient = RunningService<RoleClient, GatewayClientHandler>;

/// Cached filtered tool list, shared between a session and its notification
/// handler so `tools/list_changed` can invalidate it directly.
#[derive(Default)]
pub struct ToolCache {
    tools: Mutex<Option<Vec<Tool>>>,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Vec<Tool>> {
        self.tools.lock().clone()
    }

    pub fn set(&self, tools: Vec<Tool>) {
        *self.tools.lock() = Some(tools);
    }

    pub fn invalidate(&self) {
        *self.tools.lock() = None;
    }
}

/// Apply the allowlist to a fetched tool list.
///
/// `None` passes everything through. An empty list hides every tool (warned
/// once per fetch). Otherwise the intersection is kept, and each allowlist
/// entry that the server does not actually expose is logged as an error with
/// the server's real tool names.
pub(crate) fn filter_allowed_tools(
    server_name: &str,
    tools: Vec<Tool>,
    allowed: Option<&[String]>,
) -> Vec<Tool> {
    let Some(allowed) = allowed else {
        return tools;
    };

    if allowed.is_empty() {
        warn!(
            server_name = %server_name,
            "allowedTools is empty; hiding all {} tools",
            tools.len()
        );
        return Vec::new();
    }

    let available: HashSet<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
    for entry in allowed {
        if !available.contains(entry.as_str()) {
            let mut names: Vec<&str> = available.iter().copied().collect();
            names.sort_unstable();
            error!(
                server_name = %server_name,
                tool = %entry,
                "allowedTools entry not exposed by server; available tools: {}",
                names.join(", ")
            );
        }
    }

    let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();
    tools
        .into_iter()
        .filter(|t| allowed.contains(t.name.as_ref()))
        .collect()
}

pub struct UpstreamSession {
    server_name: String,
    allowed_tools: Option<Vec<String>>,
    client: RwLock<Option<Arc<McpClient>>>,
    tool_cache: Arc<ToolCache>,
}

impl UpstreamSession {
    pub(crate) fn new(
        server_name: impl Into<String>,
        allowed_tools: Option<Vec<String>>,
        client: McpClient,
        tool_cache: Arc<ToolCache>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            allowed_tools,
            client: RwLock::new(Some(Arc::new(client))),
            tool_cache,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn client(&self) -> GatewayResult<Arc<McpClient>> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| GatewayError::ServerDisconnected(self.server_name.clone()))
    }

    /// List the server's tools after allowlist filtering.
    ///
    /// Served from cache when present; a fetch failure leaves the cache
    /// empty so the next call retries.
    pub async fn list_tools(&self) -> GatewayResult<Vec<Tool>> {
        if let Some(tools) = self.tool_cache.get() {
            return Ok(tools);
        }

        let client = self.client()?;
        let tools = client
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let filtered = filter_allowed_tools(&self.server_name, tools, self.allowed_tools.as_deref());
        self.tool_cache.set(filtered.clone());
        Ok(filtered)
    }

    /// Forward a tool call with the tool's original name.
    ///
    /// The allowlist controls visibility, not authority: disallowed names
    /// are still callable by anything that knows them.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, serde_json::Value>>,
    ) -> GatewayResult<CallToolResult> {
        let client = self.client()?;
        client
            .call_tool(CallToolRequestParam {
                name: Cow::Owned(name.to_string()),
                arguments,
            })
            .await
            .map_err(|e| GatewayError::ToolExecution(e.to_string()))
    }

    pub async fn list_resources(&self) -> GatewayResult<Vec<Resource>> {
        let client = self.client()?;
        client
            .peer()
            .list_all_resources()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    pub async fn read_resource(&self, uri: &str) -> GatewayResult<ReadResourceResult> {
        let client = self.client()?;
        client
            .read_resource(ReadResourceRequestParam {
                uri: uri.to_string(),
            })
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    pub async fn list_prompts(&self) -> GatewayResult<Vec<Prompt>> {
        let client = self.client()?;
        client
            .peer()
            .list_all_prompts()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, serde_json::Value>>,
    ) -> GatewayResult<GetPromptResult> {
        let client = self.client()?;
        client
            .get_prompt(GetPromptRequestParam {
                name: name.to_string(),
                arguments,
            })
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    /// The upstream's name/version pair from its initialize result.
    pub fn server_version(&self) -> Option<Implementation> {
        let client = self.client().ok()?;
        client.peer().peer_info().map(|info| info.server_info.clone())
    }

    /// The upstream's initialize-time instructions, if it sent any.
    pub fn instructions(&self) -> Option<String> {
        let client = self.client().ok()?;
        client
            .peer()
            .peer_info()
            .and_then(|info| info.instructions.clone())
    }

    /// Close the underlying connection. Idempotent.
    pub async fn close(&self) {
        let client = self.client.write().take();
        let Some(client) = client else {
            return;
        };

        match Arc::try_unwrap(client) {
            Ok(client) => {
                if let Err(e) = client.cancel().await {
                    warn!(
                        server_name = %self.server_name,
                        error = %e,
                        "Error closing upstream session"
                    );
                }
            }
            Err(_) => {
                warn!(
                    server_name = %self.server_name,
                    "Upstream client still in use at close; connection will drop with last holder"
                );
            }
        }
    }
}

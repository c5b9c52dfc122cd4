//! Meta-tool registry and dispatcher.
//!
//! The gateway exposes exactly five tools of its own. The registry is built
//! once at startup and advertised in declaration order; the dispatcher
//! routes invocations with the originating downstream session id and turns
//! every user-visible failure into an `isError` tool result rather than a
//! protocol error.

use std::{borrow::Cow, sync::Arc};

use rmcp::model::{CallToolResult, Content, JsonObject, Tool};
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    aggregate,
    core::UpstreamManager,
    error::{GatewayError, GatewayResult},
    metrics::GatewayMetrics,
    script::ScriptSandbox,
};

pub const LIST_SERVERS: &str = "list-servers";
pub const LIST_SERVER_TOOLS: &str = "list-server-tools";
pub const TOOL_DETAILS: &str = "tool-details";
pub const INSPECT_TOOL_RESPONSE: &str = "inspect-tool-response";
pub const EXECUTE: &str = "execute";

/// Carries the originating downstream session through tool execution.
#[derive(Debug, Clone)]
pub struct ToolExecutionContext {
    pub session_id: String,
}

impl ToolExecutionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

impl Default for ToolExecutionContext {
    fn default() -> Self {
        Self::new("default")
    }
}

fn schema(value: Value) -> Arc<JsonObject> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(JsonObject::new()),
    }
}

fn build_meta_tools() -> Vec<Tool> {
    vec![
        Tool::new(
            Cow::Borrowed(LIST_SERVERS),
            Cow::Borrowed(
                "List the configured upstream MCP servers, their Lua identifiers, \
                 and any servers that failed to connect.",
            ),
            schema(json!({ "type": "object", "properties": {} })),
        ),
        Tool::new(
            Cow::Borrowed(LIST_SERVER_TOOLS),
            Cow::Borrowed(
                "List the tools one upstream server exposes, with the Lua names \
                 scripts use to call them.",
            ),
            schema(json!({
                "type": "object",
                "properties": {
                    "luaServerName": {
                        "type": "string",
                        "description": "Sanitized server identifier from list-servers"
                    }
                },
                "required": ["luaServerName"]
            })),
        ),
        Tool::new(
            Cow::Borrowed(TOOL_DETAILS),
            Cow::Borrowed(
                "Show one tool's full description, parameter schema, and a Lua \
                 usage example.",
            ),
            schema(json!({
                "type": "object",
                "properties": {
                    "luaServerName": {
                        "type": "string",
                        "description": "Sanitized server identifier from list-servers"
                    },
                    "luaToolName": {
                        "type": "string",
                        "description": "Sanitized tool name from list-server-tools"
                    }
                },
                "required": ["luaServerName", "luaToolName"]
            })),
        ),
        Tool::new(
            Cow::Borrowed(INSPECT_TOOL_RESPONSE),
            Cow::Borrowed(
                "Call a tool with sample arguments and report the response \
                 structure a script would see. Warning: this actually executes \
                 the tool, side effects included.",
            ),
            schema(json!({
                "type": "object",
                "properties": {
                    "luaServerName": {
                        "type": "string",
                        "description": "Sanitized server identifier from list-servers"
                    },
                    "luaToolName": {
                        "type": "string",
                        "description": "Sanitized tool name from list-server-tools"
                    },
                    "sampleArgs": {
                        "type": "object",
                        "description": "Arguments to invoke the tool with"
                    }
                },
                "required": ["luaServerName", "luaToolName"]
            })),
        ),
        Tool::new(
            Cow::Borrowed(EXECUTE),
            Cow::Borrowed(
                "Run a Lua script that orchestrates upstream tools. Each server \
                 is a global table; each tool returns an awaitable: \
                 calculator.add({a=1,b=2}):await(). Designate the return value \
                 with result(...) or by assigning to result.",
            ),
            schema(json!({
                "type": "object",
                "properties": {
                    "script": {
                        "type": "string",
                        "description": "Lua source to execute in the sandbox"
                    }
                },
                "required": ["script"]
            })),
        ),
    ]
}

pub(crate) fn error_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message.into())])
}

fn script_failure(message: &str) -> CallToolResult {
    error_result(format!("Script execution failed:\n{message}"))
}

/// Post-process a script's designated return value into a tool result.
pub(crate) fn wrap_script_value(value: Option<Value>) -> CallToolResult {
    let Some(value) = value else {
        return CallToolResult::success(vec![Content::text(
            "Script executed successfully. No result returned.",
        )]);
    };

    if value.get("content").map(Value::is_array).unwrap_or(false) {
        if let Ok(result) = serde_json::from_value::<CallToolResult>(value.clone()) {
            return result;
        }
    }

    match value {
        Value::Object(_) | Value::Array(_) => {
            let text = value.to_string();
            let mut result = CallToolResult::success(vec![Content::text(text)]);
            result.structured_content = Some(value);
            result
        }
        scalar => {
            let rendered = match &scalar {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            CallToolResult::success(vec![Content::text(format!(
                "Script executed successfully.\n\nResult:\n{rendered}"
            ))])
        }
    }
}

fn require_str<'a>(args: &'a JsonObject, name: &str) -> GatewayResult<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::ToolExecution(format!("Missing required parameter '{name}'")))
}

pub struct MetaToolDispatcher {
    manager: Arc<UpstreamManager>,
    metrics: Arc<GatewayMetrics>,
    tools: Vec<Tool>,
}

impl MetaToolDispatcher {
    pub fn new(manager: Arc<UpstreamManager>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            manager,
            metrics,
            tools: build_meta_tools(),
        }
    }

    /// The advertised meta-tools, in registration order.
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Route one downstream invocation. Failures come back as `isError`
    /// results with descriptive text.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        context: &ToolExecutionContext,
    ) -> CallToolResult {
        debug!(
            tool = %name,
            session_id = %context.session_id,
            "Dispatching meta-tool"
        );
        let args = arguments.unwrap_or_default();

        let outcome = match name {
            LIST_SERVERS => Ok(text_result(
                aggregate::list_servers(&self.manager, &context.session_id).await,
            )),
            LIST_SERVER_TOOLS => match require_str(&args, "luaServerName") {
                Ok(server) => {
                    aggregate::list_server_tools(&self.manager, server, &context.session_id)
                        .await
                        .map(text_result)
                }
                Err(e) => Err(e),
            },
            TOOL_DETAILS => self.tool_details(&args, context).await,
            INSPECT_TOOL_RESPONSE => self.inspect_tool_response(&args, context).await,
            EXECUTE => self.execute_script(&args, context).await,
            other => Err(GatewayError::NotFound(format!("Unknown tool: {other}"))),
        };

        match outcome {
            Ok(result) => {
                let success = !result.is_error.unwrap_or(false);
                self.metrics.record_call(success);
                result
            }
            Err(e) => {
                self.metrics.record_call(false);
                error_result(e.to_string())
            }
        }
    }

    async fn tool_details(
        &self,
        args: &JsonObject,
        context: &ToolExecutionContext,
    ) -> GatewayResult<CallToolResult> {
        let server = require_str(args, "luaServerName")?;
        let tool = require_str(args, "luaToolName")?;
        aggregate::get_tool_details(&self.manager, server, tool, &context.session_id)
            .await
            .map(text_result)
    }

    async fn inspect_tool_response(
        &self,
        args: &JsonObject,
        context: &ToolExecutionContext,
    ) -> GatewayResult<CallToolResult> {
        let server = require_str(args, "luaServerName")?;
        let tool = require_str(args, "luaToolName")?;
        let sample_args = args.get("sampleArgs").cloned();
        aggregate::inspect_tool_response(
            &self.manager,
            server,
            tool,
            sample_args,
            &context.session_id,
        )
        .await
        .map(text_result)
    }

    async fn execute_script(
        &self,
        args: &JsonObject,
        context: &ToolExecutionContext,
    ) -> GatewayResult<CallToolResult> {
        let script = require_str(args, "script")?;
        let sandbox =
            ScriptSandbox::new(self.manager.get_clients_by_session(&context.session_id));

        match sandbox.run(script).await {
            Ok(value) => {
                self.metrics.record_script(true);
                Ok(wrap_script_value(value))
            }
            Err(GatewayError::Script(message)) => {
                self.metrics.record_script(false);
                Ok(script_failure(&message))
            }
            Err(other) => {
                self.metrics.record_script(false);
                Ok(script_failure(&other.to_string()))
            }
        }
    }
}

fn text_result(text: String) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text)])
}

//! In-process upstream fixtures and end-to-end scenarios.
//!
//! Spins up a real MCP server inside the test process, wired to an
//! [`UpstreamSession`] over an in-memory duplex transport, so session
//! caching, aggregation, and script round-trips run against the actual
//! protocol stack with no network or child processes.

use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, GetPromptRequestParam, GetPromptResult,
        ListPromptsResult, ListResourcesResult, ListToolsResult, PaginatedRequestParam, Prompt,
        PromptMessage, PromptMessageContent, PromptMessageRole, RawResource,
        ReadResourceRequestParam, ReadResourceResult, Resource, ResourceContents,
        ServerCapabilities, ServerInfo, Tool,
    },
    service::{RequestContext, RoleServer},
    ErrorData, ServerHandler, ServiceExt,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{
    capabilities::{CapabilityStore, DownstreamCapabilities},
    core::{
        handler::{ChangeEvent, GatewayClientHandler},
        session::{ToolCache, UpstreamSession},
        UpstreamManager,
    },
    metrics::GatewayMetrics,
};

fn schema(value: Value) -> Arc<rmcp::model::JsonObject> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(rmcp::model::JsonObject::new()),
    }
}

/// Scriptable upstream: a calculator plus a small data server, with a
/// `notify_tools_changed` tool that fires a `tools/list_changed`
/// notification back at the gateway.
#[derive(Clone)]
pub(crate) struct TestUpstream {
    pub list_tools_calls: Arc<AtomicUsize>,
}

impl TestUpstream {
    pub fn new() -> Self {
        Self {
            list_tools_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn tools() -> Vec<Tool> {
        let operands = json!({
            "type": "object",
            "properties": {
                "a": { "type": "number", "description": "First operand" },
                "b": { "type": "number", "description": "Second operand" }
            },
            "required": ["a", "b"]
        });

        vec![
            Tool::new(
                Cow::Borrowed("add"),
                Cow::Borrowed("Adds two numbers\nReturns a text equation."),
                schema(operands.clone()),
            ),
            Tool::new(
                Cow::Borrowed("divide"),
                Cow::Borrowed("Divides a by b"),
                schema(operands.clone()),
            ),
            Tool::new(
                Cow::Borrowed("multiply"),
                Cow::Borrowed("Multiplies two numbers"),
                schema(operands),
            ),
            Tool::new(
                Cow::Borrowed("list_files"),
                Cow::Borrowed("Lists available files"),
                schema(json!({ "type": "object", "properties": {} })),
            ),
            Tool::new(
                Cow::Borrowed("notify_tools_changed"),
                Cow::Borrowed("Fires a tools/list_changed notification"),
                schema(json!({ "type": "object", "properties": {} })),
            ),
        ]
    }
}

impl ServerHandler for TestUpstream {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.capabilities = ServerCapabilities::builder()
            .enable_tools()
            .enable_resources()
            .enable_prompts()
            .build();
        info.server_info.name = "test-upstream".to_string();
        info.server_info.version = "1.2.3".to_string();
        info.instructions = Some("Numbers go in, numbers come out.".to_string());
        info
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        self.list_tools_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ListToolsResult {
            tools: Self::tools(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let args = request.arguments.unwrap_or_default();
        let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);

        match request.name.as_ref() {
            "add" => Ok(CallToolResult::success(vec![Content::text(format!(
                "{a} + {b} = {}",
                a + b
            ))])),
            "divide" => {
                if b == 0 {
                    Ok(CallToolResult::error(vec![Content::text(
                        "Cannot divide by zero",
                    )]))
                } else {
                    let mut result = CallToolResult::success(vec![Content::text(format!(
                        "{a} / {b} = {}",
                        a / b
                    ))]);
                    result.structured_content = Some(json!({ "quotient": a / b }));
                    Ok(result)
                }
            }
            "multiply" => {
                let mut result =
                    CallToolResult::success(vec![Content::text((a * b).to_string())]);
                result.structured_content = Some(json!({ "product": a * b }));
                Ok(result)
            }
            "list_files" => {
                let mut result = CallToolResult::success(vec![Content::text("2 files")]);
                result.structured_content =
                    Some(json!({ "files": ["test-data.json", "notes.txt"] }));
                Ok(result)
            }
            "notify_tools_changed" => {
                context
                    .peer
                    .notify_tool_list_changed()
                    .await
                    .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text("notified")]))
            }
            other => Err(ErrorData::invalid_params(
                format!("unknown tool: {other}"),
                None,
            )),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        let raw = RawResource {
            uri: "file:///test-data.json".to_string(),
            name: "test-data".to_string(),
            title: None,
            description: Some("Sample records".to_string()),
            mime_type: Some("application/json".to_string()),
            size: None,
            icons: None,
        };
        Ok(ListResourcesResult {
            resources: vec![Resource::new(raw, None)],
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        ReadResourceRequestParam { uri }: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        if uri == "file:///test-data.json" {
            Ok(ReadResourceResult {
                contents: vec![ResourceContents::TextResourceContents {
                    uri,
                    mime_type: Some("application/json".to_string()),
                    text: r#"{ "people": ["Alice", "Bob"] }"#.to_string(),
                    meta: None,
                }],
            })
        } else {
            Err(ErrorData::resource_not_found(
                "resource not found",
                Some(json!({ "uri": uri })),
            ))
        }
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, ErrorData> {
        Ok(ListPromptsResult {
            prompts: vec![Prompt {
                name: "greeting".to_string(),
                title: None,
                description: Some("Greets a person".to_string()),
                arguments: None,
                icons: None,
            }],
            next_cursor: None,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, ErrorData> {
        if request.name != "greeting" {
            return Err(ErrorData::invalid_params(
                format!("unknown prompt: {}", request.name),
                None,
            ));
        }
        let who = request
            .arguments
            .as_ref()
            .and_then(|args| args.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("world");
        Ok(GetPromptResult {
            description: Some("Greets a person".to_string()),
            messages: vec![PromptMessage {
                role: PromptMessageRole::User,
                content: PromptMessageContent::Text {
                    text: format!("Hello, {who}!"),
                },
            }],
        })
    }
}

/// Connect an [`UpstreamSession`] to an in-process [`TestUpstream`].
pub(crate) async fn connect_test_upstream(
    server_name: &str,
    allowed_tools: Option<Vec<String>>,
) -> (TestUpstream, UpstreamSession, mpsc::Receiver<ChangeEvent>) {
    let upstream = TestUpstream::new();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server = upstream.clone();
    tokio::spawn(async move {
        let (read, write) = tokio::io::split(server_io);
        if let Ok(service) = server.serve((read, write)).await {
            let _ = service.waiting().await;
        }
    });

    let (change_tx, change_rx) = mpsc::channel(16);
    let tool_cache = Arc::new(ToolCache::new());
    let handler = GatewayClientHandler::new(
        server_name,
        "default",
        DownstreamCapabilities::default(),
        Arc::clone(&tool_cache),
        change_tx,
    );

    let (read, write) = tokio::io::split(client_io);
    let client = handler
        .serve((read, write))
        .await
        .expect("connect test upstream");

    let session = UpstreamSession::new(server_name, allowed_tools, client, tool_cache);
    (upstream, session, change_rx)
}

pub(crate) fn test_manager() -> Arc<UpstreamManager> {
    UpstreamManager::new(
        Arc::new(CapabilityStore::new()),
        Arc::new(GatewayMetrics::new()),
    )
}

//! Downstream MCP surface.
//!
//! One `GatewayService` per downstream session. The stdio transport carries
//! a single session (`"default"`); the streamable HTTP transport creates a
//! service instance per protocol session with a fresh uuid. The first
//! request a session dispatches awaits the full upstream pool setup, so
//! aggregation always observes every configured client.

use std::sync::Arc;

use luagate_mcp::{
    aggregate,
    core::{ClientConfig, GatewayConfig},
    CapabilityStore, DownstreamCapabilities, GatewayError, MetaToolDispatcher,
    ToolExecutionContext, UpstreamManager,
};
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
        InitializeRequestParam, InitializeResult, ListPromptsResult, ListResourcesResult,
        ListToolsResult, PaginatedRequestParam, ReadResourceRequestParam, ReadResourceResult,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    transport::{
        streamable_http_server::session::local::LocalSessionManager, StreamableHttpServerConfig,
        StreamableHttpService,
    },
    ErrorData, ServerHandler, ServiceExt,
};
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

const GATEWAY_INSTRUCTIONS: &str = "\
This gateway aggregates multiple MCP servers. Start with list-servers, then \
list-server-tools and tool-details to discover what is available. Use the \
execute tool to run a Lua script that orchestrates several upstream tools in \
one round-trip: each server is a global table, each tool call returns an \
awaitable ( calculator.add({a=1,b=2}):await() ), and result(...) designates \
the script's return value.";

/// Shared singletons wired once at startup.
#[derive(Clone)]
pub struct GatewayDeps {
    pub config: Arc<GatewayConfig>,
    pub manager: Arc<UpstreamManager>,
    pub dispatcher: Arc<MetaToolDispatcher>,
    pub capabilities: Arc<CapabilityStore>,
}

pub struct GatewayService {
    session_id: String,
    deps: GatewayDeps,
    connected: OnceCell<()>,
}

impl GatewayService {
    pub fn new(session_id: impl Into<String>, deps: GatewayDeps) -> Self {
        Self {
            session_id: session_id.into(),
            deps,
            connected: OnceCell::new(),
        }
    }

    /// Connect every configured upstream for this session, once. Later
    /// callers wait for the first to finish, so no meta-tool observes a
    /// half-built pool.
    async fn ensure_connected(&self) {
        self.connected
            .get_or_init(|| async {
                connect_all(&self.deps.manager, &self.deps.config, &self.session_id).await;
            })
            .await;
    }

    fn not_found(e: &GatewayError) -> bool {
        matches!(e, GatewayError::NotFound(_))
    }
}

/// Open a pool entry for every configured upstream client, in document
/// order. Failures are recorded per server and do not stop the loop.
pub async fn connect_all(manager: &UpstreamManager, config: &GatewayConfig, session_id: &str) {
    for (name, client) in &config.mcp_clients {
        let result = match client {
            ClientConfig::Http {
                url,
                headers,
                allowed_tools,
            } => {
                manager
                    .add_http_client(
                        name,
                        url,
                        session_id,
                        headers,
                        allowed_tools.clone(),
                        None,
                    )
                    .await
            }
            ClientConfig::Stdio {
                command,
                args,
                env,
                allowed_tools,
            } => {
                manager
                    .add_stdio_client(
                        name,
                        command,
                        session_id,
                        args,
                        env,
                        allowed_tools.clone(),
                        None,
                    )
                    .await
            }
        };

        if !result.success {
            warn!(
                server_name = %name,
                session_id = %session_id,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Upstream client unavailable for session"
            );
        }
    }
}

impl ServerHandler for GatewayService {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.capabilities = ServerCapabilities::builder()
            .enable_tools()
            .enable_resources()
            .enable_prompts()
            .build();
        info.server_info.name = "luagate".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.instructions = Some(GATEWAY_INSTRUCTIONS.to_string());
        info
    }

    async fn initialize(
        &self,
        request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, ErrorData> {
        self.deps.capabilities.store(
            self.session_id.as_str(),
            DownstreamCapabilities {
                sampling: request.capabilities.sampling.is_some(),
                elicitation: request.capabilities.elicitation.is_some(),
            },
        );
        info!(
            session_id = %self.session_id,
            client = %request.client_info.name,
            "Downstream session initialized"
        );
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: self.deps.dispatcher.tools().to_vec(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        self.ensure_connected().await;
        let context = ToolExecutionContext::new(self.session_id.clone());
        Ok(self
            .deps
            .dispatcher
            .dispatch(&request.name, request.arguments, &context)
            .await)
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        self.ensure_connected().await;
        aggregate::list_resources(&self.deps.manager, &self.session_id)
            .await
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        self.ensure_connected().await;
        aggregate::read_resource(&self.deps.manager, &request.uri, &self.session_id)
            .await
            .map_err(|e| {
                if Self::not_found(&e) {
                    ErrorData::resource_not_found(e.to_string(), None)
                } else {
                    ErrorData::internal_error(e.to_string(), None)
                }
            })
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, ErrorData> {
        self.ensure_connected().await;
        aggregate::list_prompts(&self.deps.manager, &self.session_id)
            .await
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, ErrorData> {
        self.ensure_connected().await;
        aggregate::get_prompt(
            &self.deps.manager,
            &request.name,
            request.arguments,
            &self.session_id,
        )
        .await
        .map_err(|e| {
            if Self::not_found(&e) {
                ErrorData::invalid_params(e.to_string(), None)
            } else {
                ErrorData::internal_error(e.to_string(), None)
            }
        })
    }
}

impl Drop for GatewayService {
    /// Tear down this session's upstream pool when the downstream session
    /// goes away.
    fn drop(&mut self) {
        let manager = Arc::clone(&self.deps.manager);
        let capabilities = Arc::clone(&self.deps.capabilities);
        let session_id = self.session_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                capabilities.remove(&session_id);
                manager.close_session(&session_id).await;
            });
        }
    }
}

/// Serve the single `"default"` session over stdin/stdout.
pub async fn serve_stdio(deps: GatewayDeps) -> anyhow::Result<()> {
    let manager = Arc::clone(&deps.manager);
    let service = GatewayService::new("default", deps);

    let running = service.serve(rmcp::transport::stdio()).await?;
    running.waiting().await?;

    manager.close().await;
    Ok(())
}

/// Serve streamable HTTP at `/mcp`, one gateway session per protocol
/// session.
pub async fn serve_http(deps: GatewayDeps, host: &str, port: u16) -> anyhow::Result<()> {
    let manager = Arc::clone(&deps.manager);

    let service = StreamableHttpService::new(
        move || {
            Ok(GatewayService::new(
                Uuid::new_v4().to_string(),
                deps.clone(),
            ))
        },
        Arc::new(LocalSessionManager::default()),
        StreamableHttpServerConfig::default(),
    );

    let app = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Gateway listening on http://{host}:{port}/mcp");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    manager.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use luagate_mcp::GatewayMetrics;

    fn test_deps() -> GatewayDeps {
        let capabilities = Arc::new(CapabilityStore::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let manager = UpstreamManager::new(Arc::clone(&capabilities), Arc::clone(&metrics));
        let dispatcher = Arc::new(MetaToolDispatcher::new(Arc::clone(&manager), metrics));
        GatewayDeps {
            config: Arc::new(GatewayConfig::default()),
            manager,
            dispatcher,
            capabilities,
        }
    }

    #[tokio::test]
    async fn test_get_info_advertises_meta_tools() {
        let deps = test_deps();
        let service = GatewayService::new("default", deps.clone());

        let info = service.get_info();
        assert_eq!(info.server_info.name, "luagate");
        assert!(info.instructions.unwrap().contains("list-servers"));
        assert_eq!(deps.dispatcher.tools().len(), 5);
    }

    #[tokio::test]
    async fn test_connect_all_with_empty_config_is_noop() {
        let deps = test_deps();
        connect_all(&deps.manager, &deps.config, "default").await;
        assert!(deps.manager.get_clients_by_session("default").is_empty());
    }

    #[tokio::test]
    async fn test_connect_all_records_failures_per_session() {
        let deps = test_deps();
        let config = GatewayConfig {
            mcp_clients: vec![(
                "broken".to_string(),
                ClientConfig::Stdio {
                    command: "/nonexistent/luagate-test-binary".to_string(),
                    args: Vec::new(),
                    env: std::collections::HashMap::new(),
                    allowed_tools: None,
                },
            )],
            ..GatewayConfig::default()
        };

        connect_all(&deps.manager, &config, "default").await;
        assert_eq!(deps.manager.get_failed_servers("default").len(), 1);
    }
}

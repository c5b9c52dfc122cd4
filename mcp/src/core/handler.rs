//! Client handler for upstream MCP server notifications.
//!
//! Implements RMCP's `ClientHandler` trait for every upstream connection.
//! List-change notifications invalidate the session's tool cache and are
//! forwarded upward as [`ChangeEvent`]s carrying the originating
//! `(server_name, session_id)` pair; progress and logging notifications are
//! logged.

use std::sync::Arc;

use rmcp::{
    model::{
        CancelledNotificationParam, ClientInfo, LoggingLevel, LoggingMessageNotificationParam,
        ProgressNotificationParam, ResourceUpdatedNotificationParam,
    },
    service::NotificationContext,
    ClientHandler, RoleClient,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::session::ToolCache;
use crate::capabilities::DownstreamCapabilities;

/// Which upstream list changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Tools,
    Resources,
    Prompts,
}

/// Upward change notification, demultiplexed by the manager.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub server_name: String,
    pub session_id: String,
}

#[derive(Clone)]
pub struct GatewayClientHandler {
    server_name: Arc<str>,
    session_id: Arc<str>,
    capabilities: DownstreamCapabilities,
    tool_cache: Arc<ToolCache>,
    change_tx: mpsc::Sender<ChangeEvent>,
}

impl GatewayClientHandler {
    pub fn new(
        server_name: impl AsRef<str>,
        session_id: impl AsRef<str>,
        capabilities: DownstreamCapabilities,
        tool_cache: Arc<ToolCache>,
        change_tx: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        Self {
            server_name: Arc::from(server_name.as_ref()),
            session_id: Arc::from(session_id.as_ref()),
            capabilities,
            tool_cache,
            change_tx,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn send_change(&self, kind: ChangeKind) {
        let event = ChangeEvent {
            kind,
            server_name: self.server_name.to_string(),
            session_id: self.session_id.to_string(),
        };
        if let Err(e) = self.change_tx.try_send(event) {
            warn!(
                server_name = %self.server_name,
                session_id = %self.session_id,
                error = %e,
                "Failed to forward list-changed notification"
            );
        }
    }
}

impl ClientHandler for GatewayClientHandler {
    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(
            server_name = %self.server_name,
            session_id = %self.session_id,
            "Upstream tool list changed"
        );
        self.tool_cache.invalidate();
        self.send_change(ChangeKind::Tools);
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(
            server_name = %self.server_name,
            session_id = %self.session_id,
            "Upstream resource list changed"
        );
        self.send_change(ChangeKind::Resources);
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(
            server_name = %self.server_name,
            session_id = %self.session_id,
            "Upstream prompt list changed"
        );
        self.send_change(ChangeKind::Prompts);
    }

    async fn on_cancelled(
        &self,
        params: CancelledNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        info!(
            server_name = %self.server_name,
            request_id = %params.request_id,
            reason = ?params.reason,
            "Upstream server cancelled request"
        );
    }

    async fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        debug!(
            server_name = %self.server_name,
            token = ?params.progress_token,
            progress = %params.progress,
            total = ?params.total,
            "Upstream server progress"
        );
    }

    async fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        info!(
            server_name = %self.server_name,
            uri = %params.uri,
            "Upstream server resource updated"
        );
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        let logger = params.logger.as_deref().unwrap_or("mcp");

        match params.level {
            LoggingLevel::Emergency
            | LoggingLevel::Alert
            | LoggingLevel::Critical
            | LoggingLevel::Error => {
                error!(server_name = %self.server_name, logger = %logger, "MCP: {}", params.data);
            }
            LoggingLevel::Warning => {
                warn!(server_name = %self.server_name, logger = %logger, "MCP: {}", params.data);
            }
            LoggingLevel::Notice | LoggingLevel::Info => {
                info!(server_name = %self.server_name, logger = %logger, "MCP: {}", params.data);
            }
            LoggingLevel::Debug => {
                debug!(server_name = %self.server_name, logger = %logger, "MCP: {}", params.data);
            }
        }
    }

    fn get_info(&self) -> ClientInfo {
        let mut client_info = ClientInfo::default();
        client_info.client_info.name = "luagate".to_string();
        client_info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
        if self.capabilities.sampling {
            client_info.capabilities.sampling = Some(Default::default());
        }
        if self.capabilities.elicitation {
            client_info.capabilities.elicitation = Some(Default::default());
        }
        client_info
    }
}

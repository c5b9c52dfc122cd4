//! Upstream client pool.
//!
//! Owns every upstream session, keyed by `"{serverName}-{downstreamSessionId}"`.
//! Connection attempts never raise: they return a structured
//! [`ConnectionResult`] and record failures per downstream session until that
//! session closes. Adds are idempotent per key and single-flight, so
//! concurrent attempts initialize exactly one connection.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use parking_lot::RwLock;
use rmcp::{
    transport::{
        streamable_http_client::StreamableHttpClientTransportConfig, ConfigureCommandExt,
        StreamableHttpClientTransport, TokioChildProcess,
    },
    ServiceExt,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{
    handler::{ChangeEvent, ChangeKind, GatewayClientHandler},
    session::{ToolCache, UpstreamSession},
};
use crate::{
    capabilities::{CapabilityStore, DownstreamCapabilities},
    error::{GatewayError, GatewayResult},
    metrics::GatewayMetrics,
};

/// Outcome of an `add_*_client` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionResult {
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
}

impl ConnectionResult {
    fn connected(name: &str) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            error: None,
        }
    }

    fn failed(name: &str, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Handler invoked with `(server_name, downstream_session_id)` when an
/// upstream list changes. Latest registration wins.
pub type ChangeHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct ChangeHandlers {
    tools: RwLock<Option<ChangeHandler>>,
    resources: RwLock<Option<ChangeHandler>>,
    prompts: RwLock<Option<ChangeHandler>>,
}

impl ChangeHandlers {
    fn dispatch(&self, event: &ChangeEvent) {
        let handler = match event.kind {
            ChangeKind::Tools => self.tools.read().clone(),
            ChangeKind::Resources => self.resources.read().clone(),
            ChangeKind::Prompts => self.prompts.read().clone(),
        };
        if let Some(handler) = handler {
            handler(&event.server_name, &event.session_id);
        }
    }
}

enum ConnectSpec<'a> {
    Http {
        url: &'a str,
        headers: &'a HashMap<String, String>,
    },
    Stdio {
        command: &'a str,
        args: &'a [String],
        env: &'a HashMap<String, String>,
    },
}

/// Composite pool key.
fn pool_key(server_name: &str, session_id: &str) -> String {
    format!("{server_name}-{session_id}")
}

pub struct UpstreamManager {
    /// Live sessions keyed by `"{serverName}-{downstreamSessionId}"`.
    sessions: DashMap<String, Arc<UpstreamSession>>,
    /// Per downstream session: server names in insertion order.
    session_servers: DashMap<String, Vec<String>>,
    /// Per downstream session: failed connection attempts, insertion order.
    failed: DashMap<String, Vec<(String, String)>>,
    /// Per pool key: single-flight guard for concurrent adds.
    init_locks: DashMap<String, Arc<Mutex<()>>>,
    capabilities: Arc<CapabilityStore>,
    metrics: Arc<GatewayMetrics>,
    change_tx: mpsc::Sender<ChangeEvent>,
    handlers: Arc<ChangeHandlers>,
}

impl UpstreamManager {
    const CHANGE_CHANNEL_CAPACITY: usize = 128;

    /// Create the manager and spawn its change-notification demux task.
    pub fn new(capabilities: Arc<CapabilityStore>, metrics: Arc<GatewayMetrics>) -> Arc<Self> {
        let (change_tx, mut change_rx) = mpsc::channel(Self::CHANGE_CHANNEL_CAPACITY);
        let handlers = Arc::new(ChangeHandlers::default());

        let manager = Arc::new(Self {
            sessions: DashMap::new(),
            session_servers: DashMap::new(),
            failed: DashMap::new(),
            init_locks: DashMap::new(),
            capabilities,
            metrics,
            change_tx,
            handlers: Arc::clone(&handlers),
        });

        tokio::spawn(async move {
            while let Some(event) = change_rx.recv().await {
                debug!(
                    server_name = %event.server_name,
                    session_id = %event.session_id,
                    kind = ?event.kind,
                    "Dispatching upstream list change"
                );
                handlers.dispatch(&event);
            }
        });

        manager
    }

    pub fn set_tool_list_changed_handler(&self, handler: ChangeHandler) {
        *self.handlers.tools.write() = Some(handler);
    }

    pub fn set_resource_list_changed_handler(&self, handler: ChangeHandler) {
        *self.handlers.resources.write() = Some(handler);
    }

    pub fn set_prompt_list_changed_handler(&self, handler: ChangeHandler) {
        *self.handlers.prompts.write() = Some(handler);
    }

    pub async fn add_http_client(
        &self,
        server_name: &str,
        url: &str,
        session_id: &str,
        headers: &HashMap<String, String>,
        allowed_tools: Option<Vec<String>>,
        capabilities: Option<DownstreamCapabilities>,
    ) -> ConnectionResult {
        self.add_client(
            server_name,
            session_id,
            allowed_tools,
            capabilities,
            ConnectSpec::Http { url, headers },
        )
        .await
    }

    pub async fn add_stdio_client(
        &self,
        server_name: &str,
        command: &str,
        session_id: &str,
        args: &[String],
        env: &HashMap<String, String>,
        allowed_tools: Option<Vec<String>>,
        capabilities: Option<DownstreamCapabilities>,
    ) -> ConnectionResult {
        self.add_client(
            server_name,
            session_id,
            allowed_tools,
            capabilities,
            ConnectSpec::Stdio { command, args, env },
        )
        .await
    }

    async fn add_client(
        &self,
        server_name: &str,
        session_id: &str,
        allowed_tools: Option<Vec<String>>,
        capabilities: Option<DownstreamCapabilities>,
        spec: ConnectSpec<'_>,
    ) -> ConnectionResult {
        let key = pool_key(server_name, session_id);
        if self.sessions.contains_key(&key) {
            return ConnectionResult::connected(server_name);
        }

        let lock = self
            .init_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A concurrent add may have won the race while we waited.
        if self.sessions.contains_key(&key) {
            return ConnectionResult::connected(server_name);
        }

        if let Some(caps) = capabilities {
            self.capabilities.store(session_id, caps);
        }
        let caps = self.capabilities.get(session_id).unwrap_or_default();

        match self
            .connect(server_name, session_id, caps, allowed_tools, spec)
            .await
        {
            Ok(session) => {
                self.sessions.insert(key, Arc::new(session));
                let mut servers = self
                    .session_servers
                    .entry(session_id.to_string())
                    .or_default();
                if servers.is_empty() {
                    self.metrics.record_session_opened();
                }
                servers.push(server_name.to_string());
                drop(servers);

                if let Some(mut failures) = self.failed.get_mut(session_id) {
                    failures.retain(|(name, _)| name != server_name);
                }
                self.metrics.record_connection_opened();
                info!(
                    server_name = %server_name,
                    session_id = %session_id,
                    "Connected to upstream server"
                );
                ConnectionResult::connected(server_name)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    server_name = %server_name,
                    session_id = %session_id,
                    error = %message,
                    "Upstream connection failed"
                );
                self.metrics.record_connection_failed();
                let mut failures = self.failed.entry(session_id.to_string()).or_default();
                failures.retain(|(name, _)| name != server_name);
                failures.push((server_name.to_string(), message.clone()));
                ConnectionResult::failed(server_name, message)
            }
        }
    }

    async fn connect(
        &self,
        server_name: &str,
        session_id: &str,
        caps: DownstreamCapabilities,
        allowed_tools: Option<Vec<String>>,
        spec: ConnectSpec<'_>,
    ) -> GatewayResult<UpstreamSession> {
        let tool_cache = Arc::new(ToolCache::new());
        let handler = GatewayClientHandler::new(
            server_name,
            session_id,
            caps,
            Arc::clone(&tool_cache),
            self.change_tx.clone(),
        );

        let client = match spec {
            ConnectSpec::Http { url, headers } => {
                let mut header_map = reqwest::header::HeaderMap::new();
                for (header, value) in headers {
                    let header = reqwest::header::HeaderName::from_bytes(header.as_bytes())
                        .map_err(|e| {
                            GatewayError::Transport(format!("invalid header name '{header}': {e}"))
                        })?;
                    let value = reqwest::header::HeaderValue::from_str(value).map_err(|e| {
                        GatewayError::Transport(format!("invalid header value for '{header}': {e}"))
                    })?;
                    header_map.insert(header, value);
                }

                let http_client = reqwest::Client::builder()
                    .default_headers(header_map)
                    .build()
                    .map_err(|e| GatewayError::Transport(format!("build HTTP client: {e}")))?;

                let transport = StreamableHttpClientTransport::with_client(
                    http_client,
                    StreamableHttpClientTransportConfig::with_uri(url.to_string()),
                );

                handler
                    .serve(transport)
                    .await
                    .map_err(|e| GatewayError::upstream_connect(server_name, e))?
            }

            ConnectSpec::Stdio { command, args, env } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(env.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| GatewayError::Transport(format!("create stdio transport: {e}")))?;

                handler
                    .serve(transport)
                    .await
                    .map_err(|e| GatewayError::upstream_connect(server_name, e))?
            }
        };

        Ok(UpstreamSession::new(
            server_name,
            allowed_tools,
            client,
            tool_cache,
        ))
    }

    /// The session for `(server_name, session_id)`, if connected.
    pub fn get_client(
        &self,
        server_name: &str,
        session_id: &str,
    ) -> GatewayResult<Arc<UpstreamSession>> {
        self.sessions
            .get(&pool_key(server_name, session_id))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::ServerNotFound(server_name.to_string()))
    }

    /// All live sessions for a downstream session, in insertion order.
    pub fn get_clients_by_session(&self, session_id: &str) -> Vec<Arc<UpstreamSession>> {
        let Some(servers) = self.session_servers.get(session_id) else {
            return Vec::new();
        };
        servers
            .iter()
            .filter_map(|server| {
                self.sessions
                    .get(&pool_key(server, session_id))
                    .map(|entry| Arc::clone(entry.value()))
            })
            .collect()
    }

    /// Failed connection attempts for a downstream session, in insertion
    /// order. Retained until the session closes.
    pub fn get_failed_servers(&self, session_id: &str) -> Vec<(String, String)> {
        self.failed
            .get(session_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Close every upstream session belonging to one downstream session and
    /// purge its records. Close errors are logged, not propagated.
    pub async fn close_session(&self, session_id: &str) {
        let servers = self
            .session_servers
            .remove(session_id)
            .map(|(_, servers)| servers)
            .unwrap_or_default();

        for server in &servers {
            let key = pool_key(server, session_id);
            self.init_locks.remove(&key);
            if let Some((_, session)) = self.sessions.remove(&key) {
                session.close().await;
            }
        }

        self.failed.remove(session_id);
        self.capabilities.remove(session_id);
        if !servers.is_empty() {
            self.metrics.record_session_closed();
            info!(
                session_id = %session_id,
                count = servers.len(),
                "Closed downstream session"
            );
        }
    }

    /// Register a pre-connected session, bypassing the connect path.
    #[cfg(test)]
    pub(crate) fn insert_session_for_tests(&self, session_id: &str, session: UpstreamSession) {
        let key = pool_key(session.server_name(), session_id);
        self.session_servers
            .entry(session_id.to_string())
            .or_default()
            .push(session.server_name().to_string());
        self.sessions.insert(key, Arc::new(session));
    }

    /// Close every upstream session and clear all state.
    pub async fn close(&self) {
        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, session)) = self.sessions.remove(&key) {
                sessions.push(session);
            }
        }
        futures::future::join_all(sessions.iter().map(|session| session.close())).await;

        self.session_servers.clear();
        self.failed.clear();
        self.init_locks.clear();
        info!(count = sessions.len(), "Closed all upstream sessions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> Arc<UpstreamManager> {
        UpstreamManager::new(
            Arc::new(CapabilityStore::new()),
            Arc::new(GatewayMetrics::new()),
        )
    }

    #[test]
    fn test_pool_key_format() {
        assert_eq!(pool_key("calculator", "session-1"), "calculator-session-1");
    }

    #[tokio::test]
    async fn test_failed_stdio_connect_is_recorded() {
        let manager = test_manager();

        let result = manager
            .add_stdio_client(
                "broken",
                "/nonexistent/luagate-test-binary",
                "session-1",
                &[],
                &HashMap::new(),
                None,
                None,
            )
            .await;

        assert_eq!(result.name, "broken");
        assert!(!result.success);
        assert!(result.error.is_some());

        let failed = manager.get_failed_servers("session-1");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "broken");

        // Failed servers never land in the pool.
        assert!(manager.get_client("broken", "session-1").is_err());
        assert!(manager.get_clients_by_session("session-1").is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_servers() {
        let manager = test_manager();

        let first = manager
            .add_stdio_client(
                "broken-a",
                "/nonexistent/luagate-test-binary",
                "session-1",
                &[],
                &HashMap::new(),
                None,
                None,
            )
            .await;
        let second = manager
            .add_stdio_client(
                "broken-b",
                "/nonexistent/luagate-test-binary",
                "session-1",
                &[],
                &HashMap::new(),
                None,
                None,
            )
            .await;

        assert!(!first.success);
        assert!(!second.success);

        let failed = manager.get_failed_servers("session-1");
        let names: Vec<&str> = failed.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["broken-a", "broken-b"]);
    }

    #[tokio::test]
    async fn test_repeat_failure_keeps_single_record() {
        let manager = test_manager();

        for _ in 0..2 {
            manager
                .add_stdio_client(
                    "broken",
                    "/nonexistent/luagate-test-binary",
                    "session-1",
                    &[],
                    &HashMap::new(),
                    None,
                    None,
                )
                .await;
        }

        assert_eq!(manager.get_failed_servers("session-1").len(), 1);
    }

    #[tokio::test]
    async fn test_close_session_purges_failure_records() {
        let manager = test_manager();

        manager
            .add_stdio_client(
                "broken",
                "/nonexistent/luagate-test-binary",
                "session-1",
                &[],
                &HashMap::new(),
                None,
                None,
            )
            .await;
        assert_eq!(manager.get_failed_servers("session-1").len(), 1);

        manager.close_session("session-1").await;
        assert!(manager.get_failed_servers("session-1").is_empty());
    }

    #[tokio::test]
    async fn test_failure_records_are_per_session() {
        let manager = test_manager();

        manager
            .add_stdio_client(
                "broken",
                "/nonexistent/luagate-test-binary",
                "session-1",
                &[],
                &HashMap::new(),
                None,
                None,
            )
            .await;

        assert!(manager.get_failed_servers("session-2").is_empty());
    }

    #[tokio::test]
    async fn test_latest_change_handler_wins() {
        let manager = test_manager();

        let first_called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let second_called = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let flag = Arc::clone(&first_called);
        manager.set_tool_list_changed_handler(Arc::new(move |_, _| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        let flag = Arc::clone(&second_called);
        manager.set_tool_list_changed_handler(Arc::new(move |_, _| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        manager.handlers.dispatch(&ChangeEvent {
            kind: ChangeKind::Tools,
            server_name: "calc".to_string(),
            session_id: "session-1".to_string(),
        });

        assert!(!first_called.load(std::sync::atomic::Ordering::SeqCst));
        assert!(second_called.load(std::sync::atomic::Ordering::SeqCst));
    }
}

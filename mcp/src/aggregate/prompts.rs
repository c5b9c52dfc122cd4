//! Prompt aggregation across a downstream session's upstream servers.
//!
//! Prompt names are namespaced as `{server}/{name}`; `get_prompt` routes on
//! the prefix and forwards arguments unchanged.

use rmcp::model::{GetPromptResult, ListPromptsResult};
use serde_json::Map;
use tracing::warn;

use crate::{
    core::UpstreamManager,
    error::{GatewayError, GatewayResult},
    namespace::{namespace_prompt_name, namespace_result_uris, parse_prompt_name},
};

/// Concatenated prompts from every successful upstream, names namespaced.
pub async fn list_prompts(
    manager: &UpstreamManager,
    session_id: &str,
) -> GatewayResult<ListPromptsResult> {
    let mut prompts = Vec::new();

    for session in manager.get_clients_by_session(session_id) {
        match session.list_prompts().await {
            Ok(list) => {
                for mut prompt in list {
                    prompt.name = namespace_prompt_name(session.server_name(), &prompt.name);
                    prompts.push(prompt);
                }
            }
            Err(e) => {
                warn!(
                    server_name = %session.server_name(),
                    error = %e,
                    "Failed to list prompts"
                );
            }
        }
    }

    Ok(ListPromptsResult {
        prompts,
        next_cursor: None,
    })
}

/// Fetch one namespaced prompt through its owning upstream.
pub async fn get_prompt(
    manager: &UpstreamManager,
    name: &str,
    arguments: Option<Map<String, serde_json::Value>>,
    session_id: &str,
) -> GatewayResult<GetPromptResult> {
    let (server, original) = parse_prompt_name(name).ok_or_else(|| {
        GatewayError::NotFound(format!(
            "Prompt name '{name}' is not namespaced; expected {{server}}/{{name}}"
        ))
    })?;

    let session = manager.get_client(server, session_id).map_err(|_| {
        GatewayError::NotFound(format!("Server '{server}' not found for prompt '{name}'"))
    })?;

    let result = session.get_prompt(original, arguments).await?;
    Ok(namespace_result_uris(result, server))
}

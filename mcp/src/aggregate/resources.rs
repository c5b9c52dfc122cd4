//! Resource aggregation across a downstream session's upstream servers.
//!
//! Listings expose namespaced `mcp://{server}/{uri}` URIs; reads route back
//! to the owning upstream and return results with embedded URIs rewritten to
//! the namespaced form.

use rmcp::model::{ListResourcesResult, ReadResourceResult};
use tracing::warn;

use crate::{
    core::UpstreamManager,
    error::{GatewayError, GatewayResult},
    namespace::{namespace_resource_uri, namespace_result_uris, parse_resource_uri},
};

/// Concatenated resources from every successful upstream, URIs namespaced.
pub async fn list_resources(
    manager: &UpstreamManager,
    session_id: &str,
) -> GatewayResult<ListResourcesResult> {
    let mut resources = Vec::new();

    for session in manager.get_clients_by_session(session_id) {
        match session.list_resources().await {
            Ok(list) => {
                for mut resource in list {
                    resource.raw.uri =
                        namespace_resource_uri(session.server_name(), &resource.raw.uri);
                    resources.push(resource);
                }
            }
            Err(e) => {
                warn!(
                    server_name = %session.server_name(),
                    error = %e,
                    "Failed to list resources"
                );
            }
        }
    }

    Ok(ListResourcesResult {
        resources,
        next_cursor: None,
    })
}

/// Read one namespaced resource through its owning upstream.
pub async fn read_resource(
    manager: &UpstreamManager,
    uri: &str,
    session_id: &str,
) -> GatewayResult<ReadResourceResult> {
    let (server, original) = parse_resource_uri(uri).ok_or_else(|| {
        GatewayError::NotFound(format!(
            "Resource URI '{uri}' is not namespaced; expected mcp://{{server}}/{{uri}}"
        ))
    })?;

    let session = manager.get_client(server, session_id).map_err(|_| {
        GatewayError::NotFound(format!("Server '{server}' not found for resource '{uri}'"))
    })?;

    let result = session.read_resource(original).await?;
    Ok(namespace_result_uris(result, server))
}

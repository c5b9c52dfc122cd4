//! Tool discovery across a downstream session's upstream servers.
//!
//! Output is text for the LLM: enumerated server listings, per-server tool
//! listings with sanitized Lua names, and full tool details with a usage
//! example in the script dialect.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    core::{UpstreamManager, UpstreamSession},
    error::{GatewayError, GatewayResult},
    format::format_input_schema,
    namespace::sanitize,
    script::ScriptSandbox,
};

pub(crate) struct ServerEntry {
    pub lua_identifier: String,
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub instructions: Option<String>,
    pub error: Option<String>,
}

pub(crate) struct ToolListing {
    pub lua_name: String,
    pub summary: Option<String>,
}

/// Enumerate successful and failed upstream servers for a session.
pub async fn list_servers(manager: &UpstreamManager, session_id: &str) -> String {
    let mut entries = Vec::new();

    for session in manager.get_clients_by_session(session_id) {
        let implementation = session.server_version();
        entries.push(ServerEntry {
            lua_identifier: sanitize(session.server_name()),
            name: session.server_name().to_string(),
            version: implementation
                .as_ref()
                .map(|info| format!("{} {}", info.name, info.version)),
            description: implementation.and_then(|info| info.title),
            instructions: session.instructions(),
            error: None,
        });
    }

    for (name, error) in manager.get_failed_servers(session_id) {
        entries.push(ServerEntry {
            lua_identifier: sanitize(&name),
            name,
            version: None,
            description: None,
            instructions: None,
            error: Some(error),
        });
    }

    render_server_list(&entries)
}

pub(crate) fn render_server_list(entries: &[ServerEntry]) -> String {
    if entries.is_empty() {
        return "No MCP servers configured for this session.".to_string();
    }

    let mut out = String::from("Available MCP servers:\n");
    for (i, entry) in entries.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {} (lua: {})\n",
            i + 1,
            entry.name,
            entry.lua_identifier
        ));
        if let Some(error) = &entry.error {
            out.push_str(&format!("   error: {error}\n"));
            continue;
        }
        if let Some(version) = &entry.version {
            out.push_str(&format!("   version: {version}\n"));
        }
        if let Some(description) = &entry.description {
            out.push_str(&format!("   description: {description}\n"));
        }
        if let Some(instructions) = &entry.instructions {
            out.push_str(&format!("   instructions: {instructions}\n"));
        }
    }
    out
}

/// Resolve a sanitized server name to its live session.
fn find_session(
    manager: &UpstreamManager,
    lua_server_name: &str,
    session_id: &str,
) -> GatewayResult<Arc<UpstreamSession>> {
    let sessions = manager.get_clients_by_session(session_id);
    if let Some(session) = sessions
        .iter()
        .find(|session| sanitize(session.server_name()) == lua_server_name)
    {
        return Ok(Arc::clone(session));
    }

    let available: Vec<String> = sessions
        .iter()
        .map(|session| sanitize(session.server_name()))
        .collect();
    Err(GatewayError::NotFound(format!(
        "Server '{lua_server_name}' not found. Available servers: {}",
        render_alternatives(&available)
    )))
}

fn render_alternatives(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

/// List one server's tools with their sanitized script names.
pub async fn list_server_tools(
    manager: &UpstreamManager,
    lua_server_name: &str,
    session_id: &str,
) -> GatewayResult<String> {
    let session = find_session(manager, lua_server_name, session_id)?;
    let tools = session.list_tools().await?;

    let listings: Vec<ToolListing> = tools
        .iter()
        .map(|tool| ToolListing {
            lua_name: sanitize(&tool.name),
            summary: tool
                .description
                .as_ref()
                .and_then(|d| d.lines().next())
                .map(str::to_string),
        })
        .collect();

    Ok(render_tool_list(
        session.server_name(),
        lua_server_name,
        &listings,
    ))
}

pub(crate) fn render_tool_list(
    server_name: &str,
    lua_server_name: &str,
    listings: &[ToolListing],
) -> String {
    if listings.is_empty() {
        return format!("Server '{server_name}' exposes no tools.");
    }

    let mut out = format!("Tools on '{server_name}' (lua: {lua_server_name}):\n\n");
    for (i, listing) in listings.iter().enumerate() {
        match &listing.summary {
            Some(summary) => out.push_str(&format!("{}. {} - {}\n", i + 1, listing.lua_name, summary)),
            None => out.push_str(&format!("{}. {}\n", i + 1, listing.lua_name)),
        }
    }
    out.push_str(&format!(
        "\nUse tool-details with luaServerName='{lua_server_name}' for parameter schemas."
    ));
    out
}

/// Full description, parameter schema and usage example for one tool.
pub async fn get_tool_details(
    manager: &UpstreamManager,
    lua_server_name: &str,
    lua_tool_name: &str,
    session_id: &str,
) -> GatewayResult<String> {
    let session = find_session(manager, lua_server_name, session_id)?;
    let tools = session.list_tools().await?;

    let tool = tools
        .iter()
        .find(|tool| sanitize(&tool.name) == lua_tool_name)
        .ok_or_else(|| {
            let available: Vec<String> =
                tools.iter().map(|tool| sanitize(&tool.name)).collect();
            GatewayError::NotFound(format!(
                "Tool '{lua_tool_name}' not found on server '{lua_server_name}'. \
                 Available tools: {}",
                render_alternatives(&available)
            ))
        })?;

    let schema = Value::Object((*tool.input_schema).clone());
    let mut out = format!("Tool '{lua_tool_name}' on server '{lua_server_name}'\n\n");
    if let Some(description) = &tool.description {
        out.push_str(description);
        out.push('\n');
    }

    let parameter_lines = format_input_schema(&schema);
    if parameter_lines.is_empty() {
        out.push_str("\nParameters: none\n");
    } else {
        out.push_str("\nParameters:\n");
        for line in parameter_lines {
            out.push_str(&line);
            out.push('\n');
        }
    }

    out.push_str(&format!(
        "\nUsage:\n  {lua_server_name}.{lua_tool_name}({{ ... }}):await()\n"
    ));
    Ok(out)
}

/// Execute the target tool through the scripting sandbox with the provided
/// sample arguments and report the decoded response structure.
///
/// This runs the real tool; callers pick sample arguments accordingly.
pub async fn inspect_tool_response(
    manager: &UpstreamManager,
    lua_server_name: &str,
    lua_tool_name: &str,
    sample_args: Option<Value>,
    session_id: &str,
) -> GatewayResult<String> {
    let session = find_session(manager, lua_server_name, session_id)?;
    let tools = session.list_tools().await?;
    if !tools.iter().any(|tool| sanitize(&tool.name) == lua_tool_name) {
        let available: Vec<String> = tools.iter().map(|tool| sanitize(&tool.name)).collect();
        return Err(GatewayError::NotFound(format!(
            "Tool '{lua_tool_name}' not found on server '{lua_server_name}'. \
             Available tools: {}",
            render_alternatives(&available)
        )));
    }

    // One-server binding; decoding matches what an `execute` script sees.
    let sandbox = ScriptSandbox::new(vec![session]);
    let script = format!("result({lua_server_name}.{lua_tool_name}(args):await())");
    let args = sample_args.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    let value = sandbox.run_with_global(&script, "args", &args).await?;

    Ok(match value {
        Some(value) => format!(
            "Response structure from {lua_server_name}.{lua_tool_name}:\n\n{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
        ),
        None => format!("{lua_server_name}.{lua_tool_name} returned no value."),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_empty_server_list() {
        assert_eq!(
            render_server_list(&[]),
            "No MCP servers configured for this session."
        );
    }

    #[test]
    fn test_render_server_list_mixed() {
        let entries = vec![
            ServerEntry {
                lua_identifier: "calculator".to_string(),
                name: "calculator".to_string(),
                version: Some("calc-server 1.2.0".to_string()),
                description: None,
                instructions: Some("Use add for sums".to_string()),
                error: None,
            },
            ServerEntry {
                lua_identifier: "data_server".to_string(),
                name: "data-server".to_string(),
                version: None,
                description: None,
                instructions: None,
                error: Some("connection refused".to_string()),
            },
        ];

        let rendered = render_server_list(&entries);
        assert!(rendered.contains("1. calculator (lua: calculator)"));
        assert!(rendered.contains("version: calc-server 1.2.0"));
        assert!(rendered.contains("instructions: Use add for sums"));
        assert!(rendered.contains("2. data-server (lua: data_server)"));
        assert!(rendered.contains("error: connection refused"));
    }

    #[test]
    fn test_render_tool_list() {
        let listings = vec![
            ToolListing {
                lua_name: "add".to_string(),
                summary: Some("Adds two numbers".to_string()),
            },
            ToolListing {
                lua_name: "list_files".to_string(),
                summary: None,
            },
        ];

        let rendered = render_tool_list("data-server", "data_server", &listings);
        assert!(rendered.contains("Tools on 'data-server' (lua: data_server):"));
        assert!(rendered.contains("1. add - Adds two numbers"));
        assert!(rendered.contains("2. list_files"));
    }

    #[test]
    fn test_render_empty_tool_list() {
        assert_eq!(
            render_tool_list("calc", "calc", &[]),
            "Server 'calc' exposes no tools."
        );
    }

    #[test]
    fn test_render_alternatives() {
        assert_eq!(render_alternatives(&[]), "(none)");
        assert_eq!(
            render_alternatives(&["a".to_string(), "b".to_string()]),
            "a, b"
        );
    }
}

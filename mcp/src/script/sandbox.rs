//! Sandboxed Lua orchestration engine.
//!
//! Each `execute` invocation gets a fresh Lua 5.4 interpreter with the
//! dangerous facilities unbound and one table per live upstream server. A
//! tool call like `calculator.add({a=1,b=2})` returns an awaitable; `:await()`
//! suspends the script until the upstream call resolves and yields the
//! decoded result. The script designates its return value through the
//! `result` sink, by calling it or by assigning to it.

use std::sync::Arc;

use mlua::{Lua, LuaSerdeExt};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    core::UpstreamSession,
    error::{GatewayError, GatewayResult},
    namespace::sanitize,
};

/// Globals unbound before any script runs: host OS access, filesystem I/O,
/// module loading, and debug introspection.
const REMOVED_GLOBALS: &[&str] = &[
    "os", "io", "require", "package", "dofile", "loadfile", "load", "debug",
];

pub struct ScriptSandbox {
    sessions: Vec<Arc<UpstreamSession>>,
}

impl ScriptSandbox {
    pub fn new(sessions: Vec<Arc<UpstreamSession>>) -> Self {
        Self { sessions }
    }

    /// Run a script and return the value it designated through `result`.
    pub async fn run(&self, script: &str) -> GatewayResult<Option<Value>> {
        self.execute(script, None).await
    }

    /// Run a script with one extra global preset to a JSON value.
    pub async fn run_with_global(
        &self,
        script: &str,
        name: &str,
        value: &Value,
    ) -> GatewayResult<Option<Value>> {
        self.execute(script, Some((name, value))).await
    }

    async fn execute(
        &self,
        script: &str,
        extra_global: Option<(&str, &Value)>,
    ) -> GatewayResult<Option<Value>> {
        let lua = Lua::new();
        scrub_globals(&lua).map_err(script_err)?;

        let globals = lua.globals();
        let result_slot: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        {
            let slot = Arc::clone(&result_slot);
            let sink = lua
                .create_function(move |lua, value: mlua::Value| {
                    let json: Value = lua.from_value(value)?;
                    *slot.lock() = Some(json);
                    Ok(())
                })
                .map_err(script_err)?;
            globals.set("result", sink).map_err(script_err)?;
        }

        for session in &self.sessions {
            let table = lua.create_table().map_err(script_err)?;
            let tools = match session.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(
                        server_name = %session.server_name(),
                        error = %e,
                        "Skipping server bindings; tool listing failed"
                    );
                    continue;
                }
            };
            for tool in &tools {
                let binding =
                    tool_binding(&lua, Arc::clone(session), tool.name.to_string())
                        .map_err(script_err)?;
                table.set(sanitize(&tool.name), binding).map_err(script_err)?;
            }
            globals
                .set(sanitize(session.server_name()), table)
                .map_err(script_err)?;
        }

        if let Some((name, value)) = extra_global {
            let lua_value = lua.to_value(value).map_err(script_err)?;
            globals.set(name, lua_value).map_err(script_err)?;
        }

        lua.load(script)
            .set_name("script")
            .exec_async()
            .await
            .map_err(|e| GatewayError::Script(e.to_string()))?;

        // The sink function still being bound means the script used calls
        // (or nothing); any other value means it assigned over the global.
        let result_global: mlua::Value = globals.get("result").map_err(script_err)?;
        match result_global {
            mlua::Value::Function(_) => Ok(result_slot.lock().take()),
            mlua::Value::Nil => Ok(None),
            other => {
                let json: Value = lua.from_value(other).map_err(script_err)?;
                Ok(Some(json))
            }
        }
    }
}

/// Decode an upstream tool result into the value handed to the script:
/// `structuredContent` when present, else a single text content parsed as
/// JSON, else the raw result structure.
pub(crate) fn decode_tool_result(result: &rmcp::model::CallToolResult) -> Value {
    if let Some(structured) = &result.structured_content {
        return structured.clone();
    }

    if result.content.len() == 1 {
        if let Some(text) = result.content[0].raw.as_text() {
            if let Ok(parsed) = serde_json::from_str::<Value>(&text.text) {
                return parsed;
            }
        }
    }

    serde_json::to_value(result).unwrap_or(Value::Null)
}

fn script_err(e: mlua::Error) -> GatewayError {
    GatewayError::Script(e.to_string())
}

fn scrub_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(*name, mlua::Value::Nil)?;
    }

    // stdout carries MCP framing in stdio mode; print goes to the log.
    let print = lua.create_function(|_, values: mlua::Variadic<mlua::Value>| {
        let rendered: Vec<String> = values.iter().map(render_lua_value).collect();
        debug!(target: "luagate::script", "{}", rendered.join("\t"));
        Ok(())
    })?;
    globals.raw_set("print", print)?;
    Ok(())
}

fn render_lua_value(value: &mlua::Value) -> String {
    match value {
        mlua::Value::Nil => "nil".to_string(),
        mlua::Value::Boolean(b) => b.to_string(),
        mlua::Value::Integer(i) => i.to_string(),
        mlua::Value::Number(n) => n.to_string(),
        mlua::Value::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    }
}

/// A callable `server.tool(args)` binding returning an awaitable table.
///
/// Arguments are marshalled to JSON at call time; the upstream call itself
/// only happens inside `:await()`, which suspends the script coroutine.
fn tool_binding(
    lua: &Lua,
    session: Arc<UpstreamSession>,
    tool_name: String,
) -> mlua::Result<mlua::Function> {
    lua.create_function(move |lua, args: Option<mlua::Table>| {
        let arguments: Value = match args {
            Some(table) => lua.from_value(mlua::Value::Table(table))?,
            None => Value::Object(serde_json::Map::new()),
        };

        let pending = lua.create_table()?;
        let session = Arc::clone(&session);
        let tool_name = tool_name.clone();
        let await_fn = lua.create_async_function(move |lua, _this: mlua::MultiValue| {
            let session = Arc::clone(&session);
            let tool_name = tool_name.clone();
            let arguments = arguments.clone();
            async move {
                let map = match arguments {
                    Value::Object(map) => map,
                    Value::Null => serde_json::Map::new(),
                    // Lua cannot distinguish an empty table from an empty array.
                    Value::Array(items) if items.is_empty() => serde_json::Map::new(),
                    other => {
                        return Err(mlua::Error::RuntimeError(format!(
                            "tool arguments must be a table of named fields, got {other}"
                        )))
                    }
                };

                let result = session
                    .call_tool(&tool_name, Some(map))
                    .await
                    .map_err(mlua::Error::external)?;
                lua.to_value(&decode_tool_result(&result))
            }
        })?;
        pending.set("await", await_fn)?;
        Ok(pending)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{CallToolResult, Content};
    use serde_json::json;

    fn empty_sandbox() -> ScriptSandbox {
        ScriptSandbox::new(Vec::new())
    }

    #[tokio::test]
    async fn test_result_by_call() {
        let value = empty_sandbox().run("result(42)").await.unwrap();
        assert_eq!(value, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_result_by_assignment() {
        let value = empty_sandbox()
            .run("result = { answer = 42, tags = { 'a', 'b' } }")
            .await
            .unwrap();
        assert_eq!(value, Some(json!({ "answer": 42, "tags": ["a", "b"] })));
    }

    #[tokio::test]
    async fn test_last_result_call_wins() {
        let value = empty_sandbox().run("result(1) result(2)").await.unwrap();
        assert_eq!(value, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_no_result_is_none() {
        let value = empty_sandbox().run("local x = 1 + 1").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_script_error_surfaces() {
        let err = empty_sandbox()
            .run(r#"error("Test error message")"#)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Script(_)));
        assert!(err.to_string().contains("Test error message"));
    }

    #[tokio::test]
    async fn test_dangerous_globals_removed() {
        let value = empty_sandbox()
            .run(
                "result(os == nil and io == nil and require == nil \
                 and package == nil and dofile == nil and loadfile == nil \
                 and load == nil and debug == nil)",
            )
            .await
            .unwrap();
        assert_eq!(value, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_unknown_binding_is_plain_script_error() {
        let err = empty_sandbox()
            .run("result(nonexistent.tool({}):await())")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Script(_)));
    }

    #[tokio::test]
    async fn test_print_does_not_touch_stdout() {
        // print is rebound to the log; calling it must not error.
        let value = empty_sandbox()
            .run("print('hello', 42, {}) result(true)")
            .await
            .unwrap();
        assert_eq!(value, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_extra_global_injection() {
        let value = empty_sandbox()
            .run_with_global("result(args.x + 1)", "args", &json!({ "x": 41 }))
            .await
            .unwrap();
        assert_eq!(value, Some(json!(42)));
    }

    #[test]
    fn test_decode_prefers_structured_content() {
        let result = CallToolResult {
            content: vec![Content::text("ignored")],
            structured_content: Some(json!({ "sum": 30 })),
            is_error: None,
            meta: None,
        };
        assert_eq!(decode_tool_result(&result), json!({ "sum": 30 }));
    }

    #[test]
    fn test_decode_parses_single_json_text() {
        let result = CallToolResult {
            content: vec![Content::text(r#"{ "sum": 30 }"#)],
            structured_content: None,
            is_error: None,
            meta: None,
        };
        assert_eq!(decode_tool_result(&result), json!({ "sum": 30 }));
    }

    #[test]
    fn test_decode_falls_back_to_raw_on_plain_text() {
        let result = CallToolResult {
            content: vec![Content::text("10 + 20 = 30")],
            structured_content: None,
            is_error: None,
            meta: None,
        };

        let decoded = decode_tool_result(&result);
        assert_eq!(decoded["content"][0]["text"], "10 + 20 = 30");
    }

    #[test]
    fn test_decode_falls_back_to_raw_on_multiple_contents() {
        let result = CallToolResult {
            content: vec![Content::text(r#"{"a":1}"#), Content::text(r#"{"b":2}"#)],
            structured_content: None,
            is_error: None,
            meta: None,
        };

        let decoded = decode_tool_result(&result);
        assert!(decoded["content"].as_array().map(Vec::len) == Some(2));
    }
}

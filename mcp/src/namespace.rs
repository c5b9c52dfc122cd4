//! Identifier sanitizing and namespacing.
//!
//! Upstream server and tool names are arbitrary UTF-8; scripts need them as
//! Lua identifiers. Resource URIs and prompt names from different upstreams
//! must stay unambiguous in the gateway's merged view, so they are prefixed
//! with the owning server's name and translated back on the way in.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Scheme prefix for namespaced resource URIs.
const RESOURCE_SCHEME: &str = "mcp://";

/// Rewrite an arbitrary string into a Lua identifier (`[A-Za-z_][A-Za-z0-9_]*`).
///
/// Every disallowed code point becomes `_`; a leading digit gets a `_`
/// prepended; the empty string becomes `_`. Idempotent on strings that are
/// already valid identifiers.
pub fn sanitize(name: &str) -> String {
    if name.is_empty() {
        return "_".to_string();
    }

    let mut out = String::with_capacity(name.len());
    for (i, ch) in name.chars().enumerate() {
        if ch == '_' || ch.is_ascii_alphabetic() || (i > 0 && ch.is_ascii_digit()) {
            out.push(ch);
        } else if i == 0 && ch.is_ascii_digit() {
            out.push('_');
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}

/// `mcp://{server}/{uri}`.
pub fn namespace_resource_uri(server: &str, uri: &str) -> String {
    format!("{RESOURCE_SCHEME}{server}/{uri}")
}

/// Split a namespaced resource URI back into `(server, original_uri)`.
///
/// The server name runs up to the third `/` (the first two belong to
/// `mcp://`); everything after it is the original URI. Returns `None` when
/// the prefix is missing or either half would be empty.
pub fn parse_resource_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix(RESOURCE_SCHEME)?;
    let (server, original) = rest.split_once('/')?;
    if server.is_empty() || original.is_empty() {
        return None;
    }
    Some((server, original))
}

/// `{server}/{name}`.
pub fn namespace_prompt_name(server: &str, name: &str) -> String {
    format!("{server}/{name}")
}

/// Split a namespaced prompt name at the first `/`. Both halves must be
/// non-empty.
pub fn parse_prompt_name(name: &str) -> Option<(&str, &str)> {
    let (server, original) = name.split_once('/')?;
    if server.is_empty() || original.is_empty() {
        return None;
    }
    Some((server, original))
}

/// True if `value` starts with an RFC 3986 scheme (`alpha *(alnum|+|-|.) :`).
fn has_scheme(value: &str) -> bool {
    let Some(colon) = value.find(':') else {
        return false;
    };
    let scheme = &value[..colon];
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Rewrite every `uri` field inside an arbitrary JSON structure to its
/// namespaced form. URIs already under `mcp://` are left alone, which makes
/// the rewrite idempotent.
fn rewrite_uri_fields(value: &mut Value, server: &str) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if key == "uri" {
                    if let Value::String(uri) = entry {
                        if has_scheme(uri) && !uri.starts_with(RESOURCE_SCHEME) {
                            *uri = namespace_resource_uri(server, uri);
                        }
                    }
                } else {
                    rewrite_uri_fields(entry, server);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_uri_fields(item, server);
            }
        }
        _ => {}
    }
}

/// Namespace every embedded `uri` in a protocol result structure.
///
/// Works over the serde representation so nested content shapes (embedded
/// resources, resource links, prompt messages) are all covered by one
/// walker. If the structure cannot round-trip, it is returned unchanged.
pub fn namespace_result_uris<T>(result: T, server: &str) -> T
where
    T: Serialize + DeserializeOwned,
{
    let Ok(mut json) = serde_json::to_value(&result) else {
        return result;
    };
    rewrite_uri_fields(&mut json, server);
    serde_json::from_value(json).unwrap_or(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{CallToolResult, Content};

    #[test]
    fn test_sanitize_valid_identifiers_unchanged() {
        for name in ["calculator", "data_server", "_private", "Tool2", "a"] {
            assert_eq!(sanitize(name), name);
        }
    }

    #[test]
    fn test_sanitize_replaces_disallowed_chars() {
        assert_eq!(sanitize("data-server"), "data_server");
        assert_eq!(sanitize("my.cool/tool"), "my_cool_tool");
        assert_eq!(sanitize("söme name"), "s_me_name");
    }

    #[test]
    fn test_sanitize_leading_digit_and_empty() {
        assert_eq!(sanitize("2fast"), "_2fast");
        assert_eq!(sanitize(""), "_");
        assert_eq!(sanitize("9"), "_9");
    }

    #[test]
    fn test_sanitize_idempotent() {
        for name in ["data-server", "2fast", "", "weird!name"] {
            let once = sanitize(name);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn test_resource_uri_round_trip() {
        for (server, uri) in [
            ("data-server", "file:///test-data.json"),
            ("s", "http://example.com/a/b?c=d"),
            ("srv", "custom:thing"),
        ] {
            let namespaced = namespace_resource_uri(server, uri);
            assert_eq!(parse_resource_uri(&namespaced), Some((server, uri)));
        }
    }

    #[test]
    fn test_parse_resource_uri_rejects_malformed() {
        assert_eq!(parse_resource_uri("http://not-namespaced"), None);
        assert_eq!(parse_resource_uri("mcp://"), None);
        assert_eq!(parse_resource_uri("mcp://server-only"), None);
        assert_eq!(parse_resource_uri("mcp://server/"), None);
        assert_eq!(parse_resource_uri("mcp:///file:///x"), None);
    }

    #[test]
    fn test_prompt_name_round_trip() {
        let namespaced = namespace_prompt_name("data-server", "greeting");
        assert_eq!(namespaced, "data-server/greeting");
        assert_eq!(
            parse_prompt_name(&namespaced),
            Some(("data-server", "greeting"))
        );
    }

    #[test]
    fn test_parse_prompt_name_rejects_malformed() {
        assert_eq!(parse_prompt_name("no-slash"), None);
        assert_eq!(parse_prompt_name("/name"), None);
        assert_eq!(parse_prompt_name("server/"), None);
    }

    #[test]
    fn test_has_scheme() {
        assert!(has_scheme("file:///x"));
        assert!(has_scheme("custom+v1:payload"));
        assert!(!has_scheme("no-scheme-here"));
        assert!(!has_scheme("1bad:scheme"));
        assert!(!has_scheme(":empty"));
    }

    #[test]
    fn test_namespace_result_uris_rewrites_nested() {
        let result = CallToolResult {
            content: vec![Content::text("see file:///a")],
            structured_content: Some(serde_json::json!({
                "uri": "file:///test-data.json",
                "nested": [{ "uri": "http://inner/x" }],
                "unrelated": "file:///untouched-because-not-a-uri-field",
            })),
            is_error: None,
            meta: None,
        };

        let rewritten = namespace_result_uris(result, "data-server");
        let structured = rewritten.structured_content.unwrap();
        assert_eq!(
            structured["uri"],
            "mcp://data-server/file:///test-data.json"
        );
        assert_eq!(
            structured["nested"][0]["uri"],
            "mcp://data-server/http://inner/x"
        );
        assert_eq!(
            structured["unrelated"],
            "file:///untouched-because-not-a-uri-field"
        );
    }

    #[test]
    fn test_namespace_result_uris_idempotent() {
        let result = CallToolResult {
            content: Vec::new(),
            structured_content: Some(serde_json::json!({ "uri": "file:///x" })),
            is_error: None,
            meta: None,
        };

        let once = namespace_result_uris(result, "srv");
        let expected = once.structured_content.clone();
        let twice = namespace_result_uris(once, "srv");
        assert_eq!(twice.structured_content, expected);
    }
}

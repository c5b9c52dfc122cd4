//! Schema rendering for tool output.
//!
//! Meta-tools answer with human-readable text, so JSON Schemas from upstream
//! tools are flattened into short type labels and indented parameter lists.

use serde_json::Value;

/// Short label for a schema node: `string`, `number`, `boolean`, `object`,
/// `array<T>` (recursive), `enum: a | b | ...` when no type is declared,
/// otherwise `unknown`.
pub fn schema_type_label(schema: &Value) -> String {
    match schema.get("type").and_then(Value::as_str) {
        Some("string") => "string".to_string(),
        Some("number") => "number".to_string(),
        Some("boolean") => "boolean".to_string(),
        Some("object") => "object".to_string(),
        Some("array") => {
            let item_label = schema
                .get("items")
                .map(schema_type_label)
                .unwrap_or_else(|| "unknown".to_string());
            format!("array<{item_label}>")
        }
        None => match schema.get("enum").and_then(Value::as_array) {
            Some(values) => {
                let rendered: Vec<String> = values.iter().map(render_enum_value).collect();
                format!("enum: {}", rendered.join(" | "))
            }
            None => "unknown".to_string(),
        },
        Some(_) => "unknown".to_string(),
    }
}

fn render_enum_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render an object schema's properties as indented lines:
///
/// ```text
///   name (type, required|optional)
///     description
///
/// ```
///
/// Non-object or property-less schemas yield an empty list. Required
/// membership comes from the schema's top-level `required` array.
pub fn format_input_schema(schema: &Value) -> Vec<String> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    if properties.is_empty() {
        return Vec::new();
    }

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|entries| entries.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut lines = Vec::with_capacity(properties.len() * 3);
    for (name, property) in properties {
        let requirement = if required.contains(&name.as_str()) {
            "required"
        } else {
            "optional"
        };
        lines.push(format!(
            "  {name} ({}, {requirement})",
            schema_type_label(property)
        ));
        lines.push(
            property
                .get("description")
                .and_then(Value::as_str)
                .map(|d| format!("    {d}"))
                .unwrap_or_default(),
        );
        lines.push(String::new());
    }
    lines
}

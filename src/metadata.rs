//! Flattening of nested scene metadata.
//!
//! All renderings walk the tree depth first with object keys in lexicographic
//! order. Arrays show their scalar elements inline; composite elements are
//! announced with a `[dict]` or `[list]` tag before their contents.

use serde_json::{Map, Value};

use crate::error::CatalogError;

const LEVEL: &str = "- ";

pub fn to_indented_text(value: &Value) -> String {
    let mut lines = Vec::new();
    fill_text(&mut lines, "", value);
    lines.join("\n")
}

fn fill_text(lines: &mut Vec<String>, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            let nested = format!("{prefix}{LEVEL}");
            for (key, child) in sorted_entries(map) {
                lines.push(format!("{prefix}{key}"));
                fill_text(lines, &nested, child);
            }
        }
        Value::Array(items) => {
            if let Some(inline) = inline_scalars(items) {
                append_to_last(lines, &inline);
            }
            let nested = format!("{prefix}{LEVEL}");
            for item in items.iter().filter(|item| is_composite(item)) {
                lines.push(format!("{prefix}{}", composite_tag(item)));
                fill_text(lines, &nested, item);
            }
        }
        scalar => append_to_last(lines, &scalar_text(scalar)),
    }
}

fn append_to_last(lines: &mut Vec<String>, text: &str) {
    match lines.last_mut() {
        Some(last) => {
            last.push_str(": ");
            last.push_str(text);
        }
        None => lines.push(text.to_string()),
    }
}

pub fn to_html(value: &Value) -> String {
    let mut html = String::new();
    fill_html(&mut html, value);
    html
}

fn fill_html(html: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            html.push_str("<ul>");
            for (key, child) in sorted_entries(map) {
                match inline_text(child) {
                    Some(text) => {
                        html.push_str(&format!(
                            "<li>{}: {}</li>",
                            escape_html(key),
                            escape_html(&text)
                        ));
                    }
                    None => {
                        html.push_str(&format!("<li>{}</li>", escape_html(key)));
                        fill_html(html, child);
                    }
                }
            }
            html.push_str("</ul>");
        }
        Value::Array(items) => {
            html.push_str("<ul>");
            if let Some(inline) = inline_scalars(items) {
                html.push_str(&format!("<li>{}</li>", escape_html(&inline)));
            }
            for item in items.iter().filter(|item| is_composite(item)) {
                html.push_str(&format!("<li>{}</li>", composite_tag(item)));
                fill_html(html, item);
            }
            html.push_str("</ul>");
        }
        scalar => html.push_str(&escape_html(&scalar_text(scalar))),
    }
}

/// One `'"key", "path"' = value` line per leaf.
pub fn to_key_value_lines(value: &Value) -> String {
    let mut keys = Vec::new();
    let mut lines = Vec::new();
    fill_pairs(&mut keys, &mut lines, value);
    lines.join("\n")
}

fn fill_pairs(keys: &mut Vec<String>, lines: &mut Vec<String>, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in sorted_entries(map) {
                keys.push(format!("\"{key}\""));
                fill_pairs(keys, lines, child);
                keys.pop();
            }
        }
        Value::Array(items) => {
            for item in items {
                if is_composite(item) {
                    keys.push(format!("\"{}\"", composite_tag(item)));
                    fill_pairs(keys, lines, item);
                    keys.pop();
                } else {
                    lines.push(format!("'{}' = {}", keys.join(", "), scalar_text(item)));
                }
            }
        }
        scalar => lines.push(format!("'{}' = {}", keys.join(", "), scalar_text(scalar))),
    }
}

/// Resolves `keys` through nested objects down to a non-object value.
pub fn value_at_path<'a, S: AsRef<str>>(
    value: &'a Value,
    keys: &[S],
) -> Result<&'a Value, CatalogError> {
    let mut current = value;
    for key in keys {
        match current {
            Value::Object(map) => {
                current = map
                    .get(key.as_ref())
                    .ok_or_else(|| CatalogError::InvalidKey(describe_path(keys)))?;
            }
            _ => return Err(CatalogError::InvalidTerminalKey(describe_path(keys))),
        }
    }
    if current.is_object() {
        return Err(CatalogError::MissingPath(describe_path(keys)));
    }
    Ok(current)
}

/// Parses the expression argument `"key1","key2",...` into key names.
pub fn parse_key_expression(expression: &str) -> Result<Vec<String>, CatalogError> {
    if expression.matches('"').count() % 2 != 0 {
        return Err(CatalogError::InvalidKeyExpression(format!(
            "keys need double quotes: {expression}"
        )));
    }
    if expression.trim().is_empty() {
        return Err(CatalogError::InvalidKeyExpression(
            "expression is empty".to_string(),
        ));
    }
    Ok(expression
        .split(',')
        .map(|key| key.trim().trim_matches('"').to_string())
        .collect())
}

/// Expression entry point: looks up a key path inside serialized metadata.
pub fn value_from_metadata(meta_json: &str, expression: &str) -> Result<Value, CatalogError> {
    let keys = parse_key_expression(expression)?;
    let document: Value = serde_json::from_str(meta_json)
        .map_err(|err| CatalogError::InvalidKeyExpression(format!("metadata is not JSON: {err}")))?;
    value_at_path(&document, &keys).cloned()
}

fn describe_path<S: AsRef<str>>(keys: &[S]) -> String {
    keys.iter()
        .map(|key| format!("'{}'", key.as_ref()))
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn sorted_entries(map: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries = map.iter().collect::<Vec<_>>();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn is_composite(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

fn composite_tag(value: &Value) -> &'static str {
    if value.is_object() { "[dict]" } else { "[list]" }
}

fn inline_scalars(items: &[Value]) -> Option<String> {
    let scalars = items
        .iter()
        .filter(|item| !is_composite(item))
        .map(scalar_text)
        .collect::<Vec<_>>();
    (!scalars.is_empty()).then(|| scalars.join(", "))
}

fn inline_text(value: &Value) -> Option<String> {
    match value {
        Value::Object(_) => None,
        Value::Array(items) if items.iter().any(is_composite) => None,
        Value::Array(items) => Some(inline_scalars(items).unwrap_or_default()),
        scalar => Some(scalar_text(scalar)),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_root_renders_alone() {
        assert_eq!(to_indented_text(&json!(5)), "5");
    }

    #[test]
    fn html_escapes_markup() {
        let html = to_html(&json!({"a": "<b>"}));
        assert_eq!(html, "<ul><li>a: &lt;b&gt;</li></ul>");
    }
}

//! Job labels: sanitization and query-comment extraction.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

/// Label jobs are tagged with so they can be attributed to the invocation
/// that submitted them.
pub const INVOCATION_ID_LABEL: &str = "invocation_id";

/// Remote label length limit.
const LABEL_LENGTH_LIMIT: usize = 63;

/// Return a legal label value: trimmed, lowercased, every character outside
/// `[a-z0-9_-]` replaced with `_`, truncated to the remote limit.
pub fn sanitize_label(value: &str) -> String {
    let mut out: String = value
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    out.truncate(LABEL_LENGTH_LIMIT);
    out
}

/// Extract labels from a rendered query comment. A JSON object comment
/// becomes one label per entry; anything else becomes a single
/// `query_comment` label.
pub fn labels_from_query_comment(comment: &str) -> IndexMap<String, String> {
    match serde_json::from_str::<JsonValue>(comment) {
        Ok(JsonValue::Object(entries)) => entries
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    JsonValue::String(text) => text,
                    other => other.to_string(),
                };
                (sanitize_label(&key), sanitize_label(&value))
            })
            .collect(),
        _ => IndexMap::from([("query_comment".to_string(), sanitize_label(comment))]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("  My Model Name  "), "my_model_name");
        assert_eq!(sanitize_label("node.id:v2"), "node_id_v2");
        assert_eq!(sanitize_label("already-fine_1"), "already-fine_1");
    }

    #[test]
    fn test_sanitize_label_truncates() {
        let long = "x".repeat(100);
        assert_eq!(sanitize_label(&long).len(), 63);
    }

    #[test]
    fn test_labels_from_json_comment() {
        let labels = labels_from_query_comment(r#"{"node_id": "model.Demo", "run": 7}"#);
        assert_eq!(labels.get("node_id").unwrap(), "model_demo");
        assert_eq!(labels.get("run").unwrap(), "7");
    }

    #[test]
    fn test_labels_from_plain_comment() {
        let labels = labels_from_query_comment("run by some user");
        assert_eq!(labels.len(), 1);
        assert_eq!(labels.get("query_comment").unwrap(), "run_by_some_user");
    }

    #[test]
    fn test_labels_from_non_object_json() {
        let labels = labels_from_query_comment("42");
        assert_eq!(labels.get("query_comment").unwrap(), "42");
    }
}

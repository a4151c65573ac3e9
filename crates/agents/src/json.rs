//! Lenient parsing of model-produced JSON

use serde_json::Value;

/// Strip markdown fences and surrounding prose, keeping the outermost object.
pub fn normalize_json_payload(payload: &str) -> String {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return trimmed.to_string();
    }

    let without_fence = if trimmed.starts_with("```") {
        let mut lines = trimmed.lines();
        let _ = lines.next(); // drop ``` or ```json
        let mut content = lines.collect::<Vec<_>>().join("\n");
        if content.ends_with("```") {
            content.truncate(content.len().saturating_sub(3));
        }
        content.trim().to_string()
    } else {
        trimmed.to_string()
    };

    if let (Some(start), Some(end)) = (without_fence.find('{'), without_fence.rfind('}')) {
        if start < end {
            return without_fence[start..=end].to_string();
        }
    }

    without_fence
}

/// Parse a model reply into a JSON object, if it contains one.
pub fn parse_object(payload: &str) -> Option<serde_json::Map<String, Value>> {
    match serde_json::from_str::<Value>(&normalize_json_payload(payload)) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(arr) => arr.first().and_then(value_to_string),
        Value::Object(obj) => obj
            .get("name")
            .or_else(|| obj.get("entity"))
            .or_else(|| obj.get("value"))
            .and_then(value_to_string),
        _ => None,
    }
}

pub fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First present key among `aliases`, as a non-empty string
pub fn string_field(value: &Value, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .find_map(|key| value.get(*key))
        .and_then(value_to_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// First present key among `aliases`, as a number
pub fn number_field(value: &Value, aliases: &[&str]) -> Option<f64> {
    aliases
        .iter()
        .find_map(|key| value.get(*key))
        .and_then(value_to_f64)
}

/// First present key among `aliases`, as an array
pub fn array_field<'a>(value: &'a Value, aliases: &[&str]) -> Option<&'a Vec<Value>> {
    aliases
        .iter()
        .find_map(|key| value.get(*key))
        .and_then(Value::as_array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_strips_fences_and_prose() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(normalize_json_payload(raw), "{\"a\": 1}");
        let raw = "Sure! Here it is: {\"a\": 1} hope that helps";
        assert_eq!(normalize_json_payload(raw), "{\"a\": 1}");
    }

    #[test]
    fn test_field_aliases() {
        let v = json!({"entity_name": " Alice ", "importance": "7.5"});
        assert_eq!(string_field(&v, &["name", "entity_name"]), Some("Alice".into()));
        assert_eq!(number_field(&v, &["rating", "importance"]), Some(7.5));
        assert_eq!(string_field(&v, &["missing"]), None);
    }

    #[test]
    fn test_parse_object_rejects_non_objects() {
        assert!(parse_object("[1, 2]").is_none());
        assert!(parse_object("not json").is_none());
        assert!(parse_object("{\"points\": []}").is_some());
    }
}

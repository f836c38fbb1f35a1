//! Schema validation for tool arguments.
//!
//! Checks run in a fixed order and the first violation wins: object shape,
//! required keys, unknown keys, per-property type, enum membership, numeric
//! bounds, string length and pattern, array item type. Every message names
//! the tool, the offending key, and the violated constraint.

use serde_json::Value;

pub(crate) fn validate_arguments(tool: &str, schema: &Value, args: &Value) -> Result<(), String> {
    let fail = |detail: String| Err(format!("Error: Invalid arguments for '{}': {}", tool, detail));

    let Some(args_map) = args.as_object() else {
        return fail("expected a JSON object".to_string());
    };
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_map.contains_key(key) {
                return fail(format!("missing required parameter '{}'", key));
            }
        }
    }

    for key in args_map.keys() {
        if !properties.contains_key(key) {
            return fail(format!("unknown parameter '{}'", key));
        }
    }

    for (key, value) in args_map {
        let Some(spec) = properties.get(key) else {
            continue;
        };

        if let Some(expected) = spec.get("type").and_then(Value::as_str) {
            if !type_matches(expected, value) {
                return fail(format!("parameter '{}' must be of type {}", key, expected));
            }
        }

        if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                let names: Vec<String> = allowed
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect();
                return fail(format!(
                    "parameter '{}' must be one of: {}",
                    key,
                    names.join(", ")
                ));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = spec.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    return fail(format!("parameter '{}' must be >= {}", key, min));
                }
            }
            if let Some(max) = spec.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    return fail(format!("parameter '{}' must be <= {}", key, max));
                }
            }
        }

        if let Some(s) = value.as_str() {
            if let Some(min_len) = spec.get("minLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) < min_len {
                    return fail(format!(
                        "parameter '{}' must be at least {} characters",
                        key, min_len
                    ));
                }
            }
            if let Some(max_len) = spec.get("maxLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) > max_len {
                    return fail(format!(
                        "parameter '{}' must be at most {} characters",
                        key, max_len
                    ));
                }
            }
            if let Some(pattern) = spec.get("pattern").and_then(Value::as_str) {
                // A malformed pattern in the schema is a tool author bug, not
                // a caller error; ignore it rather than reject every call.
                if let Ok(re) = regex::Regex::new(pattern) {
                    if !re.is_match(s) {
                        return fail(format!(
                            "parameter '{}' does not match required pattern",
                            key
                        ));
                    }
                }
            }
        }

        if let Some(items) = value.as_array() {
            if let Some(item_type) = spec
                .get("items")
                .and_then(|i| i.get("type"))
                .and_then(Value::as_str)
            {
                if !items.iter().all(|item| type_matches(item_type, item)) {
                    return fail(format!(
                        "parameter '{}' must be an array of {}",
                        key, item_type
                    ));
                }
            }
        }
    }

    Ok(())
}

/// JSON Schema primitive check. Booleans are not numbers even though they
/// coerce in some languages.
fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number() && !value.is_boolean(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

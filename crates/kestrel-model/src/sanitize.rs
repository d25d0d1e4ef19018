// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-schema sanitisation for the wire format (§4.B, §9).
//!
//! Tool authors write ordinary JSON Schema (`serde_json::Value`, typically
//! produced by `schemars`). The transport's function-calling wire format is
//! a restricted subset that chokes on a few constructs schema authors reach
//! for without thinking. This pass normalises those away before a
//! [`crate::ToolDeclaration`] is handed to a provider driver.

use serde_json::{json, Map, Value};

/// Recursively sanitise a JSON Schema value.
///
/// - `anyOf`/`oneOf` unions are collapsed to their first non-null variant
///   (the wire format has no union support).
/// - A `"type"` array (e.g. `["string", "null"]`) becomes the first
///   non-null entry plus a `"nullable": true` flag.
/// - `$ref` is replaced with an empty object schema (the wire format cannot
///   resolve local refs; inlining is out of scope here).
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => sanitize_object(obj),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn sanitize_object(obj: &Map<String, Value>) -> Value {
    if obj.contains_key("$ref") {
        return json!({});
    }

    if let Some(variants) = obj.get("anyOf").or_else(|| obj.get("oneOf")).and_then(Value::as_array) {
        return match first_non_null_variant(variants) {
            Some(v) => sanitize_schema(v),
            None => json!({}),
        };
    }

    let mut out = Map::new();
    for (k, v) in obj {
        match k.as_str() {
            "type" => {
                let (ty, nullable) = sanitize_type(v);
                out.insert("type".into(), ty);
                if nullable {
                    out.insert("nullable".into(), Value::Bool(true));
                }
            }
            "properties" => {
                if let Value::Object(props) = v {
                    let sanitised: Map<String, Value> =
                        props.iter().map(|(pk, pv)| (pk.clone(), sanitize_schema(pv))).collect();
                    out.insert("properties".into(), Value::Object(sanitised));
                } else {
                    out.insert(k.clone(), sanitize_schema(v));
                }
            }
            "items" | "additionalProperties" => {
                out.insert(k.clone(), sanitize_schema(v));
            }
            _ => {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

/// `"type"` may be a bare string or an array mixing `"null"` in (nullable
/// unions schemars emits for `Option<T>` fields). Either shape normalises to
/// a single type string plus a nullable flag.
fn sanitize_type(v: &Value) -> (Value, bool) {
    match v {
        Value::Array(items) => {
            let nullable = items.iter().any(|t| t == "null");
            let first = items.iter().find(|t| *t != "null").cloned().unwrap_or(Value::String("string".into()));
            (first, nullable)
        }
        other => (other.clone(), false),
    }
}

fn first_non_null_variant(variants: &[Value]) -> Option<&Value> {
    variants.iter().find(|v| !is_null_schema(v))
}

fn is_null_schema(v: &Value) -> bool {
    v.get("type").map(|t| t == "null").unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

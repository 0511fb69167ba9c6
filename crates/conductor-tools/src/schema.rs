// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local `$ref` pre-resolution for tool parameter schemas.
//!
//! Tool schemas may reference an OpenAPI-like component registry
//! (`{"components":{"schemas":{…}}}`) supplied by the tool.  Before argument
//! validation the executor inlines every local reference so the compiled
//! schema is self-contained.  External URIs are left untouched; the schema
//! compiler reports them if they are ever reached.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::warn;

/// Placeholder substituted where a reference cycle would otherwise recurse
/// forever.  The fragment stays a valid object schema so validation of the
/// non-cyclic structure proceeds normally.
fn cycle_placeholder() -> Value {
    serde_json::json!({ "type": "object", "description": "<cycle>" })
}

/// Component registry keyed by primary id with pointer aliases.
///
/// A component named `X` is reachable as `#/components/schemas/X`; when the
/// schema declares an `$id` that id becomes the primary key and the pointer
/// form is kept as an alias.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: HashMap<String, Value>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `{"components":{"schemas":{…}}}` (or from the
    /// inner `schemas` map directly).
    pub fn from_components(components: &Value) -> Self {
        let schemas = components
            .pointer("/components/schemas")
            .or_else(|| components.get("schemas"))
            .and_then(Value::as_object);

        let mut registry = Self::new();
        if let Some(schemas) = schemas {
            for (name, schema) in schemas {
                let pointer = format!("#/components/schemas/{name}");
                if let Some(id) = schema.get("$id").and_then(Value::as_str) {
                    registry.entries.insert(id.to_string(), schema.clone());
                }
                registry.entries.insert(pointer, schema.clone());
            }
        }
        registry
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, reference: &str) -> Option<&Value> {
        self.entries.get(reference)
    }

    /// Resolve a `$ref` string to its target schema and a stable identity key
    /// used for cycle detection.
    fn resolve_reference(&self, reference: &str) -> Option<(String, Value)> {
        // Exact match: pointer form or a registered $id.
        if let Some(target) = self.lookup(reference) {
            return Some((identity_key(reference, target), target.clone()));
        }

        // `<base>#<anchor>` or bare `#<anchor>`: anchor search.  The base (if
        // any) selects a registry entry; a bare anchor searches all entries.
        if let Some((base, fragment)) = reference.split_once('#') {
            if fragment.is_empty() || fragment.starts_with('/') {
                return None;
            }
            let search_space: Vec<&Value> = if base.is_empty() {
                self.entries.values().collect()
            } else {
                self.lookup(base).into_iter().collect()
            };
            for entry in search_space {
                if let Some(found) = find_anchor(entry, fragment) {
                    return Some((format!("anchor:{fragment}"), found.clone()));
                }
            }
        }
        None
    }
}

fn identity_key(reference: &str, target: &Value) -> String {
    target
        .get("$id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| reference.to_string())
}

/// Depth-first search for a nested `{"$anchor": name}` schema.
fn find_anchor<'a>(node: &'a Value, anchor: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => {
            if map.get("$anchor").and_then(Value::as_str) == Some(anchor) {
                return Some(node);
            }
            map.values().find_map(|v| find_anchor(v, anchor))
        }
        Value::Array(items) => items.iter().find_map(|v| find_anchor(v, anchor)),
        _ => None,
    }
}

/// Inline every resolvable local `$ref` in `schema` against `registry`.
///
/// - The referenced schema's content is merged with the referring node's
///   sibling keywords (siblings win on key collision).
/// - `$id` and `$anchor` are stripped from inlined fragments; the fragment is
///   anonymous in its new context.
/// - Cycles are broken with a terminal placeholder object.
/// - References that resolve to nothing (external URIs, unknown names) are
///   left in place for the schema compiler to report.
pub fn resolve_refs(schema: &Value, registry: &SchemaRegistry) -> Value {
    let mut in_flight = Vec::new();
    resolve_node(schema, registry, &mut in_flight)
}

fn resolve_node(node: &Value, registry: &SchemaRegistry, in_flight: &mut Vec<String>) -> Value {
    match node {
        Value::Object(map) => {
            if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
                return resolve_ref_node(map, reference, registry, in_flight);
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_node(v, registry, in_flight));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_node(v, registry, in_flight))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_ref_node(
    referring: &Map<String, Value>,
    reference: &str,
    registry: &SchemaRegistry,
    in_flight: &mut Vec<String>,
) -> Value {
    let Some((key, target)) = registry.resolve_reference(reference) else {
        if reference.contains("://") {
            warn!(reference, "leaving external schema reference for the loader");
        }
        return Value::Object(referring.clone());
    };

    if in_flight.contains(&key) {
        return cycle_placeholder();
    }

    in_flight.push(key);
    let resolved = resolve_node(&target, registry, in_flight);
    in_flight.pop();

    // Merge: start from the resolved base, strip its identity keywords, then
    // overlay the referring node's sibling keywords.
    let mut merged = match resolved {
        Value::Object(m) => m,
        other => return other,
    };
    merged.remove("$id");
    merged.remove("$anchor");
    for (k, v) in referring {
        if k == "$ref" {
            continue;
        }
        merged.insert(k.clone(), resolve_node(v, registry, in_flight));
    }
    Value::Object(merged)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

//! Pure conversion of a visual-editor graph document into the
//! execution-ready graph format a graph executor accepts.
//!
//! Decision order:
//! 1. `definition.graph` is already an execution-ready mapping: return it.
//! 2. the top-level values already carry a `class_type` tag: return as-is.
//! 3. an editor document (node list with per-node ids): convert it.
//! 4. anything else: empty graph.
//!
//! Conversion gathers widget-backed inputs by positional index against the
//! node's declared widget slots, then resolves named input slots through the
//! link table. A slot with both a link and a widget value always resolves to
//! the link. Missing or badly typed slot indices default to slot 0.

use std::collections::HashMap;

use serde_json::{Map, Value};

pub fn normalize(definition: &Value) -> Value {
    if let Some(graph) = definition.get("graph")
        && graph.is_object()
    {
        return graph.clone();
    }

    if is_execution_ready(definition) {
        return definition.clone();
    }

    if let Some(nodes) = definition.get("nodes").and_then(Value::as_array)
        && nodes.iter().all(|n| n.get("id").is_some())
    {
        return convert_editor_document(nodes, definition.get("links"));
    }

    Value::Object(Map::new())
}

fn is_execution_ready(definition: &Value) -> bool {
    match definition.as_object() {
        Some(map) if !map.is_empty() => map
            .values()
            .all(|v| v.is_object() && v.get("class_type").is_some()),
        _ => false,
    }
}

/// Link table: link id -> (source node id, output slot index).
fn build_link_table(links: Option<&Value>) -> HashMap<i64, (String, u64)> {
    let mut table = HashMap::new();
    let Some(entries) = links.and_then(Value::as_array) else {
        return table;
    };

    for entry in entries {
        let Some(parts) = entry.as_array() else {
            continue;
        };
        let Some(link_id) = parts.first().and_then(Value::as_i64) else {
            continue;
        };
        let Some(source) = parts.get(1).map(id_key) else {
            continue;
        };
        let slot = parts.get(2).and_then(Value::as_u64).unwrap_or(0);
        table.insert(link_id, (source, slot));
    }

    table
}

fn convert_editor_document(nodes: &[Value], links: Option<&Value>) -> Value {
    let link_table = build_link_table(links);
    let mut graph = Map::new();

    for node in nodes {
        let Some(id) = node.get("id") else { continue };
        let class_type = node
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let widgets = node
            .get("widgets_values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut inputs = Map::new();
        let mut widget_cursor = 0usize;

        if let Some(slots) = node.get("inputs").and_then(Value::as_array) {
            for slot in slots {
                let name = slot.get("name").and_then(Value::as_str);
                let has_widget = slot.get("widget").is_some();

                // Widget slots consume positions in declaration order, even
                // when a link ends up shadowing the value.
                let widget_value = if has_widget {
                    let value = widgets.get(widget_cursor).cloned();
                    widget_cursor += 1;
                    value
                } else {
                    None
                };

                let Some(name) = name else { continue };

                let link_ref = slot
                    .get("link")
                    .and_then(Value::as_i64)
                    .and_then(|id| link_table.get(&id))
                    .map(|(source, slot)| {
                        Value::Array(vec![Value::String(source.clone()), Value::from(*slot)])
                    });

                if let Some(reference) = link_ref {
                    inputs.insert(name.to_string(), reference);
                } else if let Some(value) = widget_value {
                    inputs.insert(name.to_string(), value);
                }
            }
        }

        let mut executable = Map::new();
        executable.insert(
            "class_type".to_string(),
            Value::String(class_type.to_string()),
        );
        executable.insert("inputs".to_string(), Value::Object(inputs));
        graph.insert(id_key(id), Value::Object(executable));
    }

    Value::Object(graph)
}

fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

//! Human and machine readable renderings of trees and override rules.

use dtoverlay_core::fragment::Fragment;
use dtoverlay_core::overrides::{Action, OverrideRule};
use dtoverlay_core::{NodeId, PropertyValue, Tree};
use serde_json::{json, Map, Value};
use std::fmt::Write;

/// Renders a tree as devicetree source.
pub fn to_dts(tree: &Tree) -> String {
    let mut out = String::from("/dts-v1/;\n\n");
    for r in &tree.meta().reservations {
        let _ = writeln!(out, "/memreserve/ {:#018x} {:#018x};", r.address, r.size);
    }
    if !tree.meta().reservations.is_empty() {
        out.push('\n');
    }
    write_node(&mut out, tree, NodeId::ROOT, 0);
    out
}

fn write_node(out: &mut String, tree: &Tree, id: NodeId, depth: usize) {
    let indent = "\t".repeat(depth);
    let node = tree.node(id);
    let name = if id == NodeId::ROOT { "/" } else { node.name() };
    let _ = writeln!(out, "{}{} {{", indent, name);
    for prop in node.properties() {
        match PropertyValue::infer(&prop.value) {
            PropertyValue::Empty => {
                let _ = writeln!(out, "{}\t{};", indent, prop.name);
            }
            value => {
                let _ = writeln!(out, "{}\t{} = {};", indent, prop.name, value);
            }
        }
    }
    for &child in node.children() {
        out.push('\n');
        write_node(out, tree, child, depth + 1);
    }
    let _ = writeln!(out, "{}}};", indent);
}

/// Renders a tree as nested JSON objects.
pub fn to_json(tree: &Tree) -> Value {
    node_json(tree, NodeId::ROOT)
}

fn node_json(tree: &Tree, id: NodeId) -> Value {
    let node = tree.node(id);
    let mut properties = Map::new();
    for prop in node.properties() {
        let value = match PropertyValue::infer(&prop.value) {
            PropertyValue::Empty => Value::Bool(true),
            PropertyValue::Cells(cells) => json!(cells),
            PropertyValue::String(s) => json!(s),
            PropertyValue::Strings(list) => json!(list),
            PropertyValue::Bytes(bytes) => json!(bytes),
            PropertyValue::Phandle(p) => json!(p),
        };
        properties.insert(prop.name.clone(), value);
    }
    let children: Vec<Value> = node
        .children()
        .iter()
        .map(|&child| node_json(tree, child))
        .collect();
    json!({
        "name": tree.path(id),
        "properties": properties,
        "children": children,
    })
}

/// Text form of a rule's actions, one per entry.
fn actions(rule: &OverrideRule) -> Vec<String> {
    rule.actions
        .iter()
        .map(|action| match action {
            Action::Fragments(toggles) => toggles
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(""),
            Action::Edit(edit) => edit.to_string(),
        })
        .collect()
}

/// Lists fragments and override rules.
pub fn params_text(fragments: &[Fragment], rules: &[OverrideRule]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Fragments:");
    for f in fragments {
        let _ = writeln!(out, "  {:>4}  {:<8} {}", f.id, f.state().to_string(), f.target);
    }
    let _ = writeln!(out, "Overrides:");
    if rules.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for rule in rules {
        let _ = writeln!(out, "  {}", rule.name);
        for action in actions(rule) {
            let _ = writeln!(out, "      {}", action);
        }
    }
    out
}

pub fn params_json(fragments: &[Fragment], rules: &[OverrideRule]) -> Value {
    json!({
        "fragments": fragments
            .iter()
            .map(|f| json!({
                "id": f.id,
                "state": f.state().to_string(),
                "target": f.target.to_string(),
            }))
            .collect::<Vec<_>>(),
        "overrides": rules
            .iter()
            .map(|r| json!({ "name": r.name, "actions": actions(r) }))
            .collect::<Vec<_>>(),
    })
}

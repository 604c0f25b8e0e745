//! Payload shaping.
//!
//! A layout is any JSON/YAML document. String leaves may hold `{{ path }}`
//! placeholders that resolve against the serialized event. A leaf that is a
//! single placeholder keeps the value's JSON type; placeholders mixed with text
//! render as text. Unresolvable paths render empty.

use evex_core::path;
use evex_core::EnhancedEvent;
use serde_json::{Map, Value};

enum Piece<'a> {
    Text(&'a str),
    Field(&'a str),
}

fn pieces(template: &str) -> Vec<Piece<'_>> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else { break };
        if open > 0 {
            out.push(Piece::Text(&rest[..open]));
        }
        out.push(Piece::Field(rest[open + 2..open + 2 + close].trim()));
        rest = &rest[open + 2 + close + 2..];
    }
    if !rest.is_empty() {
        out.push(Piece::Text(rest));
    }
    out
}

/// Expand every placeholder in `template` as text.
pub fn render_str(template: &str, event: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    for piece in pieces(template) {
        match piece {
            Piece::Text(t) => out.push_str(t),
            Piece::Field(p) => {
                if let Some(v) = path::lookup_str(event, p) {
                    out.push_str(&v);
                }
            }
        }
    }
    out
}

fn render_leaf(template: &str, event: &Value) -> Value {
    if let [Piece::Field(p)] = pieces(template).as_slice() {
        return match path::lookup(event, p) {
            Some(v) if !v.is_null() => v.clone(),
            _ => Value::String(String::new()),
        };
    }
    Value::String(render_str(template, event))
}

/// Apply `layout` to an already serialized event.
pub fn render(layout: &Value, event: &Value) -> Value {
    match layout {
        Value::String(s) => render_leaf(s, event),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, event)).collect()),
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (k, v) in fields {
                out.insert(k.clone(), render(v, event));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// The event as JSON, shaped by `layout` when one is configured.
pub fn payload(layout: Option<&Value>, event: &EnhancedEvent) -> Value {
    let json = event.to_json();
    match layout {
        Some(l) => render(l, &json),
        None => json,
    }
}

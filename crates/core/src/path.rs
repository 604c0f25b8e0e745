//! Dotted path lookup over a serialized event.
//!
//! `involvedObject.name`, `metadata.labels[app.kubernetes.io/name]`,
//! `items.0.kind`. A bracketed segment is taken literally so keys with dots
//! stay addressable. A leading `.` is ignored.

use std::borrow::Cow;

use serde_json::Value;

fn segments(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = path.trim().trim_start_matches('.');
    while !rest.is_empty() {
        if let Some(inner) = rest.strip_prefix('[') {
            match inner.find(']') {
                Some(end) => {
                    out.push(&inner[..end]);
                    rest = inner[end + 1..].trim_start_matches('.');
                }
                None => {
                    out.push(inner);
                    break;
                }
            }
            continue;
        }
        let end = rest.find(|c| c == '.' || c == '[').unwrap_or(rest.len());
        out.push(&rest[..end]);
        rest = rest[end..].trim_start_matches('.');
    }
    out
}

/// Resolve `path` inside `root`.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in segments(path) {
        cur = match cur {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Scalars render as text; objects and arrays as compact JSON; null as nothing.
pub fn render(v: &Value) -> Option<Cow<'_, str>> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        other => Some(Cow::Owned(other.to_string())),
    }
}

pub fn lookup_str<'a>(root: &'a Value, path: &str) -> Option<Cow<'a, str>> {
    lookup(root, path).and_then(render)
}

use serde::Serialize;
use serde_json::{Map, Value};

/// The canonical shape every step output and handler input is normalized to.
pub type OutputMap = Map<String, Value>;

/// Normalize an input that may be a map, a JSON string or a bare value.
///
/// Objects are taken as-is. A string holding a JSON object is parsed.
/// Anything else is wrapped under a single `value` key.
pub fn canonicalize(input: &Value) -> OutputMap {
    match input {
        Value::Object(map) => map.clone(),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => wrap(input.clone()),
        },
        other => wrap(other.clone()),
    }
}

/// Normalize a typed output record.
pub fn canonicalize_record<T: Serialize>(record: &T) -> Result<OutputMap, serde_json::Error> {
    let value = serde_json::to_value(record)?;
    Ok(canonicalize(&value))
}

fn wrap(value: Value) -> OutputMap {
    let mut map = Map::new();
    map.insert("value".to_string(), value);
    map
}

/// One hop in a dotted path such as `body.items[0].id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Split a dotted path into segments. `$` and `$.` prefixes are ignored.
///
/// Returns `None` on malformed paths (unbalanced brackets, non-numeric
/// indices, empty keys).
pub fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let trimmed = path.strip_prefix('$').unwrap_or(path);
    let trimmed = trimmed.strip_prefix('.').unwrap_or(trimmed);

    let mut segments = Vec::new();
    if trimmed.is_empty() {
        return Some(segments);
    }

    for part in trimmed.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(PathSegment::Key(key.to_string()));
        } else if rest.is_empty() {
            return None;
        }
        while !rest.is_empty() {
            let close = rest.find(']')?;
            let index = rest[1..close].trim().parse::<usize>().ok()?;
            segments.push(PathSegment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return None;
            }
        }
    }

    Some(segments)
}

/// Walk `segments` through `value`.
pub fn lookup<'a>(value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match (segment, current) {
        (PathSegment::Key(key), Value::Object(map)) => map.get(key),
        (PathSegment::Index(index), Value::Array(items)) => items.get(*index),
        _ => None,
    })
}

/// Walk `segments` starting from a map rather than a value.
pub fn lookup_in<'a>(map: &'a OutputMap, segments: &[PathSegment]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let root = match first {
        PathSegment::Key(key) => map.get(key)?,
        PathSegment::Index(_) => return None,
    };
    lookup(root, rest)
}

/// Convenience over [`parse_path`] + [`lookup_in`].
pub fn get_path<'a>(map: &'a OutputMap, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path)?;
    lookup_in(map, &segments)
}

/// Render a value for embedding inside a larger string.
///
/// Strings are inserted without quotes; everything else is rendered as JSON.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Loose truthiness used by control-flow conditions.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Top-level field names, sorted, for diagnostics.
pub fn field_names(map: &OutputMap) -> Vec<String> {
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}

use crate::value::{display, get_path, lookup, lookup_in, parse_path, PathSegment};
use crate::{Flow, OutputMap, StepError};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Names resolvable without any flow variable or step output.
pub const BUILTINS: &[&str] = &[
    "UUID",
    "RANDOM_ID",
    "TIMESTAMP",
    "TIMESTAMP_MS",
    "ISO_TIMESTAMP",
    "DATE",
    "TIME",
    "DATETIME",
    "YEAR",
    "MONTH",
    "DAY",
    "HOUR",
    "MINUTE",
    "SECOND",
];

/// Variable scope and step outputs for one execution.
///
/// Step outputs are only ever added or overwritten by a later run of the
/// same step id; nothing is removed while the execution is live.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    variables: OutputMap,
    step_outputs: HashMap<String, OutputMap>,
    last_output: Option<OutputMap>,
    builtins: Arc<Mutex<HashMap<String, Value>>>,
}

/// A whole-string reference.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reference<'a> {
    /// `${name}`, `${step.path}`, `${NAME:-fallback}`, or `{{name}}`
    Braced { path: &'a str, fallback: Option<&'a str> },
    /// `$field` against the designated input.
    Field(&'a str),
    /// `$.path` against the designated input's body.
    Input(&'a str),
}

impl<'a> Reference<'a> {
    fn parse(text: &'a str) -> Option<Self> {
        if let Some(inner) = mustache(text) {
            return Some(Reference::Braced {
                path: inner,
                fallback: None,
            });
        }
        if let Some(inner) = text.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
            if inner.contains('}') || inner.contains("${") {
                return None;
            }
            return Some(match inner.split_once(":-") {
                Some((path, fallback)) => Reference::Braced {
                    path: path.trim(),
                    fallback: Some(fallback),
                },
                None => Reference::Braced {
                    path: inner.trim(),
                    fallback: None,
                },
            });
        }
        if text == "$" {
            return Some(Reference::Input(""));
        }
        if let Some(path) = text.strip_prefix("$.") {
            return is_path(path).then_some(Reference::Input(path));
        }
        let field = text.strip_prefix('$')?;
        let starts_ok = field.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_');
        (starts_ok && is_path(field)).then_some(Reference::Field(field))
    }
}

/// Inner path of a whole `{{ path }}` string. Anything that is not a plain
/// path between the braces is left as literal text.
fn mustache(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("{{")?.strip_suffix("}}")?.trim();
    (is_path(inner) && !inner.starts_with('.')).then_some(inner)
}

fn is_path(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '[' | ']'))
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a flow run: flow `env`, then caller overrides on top.
    pub fn for_flow(flow: &Flow, overrides: OutputMap) -> Self {
        let mut ctx = Self::new();
        ctx.variables = flow.meta.env.clone();
        ctx.variables.extend(overrides);
        ctx
    }

    /// Fresh variable scope sharing this execution's built-in values.
    pub fn isolated(&self, variables: OutputMap) -> Self {
        Self {
            variables,
            step_outputs: HashMap::new(),
            last_output: None,
            builtins: Arc::clone(&self.builtins),
        }
    }

    /// Copy for a concurrent branch. Writes stay local until [`absorb`](Self::absorb).
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Pull a forked branch's step outputs back into this context.
    pub fn absorb(&mut self, branch: ExecutionContext) {
        self.step_outputs.extend(branch.step_outputs);
    }

    pub fn variables(&self) -> &OutputMap {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Bind a variable and hand back whatever it shadowed.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.variables.insert(name.into(), value)
    }

    /// Undo a [`set_variable`](Self::set_variable).
    pub fn restore_variable(&mut self, name: &str, previous: Option<Value>) {
        match previous {
            Some(value) => {
                self.variables.insert(name.to_string(), value);
            }
            None => {
                self.variables.remove(name);
            }
        }
    }

    pub fn set_step_output(&mut self, step_id: impl Into<String>, output: OutputMap) {
        self.last_output = Some(output.clone());
        self.step_outputs.insert(step_id.into(), output);
    }

    pub fn step_output(&self, step_id: &str) -> Option<&OutputMap> {
        self.step_outputs.get(step_id)
    }

    pub fn step_outputs(&self) -> &HashMap<String, OutputMap> {
        &self.step_outputs
    }

    pub fn last_output(&self) -> Option<&OutputMap> {
        self.last_output.as_ref()
    }

    /// Flattened view used by conditions: variables, then the last output's
    /// fields, then each step output under its id.
    pub fn snapshot(&self) -> OutputMap {
        let mut map = self.variables.clone();
        if let Some(last) = &self.last_output {
            map.extend(last.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for (id, output) in &self.step_outputs {
            map.insert(id.clone(), Value::Object(output.clone()));
        }
        map
    }

    /// Value of a built-in, generated once per execution.
    pub fn builtin(&self, name: &str) -> Option<Value> {
        let key = if name == "UUID" { "RANDOM_ID" } else { name };
        let mut memo = self.builtins.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(value) = memo.get(key) {
            return Some(value.clone());
        }
        let value = generate_builtin(key)?;
        memo.insert(key.to_string(), value.clone());
        Some(value)
    }

    /// Resolve a whole reference against the most recent step output.
    pub fn resolve(&self, reference: &str) -> Result<Value, StepError> {
        self.resolve_in(reference, None)
    }

    /// Resolve a whole reference. `$field` and `$.path` read from `input`,
    /// or the most recent step output when `input` is `None`.
    pub fn resolve_in(&self, reference: &str, input: Option<&OutputMap>) -> Result<Value, StepError> {
        let parsed = Reference::parse(reference)
            .ok_or_else(|| StepError::unresolved(reference, "not a reference"))?;
        self.lookup_reference(reference, &parsed, input)
    }

    /// Whether the whole string is a single reference.
    pub fn is_reference(text: &str) -> bool {
        Reference::parse(text).is_some()
    }

    /// Interpolate a string. A string that is exactly one reference keeps the
    /// referenced value's JSON type; otherwise every `${...}` is substituted
    /// textually.
    pub fn interpolate_str(&self, text: &str, input: Option<&OutputMap>) -> Result<Value, StepError> {
        if let Some(reference) = Reference::parse(text) {
            return self.lookup_reference(text, &reference, input);
        }
        if !text.contains("${") && !text.contains("{{") {
            return Ok(Value::String(text.to_string()));
        }
        self.interpolate_text(text, input).map(Value::String)
    }

    /// Substitute every `${...}` and `{{...}}` occurrence inside `text`.
    /// `$${` escapes a literal `${`; a `{{` not closing over a plain path is
    /// copied as is.
    pub fn interpolate_text(&self, text: &str, input: Option<&OutputMap>) -> Result<String, StepError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = next_marker(rest) {
            if rest[start..].starts_with("{{") {
                let after = &rest[start..];
                let token = after.find("}}").map(|end| &after[..end + 2]);
                match token.filter(|token| mustache(token).is_some()) {
                    Some(token) => {
                        out.push_str(&rest[..start]);
                        let value = self.resolve_in(token, input)?;
                        out.push_str(&display(&value));
                        rest = &after[token.len()..];
                    }
                    None => {
                        out.push_str(&rest[..start + 2]);
                        rest = &rest[start + 2..];
                    }
                }
                continue;
            }
            if start > 0 && rest[..start].ends_with('$') {
                out.push_str(&rest[..start - 1]);
                out.push_str("${");
                rest = &rest[start + 2..];
                continue;
            }
            out.push_str(&rest[..start]);
            let after = &rest[start..];
            let Some(end) = after.find('}') else {
                out.push_str(after);
                return Ok(out);
            };
            let token = &after[..=end];
            let value = self.resolve_in(token, input)?;
            out.push_str(&display(&value));
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }

    /// Interpolate every string inside `value`, recursively. Object keys are
    /// left untouched.
    pub fn interpolate_value(&self, value: &Value, input: Option<&OutputMap>) -> Result<Value, StepError> {
        match value {
            Value::String(text) => self.interpolate_str(text, input),
            Value::Array(items) => items
                .iter()
                .map(|item| self.interpolate_value(item, input))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => self.interpolate_map(map, input, &[]).map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Interpolate a config map, copying the keys in `raw` through untouched.
    pub fn interpolate_map(
        &self,
        map: &OutputMap,
        input: Option<&OutputMap>,
        raw: &[&str],
    ) -> Result<OutputMap, StepError> {
        let mut out = OutputMap::new();
        for (key, value) in map {
            let resolved = if raw.contains(&key.as_str()) {
                value.clone()
            } else {
                self.interpolate_value(value, input)?
            };
            out.insert(key.clone(), resolved);
        }
        Ok(out)
    }

    fn lookup_reference(
        &self,
        text: &str,
        reference: &Reference<'_>,
        input: Option<&OutputMap>,
    ) -> Result<Value, StepError> {
        match reference {
            Reference::Braced { path, fallback } => match (self.lookup_braced(text, path, input), fallback) {
                (Ok(value), _) => Ok(value),
                (Err(_), Some(literal)) => Ok(Value::String(literal.to_string())),
                (Err(err), None) => Err(err),
            },
            Reference::Field(path) => {
                let designated = self.designated(text, input)?;
                get_path(designated, path)
                    .cloned()
                    .ok_or_else(|| missing_field(text, designated))
            }
            Reference::Input(path) => {
                let designated = self.designated(text, input)?;
                if path.is_empty() {
                    return Ok(Value::Object(designated.clone()));
                }
                let segments = parse_path(path).ok_or_else(|| StepError::unresolved(text, "malformed path"))?;
                designated
                    .get("body")
                    .and_then(|body| lookup(body, &segments))
                    .or_else(|| lookup_in(designated, &segments))
                    .cloned()
                    .ok_or_else(|| missing_field(text, designated))
            }
        }
    }

    fn lookup_braced(&self, text: &str, path: &str, input: Option<&OutputMap>) -> Result<Value, StepError> {
        let segments = parse_path(path).ok_or_else(|| StepError::unresolved(text, "malformed path"))?;
        let Some((PathSegment::Key(head), rest)) = segments.split_first() else {
            return Err(StepError::unresolved(text, "empty reference"));
        };

        if let Some(output) = self.step_outputs.get(head.as_str()) {
            if rest.is_empty() {
                return Ok(Value::Object(output.clone()));
            }
            return lookup_in(output, rest).cloned().ok_or_else(|| {
                StepError::unresolved(text, format!("step '{}' has no such field", head))
            });
        }

        if let Some(variable) = self.variables.get(head.as_str()) {
            return lookup(variable, rest)
                .cloned()
                .ok_or_else(|| StepError::unresolved(text, format!("variable '{}' has no such field", head)));
        }

        if rest.is_empty() {
            if let Some(value) = self.builtin(head) {
                return Ok(value);
            }
        }

        if let Some(found) = input.or(self.last_output.as_ref()).and_then(|map| lookup_in(map, &segments)) {
            return Ok(found.clone());
        }

        Err(StepError::unresolved(text, "no step, variable or built-in with that name"))
    }

    fn designated<'a>(&'a self, text: &str, input: Option<&'a OutputMap>) -> Result<&'a OutputMap, StepError> {
        input
            .or(self.last_output.as_ref())
            .ok_or_else(|| StepError::unresolved(text, "no step output available yet"))
    }
}

/// Offset of the first `${` or `{{`.
fn next_marker(text: &str) -> Option<usize> {
    match (text.find("${"), text.find("{{")) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn missing_field(text: &str, available: &OutputMap) -> StepError {
    let mut fields: Vec<&str> = available.keys().map(String::as_str).collect();
    fields.sort_unstable();
    StepError::unresolved(text, format!("field not found (available: {})", fields.join(", ")))
}

fn generate_builtin(name: &str) -> Option<Value> {
    let now = Utc::now();
    let value = match name {
        "RANDOM_ID" => Value::String(Uuid::new_v4().to_string()),
        "TIMESTAMP" => Value::from(now.timestamp()),
        "TIMESTAMP_MS" => Value::from(now.timestamp_millis()),
        "ISO_TIMESTAMP" => Value::String(now.to_rfc3339()),
        "DATE" => Value::String(now.format("%Y-%m-%d").to_string()),
        "TIME" => Value::String(now.format("%H:%M:%S").to_string()),
        "DATETIME" => Value::String(now.format("%Y-%m-%d %H:%M:%S").to_string()),
        "YEAR" => Value::String(now.format("%Y").to_string()),
        "MONTH" => Value::String(now.format("%m").to_string()),
        "DAY" => Value::String(now.format("%d").to_string()),
        "HOUR" => Value::String(now.format("%H").to_string()),
        "MINUTE" => Value::String(now.format("%M").to_string()),
        "SECOND" => Value::String(now.format("%S").to_string()),
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonicalize;
    use serde_json::json;

    fn ctx_with_user() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.set_variable("BASE_URL", json!("http://api.local"));
        ctx.set_step_output(
            "get_user",
            canonicalize(&json!({
                "status": 200,
                "body": {"id": 7, "items": [{"id": "a1"}, {"id": "b2"}]}
            })),
        );
        ctx
    }

    #[test]
    fn whole_reference_keeps_type() {
        let ctx = ctx_with_user();
        assert_eq!(ctx.interpolate_str("${get_user.status}", None).unwrap(), json!(200));
        assert_eq!(ctx.interpolate_str("${get_user.body.items[1].id}", None).unwrap(), json!("b2"));
        assert_eq!(ctx.interpolate_str("$status", None).unwrap(), json!(200));
        assert_eq!(ctx.interpolate_str("$.id", None).unwrap(), json!(7));
    }

    #[test]
    fn embedded_references_become_text() {
        let ctx = ctx_with_user();
        let url = ctx
            .interpolate_str("${BASE_URL}/users/${get_user.body.id}", None)
            .unwrap();
        assert_eq!(url, json!("http://api.local/users/7"));
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let ctx = ctx_with_user();
        let err = ctx.interpolate_str("${MISSING}/x", None).unwrap_err();
        assert!(matches!(err, StepError::VariableResolution { .. }));

        let err = ctx.interpolate_str("${get_user.nope}", None).unwrap_err();
        assert!(err.to_string().contains("get_user"));
    }

    #[test]
    fn fallback_applies_when_unresolved() {
        let ctx = ctx_with_user();
        assert_eq!(ctx.interpolate_str("${PORT:-8080}", None).unwrap(), json!("8080"));
        assert_eq!(
            ctx.interpolate_str("${BASE_URL:-http://other}", None).unwrap(),
            json!("http://api.local")
        );
    }

    #[test]
    fn builtins_are_stable_within_an_execution() {
        let ctx = ExecutionContext::new();
        let first = ctx.interpolate_str("${UUID}", None).unwrap();
        let second = ctx.interpolate_str("id-${UUID}", None).unwrap();
        assert_eq!(second, json!(format!("id-{}", first.as_str().unwrap())));

        let fork = ctx.fork();
        assert_eq!(fork.builtin("UUID"), Some(first.clone()));

        let other = ExecutionContext::new();
        assert_ne!(other.builtin("UUID"), Some(first));
    }

    #[test]
    fn double_brace_references_match_dollar_form() {
        let ctx = ctx_with_user();
        assert_eq!(ctx.interpolate_str("{{get_user.status}}", None).unwrap(), json!(200));
        assert_eq!(ctx.interpolate_str("{{ get_user.body.id }}", None).unwrap(), json!(7));
        assert_eq!(
            ctx.interpolate_str("{{BASE_URL}}/users/${get_user.body.id}", None).unwrap(),
            json!("http://api.local/users/7")
        );
        assert!(ExecutionContext::is_reference("{{BASE_URL}}"));

        let uuid = ctx.interpolate_str("${UUID}", None).unwrap();
        assert_eq!(ctx.interpolate_str("{{UUID}}", None).unwrap(), uuid);

        let err = ctx.interpolate_str("{{MISSING}}-x", None).unwrap_err();
        assert!(matches!(err, StepError::VariableResolution { .. }));
    }

    #[test]
    fn double_brace_without_a_path_is_literal() {
        let ctx = ctx_with_user();
        assert_eq!(ctx.interpolate_text("{{ not a path }}", None).unwrap(), "{{ not a path }}");
        assert_eq!(ctx.interpolate_text("{{\"a\": 1}} {{", None).unwrap(), "{{\"a\": 1}} {{");
        assert!(!ExecutionContext::is_reference("{{a}} and {{b}}"));
    }

    #[test]
    fn date_part_builtins_are_zero_padded() {
        let ctx = ExecutionContext::new();
        let year = ctx.builtin("YEAR").unwrap();
        assert_eq!(year.as_str().unwrap().len(), 4);
        for name in ["MONTH", "DAY", "HOUR", "MINUTE", "SECOND"] {
            let value = ctx.builtin(name).unwrap();
            let text = value.as_str().unwrap();
            assert_eq!(text.len(), 2, "{} = {}", name, text);
            assert!(text.chars().all(|c| c.is_ascii_digit()));
        }
        let date = ctx.interpolate_text("{{YEAR}}-${MONTH}-{{DAY}}", None).unwrap();
        assert_eq!(date.len(), 10);
        assert_eq!(ctx.interpolate_str("${DATE}", None).unwrap().as_str().unwrap().len(), 10);
    }

    #[test]
    fn step_output_wins_over_variable() {
        let mut ctx = ctx_with_user();
        ctx.set_variable("get_user", json!({"status": 500}));
        assert_eq!(ctx.resolve("${get_user.status}").unwrap(), json!(200));
    }

    #[test]
    fn designated_input_overrides_last_output() {
        let ctx = ctx_with_user();
        let input = canonicalize(&json!({"name": "ada"}));
        assert_eq!(ctx.resolve_in("$name", Some(&input)).unwrap(), json!("ada"));
        assert!(ctx.resolve_in("$status", Some(&input)).is_err());
    }

    #[test]
    fn escaped_placeholder_is_literal() {
        let ctx = ExecutionContext::new();
        assert_eq!(ctx.interpolate_text("cost: $${AMOUNT}", None).unwrap(), "cost: ${AMOUNT}");
    }

    #[test]
    fn raw_keys_are_not_interpolated() {
        let ctx = ctx_with_user();
        let config = canonicalize(&json!({
            "url": "${BASE_URL}",
            "transforms": {"id": "$.id"}
        }));
        let resolved = ctx.interpolate_map(&config, None, &["transforms"]).unwrap();
        assert_eq!(resolved["url"], json!("http://api.local"));
        assert_eq!(resolved["transforms"], json!({"id": "$.id"}));
    }

    #[test]
    fn expression_text_is_not_a_reference() {
        assert!(!ExecutionContext::is_reference("$.status == 200"));
        assert!(ExecutionContext::is_reference("$.status"));
        assert!(ExecutionContext::is_reference("${a.b[0]}"));
    }
}

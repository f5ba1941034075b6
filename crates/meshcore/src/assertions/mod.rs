//! Boolean expressions over canonical output maps.
//!
//! Used for step `assert` lists, the `assert` action and `condition` steps.
//! Expressions are parsed once and never mutate their input.

mod expr;

use crate::value::field_names;
use crate::{AssertionError, OutputMap, StepError};
use serde_json::Value;

/// A parsed expression ready to evaluate against any number of inputs.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: expr::Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, String> {
        Ok(Self {
            source: source.trim().to_string(),
            ast: expr::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to an arbitrary value.
    pub fn value(&self, input: &OutputMap) -> Result<Value, String> {
        expr::eval(&self.ast, input)
    }

    /// Evaluate to a boolean. Non-boolean results are errors.
    pub fn test(&self, input: &OutputMap) -> Result<bool, String> {
        match self.value(input)? {
            Value::Bool(b) => Ok(b),
            other => Err(format!(
                "expression did not evaluate to a boolean (got {})",
                expr::type_name(&other)
            )),
        }
    }
}

/// Evaluate a single expression.
///
/// `Ok(false)` is a failed check; `Err` means the expression could not be
/// parsed or evaluated at all.
pub fn evaluate(expression: &str, input: &OutputMap) -> Result<bool, AssertionError> {
    evaluate_as(expression, expression, input)
}

/// Evaluate `resolved` but report failures against `written`, so that values
/// substituted into the expression stay out of error text.
fn evaluate_as(written: &str, resolved: &str, input: &OutputMap) -> Result<bool, AssertionError> {
    let fail = |reason: String| AssertionError {
        expression: written.trim().to_string(),
        reason,
        available_fields: field_names(input),
    };
    let parsed = Expression::parse(resolved).map_err(|e| fail(format!("invalid expression: {}", e)))?;
    parsed.test(input).map_err(|e| fail(format!("evaluation error: {}", e)))
}

/// Check every expression and collect every failure.
pub fn check_all<S: AsRef<str>>(expressions: &[S], input: &OutputMap) -> Result<(), StepError> {
    let pairs: Vec<(&str, &str)> = expressions.iter().map(|e| (e.as_ref(), e.as_ref())).collect();
    check_resolved(&pairs, input)
}

/// Like [`check_all`] for expressions that went through `${...}`
/// interpolation. Each pair is `(as written, as resolved)`; failures carry
/// the written form only.
pub fn check_resolved<W: AsRef<str>, R: AsRef<str>>(pairs: &[(W, R)], input: &OutputMap) -> Result<(), StepError> {
    let mut failures = Vec::new();
    for (written, resolved) in pairs {
        let written = written.as_ref();
        match evaluate_as(written, resolved.as_ref(), input) {
            Ok(true) => {}
            Ok(false) => failures.push(AssertionError {
                expression: written.trim().to_string(),
                reason: "evaluated to false".to_string(),
                available_fields: field_names(input),
            }),
            Err(err) => failures.push(err),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonicalize;
    use serde_json::json;

    #[test]
    fn heterogeneous_inputs_evaluate_the_same() {
        let expressions = ["id == 1", "status == \"active\""];
        let as_map = canonicalize(&json!({"id": 1, "status": "active"}));
        let as_text = canonicalize(&json!("{\"id\": 1, \"status\": \"active\"}"));

        assert!(check_all(&expressions, &as_map).is_ok());
        assert!(check_all(&expressions, &as_text).is_ok());
    }

    #[test]
    fn failure_names_expression_and_fields() {
        let input = canonicalize(&json!({"id": 1, "status": "active"}));
        let err = check_all(&["id == 1", "status == \"inactive\""], &input).unwrap_err();

        let StepError::Assertion(failures) = err else {
            panic!("expected assertion error");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].expression, "status == \"inactive\"");
        assert_eq!(failures[0].available_fields, vec!["id", "status"]);
    }

    #[test]
    fn body_paths_and_response_alias() {
        let input = canonicalize(&json!({
            "status": 200,
            "body": {"user": {"name": "ada"}, "items": [1, 2]}
        }));
        assert_eq!(evaluate("$.user.name == \"ada\"", &input), Ok(true));
        assert_eq!(evaluate("response.body.items[1] == 2", &input), Ok(true));
        assert_eq!(evaluate("status >= 200 && status < 300", &input), Ok(true));
    }

    #[test]
    fn resolved_values_stay_out_of_failures() {
        let input = canonicalize(&json!({"name": "ada", "token": "abc"}));
        let pairs = [("token == \"${API_TOKEN}\"", "token == \"s3cr3t-token\"")];

        let StepError::Assertion(failures) = check_resolved(&pairs, &input).unwrap_err() else {
            panic!("expected assertion error");
        };
        assert_eq!(failures[0].expression, "token == \"${API_TOKEN}\"");
        let message = failures[0].to_string();
        assert!(!message.contains("s3cr3t"), "{}", message);
        assert!(!message.contains("abc"), "{}", message);
        assert!(message.contains("name, token"), "{}", message);
    }

    #[test]
    fn non_boolean_result_is_an_error() {
        let input = canonicalize(&json!({"id": 1}));
        let err = evaluate("id", &input).unwrap_err();
        assert!(err.reason.contains("boolean"));
    }

    #[test]
    fn evaluation_does_not_mutate_input() {
        let input = canonicalize(&json!({"id": 1}));
        let before = input.clone();
        let _ = evaluate("id == 2", &input);
        assert_eq!(input, before);
    }
}

use async_trait::async_trait;
use meshcore::{Action, ActionContext, ActionMetadata, ActionOutput, ConfigField, OutputMap, Step, StepError, ValidationError};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Rows and affected-row count from one statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<OutputMap>,
    pub rows_affected: u64,
}

/// Database access used by `database_query`. Drivers live outside this crate.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn query(
        &self,
        query: &str,
        params: &[Value],
    ) -> Result<QueryResult, Box<dyn std::error::Error + Send + Sync>>;
}

/// Runs `query` with positional `params` through a [`DatabaseClient`]
pub struct DatabaseQueryAction {
    client: Arc<dyn DatabaseClient>,
}

impl DatabaseQueryAction {
    pub fn new(client: Arc<dyn DatabaseClient>) -> Self {
        Self { client }
    }
}

pub(crate) fn params(value: Option<&Value>) -> Result<Vec<Value>, StepError> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(StepError::Configuration("params must be a list".to_string())),
    }
}

#[async_trait]
impl Action for DatabaseQueryAction {
    fn action_type(&self) -> &str {
        "database_query"
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let query = ctx.require_str("query")?;
        let params = params(ctx.get("params"))?;
        let kind = query.split_whitespace().next().unwrap_or_default().to_uppercase();

        info!(step_id = %ctx.step.id, kind = %kind, params = params.len(), "Executing database query");
        let result = self
            .client
            .query(query, &params)
            .await
            .map_err(|e| ctx.action_error(format!("query failed: {}", e)))?;

        let row_count = result.rows.len();
        let rows: Vec<Value> = result.rows.into_iter().map(Value::Object).collect();
        Ok(ActionOutput::new()
            .with_output("rows", Value::Array(rows))
            .with_output("row_count", row_count)
            .with_output("rows_affected", result.rows_affected))
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        match step.config.get("query").and_then(Value::as_str) {
            Some(query) if !query.trim().is_empty() => Ok(()),
            _ => Err(ValidationError::step(&step.id, "database_query needs a query")),
        }
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Run a database query".to_string(),
            category: "database".to_string(),
            config: vec![
                ConfigField::required("query", "SQL statement"),
                ConfigField::optional("params", "Positional parameters"),
            ],
        }
    }
}

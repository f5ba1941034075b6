use meshcore::{Action, ActionMetadata};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available action types
///
/// Built once at startup and shared read-only afterwards, so lookups need
/// no locking.
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action. A later registration under the same name wins.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        let action_type = action.action_type().to_string();
        if self.actions.contains_key(&action_type) {
            tracing::warn!("Replacing action type: {}", action_type);
        } else {
            tracing::info!("Registering action type: {}", action_type);
        }
        self.actions.insert(action_type, action);
    }

    /// Look up the handler for `action_type`.
    ///
    /// An exact match wins. Otherwise a namespaced type such as
    /// `kafka.produce` resolves to the handler registered as `kafka`, which
    /// reads the full name from `ActionContext::step` to pick the operation.
    pub fn get(&self, action_type: &str) -> Option<Arc<dyn Action>> {
        if let Some(action) = self.actions.get(action_type) {
            return Some(action.clone());
        }
        let (namespace, _) = action_type.split_once('.')?;
        if namespace.is_empty() {
            return None;
        }
        self.actions.get(namespace).cloned()
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.get(action_type).is_some()
    }

    /// Get all registered action types, sorted
    pub fn list_action_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.actions.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for an action type
    pub fn get_metadata(&self, action_type: &str) -> Option<ActionMetadata> {
        self.get(action_type).map(|a| a.metadata())
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshcore::{ActionContext, ActionOutput, StepError};

    struct Named(&'static str);

    #[async_trait]
    impl Action for Named {
        fn action_type(&self) -> &str {
            self.0
        }

        async fn execute(&self, _ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
            Ok(ActionOutput::new())
        }
    }

    #[test]
    fn namespaced_types_fall_back_to_their_prefix() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Named("kafka")));
        registry.register(Arc::new(Named("kafka.admin")));

        assert_eq!(registry.get("kafka.produce").unwrap().action_type(), "kafka");
        assert_eq!(registry.get("kafka.admin").unwrap().action_type(), "kafka.admin");
        assert!(registry.contains("kafka.consume"));
        assert!(registry.get("redis.get").is_none());
        assert!(registry.get(".produce").is_none());
        assert!(registry.get("kafka").is_some());
    }
}

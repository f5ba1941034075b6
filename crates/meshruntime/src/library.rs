use meshcore::Flow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Named flows that `run_flow` steps can invoke.
#[derive(Default)]
pub struct FlowLibrary {
    flows: RwLock<HashMap<String, Arc<Flow>>>,
}

impl FlowLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow under its own name, replacing any earlier one.
    pub fn register(&self, flow: Flow) {
        let name = flow.name().to_string();
        tracing::info!("Registering flow: {}", name);
        self.write().insert(name, Arc::new(flow));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Flow>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Flow>>> {
        self.flows.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Flow>>> {
        self.flows.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

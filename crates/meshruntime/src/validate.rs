use crate::{ActionRegistry, FlowLibrary};
use meshcore::{parse_duration, Flow, OnError, Step, ValidationError};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Static checks run before an execution starts. Nothing here executes a step.
pub struct FlowValidator<'a> {
    registry: &'a ActionRegistry,
    library: &'a FlowLibrary,
}

impl<'a> FlowValidator<'a> {
    pub fn new(registry: &'a ActionRegistry, library: &'a FlowLibrary) -> Self {
        Self { registry, library }
    }

    pub fn validate(&self, flow: &Flow) -> Result<(), ValidationError> {
        self.validate_definition(flow)?;
        self.check_subflows(flow)
    }

    /// Checks for one flow on its own, without following `run_flow` targets.
    fn validate_definition(&self, flow: &Flow) -> Result<(), ValidationError> {
        if flow.name().trim().is_empty() {
            return Err(ValidationError::Invalid("flow name is required".to_string()));
        }
        if flow.steps.is_empty() {
            return Err(ValidationError::Invalid(format!("flow '{}' has no steps", flow.name())));
        }
        flow.timeout()?;

        let mut seen = HashSet::new();
        for (_, block) in flow.phases() {
            self.validate_block(flow, block, &mut seen)?;
        }
        Ok(())
    }

    fn validate_block(&self, flow: &Flow, steps: &[Step], seen: &mut HashSet<String>) -> Result<(), ValidationError> {
        for step in steps {
            self.validate_step(flow, step, seen)?;
        }
        Ok(())
    }

    fn validate_step(&self, flow: &Flow, step: &Step, seen: &mut HashSet<String>) -> Result<(), ValidationError> {
        if step.id.is_empty() {
            return Err(ValidationError::step(step.display_name(), "step id is required"));
        }
        if !seen.insert(step.id.clone()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }

        let action = self
            .registry
            .get(&step.action)
            .ok_or_else(|| ValidationError::UnknownAction {
                step_id: step.id.clone(),
                action: step.action.clone(),
            })?;

        if let Some(retry) = &step.retry {
            if retry.attempts == 0 {
                return Err(ValidationError::step(&step.id, "retry attempts must be at least 1"));
            }
            retry.base_delay()?;
        }
        if let Some(timeout) = &step.timeout {
            parse_duration(timeout)?;
        }

        match (step.on_error, step.error_handler.is_empty()) {
            (OnError::Handle, true) => {
                return Err(ValidationError::step(&step.id, "on_error: handle needs an error_handler"));
            }
            (OnError::Abort | OnError::Continue, false) => {
                return Err(ValidationError::step(&step.id, "error_handler is only used with on_error: handle"));
            }
            _ => {}
        }

        action.validate(step)?;

        if let Some(target) = action.subflow(step) {
            if target != flow.name() && !self.library.contains(target) {
                return Err(ValidationError::FlowNotFound(target.to_string()));
            }
        }

        for block in step.child_blocks() {
            self.validate_block(flow, block, seen)?;
        }
        Ok(())
    }

    /// Every library flow reachable from `flow` must itself be valid, and the
    /// references must not form a cycle. Each flow is checked once.
    fn check_subflows(&self, flow: &Flow) -> Result<(), ValidationError> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        let root = graph.add_node(flow.name().to_string());
        index.insert(flow.name().to_string(), root);

        let mut queue = vec![(root, self.references(flow))];
        while let Some((from, targets)) = queue.pop() {
            for target in targets {
                let to = match index.get(&target) {
                    Some(existing) => *existing,
                    None => {
                        let node = graph.add_node(target.clone());
                        index.insert(target.clone(), node);
                        if let Some(child) = self.library.get(&target) {
                            self.validate_definition(&child).map_err(|err| ValidationError::InvalidSubFlow {
                                flow: target.clone(),
                                source: Box::new(err),
                            })?;
                            queue.push((node, self.references(&child)));
                        }
                        node
                    }
                };
                graph.update_edge(from, to, ());
            }
        }

        toposort(&graph, None)
            .map(|_| ())
            .map_err(|cycle| ValidationError::CyclicFlowReference(graph[cycle.node_id()].clone()))
    }

    fn references(&self, flow: &Flow) -> Vec<String> {
        flow.all_steps()
            .into_iter()
            .filter_map(|step| {
                let action = self.registry.get(&step.action)?;
                action.subflow(step).map(str::to_string)
            })
            .collect()
    }
}

use crate::{parse_duration, FlowError, OutputMap, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Complete flow definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    #[serde(rename = "flow")]
    pub meta: FlowMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<Step>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown: Vec<Step>,
    #[serde(default, skip_serializing_if = "FlowSettings::is_empty")]
    pub config: FlowSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowMeta {
    pub name: String,
    /// Stable identifier assigned by whoever stores the flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Flow-level variables, overridable per execution.
    #[serde(default, skip_serializing_if = "OutputMap::is_empty")]
    pub env: OutputMap,
    /// Result fields exposed to callers, typically `run_flow` parents.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl FlowSettings {
    fn is_empty(&self) -> bool {
        self.timeout.is_none()
    }
}

/// Which block of a flow a step belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Main,
    Teardown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Main => "main",
            Phase::Teardown => "teardown",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: FlowMeta {
                name: name.into(),
                ..FlowMeta::default()
            },
            setup: Vec::new(),
            steps: Vec::new(),
            teardown: Vec::new(),
            config: FlowSettings::default(),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, FlowError> {
        let mut flow: Flow = serde_yaml::from_str(text)?;
        flow.assign_ids();
        Ok(flow)
    }

    pub fn from_json(text: &str) -> Result<Self, FlowError> {
        let mut flow: Flow = serde_json::from_str(text)?;
        flow.assign_ids();
        Ok(flow)
    }

    pub fn to_yaml(&self) -> Result<String, FlowError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn to_json(&self) -> Result<String, FlowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_setup(mut self, step: Step) -> Self {
        self.setup.push(step);
        self
    }

    pub fn with_teardown(mut self, step: Step) -> Self {
        self.teardown.push(step);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.env.insert(key.into(), value.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, rule: impl Into<String>) -> Self {
        self.meta.outputs.insert(name.into(), rule.into());
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.config.timeout = Some(timeout.into());
        self
    }

    pub fn timeout(&self) -> Result<Option<Duration>, ValidationError> {
        self.config.timeout.as_deref().map(parse_duration).transpose()
    }

    /// Give every step without an id a positional one, e.g. `main_2` or
    /// `main_0_then_1`. Explicit ids are left alone.
    pub fn assign_ids(&mut self) {
        assign_block_ids(&mut self.setup, Phase::Setup.as_str());
        assign_block_ids(&mut self.steps, Phase::Main.as_str());
        assign_block_ids(&mut self.teardown, Phase::Teardown.as_str());
    }

    pub fn phases(&self) -> [(Phase, &[Step]); 3] {
        [
            (Phase::Setup, &self.setup),
            (Phase::Main, &self.steps),
            (Phase::Teardown, &self.teardown),
        ]
    }

    /// Every step in the flow, depth first, including nested children.
    pub fn all_steps(&self) -> Vec<&Step> {
        let mut out = Vec::new();
        for (_, block) in self.phases() {
            for step in block {
                step.collect(&mut out);
            }
        }
        out
    }

    pub fn find_step(&self, id: &str) -> Option<&Step> {
        self.all_steps().into_iter().find(|s| s.id == id)
    }
}

fn assign_block_ids(steps: &mut [Step], prefix: &str) {
    for (index, step) in steps.iter_mut().enumerate() {
        if step.id.is_empty() {
            step.id = format!("{}_{}", prefix, index);
        }
        let parent = step.id.clone();
        assign_block_ids(&mut step.then, &format!("{}_then", parent));
        assign_block_ids(&mut step.otherwise, &format!("{}_else", parent));
        assign_block_ids(&mut step.steps, &format!("{}_steps", parent));
        assign_block_ids(&mut step.error_handler, &format!("{}_handler", parent));
        for (branch_index, branch) in step.branches.iter_mut().enumerate() {
            let label = branch
                .name
                .clone()
                .unwrap_or_else(|| branch_index.to_string());
            assign_block_ids(&mut branch.steps, &format!("{}_{}", parent, label));
        }
    }
}

/// What happens after a step fails for good.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Abort,
    Continue,
    Handle,
}

impl OnError {
    fn is_abort(&self) -> bool {
        matches!(self, OnError::Abort)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Retry policy for step execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(alias = "max_attempts")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            delay: None,
            backoff: Backoff::Fixed,
        }
    }

    pub fn with_delay(mut self, delay: impl Into<String>) -> Self {
        self.delay = Some(delay.into());
        self
    }

    pub fn exponential(mut self) -> Self {
        self.backoff = Backoff::Exponential;
        self
    }

    pub fn base_delay(&self) -> Result<Duration, ValidationError> {
        match self.delay.as_deref() {
            Some(text) => parse_duration(text),
            None => Ok(Duration::ZERO),
        }
    }

    /// Delay to wait after `failed_attempt` (1-based) before the next one.
    pub fn delay_after(&self, base: Duration, failed_attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(failed_attempt.saturating_sub(1));
                base.checked_mul(factor).unwrap_or(Duration::MAX)
            }
        }
    }
}

/// Named group of steps run concurrently by the `parallel` action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Branch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn label(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("branch_{}", index))
    }
}

/// One unit of work in a flow
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Step {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub action: String,
    #[serde(default, skip_serializing_if = "OutputMap::is_empty")]
    pub config: OutputMap,
    #[serde(default, rename = "assert", skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "OnError::is_abort")]
    pub on_error: OnError,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_handler: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub then: Vec<Step>,
    #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
    pub otherwise: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
}

impl Step {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_assert(mut self, expression: impl Into<String>) -> Self {
        self.assertions.push(expression.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, rule: impl Into<String>) -> Self {
        self.output.insert(name.into(), rule.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_error_handler(mut self, step: Step) -> Self {
        self.on_error = OnError::Handle;
        self.error_handler.push(step);
        self
    }

    pub fn with_then(mut self, step: Step) -> Self {
        self.then.push(step);
        self
    }

    pub fn with_else(mut self, step: Step) -> Self {
        self.otherwise.push(step);
        self
    }

    pub fn with_child(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_branch(mut self, branch: Branch) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1)
    }

    pub fn step_timeout(&self) -> Result<Option<Duration>, ValidationError> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }

    pub fn has_children(&self) -> bool {
        !(self.then.is_empty()
            && self.otherwise.is_empty()
            && self.steps.is_empty()
            && self.branches.is_empty()
            && self.error_handler.is_empty())
    }

    /// Direct child blocks: `then`, `else`, `steps`, each branch, then
    /// the error handler.
    pub fn child_blocks(&self) -> Vec<&[Step]> {
        let mut blocks: Vec<&[Step]> = vec![&self.then, &self.otherwise, &self.steps];
        blocks.extend(self.branches.iter().map(|b| b.steps.as_slice()));
        blocks.push(&self.error_handler);
        blocks
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Step>) {
        out.push(self);
        for block in self.child_blocks() {
            for child in block {
                child.collect(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_FLOW: &str = r#"
flow:
  name: login
  env:
    BASE_URL: http://localhost:8080
  outputs:
    token: ${login.token}
setup:
  - action: log
    config:
      message: starting
steps:
  - id: login
    action: http
    config:
      method: POST
      url: ${BASE_URL}/login
    assert:
      - status == 200
    output:
      token: $.token
    retry:
      max_attempts: 3
      delay: 100ms
      backoff: exponential
  - action: condition
    config:
      condition: "true"
    then:
      - action: log
        config:
          message: ok
    else:
      - action: log
        config:
          message: no
config:
  timeout: 30s
"#;

    #[test]
    fn parses_yaml_flow() {
        let flow = Flow::from_yaml(LOGIN_FLOW).unwrap();

        assert_eq!(flow.name(), "login");
        assert_eq!(flow.setup[0].id, "setup_0");
        assert_eq!(flow.steps[0].id, "login");
        assert_eq!(flow.steps[1].id, "main_1");
        assert_eq!(flow.steps[1].then[0].id, "main_1_then_0");
        assert_eq!(flow.steps[1].otherwise[0].id, "main_1_else_0");

        let retry = flow.steps[0].retry.as_ref().unwrap();
        assert_eq!(retry.attempts, 3);
        assert_eq!(retry.backoff, Backoff::Exponential);
        assert_eq!(flow.timeout().unwrap(), Some(Duration::from_secs(30)));
        assert_eq!(flow.steps[0].assertions, vec!["status == 200".to_string()]);
    }

    #[test]
    fn yaml_round_trip_preserves_definition() {
        let flow = Flow::from_yaml(LOGIN_FLOW).unwrap();
        let text = flow.to_yaml().unwrap();
        let again = Flow::from_yaml(&text).unwrap();
        assert_eq!(flow, again);

        let json = flow.to_json().unwrap();
        assert_eq!(Flow::from_json(&json).unwrap(), flow);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy::new(4).with_delay("100ms").exponential();
        let base = policy.base_delay().unwrap();

        assert_eq!(policy.delay_after(base, 1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(base, 2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(base, 3), Duration::from_millis(400));

        let fixed = RetryPolicy::new(4).with_delay("100ms");
        assert_eq!(fixed.delay_after(base, 3), Duration::from_millis(100));
    }

    #[test]
    fn all_steps_walks_nested_blocks() {
        let flow = Flow::from_yaml(LOGIN_FLOW).unwrap();
        let ids: Vec<&str> = flow.all_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["setup_0", "login", "main_1", "main_1_then_0", "main_1_else_0"]
        );
    }
}

use crate::{ExecutionId, FlowError, OutputMap, Phase, Step};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// pending -> running -> {completed, failed, cancelled}. A pending
    /// execution may also be cancelled before it starts.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Cancelled) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }

    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Skipped) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Outcome of a single try of a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptResult {
    pub attempt: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "OutputMap::is_empty")]
    pub output: OutputMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub action: String,
    pub phase: Phase,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptResult>,
    /// Extracted output written to the execution context on success.
    #[serde(default, skip_serializing_if = "OutputMap::is_empty")]
    pub output: OutputMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl StepRecord {
    pub fn new(step: &Step, phase: Phase) -> Self {
        Self {
            step_id: step.id.clone(),
            name: step.name.clone(),
            action: step.action.clone(),
            phase,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            attempts: Vec::new(),
            output: OutputMap::new(),
            error: None,
            children: Vec::new(),
            iteration: None,
            branch: None,
        }
    }

    /// A step that was reached but never run.
    pub fn skipped(step: &Step, phase: Phase) -> Self {
        let mut record = Self::new(step, phase);
        record.status = StepStatus::Skipped;
        record
    }

    pub fn transition(&mut self, next: StepStatus) -> Result<(), FlowError> {
        if !self.status.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        let now = Utc::now();
        match next {
            StepStatus::Running => self.started_at = Some(now),
            _ if next.is_terminal() => {
                self.finished_at = Some(now);
                if let Some(started) = self.started_at {
                    self.duration_ms = (now - started).num_milliseconds().max(0) as u64;
                }
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    /// Depth-first search through this record and its children.
    pub fn find(&self, step_id: &str) -> Option<&StepRecord> {
        if self.step_id == step_id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(step_id))
    }

    fn tally_into(&self, counts: &mut StepCounts) {
        match self.status {
            StepStatus::Completed => counts.passed += 1,
            StepStatus::Failed => counts.failed += 1,
            StepStatus::Skipped => counts.skipped += 1,
            StepStatus::Pending | StepStatus::Running => counts.unfinished += 1,
        }
        for child in &self.children {
            child.tally_into(counts);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unfinished: usize,
}

impl StepCounts {
    pub fn of(records: &[StepRecord]) -> Self {
        let mut counts = StepCounts::default();
        for record in records {
            record.tally_into(&mut counts);
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped + self.unfinished
    }
}

/// Result of running one flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub flow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub steps: Vec<StepRecord>,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(default, skip_serializing_if = "OutputMap::is_empty")]
    pub outputs: OutputMap,
}

impl ExecutionRecord {
    pub fn new(flow_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_name: flow_name.into(),
            flow_id: None,
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            steps: Vec::new(),
            passed: 0,
            failed: 0,
            skipped: 0,
            error: None,
            failed_step: None,
            outputs: OutputMap::new(),
        }
    }

    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), FlowError> {
        if !self.status.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        let now = Utc::now();
        match next {
            ExecutionStatus::Running => self.started_at = Some(now),
            _ if next.is_terminal() => {
                self.finished_at = Some(now);
                if let Some(started) = self.started_at {
                    self.duration_ms = (now - started).num_milliseconds().max(0) as u64;
                }
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Recount passed/failed/skipped across the whole step tree.
    pub fn tally(&mut self) {
        let counts = StepCounts::of(&self.steps);
        self.passed = counts.passed;
        self.failed = counts.failed;
        self.skipped = counts.skipped;
    }

    pub fn counts(&self) -> StepCounts {
        StepCounts::of(&self.steps)
    }

    pub fn find_step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find_map(|s| s.find(step_id))
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

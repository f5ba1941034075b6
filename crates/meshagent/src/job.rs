use crate::error::AgentError;
use chrono::{DateTime, Utc};
use meshcore::{ExecutionId, ExecutionRecord, ExecutionStatus, Flow, OutputMap, StepRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A unit of work handed out by the control plane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Flow definition, YAML or JSON
    pub flow_yaml: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: OutputMap,
}

impl Job {
    pub fn new(id: impl Into<String>, flow_yaml: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            flow_id: None,
            flow_yaml: flow_yaml.into(),
            environment: BTreeMap::new(),
            variables: OutputMap::new(),
        }
    }

    pub fn flow(&self) -> Result<Flow, AgentError> {
        Flow::from_yaml(&self.flow_yaml).map_err(|e| AgentError::InvalidJob {
            job_id: self.id.clone(),
            message: e.to_string(),
        })
    }

    /// Run-time variables: environment first, explicit variables win.
    pub fn inputs(&self) -> OutputMap {
        let mut inputs: OutputMap = self
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        inputs.extend(self.variables.clone());
        inputs
    }
}

/// Result of one job as delivered to the control plane.
///
/// `idempotency_key` is the job id, so a report re-sent after a network
/// failure can be recognised as a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobReport {
    pub job_id: String,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    pub status: ExecutionStatus,
    pub steps: Vec<StepRecord>,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(default, skip_serializing_if = "OutputMap::is_empty")]
    pub outputs: OutputMap,
}

impl JobReport {
    pub fn from_record(job: &Job, record: ExecutionRecord) -> Self {
        Self {
            job_id: job.id.clone(),
            idempotency_key: job.id.clone(),
            execution_id: Some(record.id),
            flow_id: record.flow_id.or_else(|| job.flow_id.clone()),
            status: record.status,
            steps: record.steps,
            passed: record.passed,
            failed: record.failed,
            skipped: record.skipped,
            duration_ms: record.duration_ms,
            error: record.error,
            failed_step: record.failed_step,
            outputs: record.outputs,
        }
    }

    /// A job that never started: unparsable or failed validation
    pub fn rejected(job: &Job, error: impl Into<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            idempotency_key: job.id.clone(),
            execution_id: None,
            flow_id: job.flow_id.clone(),
            status: ExecutionStatus::Failed,
            steps: Vec::new(),
            passed: 0,
            failed: 0,
            skipped: 0,
            duration_ms: 0,
            error: Some(error.into()),
            failed_step: None,
            outputs: OutputMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInfo {
    pub id: String,
    pub hostname: String,
    pub version: String,
    pub platform: String,
    pub arch: String,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl AgentInfo {
    /// Describe the machine this process runs on
    pub fn detect(id: impl Into<String>, tags: Vec<String>) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        let mut metadata = BTreeMap::new();
        metadata.insert("num_cpus".to_string(), cpus.to_string());

        Self {
            id: id.into(),
            hostname,
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            tags,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatPayload {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub running_jobs: usize,
    pub max_concurrent: usize,
    /// Share of job slots in use, 0.0 to 1.0
    pub load: f64,
    pub uptime_seconds: u64,
}

/// Snapshot of one in-flight job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunningJob {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn variables_override_environment() {
        let mut job = Job::new("j1", "steps: []");
        job.environment.insert("region".to_string(), "eu".to_string());
        job.environment.insert("tier".to_string(), "free".to_string());
        job.variables.insert("tier".to_string(), json!("pro"));

        let inputs = job.inputs();
        assert_eq!(inputs["region"], json!("eu"));
        assert_eq!(inputs["tier"], json!("pro"));
    }

    #[test]
    fn job_decodes_with_missing_optionals() {
        let job: Job = serde_json::from_value(json!({"id": "j2", "flow_yaml": "steps: []"})).unwrap();
        assert!(job.environment.is_empty());
        assert!(job.flow_id.is_none());
    }

    #[test]
    fn rejected_report_keys_on_job_id() {
        let job = Job::new("j3", "::");
        let err = job.flow().unwrap_err();
        let report = JobReport::rejected(&job, err.to_string());
        assert_eq!(report.idempotency_key, "j3");
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(report.error.unwrap().contains("Invalid job j3"));
    }
}

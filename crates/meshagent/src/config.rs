use crate::error::{AgentError, Result};
use clap::Parser;
use meshcore::parse_duration;
use std::time::Duration;

/// Agent settings, read from flags with `MESH_*` environment fallbacks
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "mesh-agent", about = "Runs test flows pulled from the control plane", version)]
pub struct AgentConfig {
    /// Base URL of the control plane API
    #[arg(long, env = "MESH_API_URL", default_value = "http://localhost:5016")]
    pub api_url: String,

    /// Agent id, generated when empty
    #[arg(long, env = "MESH_AGENT_ID")]
    pub agent_id: Option<String>,

    /// Bearer token sent with every control plane request
    #[arg(long, env = "MESH_AGENT_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,

    /// Comma-separated tags advertised at registration
    #[arg(long, env = "MESH_AGENT_TAGS", default_value = "")]
    pub tags: String,

    #[arg(long, env = "MESH_MAX_CONCURRENT", default_value_t = 5)]
    pub max_concurrent: usize,

    #[arg(long, env = "MESH_POLL_INTERVAL", default_value = "5s", value_parser = duration_arg)]
    pub poll_interval: Duration,

    #[arg(long, env = "MESH_HEARTBEAT_INTERVAL", default_value = "30s", value_parser = duration_arg)]
    pub heartbeat_interval: Duration,

    /// How long running jobs get to wind down after a shutdown signal
    #[arg(long, env = "MESH_SHUTDOWN_GRACE", default_value = "30s", value_parser = duration_arg)]
    pub shutdown_grace: Duration,

    /// Delivery attempts for one job result before giving up
    #[arg(long, env = "MESH_REPORT_ATTEMPTS", default_value_t = 5)]
    pub report_attempts: u32,
}

fn duration_arg(text: &str) -> std::result::Result<Duration, String> {
    parse_duration(text).map_err(|e| e.to_string())
}

impl AgentConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            agent_id: None,
            token: String::new(),
            tags: String::new(),
            max_concurrent: 5,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            report_attempts: 5,
        }
    }

    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(AgentError::Config(format!("api_url must be an http(s) URL, got '{}'", self.api_url)));
        }
        if self.max_concurrent == 0 {
            return Err(AgentError::Config("max_concurrent must be at least 1".to_string()));
        }
        if self.report_attempts == 0 {
            return Err(AgentError::Config("report_attempts must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(AgentError::Config("intervals must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_defaults_match_constructor() {
        let parsed = AgentConfig::try_parse_from(["mesh-agent", "--api-url", "http://cp:5016"]).unwrap();
        assert_eq!(parsed, AgentConfig::new("http://cp:5016"));
    }

    #[test]
    fn durations_and_tags_parse() {
        let parsed = AgentConfig::try_parse_from([
            "mesh-agent",
            "--poll-interval",
            "250ms",
            "--tags",
            "linux, gpu ,,eu",
        ])
        .unwrap();
        assert_eq!(parsed.poll_interval, Duration::from_millis(250));
        assert_eq!(parsed.tag_list(), vec!["linux", "gpu", "eu"]);
    }

    #[test]
    fn bad_values_rejected() {
        assert!(AgentConfig::try_parse_from(["mesh-agent", "--poll-interval", "soon"]).is_err());

        let mut config = AgentConfig::new("ftp://cp");
        assert!(config.validate().is_err());
        config.api_url = "http://cp".to_string();
        config.max_concurrent = 0;
        assert!(config.validate().is_err());
    }
}

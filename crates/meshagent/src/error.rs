use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Control plane returned {status}: {message}")]
    ControlPlane { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to report result of job {job_id} after {attempts} attempts: {message}")]
    Reporting {
        job_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Invalid job {job_id}: {message}")]
    InvalidJob { job_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// Whether repeating the same request later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Http(_) => true,
            AgentError::ControlPlane { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

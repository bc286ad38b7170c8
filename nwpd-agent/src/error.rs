use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] nwpd_common::ConfigError),

    #[error("invalid job {job_id}: {reason}")]
    InvalidJob { job_id: String, reason: String },

    #[error("no observation writer configured")]
    NoWriter,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("cannot encode report: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn invalid_job(job_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        AgentError::InvalidJob {
            job_id: job_id.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

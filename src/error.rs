use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("cannot connect to agent {agent}: {reason}")]
    Connect { agent: String, reason: String },

    #[error("agent request failed: {0}")]
    Rpc(#[from] tonic::Status),
}

pub type Result<T> = std::result::Result<T, CliError>;

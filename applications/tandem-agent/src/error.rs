/// Agent error types
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Update failed: {0}")]
    Update(#[from] tandem_core::OtaError),

    #[error("Invalid engine configuration: {0}")]
    Engine(#[from] tandem_ota::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

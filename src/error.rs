use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Every credential has hit its daily request cap. Fatal to the run;
    /// the orchestrator flushes a checkpoint before surfacing this.
    #[error("all credentials exhausted their daily quota")]
    QuotaExceeded,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

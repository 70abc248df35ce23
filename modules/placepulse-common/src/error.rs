use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PlacePulseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Audit run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Stage {stage} cannot start: upstream {upstream} is not done")]
    DependencyNotReady { stage: String, upstream: String },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

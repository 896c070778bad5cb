/// Shared error type used across all Colloquy crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("llm: {0}")]
    Llm(String),

    #[error("workflow: {0}")]
    Workflow(String),

    #[error("executor: {0}")]
    Executor(String),

    #[error("definitions: {0}")]
    Definitions(String),

    #[error("turn not found: {0}")]
    TurnNotFound(uuid::Uuid),

    #[error("actor: {0}")]
    Actor(String),

    #[error("journal: {0}")]
    Journal(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

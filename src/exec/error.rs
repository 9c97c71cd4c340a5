use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to create exec: {0}")]
    Create(String),

    #[error("Failed to attach exec: {0}")]
    Attach(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Resize failed: {0}")]
    Resize(String),

    #[error("Exec channel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LmError {
    /// Invalid dimension relationships, detected at construction.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("sequence of {len} tokens exceeds the context length of {max}")]
    SequenceTooLong { len: usize, max: usize },

    #[error("non-finite values at step {step} (loss {loss}, grad norm {grad_norm})")]
    NumericInstability {
        step: usize,
        loss: f32,
        grad_norm: f32,
    },

    #[error("key/value cache is full ({len} of {capacity} positions)")]
    CacheExhausted { len: usize, capacity: usize },

    #[error("checkpoint: {0}")]
    Checkpoint(String),

    #[error("tokenizer: {0}")]
    Tokenizer(String),

    #[error("failed to read or write")]
    Io(#[from] std::io::Error),

    #[error("invalid json")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LmError>;

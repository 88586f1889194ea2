use thiserror::Error;

/// Result alias for analytical operations.
pub type AiResult<T> = Result<T, AiError>;

/// Failures raised by the analytical pipelines.
///
/// None of these are fatal to the process: the scheduler terminates only the
/// run that raised them, and nothing is written for that run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AiError {
    /// Not enough (or not varied enough) labeled data to train a model.
    #[error("insufficient training data: {0}")]
    InsufficientData(String),

    /// Not enough history to run an algorithm meaningfully.
    #[error("insufficient history: need at least {required} periods, got {available}")]
    InsufficientHistory { required: usize, available: usize },

    /// The statistical fit did not converge to usable parameters.
    #[error("model fit failed: {0}")]
    ModelFit(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Model state could not be encoded/decoded.
    #[error("model serialization failed: {0}")]
    Serialization(String),

    #[error("model io failed: {0}")]
    Io(String),
}

impl From<serde_json::Error> for AiError {
    fn from(value: serde_json::Error) -> Self {
        AiError::Serialization(value.to_string())
    }
}

impl From<std::io::Error> for AiError {
    fn from(value: std::io::Error) -> Self {
        AiError::Io(value.to_string())
    }
}

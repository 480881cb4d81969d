//! ddptrain error types

/// ddptrain result type
pub type Result<T> = std::result::Result<T, Error>;

/// ddptrain errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Filesystem or socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid run or model configuration, detected before training starts
    #[error("configuration error: {reason}")]
    ConfigError {
        /// Description of what went wrong
        reason: String,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Dataset, sampler or loader error
    #[error("data error: {reason}")]
    DataError {
        /// Description of what went wrong
        reason: String,
    },

    /// Tokenizer error
    #[error("tokenizer error: {reason}")]
    TokenizerError {
        /// Description of what went wrong
        reason: String,
    },

    /// Model construction or forward error
    #[error("model error: {reason}")]
    ModelError {
        /// Description of what went wrong
        reason: String,
    },

    /// Training/optimizer error
    #[error("training error: {reason}")]
    TrainingError {
        /// Description of what went wrong
        reason: String,
    },

    /// Distributed communication error
    #[error("distributed error: {reason}")]
    DistributedError {
        /// Description of what went wrong
        reason: String,
    },

    /// Checkpoint exists but cannot be decoded
    #[error("corrupt checkpoint {path}: {reason}")]
    CheckpointCorrupt {
        /// Checkpoint file
        path: String,
        /// Description of what went wrong
        reason: String,
    },
}

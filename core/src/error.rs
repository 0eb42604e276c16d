use thiserror::Error;

/// Stratum error types
#[derive(Error, Debug)]
pub enum StratumError {
    /// Invalid configuration or build precondition (layer cap, path mapping)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Build file could not be decoded
    #[error("Parse error: line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Union mount or fallback copy failed
    #[error("Mount error: {target}: {message}")]
    Mount { target: String, message: String },

    /// A directory or tar stream could not be registered as a layer
    #[error("Layer registration failed: {0}")]
    Registration(String),

    /// Cache lookup failed; callers degrade this to a miss
    #[error("Cache probe error: {0}")]
    CacheProbe(String),

    /// An instruction body exited unsuccessfully
    #[error("Execution failed: `{command}` exited with {exit_code}: {output}")]
    Execution {
        command: String,
        exit_code: i32,
        output: String,
    },

    /// Blob, image or layer does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Content store failure (I/O around blobs, corruption)
    #[error("Store error: {0}")]
    Store(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StratumError {
    /// Shorthand for a mount error on a path.
    pub fn mount(target: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        StratumError::Mount {
            target: target.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// Whether the error must abort a build.
    ///
    /// Cache probe failures are the only recoverable kind: the build falls
    /// back to executing the instruction.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StratumError::CacheProbe(_))
    }
}

impl From<serde_json::Error> for StratumError {
    fn from(err: serde_json::Error) -> Self {
        StratumError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for StratumError {
    fn from(err: serde_yaml::Error) -> Self {
        StratumError::Serialization(err.to_string())
    }
}

/// Result type alias for stratum operations
pub type Result<T> = std::result::Result<T, StratumError>;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Watcher error: {0}")]
    WatchError(#[from] notify::Error),

    #[error("Invalid file pattern: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The file may still be in flight; callers retry.
    #[error("Loading {path} failed: {message}")]
    TransientLoad { path: String, message: String },

    #[error("Cannot load {path}: {message}")]
    Load { path: String, message: String },

    #[error("Invalid sha {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("Ledger invariant violated: {0}")]
    LedgerInvariant(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(path: &std::path::Path, message: impl Into<String>) -> Self {
        Self::TransientLoad {
            path: path.display().to_string(),
            message: message.into(),
        }
    }

    pub fn load(path: &std::path::Path, message: impl Into<String>) -> Self {
        Self::Load {
            path: path.display().to_string(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientLoad { .. })
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LedgerInvariant(_))
    }

    /// Short machine-readable code used in error replies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "invalid_request",
            Self::ConfigError(_) | Self::PatternError(_) => "config",
            Self::TransientLoad { .. } | Self::Load { .. } => "load_failed",
            Self::LedgerInvariant(_) => "internal",
            Self::IoError(_) | Self::JsonError(_) | Self::WatchError(_) | Self::Other(_) => {
                "internal"
            }
        }
    }
}

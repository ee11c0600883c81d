use crate::storage::StorageError;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Configuration rejected before any generation started
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// The raw curve could not be rescaled onto the target percentile
    #[error("Calibration failed: {message}")]
    Calibration { message: String },

    /// Storage read/write failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config { message: message.into() }
    }

    pub fn calibration(message: impl Into<String>) -> Self {
        Error::Calibration { message: message.into() }
    }

    /// Short machine-friendly label used in logs and run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config",
            Error::Calibration { .. } => "calibration",
            Error::Storage(_) => "storage",
            Error::Other(_) => "internal",
        }
    }
}

/// Type alias for pipeline results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinct() {
        assert_eq!(Error::config("bad").kind(), "config");
        assert_eq!(Error::calibration("flat").kind(), "calibration");
        assert_eq!(Error::Storage(StorageError::Corrupt("x".into())).kind(), "storage");
        assert_eq!(Error::Other(anyhow::anyhow!("boom")).kind(), "internal");
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::config("target bandwidth must be positive").to_string(),
            "Invalid configuration: target bandwidth must be positive"
        );
        assert_eq!(Error::calibration("raw p95 is zero").to_string(), "Calibration failed: raw p95 is zero");
    }
}

//! Error types for the fine-tune harness.

use thiserror::Error;

/// Main error type for the fine-tune harness.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Model name with no registered architecture
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    /// Learning rate policy name with no schedule
    #[error("Unsupported learning rate policy: {0}")]
    UnsupportedPolicy(String),

    /// Dataset name with no known class count or input size
    #[error("Unsupported dataset: {0}")]
    UnsupportedDataset(String),

    /// Dataset error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Image processing error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Checkpoint could not be written or read back
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for fine-tune operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnsupportedModel("mobilenet".to_string());
        assert_eq!(err.to_string(), "Unsupported model: mobilenet");

        let err = Error::UnsupportedPolicy("step3".to_string());
        assert_eq!(err.to_string(), "Unsupported learning rate policy: step3");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}

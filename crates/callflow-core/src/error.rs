use thiserror::Error;

/// Top-level error type for the Callflow system.
///
/// Subsystem crates define their own error types and wrap `CallflowError`
/// with `#[from]` so the `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CallflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("API error: {0}")]
    Api(String),
}

impl From<toml::de::Error> for CallflowError {
    fn from(err: toml::de::Error) -> Self {
        CallflowError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for CallflowError {
    fn from(err: toml::ser::Error) -> Self {
        CallflowError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CallflowError {
    fn from(err: serde_json::Error) -> Self {
        CallflowError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Callflow operations.
pub type Result<T> = std::result::Result<T, CallflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CallflowError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");

        let err = CallflowError::InvalidTransition {
            from: "completed".into(),
            to: "active".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: completed -> active"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CallflowError = io_err.into();
        assert!(matches!(err, CallflowError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: CallflowError = err.unwrap_err().into();
        assert!(matches!(err, CallflowError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: CallflowError = err.unwrap_err().into();
        assert!(matches!(err, CallflowError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(format!("got {}", value))
        }

        assert_eq!(inner().unwrap(), "got 42");
    }
}

use std::fmt;

/// Custom error types for the advisor subsystem
#[derive(Debug, Clone)]
pub enum AdvisorError {
    /// Helper executable could not be spawned
    LaunchError(String),
    /// Helper never completed the UCI handshake
    HandshakeError(String),
    /// Reading from or writing to a helper pipe failed
    CommunicationError(String),
    /// A helper process is no longer running; its stream can no longer be trusted
    HelperDied { index: usize },
    /// Invalid chess position or move
    InvalidPosition(String),
    /// Configuration error
    ConfigurationError(String),
}

impl fmt::Display for AdvisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvisorError::LaunchError(msg) => write!(f, "Launch error: {}", msg),
            AdvisorError::HandshakeError(msg) => write!(f, "Handshake error: {}", msg),
            AdvisorError::CommunicationError(msg) => write!(f, "Communication error: {}", msg),
            AdvisorError::HelperDied { index } => {
                write!(f, "Helper engine {} died; its stream cannot be recovered", index)
            }
            AdvisorError::InvalidPosition(msg) => write!(f, "Invalid position: {}", msg),
            AdvisorError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AdvisorError {}

// Convenience type alias
pub type Result<T> = std::result::Result<T, AdvisorError>;

// Convert from common error types
impl From<std::io::Error> for AdvisorError {
    fn from(error: std::io::Error) -> Self {
        AdvisorError::CommunicationError(error.to_string())
    }
}

impl From<serde_json::Error> for AdvisorError {
    fn from(error: serde_json::Error) -> Self {
        AdvisorError::ConfigurationError(format!("JSON serialization error: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AdvisorError::HelperDied { index: 2 };
        assert_eq!(
            err.to_string(),
            "Helper engine 2 died; its stream cannot be recovered"
        );

        let err = AdvisorError::LaunchError("no such file".to_string());
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: AdvisorError = io_err.into();
        assert!(matches!(err, AdvisorError::CommunicationError(_)));
    }
}

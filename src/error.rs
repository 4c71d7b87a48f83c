//! Error types for the provenance engine

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the provenance engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Request validation errors (surfaced before any traversal starts)
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    // Chain data source errors (absorbed per node by the tracer)
    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("Data source timeout after {0}ms")]
    DataSourceTimeout(u64),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is worth another bounded attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimitExceeded(_) | Error::DataSourceTimeout(_)
        )
    }

    /// Check if this error came from a chain data source call
    ///
    /// These never fail a trace; the affected address is marked unresolved.
    pub fn is_data_source(&self) -> bool {
        matches!(
            self,
            Error::DataSource(_)
                | Error::DataSourceTimeout(_)
                | Error::RateLimitExceeded(_)
                | Error::MalformedResponse(_)
        )
    }

    /// Check if this error rejects a request outright
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::InvalidAddress(_) | Error::InvalidParameters(_))
    }
}

// Conversion from solana_client errors
impl From<solana_client::client_error::ClientError> for Error {
    fn from(e: solana_client::client_error::ClientError) -> Self {
        Error::DataSource(e.to_string())
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_families() {
        assert!(Error::RateLimitExceeded("5/s".into()).is_retryable());
        assert!(Error::DataSourceTimeout(100).is_retryable());
        assert!(!Error::MalformedResponse("bad".into()).is_retryable());

        assert!(Error::MalformedResponse("bad".into()).is_data_source());
        assert!(!Error::InvalidAddress("x".into()).is_data_source());

        assert!(Error::InvalidParameters("max_hops".into()).is_rejection());
        assert!(!Error::DataSource("down".into()).is_rejection());
    }
}

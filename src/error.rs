//! Crate-level error type.
//!
//! Every component returns [`TunerError`]; the HTTP layer maps each variant to
//! a status code via [`TunerError::status_code`] and never retries.

use thiserror::Error;

/// Errors surfaced by the tuning components and the service layer.
#[derive(Debug, Error)]
pub enum TunerError {
    /// Operation preconditions unmet (empty telemetry window, nothing to version).
    #[error("{0}")]
    InvalidState(String),
    /// Referenced entity does not exist.
    #[error("{0}")]
    NotFound(String),
    /// The request body or query could not be understood.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Durable read or write failed.
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),
    /// A persisted record could not be encoded or decoded.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TunerError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        TunerError::InvalidState(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        TunerError::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        TunerError::BadRequest(msg.into())
    }

    /// HTTP status code for this error class.
    pub fn status_code(&self) -> u16 {
        match self {
            TunerError::InvalidState(_) | TunerError::BadRequest(_) => 400,
            TunerError::NotFound(_) => 404,
            TunerError::Storage(_) | TunerError::Serialization(_) => 500,
        }
    }

    /// True when the caller is at fault (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

pub type Result<T> = std::result::Result<T, TunerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_is_400() {
        let e = TunerError::invalid_state("No telemetry");
        assert_eq!(e.status_code(), 400);
        assert!(e.is_client_error());
        assert_eq!(e.to_string(), "No telemetry");
    }

    #[test]
    fn test_not_found_is_404() {
        assert_eq!(TunerError::not_found("Experiment not found").status_code(), 404);
    }

    #[test]
    fn test_io_error_is_500() {
        let e: TunerError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(e.status_code(), 500);
        assert!(!e.is_client_error());
        assert!(e.to_string().contains("disk full"));
    }

    #[test]
    fn test_serde_error_is_500() {
        let e: TunerError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(e.status_code(), 500);
    }
}

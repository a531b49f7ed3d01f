use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{dynamic::ParseObjectError, labels::SelectorError};

/// An error response from the API.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    /// Build a failure response
    pub fn new(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self {
            status: "Failure".into(),
            message: message.into(),
            reason: reason.into(),
            code,
        }
    }

    /// The object does not exist
    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }

    /// A write lost an optimistic concurrency race, or the object already exists
    pub fn is_conflict(&self) -> bool {
        self.code == 409
    }

    /// The watch fell out of the server's history window and must relist
    pub fn is_gone(&self) -> bool {
        self.code == 410
    }
}

/// Possible errors when working with the shared types
#[derive(Error, Debug)]
pub enum Error {
    /// A selector could not be evaluated
    #[error("invalid selector: {0}")]
    Selector(#[from] SelectorError),

    /// A field of an object did not have the expected shape
    #[error(transparent)]
    ParseObject(#[from] ParseObjectError),
}

#[cfg(test)]
mod test {
    use super::ErrorResponse;

    #[test]
    fn test_deserialize_error_response() {
        let status = r#"{"kind":"Status","apiVersion":"v1","metadata":{},"status":"Failure","message":"vmrules \"r1\" not found","reason":"NotFound","details":{"name":"r1","kind":"vmrules"},"code":404}"#;
        let err: ErrorResponse = serde_json::from_str(status).unwrap();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "vmrules \"r1\" not found: NotFound");
    }
}

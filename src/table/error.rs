// ABOUTME: Typed failures reported by table services
// ABOUTME: Wrapped in anyhow at call sites; callers downcast when they need the kind

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table '{0}' does not exist")]
    TableNotFound(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("{operation} failed with status {status}{}: {message}", .code.as_deref().map(|c| format!(" ({})", c)).unwrap_or_default())]
    Status {
        operation: String,
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("unexpected response from table service: {0}")]
    Protocol(String),
}

impl TableError {
    /// HTTP-like status of the failure, if the service reported one.
    pub fn status(&self) -> Option<u16> {
        match self {
            TableError::Status { status, .. } => Some(*status),
            TableError::TableNotFound(_) => Some(404),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_includes_code() {
        let err = TableError::Status {
            operation: "query table 'users'".to_string(),
            status: 503,
            code: Some("ServerBusy".to_string()),
            message: "try later".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "query table 'users' failed with status 503 (ServerBusy): try later"
        );
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn test_status_display_without_code() {
        let err = TableError::Status {
            operation: "list tables".to_string(),
            status: 500,
            code: None,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "list tables failed with status 500: boom");
    }
}

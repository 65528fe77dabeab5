//! Error types for CDP operations
//!
//! One flat enum. Callers branch on the variant (or the `is_*` helpers),
//! never on message text.

use thiserror::Error;

use crate::cdp::protocol::TargetId;

/// Result type for CDP operations
pub type Result<T> = std::result::Result<T, CDPError>;

#[derive(Error, Debug)]
pub enum CDPError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The browser answered a command with an explicit error
    #[error("Protocol error ({method}): {message}{}", format_data(.data))]
    Protocol {
        method: String,
        code: i64,
        message: String,
        data: Option<String>,
    },

    /// Command addressed to a detached session
    #[error("Protocol error ({method}): Session closed. Most likely the target has been closed.")]
    SessionClosed { method: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Execution context was destroyed, most likely because of a navigation.")]
    ExecutionContextDestroyed,

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Target not found: {0}")]
    TargetNotFound(TargetId),

    #[error("Page initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid response for {method}: {reason}")]
    InvalidResponse { method: String, reason: String },
}

fn format_data(data: &Option<String>) -> String {
    match data {
        Some(data) => format!(" {}", data),
        None => String::new(),
    }
}

impl CDPError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CDPError::Timeout(_))
    }

    pub fn is_navigation(&self) -> bool {
        matches!(self, CDPError::Navigation(_))
    }

    pub fn is_session_closed(&self) -> bool {
        matches!(self, CDPError::SessionClosed { .. })
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, CDPError::ConnectionClosed)
    }

    pub(crate) fn invalid_response(method: &str, reason: impl ToString) -> Self {
        CDPError::InvalidResponse {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_is_prefixed_with_method() {
        let err = CDPError::Protocol {
            method: "Page.navigate".to_string(),
            code: -32000,
            message: "Cannot navigate to invalid URL".to_string(),
            data: None,
        };
        assert_eq!(
            err.to_string(),
            "Protocol error (Page.navigate): Cannot navigate to invalid URL"
        );

        let err = CDPError::Protocol {
            method: "DOM.describeNode".to_string(),
            code: -32602,
            message: "Invalid parameters".to_string(),
            data: Some("Failed to deserialize params.nodeId".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Protocol error (DOM.describeNode): Invalid parameters Failed to deserialize params.nodeId"
        );
    }

    #[test]
    fn test_predicates_follow_variant() {
        let timeout = CDPError::Timeout("Navigation timeout of 30000 ms exceeded".to_string());
        assert!(timeout.is_timeout());
        assert!(!timeout.is_navigation());

        let detached = CDPError::Navigation("Navigating frame was detached".to_string());
        assert!(detached.is_navigation());
        assert!(!detached.is_connection_closed());

        assert!(CDPError::ConnectionClosed.is_connection_closed());
        assert!(!CDPError::ExecutionContextDestroyed.is_session_closed());
    }

    #[test]
    fn test_session_closed_message() {
        let err = CDPError::SessionClosed {
            method: "Runtime.evaluate".to_string(),
        };
        assert!(err.is_session_closed());
        assert_eq!(
            err.to_string(),
            "Protocol error (Runtime.evaluate): Session closed. Most likely the target has been closed."
        );
    }
}

//! # Errors
//!
//! Two layers of errors live here.
//!
//! - [`ResError`] is what a *client* sees: a `{code, message}` object inside the
//!   `error` field of a reply. Handlers produce these for expected outcomes
//!   (not found, invalid parameters, application rule violations).
//! - [`FrameworkError`] is the outcome of a handler invocation or a misuse of
//!   the framework API. It wraps a [`ResError`] for protocol errors and carries
//!   everything else (programming errors, opaque application failures).
//!
//! The dispatcher resolves a `FrameworkError` into exactly one reply: protocol
//! errors go straight to the client, every other variant becomes a generic
//! internal error and is reported to the operator log.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Error code for resources that do not exist.
pub const CODE_NOT_FOUND: &str = "system.notFound";
/// Error code for call or auth methods that do not exist.
pub const CODE_METHOD_NOT_FOUND: &str = "system.methodNotFound";
/// Error code for malformed or rejected call parameters.
pub const CODE_INVALID_PARAMS: &str = "system.invalidParams";
/// Error code for failures internal to the service.
pub const CODE_INTERNAL_ERROR: &str = "system.internalError";
/// Error code for denied access.
pub const CODE_ACCESS_DENIED: &str = "system.accessDenied";
/// Error code for requests that timed out.
pub const CODE_TIMEOUT: &str = "system.timeout";

/// A RES protocol error, sent to the client as the `error` member of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

impl ResError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attaches additional structured data to the error.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn not_found() -> Self {
        Self::new(CODE_NOT_FOUND, "Not found")
    }

    pub fn method_not_found() -> Self {
        Self::new(CODE_METHOD_NOT_FOUND, "Method not found")
    }

    /// An invalid params error. An empty message becomes "Invalid parameters".
    pub fn invalid_params(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.is_empty() {
            Self::new(CODE_INVALID_PARAMS, "Invalid parameters")
        } else {
            Self::new(CODE_INVALID_PARAMS, message)
        }
    }

    pub fn internal() -> Self {
        Self::new(CODE_INTERNAL_ERROR, "Internal error")
    }

    pub fn access_denied() -> Self {
        Self::new(CODE_ACCESS_DENIED, "Access denied")
    }

    pub fn timeout() -> Self {
        Self::new(CODE_TIMEOUT, "Request timeout")
    }
}

impl fmt::Display for ResError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ResError {}

/// Errors raised by the framework itself or returned from handlers.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    /// A structured protocol error meant for the client.
    #[error("protocol error: {0}")]
    Protocol(ResError),

    #[error("response already sent on request")]
    AlreadyReplied,

    #[error("negative timeout duration: {0}ms")]
    NegativeTimeout(i64),

    #[error("query response on non-query request")]
    QueryOnNonQueryRequest,

    #[error("{operation} not allowed on a {kind} resource")]
    WrongResourceKind {
        operation: &'static str,
        kind: &'static str,
    },

    #[error("{operation} not allowed on a {rtype} request")]
    UnsupportedOperation {
        operation: &'static str,
        rtype: &'static str,
    },

    #[error("reserved event name: {0}")]
    ReservedEvent(String),

    #[error("invalid event name: {0:?}")]
    InvalidEventName(String),

    #[error("invalid resource reference: {0:?}")]
    InvalidReference(String),

    #[error("{operation} result must be a JSON {expected}")]
    InvalidResult {
        operation: &'static str,
        expected: &'static str,
    },

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    #[error("pattern {0:?} collides with an already registered pattern")]
    DuplicatePattern(String),

    #[error("handler for {0:?} declares both model and collection handlers")]
    KindConflict(String),

    #[error("no handler for resource {0:?}")]
    NotFound(String),

    #[error("group {0:?} is already held by the current task")]
    ReentrantLock(String),

    #[error("task queue is closed")]
    QueueClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// An opaque failure from application code.
    #[error("handler error: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),
}

impl FrameworkError {
    /// Wraps an application error as an opaque handler failure.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        FrameworkError::Handler(err.into())
    }

    /// Returns the protocol error if this is one.
    pub fn as_protocol(&self) -> Option<&ResError> {
        match self {
            FrameworkError::Protocol(e) => Some(e),
            _ => None,
        }
    }

    /// True for misuse of the request or event API by handler code. These are
    /// logged where they happen.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            FrameworkError::AlreadyReplied
                | FrameworkError::NegativeTimeout(_)
                | FrameworkError::QueryOnNonQueryRequest
                | FrameworkError::WrongResourceKind { .. }
                | FrameworkError::UnsupportedOperation { .. }
                | FrameworkError::ReservedEvent(_)
                | FrameworkError::InvalidEventName(_)
                | FrameworkError::InvalidReference(_)
                | FrameworkError::InvalidResult { .. }
        )
    }
}

impl From<ResError> for FrameworkError {
    fn from(err: ResError) -> Self {
        FrameworkError::Protocol(err)
    }
}

/// Outcome of a handler invocation.
pub type HandlerResult = Result<(), FrameworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_res_error_omits_missing_data() {
        let json = serde_json::to_string(&ResError::not_found()).unwrap();
        assert_eq!(json, r#"{"code":"system.notFound","message":"Not found"}"#);
    }

    #[test]
    fn test_invalid_params_defaults_message() {
        assert_eq!(ResError::invalid_params("").message, "Invalid parameters");
        assert_eq!(ResError::invalid_params("Title required").message, "Title required");
    }

    #[test]
    fn test_question_mark_lifts_res_error() {
        fn fails() -> HandlerResult {
            let lookup: Result<(), ResError> = Err(ResError::method_not_found());
            lookup?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert_eq!(err.as_protocol().unwrap().code, CODE_METHOD_NOT_FOUND);
        assert!(!err.is_programming_error());
        assert!(FrameworkError::AlreadyReplied.is_programming_error());
    }

    #[test]
    fn test_timeout_error_code() {
        let err = ResError::timeout();
        assert_eq!(err.code, CODE_TIMEOUT);
        assert_eq!(err.message, "Request timeout");
    }
}

//! Error tracing extensions
//!
//! Logs a [`BridgeError`] with its code, classification and source chain.

use std::error::Error as StdError;

use crate::types::BridgeError;

/// Extension trait for adding tracing context to errors
pub trait ErrorTraceExt {
    /// Log error with full context including error code, retryable status, and error chain
    fn trace_error(&self) -> &Self;
}

impl ErrorTraceExt for BridgeError {
    fn trace_error(&self) -> &Self {
        let error_code = self.error_code();

        let mut error_chain = Vec::new();
        let mut current_source = self.source();
        while let Some(source) = current_source {
            error_chain.push(source.to_string());
            current_source = source.source();
        }

        tracing::error!(
            error = %self,
            error_code = error_code.code(),
            error_code_name = ?error_code,
            is_retryable = self.is_retryable(),
            is_client_error = self.is_client_error(),
            error_chain = ?error_chain,
            "Bridge operation failed"
        );

        self
    }
}

/// Extension trait for Result types
pub trait ResultTraceExt<T>: Sized {
    /// Convert the error to a [`BridgeError`] and log it with context
    fn trace_context(self) -> Result<T, BridgeError>;
}

impl<T, E> ResultTraceExt<T> for Result<T, E>
where
    BridgeError: From<E>,
{
    fn trace_context(self) -> Result<T, BridgeError> {
        self.map_err(|e| {
            let error = BridgeError::from(e);
            error.trace_error();
            error
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_error_returns_self() {
        let error = BridgeError::session_not_found("thread-1");
        assert!(matches!(error.trace_error(), BridgeError::SessionNotFound(id) if id == "thread-1"));
    }

    #[test]
    fn test_result_trace_context_converts() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe closed",
        ));
        let error = result.trace_context().unwrap_err();
        assert!(matches!(error, BridgeError::Io(_)));
    }
}

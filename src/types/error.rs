//! Error types for the chat bridge

use thiserror::Error;

/// Stable error codes reported alongside [`BridgeError`]
///
/// The JSON-RPC range is shared with the MCP permission helper, which
/// reports these codes verbatim to the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Standard JSON-RPC errors (-32xxx)
    /// Parse error: Invalid JSON
    ParseError = -32700,
    /// Invalid request: Not a valid request object
    InvalidRequest = -32600,
    /// Method not found
    MethodNotFound = -32601,
    /// Invalid params
    InvalidParams = -32602,
    /// Internal error
    InternalError = -32603,

    // Bridge-specific errors (-32000 to -32099)
    /// Session not found
    SessionNotFound = -32001,
    /// A turn is already running for the session
    TurnInProgress = -32002,
    /// The CLI process is not running
    ProcessNotRunning = -32003,
    /// The CLI process could not be started
    SpawnFailed = -32004,
    /// Writing to the CLI process failed
    TransportFailed = -32005,
    /// Permission bridge could not be started
    BridgeUnavailable = -32006,
    /// Configuration error
    ConfigError = -32010,
}

impl ErrorCode {
    /// Get the error code value
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Main error type for the bridge core
#[derive(Debug, Error)]
pub enum BridgeError {
    // === Session errors ===
    /// No session registered for the conversation
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A message arrived while the session was still processing a turn
    #[error("A turn is already in progress for {0}")]
    TurnInProgress(String),

    // === Process errors ===
    /// The CLI binary could not be spawned
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing the input record to the CLI stdin failed
    #[error("Failed to write to CLI stdin: {0}")]
    StdinWrite(#[source] std::io::Error),

    /// The driver has no live process to talk to
    #[error("CLI process is not running")]
    ProcessNotRunning,

    /// A stdout line was not a JSON object
    #[error("Malformed event line: {0}")]
    MalformedEvent(String),

    // === Permission bridge errors ===
    /// Binding the loopback listener failed
    #[error("Failed to bind permission bridge on {addr}: {source}")]
    BridgeBind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called on a bridge that is already listening
    #[error("Permission bridge is already running")]
    BridgeAlreadyRunning,

    // === Configuration errors ===
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // === External errors ===
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic errors ===
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for the bridge core
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Get the error code for this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            BridgeError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            BridgeError::TurnInProgress(_) => ErrorCode::TurnInProgress,
            BridgeError::SpawnFailed { .. } => ErrorCode::SpawnFailed,
            BridgeError::StdinWrite(_) => ErrorCode::TransportFailed,
            BridgeError::ProcessNotRunning => ErrorCode::ProcessNotRunning,
            BridgeError::MalformedEvent(_) => ErrorCode::ParseError,
            BridgeError::BridgeBind { .. } => ErrorCode::BridgeUnavailable,
            BridgeError::BridgeAlreadyRunning => ErrorCode::BridgeUnavailable,
            BridgeError::Config(_) => ErrorCode::ConfigError,
            BridgeError::Io(_) => ErrorCode::InternalError,
            BridgeError::Json(_) => ErrorCode::ParseError,
            BridgeError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if this error is retryable
    ///
    /// The core never retries on its own; this is a hint for the front end.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::TurnInProgress(_)
                | BridgeError::StdinWrite(_)
                | BridgeError::ProcessNotRunning
        )
    }

    /// Check if this error is a client error (caused by invalid input)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BridgeError::SessionNotFound(_)
                | BridgeError::TurnInProgress(_)
                | BridgeError::Config(_)
        )
    }

    // === Constructor helpers ===

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        BridgeError::Internal(msg.into())
    }

    /// Create a session not found error
    pub fn session_not_found(conversation_id: impl Into<String>) -> Self {
        BridgeError::SessionNotFound(conversation_id.into())
    }

    /// Create a turn in progress error
    pub fn turn_in_progress(conversation_id: impl Into<String>) -> Self {
        BridgeError::TurnInProgress(conversation_id.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        BridgeError::Config(msg.into())
    }

    /// Create a spawn failure for `program`
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        BridgeError::SpawnFailed {
            program: program.into(),
            source,
        }
    }
}

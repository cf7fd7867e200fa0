//! Shared types for the chat bridge
//!
//! Event protocol records, permission and question records, configuration
//! and errors.

mod config;
mod error;
mod events;
mod permission;
mod question;

pub use config::{
    BridgeConfig, CLIENT_TIMEOUT, DEFAULT_ALLOWED_TOOLS, DEFAULT_DECISION_TIMEOUT, DEFAULT_IPC_PORT,
    IPC_PORT_ENV,
};
pub use error::{BridgeError, ErrorCode, Result};
pub use events::{
    AssistantBody, AssistantMessage, BlockDelta, ContentBlock, PartialEvent, PartialMessage,
    StreamEvent, SystemMessage, TokenUsage, TurnResult, UserEcho, user_message_line,
};
pub use permission::{PermissionDecision, PermissionRequest};
pub use question::{ASK_USER_QUESTION_TOOL, QuestionOption, UserQuestion, questions_answered};

//! Permission negotiation bridge
//!
//! The CLI cannot ask the chat user for permission itself. Instead it calls
//! the `permission_prompt` tool of a small MCP helper ([`mcp`]), which posts
//! the request over loopback HTTP ([`client`]) to the host process
//! ([`server`]). The host parks the request until a [`DecisionMaker`] answers.

pub mod client;
pub mod mcp;
pub mod server;

pub use client::{IPC_FAILURE_MESSAGE, PermissionClient};
pub use mcp::PermissionMcpServer;
pub use server::{
    ABANDONED_MESSAGE, DecisionMaker, NO_HANDLER_MESSAGE, PERMISSION_PATH, PermissionBridge,
    PermissionResolver, SHUTDOWN_MESSAGE,
};

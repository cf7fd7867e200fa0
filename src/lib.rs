//! Claude Chat Bridge
//!
//! Drives long-running Claude CLI processes on behalf of chat conversations
//! and routes the CLI's tool permission questions back to a human.
//!
//! ## Components
//!
//! - [`session`]: one CLI process per conversation, spoken to over its
//!   stream-json stdin/stdout protocol, plus the registry that owns them
//! - [`bridge`]: the loopback HTTP permission bridge and the MCP helper the
//!   CLI calls for every tool that is not pre-approved
//! - [`router`]: runs turns, renders their events through a
//!   [`router::TurnConsumer`] and answers permission requests
//! - [`console`]: a line console front end used by the binary
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use claude_chat_bridge::bridge::PermissionBridge;
//! use claude_chat_bridge::router::Router;
//! use claude_chat_bridge::session::{DriverOptions, SessionOptions, SessionRegistry};
//! use claude_chat_bridge::types::BridgeConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::from_env()?;
//!     let bridge = PermissionBridge::new();
//!     bridge.start(([127, 0, 0, 1], config.ipc_port).into()).await?;
//!
//!     let registry = Arc::new(SessionRegistry::new(DriverOptions::from_config(&config)));
//!     let router = Router::new(registry, bridge, Duration::from_secs(300));
//!     router.new_session("thread-1", SessionOptions::default())?;
//!     // router.handle_message("thread-1", "hello", consumer).await?;
//!     router.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! - `CLAUDE_BRIDGE_IPC_PORT`: permission bridge port (default 9824)
//! - `CLAUDE_BRIDGE_CLAUDE_PATH`: Claude CLI executable (default `claude`)
//! - `CLAUDE_BRIDGE_WORKING_DIR`: default working directory for sessions
//! - `CLAUDE_BRIDGE_SKIP_PERMISSIONS`: run the CLI without permission prompts
//! - `CLAUDE_BRIDGE_ALLOWED_TOOLS`: tools approved without asking
//! - `CLAUDE_BRIDGE_DECISION_TIMEOUT_SECS`: how long a human may take to answer
//!   (1 to 359 seconds)
//! - `CLAUDE_BRIDGE_MODEL`: model passed to the CLI

pub mod bridge;
pub mod cli;
pub mod console;
pub mod router;
pub mod runner;
pub mod session;
pub mod tracing;
pub mod types;

pub use bridge::{DecisionMaker, PermissionBridge, PermissionClient, PermissionResolver};
pub use cli::Cli;
pub use router::{Router, TurnConsumer, TurnEvent, TurnOutcome, TurnSummary};
pub use runner::{run_with_cli, shutdown_otel};
pub use session::{ManagedSession, SessionDriver, SessionOptions, SessionRegistry};
pub use types::{BridgeConfig, BridgeError, PermissionDecision, PermissionRequest, Result, StreamEvent};

//! Session management
//!
//! This module handles:
//! - The per-conversation Claude CLI process driver
//! - The registry mapping conversations to drivers
//! - Usage tracking (cost, tokens, message counts)

mod driver;
mod registry;
mod usage;
mod wrapped_child;

pub use driver::{
    DriverInfo, DriverOptions, DriverState, PERMISSION_PROMPT_TOOL, PERMISSION_SERVER_NAME,
    PermissionHelper, SessionDriver,
};
pub use registry::{ManagedSession, SessionOptions, SessionRegistry, SessionSummary};
pub use usage::{SessionUsage, UsageSnapshot};
pub use wrapped_child::{ChildPid, ChildPipes, WrappedChild};

#[cfg(all(test, unix))]
pub(crate) use driver::test_support;

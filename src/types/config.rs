//! Bridge configuration from environment variables

use std::path::PathBuf;
use std::time::Duration;

use super::error::{BridgeError, Result};

/// Environment variable carrying the bridge port into the permission helper
pub const IPC_PORT_ENV: &str = "CLAUDE_BRIDGE_IPC_PORT";

/// Default loopback port for the permission bridge
pub const DEFAULT_IPC_PORT: u16 = 9824;

/// How long a human gets to answer a permission prompt
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP timeout of the permission helper
///
/// Every decision timeout must stay below it, otherwise the helper gives up
/// while the human is still being asked.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(360);

/// Tools the CLI may use without asking
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &["Read", "Glob", "Grep"];

/// Host-side configuration
///
/// Every field can be set through a `CLAUDE_BRIDGE_*` environment variable;
/// command line flags override the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Loopback port for the permission bridge
    /// Environment variable: `CLAUDE_BRIDGE_IPC_PORT`
    pub ipc_port: u16,

    /// Claude CLI executable
    /// Environment variable: `CLAUDE_BRIDGE_CLAUDE_PATH`
    pub claude_path: PathBuf,

    /// Default working directory for new sessions
    /// Environment variable: `CLAUDE_BRIDGE_WORKING_DIR`
    pub working_dir: PathBuf,

    /// Run the CLI with `--dangerously-skip-permissions`
    /// Environment variable: `CLAUDE_BRIDGE_SKIP_PERMISSIONS`
    pub skip_permissions: bool,

    /// Tools pre-approved through `--allowedTools`
    /// Environment variable: `CLAUDE_BRIDGE_ALLOWED_TOOLS` (comma or space separated)
    pub allowed_tools: Vec<String>,

    /// Human decision timeout for permission prompts
    /// Environment variable: `CLAUDE_BRIDGE_DECISION_TIMEOUT_SECS`
    pub decision_timeout: Duration,

    /// Model passed to the CLI with `--model`
    /// Environment variable: `CLAUDE_BRIDGE_MODEL`
    pub model: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ipc_port: DEFAULT_IPC_PORT,
            claude_path: PathBuf::from("claude"),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            skip_permissions: false,
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(ToString::to_string).collect(),
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
            model: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(port) = get(IPC_PORT_ENV) {
            config.ipc_port = port
                .trim()
                .parse()
                .map_err(|_| BridgeError::config(format!("{IPC_PORT_ENV}={port} is not a port")))?;
        }
        if let Some(path) = get("CLAUDE_BRIDGE_CLAUDE_PATH") {
            config.claude_path = PathBuf::from(path);
        }
        if let Some(dir) = get("CLAUDE_BRIDGE_WORKING_DIR") {
            config.working_dir = PathBuf::from(dir);
        }
        if let Some(flag) = get("CLAUDE_BRIDGE_SKIP_PERMISSIONS") {
            config.skip_permissions = parse_bool("CLAUDE_BRIDGE_SKIP_PERMISSIONS", &flag)?;
        }
        if let Some(tools) = get("CLAUDE_BRIDGE_ALLOWED_TOOLS") {
            config.allowed_tools = tools
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|t| !t.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(secs) = get("CLAUDE_BRIDGE_DECISION_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                BridgeError::config(format!(
                    "CLAUDE_BRIDGE_DECISION_TIMEOUT_SECS={secs} is not a number of seconds"
                ))
            })?;
            config.decision_timeout = Duration::from_secs(secs);
        }
        config.model = get("CLAUDE_BRIDGE_MODEL");

        config.validate()?;
        Ok(config)
    }

    /// Check settings that depend on each other
    pub fn validate(&self) -> Result<()> {
        if self.decision_timeout.is_zero() || self.decision_timeout >= CLIENT_TIMEOUT {
            return Err(BridgeError::config(format!(
                "decision timeout must be between 1 and {} seconds, got {}",
                CLIENT_TIMEOUT.as_secs() - 1,
                self.decision_timeout.as_secs()
            )));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(BridgeError::config(format!("{key}={other} is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.ipc_port, 9824);
        assert_eq!(config.claude_path, PathBuf::from("claude"));
        assert!(!config.skip_permissions);
        assert_eq!(config.allowed_tools, vec!["Read", "Glob", "Grep"]);
        assert_eq!(config.decision_timeout, Duration::from_secs(300));
        assert!(config.model.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("CLAUDE_BRIDGE_IPC_PORT", "9900"),
            ("CLAUDE_BRIDGE_CLAUDE_PATH", "/opt/claude"),
            ("CLAUDE_BRIDGE_SKIP_PERMISSIONS", "yes"),
            ("CLAUDE_BRIDGE_ALLOWED_TOOLS", "Read, Bash  Edit"),
            ("CLAUDE_BRIDGE_DECISION_TIMEOUT_SECS", "30"),
            ("CLAUDE_BRIDGE_MODEL", "opus"),
            ("CLAUDE_BRIDGE_WORKING_DIR", ""),
        ]))
        .unwrap();
        assert_eq!(config.ipc_port, 9900);
        assert_eq!(config.claude_path, PathBuf::from("/opt/claude"));
        assert!(config.skip_permissions);
        assert_eq!(config.allowed_tools, vec!["Read", "Bash", "Edit"]);
        assert_eq!(config.decision_timeout, Duration::from_secs(30));
        assert_eq!(config.model.as_deref(), Some("opus"));
    }

    #[test]
    fn test_invalid_values() {
        let err = BridgeConfig::from_lookup(lookup(&[("CLAUDE_BRIDGE_IPC_PORT", "70000")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));

        let err = BridgeConfig::from_lookup(lookup(&[("CLAUDE_BRIDGE_SKIP_PERMISSIONS", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("not a boolean"));
    }

    #[test]
    fn test_decision_timeout_must_stay_below_client_timeout() {
        let err = BridgeConfig::from_lookup(lookup(&[("CLAUDE_BRIDGE_DECISION_TIMEOUT_SECS", "600")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
        assert!(err.to_string().contains("between 1 and 359 seconds"));

        let err = BridgeConfig::from_lookup(lookup(&[("CLAUDE_BRIDGE_DECISION_TIMEOUT_SECS", "360")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));

        let err = BridgeConfig::from_lookup(lookup(&[("CLAUDE_BRIDGE_DECISION_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));

        let config = BridgeConfig::from_lookup(lookup(&[("CLAUDE_BRIDGE_DECISION_TIMEOUT_SECS", "359")]))
            .unwrap();
        assert!(config.decision_timeout < CLIENT_TIMEOUT);
    }

    #[test]
    #[serial]
    fn test_from_process_env() {
        // SAFETY: serialized with the other env-mutating tests
        unsafe { std::env::set_var(IPC_PORT_ENV, "9901") };
        let config = BridgeConfig::from_env().unwrap();
        unsafe { std::env::remove_var(IPC_PORT_ENV) };
        assert_eq!(config.ipc_port, 9901);
    }
}

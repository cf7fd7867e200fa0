//! Command-line interface definitions
//!
//! Provides CLI argument parsing using clap for the chat bridge.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::types::{BridgeConfig, Result};

/// Claude chat bridge - drive Claude CLI sessions with human-approved tool use
#[derive(Parser, Debug, Clone)]
#[command(name = "claude-chat-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Enable diagnostic mode (auto-log to temp file)
    #[arg(short, long, global = true)]
    pub diagnostic: bool,

    /// Log directory (implies diagnostic mode)
    #[arg(short = 'l', long, value_name = "DIR", global = true)]
    pub log_dir: Option<PathBuf>,

    /// Log file name (implies diagnostic mode)
    #[arg(short = 'f', long, value_name = "FILE", global = true)]
    pub log_file: Option<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    /// Note: RUST_LOG env var takes priority over this flag
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (only errors)
    /// Note: RUST_LOG env var takes priority over this flag
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// OpenTelemetry OTLP endpoint (e.g., http://localhost:4317)
    /// When otel feature is disabled, this argument is accepted but ignored.
    #[arg(long, value_name = "URL", env = "OTEL_EXPORTER_OTLP_ENDPOINT", global = true)]
    pub otel_endpoint: Option<String>,

    /// OpenTelemetry service name
    #[arg(long, value_name = "NAME", default_value = "claude-chat-bridge", global = true)]
    pub otel_service_name: String,
}

/// What the binary runs
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Host the permission bridge and chat through a line console (default)
    Serve(ServeArgs),
    /// Stdio MCP permission helper; launched by the Claude CLI, not by hand
    PermissionMcp,
}

/// Overrides for the `CLAUDE_BRIDGE_*` environment
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct ServeArgs {
    /// Loopback port for the permission bridge
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Claude CLI executable
    #[arg(long, value_name = "PATH")]
    pub claude_path: Option<PathBuf>,

    /// Working directory for new sessions
    #[arg(long, short = 'C', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Let the CLI run every tool without asking
    #[arg(long)]
    pub skip_permissions: bool,

    /// Tools allowed without a prompt (comma separated)
    #[arg(long, value_name = "TOOLS", value_delimiter = ',')]
    pub allowed_tools: Option<Vec<String>>,

    /// Seconds to wait for a permission answer before denying (1 to 359)
    #[arg(long, value_name = "SECS")]
    pub decision_timeout: Option<u64>,

    /// Model for new sessions
    #[arg(long)]
    pub model: Option<String>,
}

impl ServeArgs {
    /// Apply the flags that were given on top of `config`
    ///
    /// The result is validated again, since flags may combine with the
    /// environment into an invalid configuration.
    pub fn apply(&self, config: &mut BridgeConfig) -> Result<()> {
        if let Some(port) = self.port {
            config.ipc_port = port;
        }
        if let Some(path) = &self.claude_path {
            config.claude_path.clone_from(path);
        }
        if let Some(dir) = &self.working_dir {
            config.working_dir.clone_from(dir);
        }
        if self.skip_permissions {
            config.skip_permissions = true;
        }
        if let Some(tools) = &self.allowed_tools {
            config.allowed_tools.clone_from(tools);
        }
        if let Some(secs) = self.decision_timeout {
            config.decision_timeout = Duration::from_secs(secs);
        }
        if let Some(model) = &self.model {
            config.model = Some(model.clone());
        }
        config.validate()
    }
}

#[allow(clippy::derivable_impls)]
impl Default for Cli {
    fn default() -> Self {
        Self {
            command: None,
            diagnostic: false,
            log_dir: None,
            log_file: None,
            verbose: 0,
            quiet: false,
            otel_endpoint: None,
            otel_service_name: "claude-chat-bridge".to_string(),
        }
    }
}

impl Cli {
    /// The subcommand to run; `serve` when none was given
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Serve(ServeArgs::default()))
    }

    /// Check if diagnostic mode is enabled (output to file)
    ///
    /// Returns true if `--diagnostic` is set, or if `--log-dir` or `--log-file` is specified.
    pub fn is_diagnostic(&self) -> bool {
        self.diagnostic || self.log_dir.is_some() || self.log_file.is_some()
    }

    /// Check if OpenTelemetry tracing is enabled
    #[cfg(feature = "otel")]
    pub fn is_otel_enabled(&self) -> bool {
        self.otel_endpoint.is_some()
    }

    /// Always false without the otel feature
    #[cfg(not(feature = "otel"))]
    pub fn is_otel_enabled(&self) -> bool {
        if self.otel_endpoint.is_some() {
            tracing::warn!("--otel-endpoint specified but otel feature is not enabled, ignoring");
        }
        false
    }

    /// Get the log level based on CLI arguments
    ///
    /// - `--quiet`: ERROR
    /// - default: INFO
    /// - `-v`: DEBUG
    /// - `-vv` or more: TRACE
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }

    /// Get the log file path for diagnostic mode
    ///
    /// Defaults to `claude-chat-bridge-{timestamp}.log` in the system temp directory.
    pub fn log_path(&self) -> PathBuf {
        let dir = self.log_dir.clone().unwrap_or_else(std::env::temp_dir);

        let filename = self.log_file.clone().unwrap_or_else(|| {
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            format!("claude-chat-bridge-{timestamp}.log")
        });

        dir.join(filename)
    }
}

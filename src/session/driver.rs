//! Session process driver
//!
//! Owns one Claude CLI process across respawns and turns its stdout into
//! per-turn event streams.
//!
//! Every spawn starts a new *generation*. Background tasks capture the
//! generation they were started for and drop their effects once it is no
//! longer current, so a killed process can never feed events to a consumer
//! of its replacement.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::wrapped_child::{ChildPid, WrappedChild};
use crate::types::{BridgeConfig, BridgeError, IPC_PORT_ENV, Result, StreamEvent, user_message_line};

/// Name of the MCP server that hosts the permission prompt tool
pub const PERMISSION_SERVER_NAME: &str = "permsrv";

/// Fully qualified tool name passed to `--permission-prompt-tool`
pub const PERMISSION_PROMPT_TOOL: &str = "mcp__permsrv__permission_prompt";

/// Time between SIGTERM and SIGKILL when retiring a process
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Time the exit watcher waits for the stdout pump to flush after exit
const PUMP_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Driver lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    Dead,
    Idle,
    Processing,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriverState::Dead => "dead",
            DriverState::Idle => "idle",
            DriverState::Processing => "processing",
        };
        f.write_str(s)
    }
}

/// Command the CLI runs as its MCP permission server
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionHelper {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl PermissionHelper {
    /// This binary's `permission-mcp` subcommand
    pub fn current_exe() -> Option<Self> {
        let program = std::env::current_exe().ok()?;
        Some(Self {
            program,
            args: vec!["permission-mcp".to_string()],
        })
    }
}

/// How to launch the CLI
#[derive(Debug, Clone, PartialEq)]
pub struct DriverOptions {
    /// CLI executable (or a launcher such as `npx`)
    pub claude_path: PathBuf,
    /// Arguments placed before the CLI flags, for launchers
    pub launcher_args: Vec<String>,
    pub working_dir: PathBuf,
    pub ipc_port: u16,
    pub skip_permissions: bool,
    pub allowed_tools: Vec<String>,
    pub model: Option<String>,
    pub permission_helper: Option<PermissionHelper>,
}

impl DriverOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            claude_path: config.claude_path.clone(),
            launcher_args: Vec::new(),
            working_dir: config.working_dir.clone(),
            ipc_port: config.ipc_port,
            skip_permissions: config.skip_permissions,
            allowed_tools: config.allowed_tools.clone(),
            model: config.model.clone(),
            permission_helper: PermissionHelper::current_exe(),
        }
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    /// Arguments passed to the CLI after `launcher_args`
    pub fn cli_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        } else {
            if !self.allowed_tools.is_empty() {
                args.push("--allowedTools".to_string());
                args.extend(self.allowed_tools.iter().cloned());
            }
            match &self.permission_helper {
                Some(helper) => {
                    args.push("--mcp-config".to_string());
                    args.push(self.mcp_config(helper).to_string());
                    args.push("--permission-prompt-tool".to_string());
                    args.push(PERMISSION_PROMPT_TOOL.to_string());
                }
                None => tracing::warn!(
                    "No permission helper configured; tools outside --allowedTools will be refused"
                ),
            }
        }

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }

    /// Environment the permission helper is started with
    pub fn helper_env(&self) -> HashMap<String, String> {
        HashMap::from([(IPC_PORT_ENV.to_string(), self.ipc_port.to_string())])
    }

    fn mcp_config(&self, helper: &PermissionHelper) -> serde_json::Value {
        serde_json::json!({
            "mcpServers": {
                PERMISSION_SERVER_NAME: {
                    "command": helper.program,
                    "args": helper.args,
                    "env": self.helper_env(),
                }
            }
        })
    }
}

/// Point-in-time view of a driver
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverInfo {
    pub state: DriverState,
    pub generation: u64,
    /// CLI session id from the last `system/init`
    pub session_id: Option<String>,
    /// Running cost reported by the current process
    pub total_cost_usd: f64,
    pub pid: Option<u32>,
}

/// Handles for the live process of one generation
#[derive(Debug)]
struct LiveProcess {
    pid: Option<ChildPid>,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    events: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamEvent>>>,
    cancel: CancellationToken,
    turns_started: u64,
}

#[derive(Debug)]
struct Inner {
    state: DriverState,
    generation: u64,
    process: Option<LiveProcess>,
    session_id: Option<String>,
    total_cost_usd: f64,
}

#[derive(Debug)]
struct Shared {
    label: String,
    options: DriverOptions,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Apply an event's side effects and queue it for the turn stream
    ///
    /// Returns false if `generation` is stale or nobody can receive. The send
    /// happens under the lock, so a `result` is queued before the state
    /// reads `Idle` and the next `send_message` can discard it.
    fn forward(
        &self,
        generation: u64,
        event: StreamEvent,
        tx: &mpsc::UnboundedSender<StreamEvent>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        if let Some(init) = event.as_system_init() {
            inner.session_id.clone_from(&init.session_id);
        }
        let ends_turn = match event.as_result() {
            Some(result) => {
                inner.total_cost_usd = result.total_cost_usd;
                true
            }
            None => false,
        };
        if tx.send(event).is_err() {
            return false;
        }
        if ends_turn && inner.state == DriverState::Processing {
            inner.state = DriverState::Idle;
        }
        true
    }
}

/// Driver for one Claude CLI process
///
/// Not `Clone`: the owner (normally the session registry) is the only
/// component allowed to spawn or destroy it. Dropping the driver destroys the
/// process.
#[derive(Debug)]
pub struct SessionDriver {
    shared: Arc<Shared>,
}

impl SessionDriver {
    /// Create a driver in the `Dead` state; nothing is spawned yet
    pub fn new(label: impl Into<String>, options: DriverOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                options,
                inner: Mutex::new(Inner {
                    state: DriverState::Dead,
                    generation: 0,
                    process: None,
                    session_id: None,
                    total_cost_usd: 0.0,
                }),
            }),
        }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.shared.options
    }

    pub fn state(&self) -> DriverState {
        self.shared.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    pub fn info(&self) -> DriverInfo {
        let inner = self.shared.lock();
        DriverInfo {
            state: inner.state,
            generation: inner.generation,
            session_id: inner.session_id.clone(),
            total_cost_usd: inner.total_cost_usd,
            pid: inner
                .process
                .as_ref()
                .and_then(|p| p.pid)
                .map(ChildPid::as_u32),
        }
    }

    /// Start a fresh CLI process, retiring any current one
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        spawn_locked(&self.shared, &mut inner)
    }

    /// Send one user message and stream the turn's events
    ///
    /// Respawns the process first if it is dead. The returned stream ends
    /// after the `result` event, when the process dies, or when the driver is
    /// respawned or destroyed underneath it. Only the first case is a
    /// completed turn.
    #[tracing::instrument(
        skip(self, text),
        fields(session = %self.shared.label, generation = tracing::field::Empty)
    )]
    pub async fn send_message(
        &self,
        text: &str,
    ) -> Result<impl Stream<Item = StreamEvent> + Send + 'static> {
        let (generation, stdin, events, cancel, drain) = {
            let mut inner = self.shared.lock();
            match inner.state {
                DriverState::Processing => {
                    return Err(BridgeError::turn_in_progress(&self.shared.label));
                }
                DriverState::Dead => spawn_locked(&self.shared, &mut inner)?,
                DriverState::Idle => {}
            }
            let generation = inner.generation;
            let process = inner
                .process
                .as_mut()
                .ok_or(BridgeError::ProcessNotRunning)?;
            process.turns_started += 1;
            let handles = (
                generation,
                Arc::clone(&process.stdin),
                Arc::clone(&process.events),
                process.cancel.clone(),
                process.turns_started > 1,
            );
            inner.state = DriverState::Processing;
            handles
        };
        tracing::Span::current().record("generation", generation);

        if drain {
            // Leftovers of an abandoned turn, up to and including its queued result.
            let mut events = events.lock().await;
            let mut dropped = 0usize;
            while events.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                tracing::debug!(dropped, "Discarded events left over from the previous turn");
            }
        }

        let line = user_message_line(text);
        let written = async {
            let mut stdin = stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(error = %e, "Failed to write message to CLI stdin");
            self.retire(generation);
            return Err(BridgeError::StdinWrite(e));
        }
        tracing::debug!(bytes = line.len(), "Message written to CLI");

        Ok(turn_stream(
            Arc::downgrade(&self.shared),
            generation,
            events,
            cancel,
        ))
    }

    /// Interrupt the running turn
    ///
    /// Returns whether an interrupt was actually sent. The CLI answers with a
    /// `result` event, which ends the turn's stream as usual.
    pub fn abort_current_turn(&self) -> bool {
        let inner = self.shared.lock();
        if inner.state != DriverState::Processing {
            return false;
        }
        let Some(pid) = inner.process.as_ref().and_then(|p| p.pid) else {
            return false;
        };
        match pid.interrupt() {
            Ok(()) => {
                tracing::info!(session = %self.shared.label, %pid, "Sent SIGINT to abort turn");
                true
            }
            Err(e) => {
                tracing::warn!(session = %self.shared.label, %pid, error = %e, "Failed to interrupt CLI");
                false
            }
        }
    }

    /// Terminate the process and invalidate every in-flight consumer
    ///
    /// Returns whether a live process was terminated.
    pub fn destroy(&self) -> bool {
        let mut inner = self.shared.lock();
        let had_process = terminate_locked(&self.shared.label, &mut inner);
        inner.generation += 1;
        inner.state = DriverState::Dead;
        if had_process {
            tracing::info!(
                session = %self.shared.label,
                generation = inner.generation,
                "Session driver destroyed"
            );
        }
        had_process
    }

    /// Tear down `generation` if it is still current
    fn retire(&self, generation: u64) {
        let mut inner = self.shared.lock();
        if inner.generation == generation {
            terminate_locked(&self.shared.label, &mut inner);
            inner.generation += 1;
            inner.state = DriverState::Dead;
        }
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn spawn_locked(shared: &Arc<Shared>, inner: &mut Inner) -> Result<()> {
    terminate_locked(&shared.label, inner);
    inner.generation += 1;
    inner.state = DriverState::Dead;
    inner.session_id = None;
    inner.total_cost_usd = 0.0;
    let generation = inner.generation;

    let options = &shared.options;
    let (child, pipes) = WrappedChild::spawn(&options.claude_path, |cmd| {
        cmd.args(&options.launcher_args)
            .args(options.cli_args())
            .current_dir(&options.working_dir)
            .env_remove("CLAUDECODE");
    })
    .map_err(|e| BridgeError::spawn_failed(options.claude_path.display().to_string(), e))?;

    let pid = child.pid();
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let weak = Arc::downgrade(shared);

    let pump = tokio::spawn(pump_stdout(
        pipes.stdout,
        tx.clone(),
        cancel.clone(),
        generation,
        weak.clone(),
    ));
    tokio::spawn(log_stderr(
        pipes.stderr,
        cancel.clone(),
        shared.label.clone(),
        generation,
    ));
    tokio::spawn(watch_exit(child, pump, tx, cancel.clone(), generation, weak));

    inner.process = Some(LiveProcess {
        pid,
        stdin: Arc::new(tokio::sync::Mutex::new(pipes.stdin)),
        events: Arc::new(tokio::sync::Mutex::new(rx)),
        cancel,
        turns_started: 0,
    });
    inner.state = DriverState::Idle;

    tracing::info!(
        session = %shared.label,
        generation,
        pid = pid.map(ChildPid::as_u32),
        cwd = %options.working_dir.display(),
        "Claude CLI spawned"
    );
    Ok(())
}

/// Stop the live process, if any; the exit watcher reaps it
fn terminate_locked(label: &str, inner: &mut Inner) -> bool {
    let Some(process) = inner.process.take() else {
        return false;
    };
    process.cancel.cancel();
    if let Some(pid) = process.pid {
        if let Err(e) = pid.terminate_group() {
            tracing::debug!(session = %label, %pid, error = %e, "SIGTERM to CLI process group failed");
        }
    }
    true
}

fn turn_stream(
    shared: Weak<Shared>,
    generation: u64,
    events: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamEvent>>>,
    cancel: CancellationToken,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    async_stream::stream! {
        // Holding the receiver makes this the only consumer of the generation.
        let mut events = events.lock().await;
        loop {
            let next = tokio::select! {
                biased;
                event = events.recv() => event,
                () = cancel.cancelled() => None,
            };
            let Some(event) = next else {
                break;
            };
            let current = shared.upgrade().is_some_and(|s| s.is_current(generation));
            if !current {
                break;
            }
            let done = event.is_result();
            yield event;
            if done {
                break;
            }
        }
    }
}

async fn pump_stdout(
    stdout: ChildStdout,
    tx: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
    generation: u64,
    shared: Weak<Shared>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            () = cancel.cancelled() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(generation, error = %e, "Failed to read CLI stdout");
                break;
            }
        };
        let event = match StreamEvent::parse_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(generation, error = %e, "Skipping malformed CLI output line");
                continue;
            }
        };
        let forwarded = shared
            .upgrade()
            .is_some_and(|s| s.forward(generation, event, &tx));
        if !forwarded {
            break;
        }
    }
    tracing::debug!(generation, "CLI stdout pump finished");
}

async fn log_stderr(stderr: ChildStderr, cancel: CancellationToken, label: String, generation: u64) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            () = cancel.cancelled() => break,
        };
        match line {
            Ok(Some(line)) if !line.trim().is_empty() => {
                tracing::debug!(session = %label, generation, stderr = %line, "CLI stderr");
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
}

/// Reap the process and retire its generation
///
/// Holds a sender so the turn stream only observes channel closure after the
/// driver state already says `Dead`.
async fn watch_exit(
    mut child: WrappedChild,
    pump: JoinHandle<()>,
    tx: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
    generation: u64,
    shared: Weak<Shared>,
) {
    let pid = child.pid().map(ChildPid::as_u32);
    let status = tokio::select! {
        status = child.wait() => status,
        () = cancel.cancelled() => {
            if let Ok(status) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
                status
            } else {
                tracing::warn!(generation, pid, "CLI ignored SIGTERM, killing process group");
                if let Err(e) = child.kill().await {
                    tracing::warn!(generation, pid, error = %e, "Failed to kill CLI process group");
                }
                child.wait().await
            }
        }
    };
    match &status {
        Ok(status) => tracing::info!(generation, pid, code = ?status.code(), "CLI process exited"),
        Err(e) => tracing::warn!(generation, pid, error = %e, "Failed to wait for CLI process"),
    }

    if tokio::time::timeout(PUMP_DRAIN_GRACE, pump).await.is_err() {
        tracing::debug!(generation, "stdout still open after exit, abandoning pump");
    }

    if let Some(shared) = shared.upgrade() {
        let mut inner = shared.lock();
        if inner.generation == generation {
            inner.state = DriverState::Dead;
            inner.process = None;
        }
    }
    drop(tx);
    cancel.cancel();
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::fake_options;
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    async fn collect(stream: impl Stream<Item = StreamEvent>) -> Vec<StreamEvent> {
        timeout(WAIT, stream.collect::<Vec<_>>())
            .await
            .expect("event stream did not terminate")
    }

    #[test]
    fn test_cli_args_with_permission_helper() {
        let options = DriverOptions {
            claude_path: PathBuf::from("claude"),
            launcher_args: Vec::new(),
            working_dir: PathBuf::from("/tmp"),
            ipc_port: 9824,
            skip_permissions: false,
            allowed_tools: vec!["Read".into(), "Grep".into()],
            model: Some("opus".into()),
            permission_helper: Some(PermissionHelper {
                program: PathBuf::from("/usr/bin/bridge"),
                args: vec!["permission-mcp".into()],
            }),
        };
        let args = options.cli_args();
        assert_eq!(&args[..7], &[
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
        ]);
        assert!(!args.contains(&"--dangerously-skip-permissions".to_string()));

        let tools = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert_eq!(&args[tools + 1..tools + 3], &["Read", "Grep"]);

        let mcp = args.iter().position(|a| a == "--mcp-config").unwrap();
        let config: serde_json::Value = serde_json::from_str(&args[mcp + 1]).unwrap();
        assert_eq!(
            config,
            serde_json::json!({
                "mcpServers": {
                    "permsrv": {
                        "command": "/usr/bin/bridge",
                        "args": ["permission-mcp"],
                        "env": {"CLAUDE_BRIDGE_IPC_PORT": "9824"}
                    }
                }
            })
        );

        let tool = args.iter().position(|a| a == "--permission-prompt-tool").unwrap();
        assert_eq!(args[tool + 1], PERMISSION_PROMPT_TOOL);
        assert_eq!(&args[args.len() - 2..], &["--model", "opus"]);
    }

    #[test]
    fn test_cli_args_skip_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let args = fake_options(&dir).cli_args();
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--mcp-config".to_string()));
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[tokio::test]
    async fn test_turn_completes_and_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SessionDriver::new("test", fake_options(&dir));
        assert_eq!(driver.state(), DriverState::Dead);

        let events = collect(driver.send_message("hello").await.unwrap()).await;
        assert!(events.first().unwrap().as_system_init().is_some());
        let result = events.last().unwrap().as_result().expect("turn ends with result");
        assert!(!result.is_error);
        // init, text delta, result; the malformed line is skipped
        assert_eq!(events.len(), 3);

        assert_eq!(driver.state(), DriverState::Idle);
        let info = driver.info();
        assert_eq!(info.session_id.as_deref(), Some("sess-1"));
        assert!((info.total_cost_usd - 0.5).abs() < f64::EPSILON);
        assert_eq!(info.generation, 1);

        // Second turn on the same process
        let events = collect(driver.send_message("again").await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert!(events.last().unwrap().is_result());
        assert_eq!(driver.generation(), 1);
    }

    #[tokio::test]
    async fn test_dropped_turn_leftovers_do_not_reach_next_turn() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SessionDriver::new("leftovers", fake_options(&dir));

        // Abandon the first turn without reading any of its events
        drop(driver.send_message("hello").await.unwrap());
        timeout(WAIT, async {
            while driver.state() != DriverState::Idle {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("first turn never finished");

        let events = collect(driver.send_message("again").await.unwrap()).await;
        assert!(events.iter().all(|e| e.as_system_init().is_none()));
        // Only this turn's text delta and result
        assert_eq!(events.len(), 2);
        assert_eq!(events.iter().filter(|e| e.is_result()).count(), 1);
        assert_eq!(driver.state(), DriverState::Idle);

        // A third turn still lines up with its own output
        let events = collect(driver.send_message("once more").await.unwrap()).await;
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_helper_env_carries_port() {
        let dir = tempfile::tempdir().unwrap();
        let options = DriverOptions {
            ipc_port: 12345,
            ..fake_options(&dir)
        };
        let env = options.helper_env();
        assert_eq!(env.get(IPC_PORT_ENV).map(String::as_str), Some("12345"));
        assert_eq!(env.len(), 1);
    }

    #[tokio::test]
    async fn test_second_message_while_processing_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SessionDriver::new("busy", fake_options(&dir));
        let _stream = driver.send_message("hang").await.unwrap();
        assert_eq!(driver.state(), DriverState::Processing);

        let err = driver.send_message("hello").await.err().unwrap();
        assert!(matches!(err, BridgeError::TurnInProgress(_)));
    }

    #[tokio::test]
    async fn test_process_death_mid_turn_ends_stream_without_result() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SessionDriver::new("dies", fake_options(&dir));

        let events = collect(driver.send_message("die").await.unwrap()).await;
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| !e.is_result()));
        assert_eq!(driver.state(), DriverState::Dead);

        // The next message respawns a fresh generation
        let events = collect(driver.send_message("hello").await.unwrap()).await;
        assert!(events.last().unwrap().is_result());
        assert_eq!(driver.generation(), 2);
    }

    #[tokio::test]
    async fn test_respawn_supersedes_running_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SessionDriver::new("respawn", fake_options(&dir));

        let mut stream = Box::pin(driver.send_message("hang").await.unwrap());
        let first = timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert!(first.as_system_init().is_some());

        driver.spawn().unwrap();
        assert_eq!(driver.generation(), 2);

        // The old consumer never sees the new process's init and terminates.
        let rest = collect(stream).await;
        assert!(rest.iter().all(|e| e.as_system_init().is_none()));
        assert!(rest.iter().all(|e| !e.is_result()));
        assert_eq!(driver.state(), DriverState::Idle);
    }

    #[tokio::test]
    async fn test_destroy_ends_stream_and_marks_dead() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SessionDriver::new("destroy", fake_options(&dir));

        let stream = driver.send_message("hang").await.unwrap();
        assert!(driver.destroy());
        assert_eq!(driver.state(), DriverState::Dead);

        let events = collect(stream).await;
        assert!(events.iter().all(|e| !e.is_result()));
        assert!(!driver.destroy());
        assert!(driver.info().pid.is_none());
    }

    #[tokio::test]
    async fn test_abort_current_turn() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SessionDriver::new("abort", fake_options(&dir));
        assert!(!driver.abort_current_turn());

        let mut stream = Box::pin(driver.send_message("hang").await.unwrap());
        // Wait until the fake CLI reports it is busy
        loop {
            let event = timeout(WAIT, stream.next()).await.unwrap().unwrap();
            if matches!(&event, StreamEvent::System(s) if s.subtype == "status") {
                break;
            }
        }
        assert!(driver.abort_current_turn());

        let rest = collect(stream).await;
        let result = rest.last().and_then(StreamEvent::as_result).expect("aborted turn result");
        assert!(result.is_error);
        assert_eq!(driver.state(), DriverState::Idle);
        assert!(!driver.abort_current_turn());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let options = DriverOptions {
            claude_path: PathBuf::from("/nonexistent/claude-binary"),
            launcher_args: Vec::new(),
            working_dir: std::env::temp_dir(),
            ipc_port: 0,
            skip_permissions: true,
            allowed_tools: Vec::new(),
            model: None,
            permission_helper: None,
        };
        let driver = SessionDriver::new("missing", options);
        let err = driver.send_message("hello").await.err().unwrap();
        assert!(matches!(err, BridgeError::SpawnFailed { .. }));
        assert_eq!(driver.state(), DriverState::Dead);
    }
}

//! Line console front end
//!
//! Stands in for a chat platform: one conversation, driven from stdin, with
//! turn output and permission prompts written to stdout.
//!
//! Commands: `/new [dir]`, `/stop`, `/abort`, `/status`, `/help`, `/quit`.
//! Any other line is sent to the session, starting one if needed. While a
//! permission prompt or a question is open the next line answers it.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::router::{Router, TurnConsumer, TurnEvent, TurnOutcome, describe_tool_use};
use crate::session::SessionOptions;
use crate::tracing::ErrorTraceExt;
use crate::types::{BridgeError, PermissionDecision, PermissionRequest, Result, UserQuestion};

pub const CONSOLE_CONVERSATION: &str = "console";
pub const USER_DENIED_MESSAGE: &str = "User denied this action";

const HELP: &str = "\
Commands:
  /new [dir]  start a new session (optionally in another directory)
  /stop       end the session
  /abort      interrupt the running turn
  /status     show session usage
  /quit       exit
Anything else is sent to Claude.
";

type Output = tokio::sync::Mutex<Pin<Box<dyn AsyncWrite + Send>>>;

/// Writes to the console's output, logging instead of failing
#[derive(Clone)]
struct ConsoleOutput(Arc<Output>);

impl ConsoleOutput {
    fn new(writer: impl AsyncWrite + Send + 'static) -> Self {
        Self(Arc::new(tokio::sync::Mutex::new(Box::pin(writer))))
    }

    async fn write(&self, text: &str) {
        let mut writer = self.0.lock().await;
        let written = async {
            writer.write_all(text.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(error = %e, "Console write failed");
        }
    }

    async fn line(&self, text: &str) {
        self.write(&format!("{text}\n")).await;
    }
}

/// Open permission prompt waiting for the next input line
#[derive(Default)]
struct PromptSlot(Mutex<Option<oneshot::Sender<String>>>);

impl PromptSlot {
    fn open(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        // A previous unanswered prompt is dropped, which denies it.
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn take(&self) -> Option<oneshot::Sender<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Renders turns and asks permission questions on the console
struct ConsoleConsumer {
    output: ConsoleOutput,
    prompt: Arc<PromptSlot>,
}

#[async_trait]
impl TurnConsumer for ConsoleConsumer {
    async fn on_event(&self, event: TurnEvent) {
        match event {
            TurnEvent::SessionReady { model } => {
                let model = model.as_deref().unwrap_or("default model");
                self.output.line(&format!("[session ready: {model}]")).await;
            }
            TurnEvent::TextDelta(text) => self.output.write(&text).await,
            TurnEvent::ToolActivity { summary, .. } => {
                self.output.line(&format!("\n[{summary}...]")).await;
            }
            // Reported by the turn task with the outcome
            TurnEvent::Completed(_) | TurnEvent::Abandoned => {}
        }
    }

    async fn ask_permission(&self, request: &PermissionRequest) -> PermissionDecision {
        let answer = self.prompt.open();
        let what = describe_tool_use(&request.tool_name, Some(&request.tool_input));
        self.output
            .write(&format!("\nAllow {}? {what} [y/N] ", request.tool_name))
            .await;

        match answer.await {
            Ok(line) if matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes") => {
                PermissionDecision::allow_with(request.tool_input.clone())
            }
            Ok(_) => PermissionDecision::deny(USER_DENIED_MESSAGE),
            Err(_) => PermissionDecision::deny("Permission prompt was superseded"),
        }
    }

    async fn answer_question(&self, question: &UserQuestion) -> Option<String> {
        let answer = self.prompt.open();
        let mut text = format!("\n[{}] {}\n", question.header, question.question);
        for (number, option) in question.options.iter().enumerate() {
            if option.description.is_empty() {
                text.push_str(&format!("  {}. {}\n", number + 1, option.label));
            } else {
                text.push_str(&format!("  {}. {} - {}\n", number + 1, option.label, option.description));
            }
        }
        text.push_str(if question.multi_select {
            "Answer (numbers separated by commas, or your own words): "
        } else {
            "Answer (number, or your own words): "
        });
        self.output.write(&text).await;

        answer.await.ok().map(|line| question.answer_from_reply(&line))
    }
}

/// Interactive console over one conversation
pub struct Console {
    router: Arc<Router>,
    conversation_id: String,
    default_dir: PathBuf,
    output: ConsoleOutput,
    prompt: Arc<PromptSlot>,
    turn: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("conversation_id", &self.conversation_id)
            .field("default_dir", &self.default_dir)
            .field("turn_running", &self.turn.as_ref().is_some_and(|t| !t.is_finished()))
            .finish_non_exhaustive()
    }
}

impl Console {
    pub fn new(
        router: Arc<Router>,
        default_dir: PathBuf,
        output: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            router,
            conversation_id: CONSOLE_CONVERSATION.to_string(),
            default_dir,
            output: ConsoleOutput::new(output),
            prompt: Arc::new(PromptSlot::default()),
            turn: None,
        }
    }

    /// Console on the process's stdout
    pub fn stdio(router: Arc<Router>, default_dir: PathBuf) -> Self {
        Self::new(router, default_dir, tokio::io::stdout())
    }

    /// Read commands until `/quit` or end of input
    pub async fn run<R: AsyncBufRead + Unpin>(mut self, input: R) -> Result<()> {
        self.output
            .line("claude-chat-bridge console. Type /help for commands.")
            .await;
        let mut lines = input.lines();

        while let Some(line) = lines.next_line().await? {
            if let Some(answer) = self.prompt.take() {
                drop(answer.send(line));
                continue;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !self.handle_line(line).await {
                break;
            }
        }

        if let Some(turn) = self.turn.take() {
            turn.abort();
        }
        Ok(())
    }

    /// Returns false when the console should exit
    async fn handle_line(&mut self, line: &str) -> bool {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match command {
            "/quit" | "/exit" => return false,
            "/help" => self.output.write(HELP).await,
            "/new" => {
                let dir = (!rest.is_empty()).then(|| PathBuf::from(rest));
                self.start_session(dir).await;
            }
            "/stop" => {
                let message = if self.router.end_session(&self.conversation_id) {
                    "Session ended."
                } else {
                    "No active session to stop."
                };
                self.output.line(message).await;
            }
            "/abort" => {
                let message = if self.router.abort(&self.conversation_id) {
                    "Interrupt sent."
                } else {
                    "Nothing to abort."
                };
                self.output.line(message).await;
            }
            "/status" => self.print_status().await,
            _ => self.send(line.to_string()).await,
        }
        true
    }

    async fn start_session(&self, working_dir: Option<PathBuf>) -> bool {
        let options = SessionOptions {
            working_dir: working_dir.or_else(|| Some(self.default_dir.clone())),
            conversation_url: None,
        };
        match self.router.new_session(&self.conversation_id, options) {
            Ok(session) => {
                self.output
                    .line(&format!("Session started in {}", session.working_dir().display()))
                    .await;
                true
            }
            Err(e) => {
                self.output.line(&format!("Error: {}", e.trace_error())).await;
                false
            }
        }
    }

    async fn print_status(&self) {
        let sessions = self.router.sessions();
        if sessions.is_empty() {
            self.output.line("No active sessions. Use /new to start one.").await;
            return;
        }
        for session in sessions {
            let status = if session.processing { "Processing" } else { "Idle" };
            self.output
                .line(&format!(
                    "{} [{status}] dir={} messages={} tokens={}/{} cost=${:.4} pid={}",
                    session.conversation_id,
                    session.working_dir.display(),
                    session.usage.message_count,
                    session.usage.input_tokens,
                    session.usage.output_tokens,
                    session.usage.total_cost_usd,
                    session
                        .driver
                        .pid
                        .map_or_else(|| "-".to_string(), |pid| pid.to_string()),
                ))
                .await;
        }
    }

    async fn send(&mut self, text: String) {
        if self.router.registry().get(&self.conversation_id).is_none()
            && !self.start_session(None).await
        {
            return;
        }
        if self.turn.as_ref().is_some_and(|t| !t.is_finished()) {
            self.output
                .line("Still working on the previous message. Use /abort to interrupt it.")
                .await;
            return;
        }

        let router = Arc::clone(&self.router);
        let conversation_id = self.conversation_id.clone();
        let output = self.output.clone();
        let consumer = Arc::new(ConsoleConsumer {
            output: self.output.clone(),
            prompt: Arc::clone(&self.prompt),
        });
        self.turn = Some(tokio::spawn(async move {
            let footer = match router.handle_message(&conversation_id, &text, consumer).await {
                Ok(TurnOutcome::Completed(summary)) => summary.describe(),
                Ok(TurnOutcome::Abandoned) => "The session ended before finishing this turn.".to_string(),
                Err(BridgeError::TurnInProgress(_)) => {
                    "Still working on the previous message.".to_string()
                }
                Err(e) => format!("Error: {}", e.trace_error()),
            };
            output.line(&format!("\n[{footer}]")).await;
        }));
    }
}

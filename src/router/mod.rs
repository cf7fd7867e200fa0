//! Orchestration router
//!
//! Drives one event stream per turn, hands the translated events to the
//! conversation's [`TurnConsumer`], and answers permission requests from the
//! bridge by asking the consumer of the turn they most likely belong to.
//!
//! # Permission routing
//!
//! The permission helper is a grandchild process and does not know which
//! conversation it serves. Requests are routed to the most recently active
//! session that has a turn in flight. With one active turn this is exact;
//! with several concurrent turns it is a best guess. Exact correlation would
//! need the conversation id threaded through the helper's environment, which
//! the CLI's MCP invocation does not provide per turn.
//!
//! `AskUserQuestion` calls arrive the same way but are answered question by
//! question through [`TurnConsumer::answer_question`]; the answers travel
//! back to the CLI in the allow decision's `updatedInput`.

mod activity;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;

use crate::bridge::{DecisionMaker, PermissionBridge, PermissionResolver};
use crate::session::{ManagedSession, SessionOptions, SessionRegistry, SessionSummary};
use crate::types::{
    ASK_USER_QUESTION_TOOL, BridgeError, PermissionDecision, PermissionRequest, Result,
    UserQuestion, questions_answered,
};

pub use activity::{TurnEvent, TurnSummary, describe_tool_use};
use activity::TurnTranslator;

pub const NO_ACTIVE_SESSION_MESSAGE: &str = "No active session";
pub const NO_PROMPT_SUPPORT_MESSAGE: &str = "Permission prompts are not supported by this front end";
pub const NO_QUESTIONS_MESSAGE: &str = "No questions provided";
pub const QUESTION_UNANSWERED_MESSAGE: &str = "User did not answer the question";

/// Rendering side of a conversation
#[async_trait]
pub trait TurnConsumer: Send + Sync {
    /// Render one event of the running turn
    async fn on_event(&self, event: TurnEvent);

    /// Ask the user about a tool call; the router bounds how long this may take
    async fn ask_permission(&self, request: &PermissionRequest) -> PermissionDecision {
        tracing::debug!(tool = %request.tool_name, "Consumer cannot prompt, denying");
        PermissionDecision::deny(NO_PROMPT_SUPPORT_MESSAGE)
    }

    /// Ask one `AskUserQuestion` question; `None` leaves it unanswered
    async fn answer_question(&self, question: &UserQuestion) -> Option<String> {
        tracing::debug!(header = %question.header, "Consumer cannot ask questions");
        None
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(TurnSummary),
    /// No `result` arrived; the process died or the session was replaced
    Abandoned,
}

struct ActiveTurn {
    ticket: u64,
    consumer: Arc<dyn TurnConsumer>,
}

/// Clears a turn's bookkeeping however `handle_message` exits
struct TurnGuard<'a> {
    router: &'a Router,
    session: &'a ManagedSession,
    ticket: u64,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.router
            .turns
            .remove_if(self.session.conversation_id(), |_, turn| turn.ticket == self.ticket);
        self.session.end_turn();
    }
}

/// Connects conversations to sessions and the permission bridge
pub struct Router {
    registry: Arc<SessionRegistry>,
    bridge: PermissionBridge,
    /// Consumers of in-flight turns, keyed by conversation id
    turns: DashMap<String, ActiveTurn>,
    next_ticket: AtomicU64,
    decision_timeout: Duration,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("registry", &self.registry)
            .field("bridge", &self.bridge)
            .field("active_turns", &self.turns.len())
            .field("decision_timeout", &self.decision_timeout)
            .finish()
    }
}

/// Registered with the bridge so the bridge does not keep the router alive
struct RouterDecisions(Weak<Router>);

impl DecisionMaker for RouterDecisions {
    fn request_decision(&self, request: PermissionRequest, resolver: PermissionResolver) {
        match self.0.upgrade() {
            Some(router) => router.request_decision(request, resolver),
            None => {
                resolver.resolve(PermissionDecision::deny(NO_ACTIVE_SESSION_MESSAGE));
            }
        }
    }
}

impl Router {
    /// Create a router and register it as the bridge's decision maker
    pub fn new(
        registry: Arc<SessionRegistry>,
        bridge: PermissionBridge,
        decision_timeout: Duration,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            registry,
            bridge,
            turns: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            decision_timeout,
        });
        router
            .bridge
            .set_decision_maker(Arc::new(RouterDecisions(Arc::downgrade(&router))));
        router
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> &PermissionBridge {
        &self.bridge
    }

    /// Start (or restart) the session for a conversation
    pub fn new_session(
        &self,
        conversation_id: &str,
        options: SessionOptions,
    ) -> Result<Arc<ManagedSession>> {
        self.registry.create(conversation_id, options)
    }

    /// End a conversation's session; false if there was none
    pub fn end_session(&self, conversation_id: &str) -> bool {
        self.registry.destroy(conversation_id).is_some()
    }

    /// Interrupt a conversation's running turn
    pub fn abort(&self, conversation_id: &str) -> bool {
        self.registry
            .get(conversation_id)
            .is_some_and(|session| session.abort_turn())
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.registry.list().iter().map(|s| s.summary()).collect()
    }

    /// Run one turn for `conversation_id`, streaming events to `consumer`
    ///
    /// A second message for the same conversation while a turn is running is
    /// rejected with [`BridgeError::TurnInProgress`].
    #[tracing::instrument(skip(self, text, consumer), fields(chars = text.len()))]
    pub async fn handle_message(
        &self,
        conversation_id: &str,
        text: &str,
        consumer: Arc<dyn TurnConsumer>,
    ) -> Result<TurnOutcome> {
        let session = self
            .registry
            .get(conversation_id)
            .ok_or_else(|| BridgeError::session_not_found(conversation_id))?;
        if !session.try_begin_turn() {
            tracing::info!("Rejecting message, a turn is already running");
            return Err(BridgeError::turn_in_progress(conversation_id));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let _guard = TurnGuard {
            router: self,
            session: &session,
            ticket,
        };
        session.touch();
        self.turns.insert(
            conversation_id.to_string(),
            ActiveTurn {
                ticket,
                consumer: Arc::clone(&consumer),
            },
        );

        let mut events = Box::pin(session.send_message(text).await?);
        let mut translator = TurnTranslator::new();
        let mut summary = None;

        while let Some(event) = events.next().await {
            if let Some(result) = event.as_result() {
                self.registry.record_turn_result(conversation_id, result);
            }
            for turn_event in translator.translate(&event) {
                if let TurnEvent::Completed(completed) = &turn_event {
                    summary = Some(completed.clone());
                }
                consumer.on_event(turn_event).await;
            }
        }

        match summary {
            Some(summary) => {
                tracing::info!(
                    is_error = summary.is_error,
                    cost_usd = summary.cost_usd,
                    "Turn completed"
                );
                Ok(TurnOutcome::Completed(summary))
            }
            None => {
                tracing::warn!(state = %session.driver_state(), "Turn ended without a result");
                consumer.on_event(TurnEvent::Abandoned).await;
                Ok(TurnOutcome::Abandoned)
            }
        }
    }

    /// Destroy every session, then stop the permission bridge
    pub async fn shutdown(&self) {
        let destroyed = self.registry.destroy_all();
        self.bridge.stop().await;
        self.bridge.clear_decision_maker();
        tracing::info!(destroyed, "Router shut down");
    }

    fn timeout_span(&self) -> String {
        match self.decision_timeout.as_secs() {
            60 => "1 minute".to_string(),
            s if s >= 60 && s % 60 == 0 => format!("{} minutes", s / 60),
            1 => "1 second".to_string(),
            s if s > 0 => format!("{s} seconds"),
            _ => format!("{} ms", self.decision_timeout.as_millis()),
        }
    }

    fn timeout_message(&self) -> String {
        format!("Permission request timed out ({})", self.timeout_span())
    }

    fn question_timeout_message(&self) -> String {
        format!("Question timed out ({})", self.timeout_span())
    }
}

/// Ask every question of an `AskUserQuestion` call in order
async fn ask_questions(consumer: &dyn TurnConsumer, request: &PermissionRequest) -> PermissionDecision {
    let Some(questions) = UserQuestion::parse_all(&request.tool_input) else {
        tracing::warn!(input = %request.tool_input, "AskUserQuestion without questions");
        return PermissionDecision::deny(NO_QUESTIONS_MESSAGE);
    };

    let mut answers = serde_json::Map::new();
    for question in &questions {
        let Some(answer) = consumer.answer_question(question).await else {
            return PermissionDecision::deny(QUESTION_UNANSWERED_MESSAGE);
        };
        answers.insert(question.question.clone(), serde_json::Value::String(answer));
    }
    questions_answered(&request.tool_input, answers)
}

impl DecisionMaker for Router {
    fn request_decision(&self, request: PermissionRequest, resolver: PermissionResolver) {
        let target = self.registry.most_recently_active_processing().and_then(|session| {
            self.turns
                .get(session.conversation_id())
                .map(|turn| (session.conversation_id().to_string(), Arc::clone(&turn.consumer)))
        });
        let Some((conversation_id, consumer)) = target else {
            tracing::info!(tool = %request.tool_name, "Permission request with no active turn, denying");
            resolver.resolve(PermissionDecision::deny(NO_ACTIVE_SESSION_MESSAGE));
            return;
        };

        tracing::debug!(%conversation_id, tool = %request.tool_name, "Routing permission request");
        // One bound for the whole exchange, however many questions it has
        let timeout = self.decision_timeout;
        let is_question = request.tool_name == ASK_USER_QUESTION_TOOL;
        let timeout_message = if is_question {
            self.question_timeout_message()
        } else {
            self.timeout_message()
        };
        tokio::spawn(async move {
            let asked = async {
                if is_question {
                    ask_questions(consumer.as_ref(), &request).await
                } else {
                    consumer.ask_permission(&request).await
                }
            };
            let decision = match tokio::time::timeout(timeout, asked).await {
                Ok(decision) => decision,
                Err(_) => {
                    tracing::warn!(%conversation_id, tool = %request.tool_name, "Permission prompt timed out");
                    PermissionDecision::deny(timeout_message)
                }
            };
            resolver.resolve(decision);
        });
    }
}

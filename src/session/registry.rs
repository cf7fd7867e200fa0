//! Session registry
//!
//! Maps external conversation ids to managed sessions. Uses DashMap with the
//! entry API so that create/destroy for one conversation are atomic with
//! respect to the map.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;
use uuid::Uuid;

use super::driver::{DriverInfo, DriverOptions, DriverState, SessionDriver};
use super::usage::{SessionUsage, UsageSnapshot};
use crate::types::{Result, StreamEvent, TurnResult};

/// Orders activity across sessions; timestamps alone can tie
static ACTIVITY_CLOCK: AtomicU64 = AtomicU64::new(0);

/// Per-session overrides for [`SessionRegistry::create`]
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Working directory instead of the registry default
    pub working_dir: Option<PathBuf>,
    /// Link to the conversation in the front end
    pub conversation_url: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    at: DateTime<Utc>,
    seq: u64,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Utc::now(),
            seq: ACTIVITY_CLOCK.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}

/// One conversation bound to its own CLI driver
#[derive(Debug)]
pub struct ManagedSession {
    id: Uuid,
    conversation_id: String,
    conversation_url: Option<String>,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    activity: Mutex<Activity>,
    usage: SessionUsage,
    processing: AtomicBool,
    driver: SessionDriver,
}

/// Serializable status of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub conversation_id: String,
    pub conversation_url: Option<String>,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub processing: bool,
    pub usage: UsageSnapshot,
    pub driver: DriverInfo,
}

impl ManagedSession {
    fn new(conversation_id: &str, options: &SessionOptions, driver: SessionDriver) -> Self {
        let activity = Activity::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            conversation_url: options.conversation_url.clone(),
            working_dir: driver.options().working_dir.clone(),
            created_at: activity.at,
            activity: Mutex::new(activity),
            usage: SessionUsage::new(),
            processing: AtomicBool::new(false),
            driver,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn conversation_url(&self) -> Option<&str> {
        self.conversation_url.as_deref()
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.activity().at
    }

    pub fn usage(&self) -> &SessionUsage {
        &self.usage
    }

    /// Record user activity: bumps recency and the message count
    pub fn touch(&self) {
        *self.activity.lock().unwrap_or_else(PoisonError::into_inner) = Activity::now();
        self.usage.record_message();
    }

    fn activity(&self) -> Activity {
        *self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a turn is in flight
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Claim the in-flight flag; false if a turn is already running
    pub fn try_begin_turn(&self) -> bool {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_turn(&self) {
        self.processing.store(false, Ordering::Release);
    }

    pub fn driver_state(&self) -> DriverState {
        self.driver.state()
    }

    pub fn driver_info(&self) -> DriverInfo {
        self.driver.info()
    }

    /// Send a message through the owned driver
    pub async fn send_message(
        &self,
        text: &str,
    ) -> Result<impl Stream<Item = StreamEvent> + Send + 'static> {
        self.driver.send_message(text).await
    }

    /// Interrupt the current turn; see [`SessionDriver::abort_current_turn`]
    pub fn abort_turn(&self) -> bool {
        self.driver.abort_current_turn()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            conversation_id: self.conversation_id.clone(),
            conversation_url: self.conversation_url.clone(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            processing: self.is_processing(),
            usage: self.usage.snapshot(),
            driver: self.driver.info(),
        }
    }
}

/// Owner of every session driver
#[derive(Debug)]
pub struct SessionRegistry {
    /// Sessions keyed by conversation id
    sessions: DashMap<String, Arc<ManagedSession>>,
    defaults: DriverOptions,
}

impl SessionRegistry {
    /// Create a registry spawning drivers with `defaults`
    pub fn new(defaults: DriverOptions) -> Self {
        Self {
            sessions: DashMap::new(),
            defaults,
        }
    }

    /// Start a session for `conversation_id`
    ///
    /// An existing session for the same id is destroyed first. If the new
    /// process cannot be spawned nothing is registered.
    #[tracing::instrument(skip(self, options))]
    pub fn create(
        &self,
        conversation_id: &str,
        options: SessionOptions,
    ) -> Result<Arc<ManagedSession>> {
        let mut driver_options = self.defaults.clone();
        if let Some(dir) = &options.working_dir {
            driver_options = driver_options.with_working_dir(dir);
        }
        let driver = SessionDriver::new(conversation_id, driver_options);

        match self.sessions.entry(conversation_id.to_string()) {
            dashmap::Entry::Occupied(mut occupied) => {
                tracing::warn!(
                    old_session = %occupied.get().id,
                    "Session already exists for conversation, replacing it"
                );
                occupied.get().driver.destroy();
                if let Err(e) = driver.spawn() {
                    occupied.remove();
                    return Err(e);
                }
                let session = Arc::new(ManagedSession::new(conversation_id, &options, driver));
                occupied.insert(Arc::clone(&session));
                Ok(session)
            }
            dashmap::Entry::Vacant(vacant) => {
                driver.spawn()?;
                let session = Arc::new(ManagedSession::new(conversation_id, &options, driver));
                vacant.insert(Arc::clone(&session));
                tracing::info!(session = %session.id, "Session created");
                Ok(session)
            }
        }
    }

    /// Get an existing session
    pub fn get(&self, conversation_id: &str) -> Option<Arc<ManagedSession>> {
        self.sessions.get(conversation_id).map(|r| Arc::clone(&r))
    }

    /// Destroy one session; `None` if there was none
    pub fn destroy(&self, conversation_id: &str) -> Option<Arc<ManagedSession>> {
        let (_, session) = self.sessions.remove(conversation_id)?;
        session.driver.destroy();
        tracing::info!(conversation_id, session = %session.id, "Session destroyed");
        Some(session)
    }

    /// Destroy every session and return how many there were
    pub fn destroy_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        let mut destroyed = 0;
        for id in ids {
            if self.destroy(&id).is_some() {
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            tracing::info!(destroyed, "All sessions destroyed");
        }
        destroyed
    }

    /// Apply a turn's cost and token usage; false if the session is gone
    pub fn record_turn_result(&self, conversation_id: &str, result: &TurnResult) -> bool {
        match self.sessions.get(conversation_id) {
            Some(session) => {
                session
                    .usage
                    .record_turn(result.total_cost_usd, &result.usage);
                true
            }
            None => {
                tracing::debug!(conversation_id, "Turn finished after its session was destroyed");
                false
            }
        }
    }

    /// Session with the most recent activity
    pub fn most_recently_active(&self) -> Option<Arc<ManagedSession>> {
        self.latest_where(|_| true)
    }

    /// Most recently active session with a turn in flight
    pub fn most_recently_active_processing(&self) -> Option<Arc<ManagedSession>> {
        self.latest_where(ManagedSession::is_processing)
    }

    fn latest_where(&self, predicate: impl Fn(&ManagedSession) -> bool) -> Option<Arc<ManagedSession>> {
        self.sessions
            .iter()
            .filter(|r| predicate(r.value()))
            .max_by_key(|r| r.value().activity().seq)
            .map(|r| Arc::clone(r.value()))
    }

    /// All sessions, oldest first
    pub fn list(&self) -> Vec<Arc<ManagedSession>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(r.value())).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Sessions with a turn in flight
    pub fn processing_sessions(&self) -> Vec<Arc<ManagedSession>> {
        self.list().into_iter().filter(|s| s.is_processing()).collect()
    }

    /// Get the number of active sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_any(&self) -> bool {
        !self.sessions.is_empty()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

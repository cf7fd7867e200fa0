//! Host side of the permission bridge
//!
//! A loopback HTTP listener that receives permission requests from the MCP
//! permission helper and parks each one until a [`DecisionMaker`] resolves
//! it. Every path that cannot produce an explicit decision denies.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::{BridgeError, PermissionDecision, PermissionRequest, Result};

/// Route the permission helper posts to
pub const PERMISSION_PATH: &str = "/permission";

pub const NO_HANDLER_MESSAGE: &str = "No permission handler registered";
pub const SHUTDOWN_MESSAGE: &str = "IPC server shutting down";
pub const ABANDONED_MESSAGE: &str = "Permission request abandoned";

/// How long `stop` waits for in-flight responses to drain
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Something that turns permission requests into decisions
///
/// `request_decision` is called on the listener's task and must not block;
/// the decision is delivered later through the resolver. Dropping the
/// resolver without resolving it denies the request.
pub trait DecisionMaker: Send + Sync {
    fn request_decision(&self, request: PermissionRequest, resolver: PermissionResolver);
}

#[derive(Debug)]
struct PendingEntry {
    ticket: u64,
    sink: oneshot::Sender<PermissionDecision>,
}

type PendingMap = DashMap<String, PendingEntry>;

/// One-shot completion handle for a pending request
///
/// Resolving is idempotent: only the first call delivers, later calls and
/// calls after the request was answered elsewhere (shutdown, disconnect) are
/// silently absorbed.
#[derive(Debug)]
pub struct PermissionResolver {
    request_id: String,
    ticket: u64,
    pending: Arc<PendingMap>,
}

impl PermissionResolver {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Deliver `decision`; returns whether it reached the waiting request
    pub fn resolve(&self, decision: PermissionDecision) -> bool {
        let Some((_, entry)) = self
            .pending
            .remove_if(&self.request_id, |_, entry| entry.ticket == self.ticket)
        else {
            tracing::debug!(request_id = %self.request_id, "Ignoring late permission decision");
            return false;
        };
        entry.sink.send(decision).is_ok()
    }

    /// Whether the request is still waiting for a decision
    pub fn is_pending(&self) -> bool {
        self.pending
            .get(&self.request_id)
            .is_some_and(|entry| entry.ticket == self.ticket)
    }
}

impl Drop for PermissionResolver {
    fn drop(&mut self) {
        if self.is_pending() {
            tracing::warn!(request_id = %self.request_id, "Permission resolver dropped unresolved, denying");
            self.resolve(PermissionDecision::deny(ABANDONED_MESSAGE));
        }
    }
}

/// Removes a request's pending entry if its HTTP caller goes away
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    request_id: &'a str,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .remove_if(self.request_id, |_, entry| entry.ticket == self.ticket);
    }
}

#[derive(Debug)]
struct RunningServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

struct BridgeInner {
    pending: Arc<PendingMap>,
    decision_maker: RwLock<Option<Arc<dyn DecisionMaker>>>,
    next_ticket: AtomicU64,
    shutting_down: AtomicBool,
    server: tokio::sync::Mutex<Option<RunningServer>>,
}

impl std::fmt::Debug for BridgeInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeInner")
            .field("pending", &self.pending.len())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Loopback permission server
///
/// Cheap to clone; clones share the pending map and listener.
#[derive(Debug, Clone)]
pub struct PermissionBridge {
    inner: Arc<BridgeInner>,
}

impl Default for PermissionBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionBridge {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                pending: Arc::new(DashMap::new()),
                decision_maker: RwLock::new(None),
                next_ticket: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                server: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Register the component that answers permission requests
    pub fn set_decision_maker(&self, maker: Arc<dyn DecisionMaker>) {
        *self
            .inner
            .decision_maker
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(maker);
    }

    pub fn clear_decision_maker(&self) {
        *self
            .inner
            .decision_maker
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn decision_maker(&self) -> Option<Arc<dyn DecisionMaker>> {
        self.inner
            .decision_maker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Requests currently waiting for a decision
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Bound address, if listening
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.lock().await.as_ref().map(|s| s.addr)
    }

    /// Resolve one request, independent of the HTTP transport
    #[tracing::instrument(skip(self, request), fields(request_id = %request.request_id, tool = %request.tool_name))]
    pub async fn handle_request(&self, request: PermissionRequest) -> PermissionDecision {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return PermissionDecision::deny(SHUTDOWN_MESSAGE);
        }
        let Some(maker) = self.decision_maker() else {
            tracing::info!("No decision maker registered, denying");
            return PermissionDecision::deny(NO_HANDLER_MESSAGE);
        };

        let (tx, rx) = oneshot::channel();
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let request_id = request.request_id.clone();
        let previous = self
            .inner
            .pending
            .insert(request_id.clone(), PendingEntry { ticket, sink: tx });
        if let Some(previous) = previous {
            tracing::warn!("Duplicate request id, superseding the earlier request");
            drop(previous.sink.send(PermissionDecision::deny(ABANDONED_MESSAGE)));
        }
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            request_id: &request_id,
            ticket,
        };

        // `stop` sets the flag before draining; re-check so an entry inserted
        // during the drain is not left behind.
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return PermissionDecision::deny(SHUTDOWN_MESSAGE);
        }

        tracing::debug!("Permission request pending");
        maker.request_decision(
            request,
            PermissionResolver {
                request_id: request_id.clone(),
                ticket,
                pending: Arc::clone(&self.inner.pending),
            },
        );

        let decision = rx
            .await
            .unwrap_or_else(|_| PermissionDecision::deny(ABANDONED_MESSAGE));
        tracing::info!(allowed = decision.is_allow(), "Permission decision delivered");
        decision
    }

    /// Deny every pending request; returns how many were pending
    pub fn deny_all_pending(&self, message: &str) -> usize {
        let ids: Vec<String> = self.inner.pending.iter().map(|r| r.key().clone()).collect();
        let mut denied = 0;
        for id in ids {
            if let Some((_, entry)) = self.inner.pending.remove(&id) {
                drop(entry.sink.send(PermissionDecision::deny(message)));
                denied += 1;
            }
        }
        denied
    }

    /// HTTP routes for the bridge
    pub fn router(&self) -> Router {
        Router::new()
            .route(PERMISSION_PATH, post(permission_handler).fallback(not_found))
            .fallback(not_found)
            .with_state(self.clone())
    }

    /// Start listening on `addr` and return the bound address
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut server = self.inner.server.lock().await;
        if server.is_some() {
            return Err(BridgeError::BridgeAlreadyRunning);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::BridgeBind { addr, source })?;
        let bound = listener.local_addr()?;
        self.inner.shutting_down.store(false, Ordering::SeqCst);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let app = self.router();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        *server = Some(RunningServer {
            addr: bound,
            shutdown,
            task,
        });
        tracing::info!(addr = %bound, "Permission bridge listening");
        Ok(bound)
    }

    /// Deny everything pending, then stop the listener
    pub async fn stop(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let denied = self.deny_all_pending(SHUTDOWN_MESSAGE);

        let server = self.inner.server.lock().await.take();
        if let Some(server) = server {
            server.shutdown.cancel();
            match tokio::time::timeout(STOP_GRACE, server.task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Permission bridge server error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Permission bridge task failed"),
                Err(_) => tracing::warn!("Permission bridge did not stop in time"),
            }
        }
        tracing::info!(denied, "Permission bridge stopped");
    }
}

async fn permission_handler(State(bridge): State<PermissionBridge>, body: Bytes) -> Response {
    let request: PermissionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting malformed permission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "Invalid request body" })),
            )
                .into_response();
        }
    };
    Json(bridge.handle_request(request).await).into_response()
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
        .into_response()
}

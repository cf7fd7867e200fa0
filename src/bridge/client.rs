//! Helper side of the permission bridge
//!
//! Posts a [`PermissionRequest`] to the host's loopback listener and returns
//! its decision. Transport failures never surface as errors: the caller is
//! the CLI, which must always receive a decision, so every failure denies.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::types::{
    BridgeError, CLIENT_TIMEOUT, DEFAULT_IPC_PORT, IPC_PORT_ENV, PermissionDecision,
    PermissionRequest, Result,
};

use super::server::PERMISSION_PATH;

pub const IPC_FAILURE_MESSAGE: &str = "IPC communication failed";

/// HTTP client for the loopback permission listener
#[derive(Debug, Clone)]
pub struct PermissionClient {
    http: reqwest::Client,
    url: String,
}

impl PermissionClient {
    /// Client for the listener on `127.0.0.1:port`
    pub fn new(port: u16) -> Result<Self> {
        Self::with_timeout(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), CLIENT_TIMEOUT)
    }

    pub fn with_timeout(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| BridgeError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: format!("http://{addr}{PERMISSION_PATH}"),
        })
    }

    /// Client for the port named by `CLAUDE_BRIDGE_IPC_PORT`
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var(IPC_PORT_ENV) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|e| BridgeError::config(format!("{IPC_PORT_ENV}={raw}: {e}")))?,
            Err(_) => DEFAULT_IPC_PORT,
        };
        Self::new(port)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Ask the host for a decision; denies on any transport failure
    #[tracing::instrument(skip(self, request), fields(request_id = %request.request_id, tool = %request.tool_name))]
    pub async fn request(&self, request: &PermissionRequest) -> PermissionDecision {
        match self.try_request(request).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, url = %self.url, "Permission request failed, denying");
                PermissionDecision::deny(IPC_FAILURE_MESSAGE)
            }
        }
    }

    async fn try_request(&self, request: &PermissionRequest) -> reqwest::Result<PermissionDecision> {
        self.http
            .post(&self.url)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{DecisionMaker, PermissionBridge, PermissionResolver};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    struct DenyAll;

    impl DecisionMaker for DenyAll {
        fn request_decision(&self, _request: PermissionRequest, resolver: PermissionResolver) {
            resolver.resolve(PermissionDecision::deny("not today"));
        }
    }

    fn request() -> PermissionRequest {
        PermissionRequest::new("toolu_1", "Write", json!({"file_path": "/tmp/x"}))
    }

    #[tokio::test]
    async fn test_decision_from_live_bridge() {
        let bridge = PermissionBridge::new();
        bridge.set_decision_maker(Arc::new(DenyAll));
        let addr = bridge.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let client = PermissionClient::with_timeout(addr, Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.request(&request()).await,
            PermissionDecision::deny("not today")
        );
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_connection_refused_denies() {
        // Bind then drop to get a port nobody is listening on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = PermissionClient::with_timeout(addr, Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.request(&request()).await.deny_message(),
            Some(IPC_FAILURE_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_timeout_denies() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = PermissionClient::with_timeout(addr, Duration::from_millis(200)).unwrap();
        assert_eq!(
            client.request(&request()).await.deny_message(),
            Some(IPC_FAILURE_MESSAGE)
        );
        silent.abort();
    }

    #[tokio::test]
    async fn test_url() {
        let client = PermissionClient::new(9824).unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:9824/permission");
    }
}

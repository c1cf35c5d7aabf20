//! Per-connection handler: owns the pod in connection mode and coordinates
//! handshake, disconnect and shutdown across the connection's channels.

use crate::channel::ChannelHandler;
use crate::client::{ClusterClient, ClusterPod};
use crate::config::Config;
use crate::error::SessionError;
use async_trait::async_trait;
use portcullis_sshserver::{
    AuthResponse, ChannelId, HandlerError, NetworkConnectionHandler, SessionChannelHandler,
    SshConnectionHandler,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Label carrying the connection identifier on every created pod.
const LABEL_CONNECTION_ID: &str = "containerssh_connection_id";
/// Label carrying the authenticated username on every created pod.
const LABEL_USERNAME: &str = "containerssh_username";
/// Annotation carrying the client IP on every created pod. IPv6 colons are
/// replaced with dashes to stay label-safe.
const ANNOTATION_IP: &str = "containerssh_ip";

/// Handler for one SSH network connection.
///
/// Cheap to clone; clones share the connection state. The single connection
/// mutex serializes handshake-time pod creation, per-channel run setup,
/// signal/window/exit delivery, disconnect and close.
#[derive(Clone)]
pub struct ConnectionHandler {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    client_addr: SocketAddr,
    connection_id: String,
    config: Arc<Config>,
    cli: Arc<dyn ClusterClient>,
    state: Mutex<ConnectionState>,
    done: watch::Sender<bool>,
}

pub(crate) struct ConnectionState {
    /// The pod owned by this connection; only set in connection mode.
    pub(crate) pod: Option<Arc<dyn ClusterPod>>,
    pub(crate) labels: BTreeMap<String, String>,
    pub(crate) annotations: BTreeMap<String, String>,
    pub(crate) disconnected: bool,
}

impl ConnectionHandler {
    pub(crate) fn with_client(
        client_addr: SocketAddr,
        connection_id: String,
        config: Arc<Config>,
        cli: Arc<dyn ClusterClient>,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                client_addr,
                connection_id,
                config,
                cli,
                state: Mutex::new(ConnectionState {
                    pod: None,
                    labels: BTreeMap::new(),
                    annotations: BTreeMap::new(),
                    disconnected: false,
                }),
                done,
            }),
        }
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub(crate) fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.inner.cli
    }

    pub(crate) fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    /// The connection mutex. Channel handlers acquire this before their own
    /// state lock.
    pub(crate) fn state(&self) -> &Mutex<ConnectionState> {
        &self.inner.state
    }
}

#[async_trait]
impl NetworkConnectionHandler for ConnectionHandler {
    async fn on_auth_password(&self, _username: &str, _password: &[u8]) -> AuthResponse {
        // Authentication is an upstream concern.
        AuthResponse::Unavailable
    }

    async fn on_auth_pubkey(&self, _username: &str, _public_key: &str) -> AuthResponse {
        AuthResponse::Unavailable
    }

    async fn on_handshake_success(
        &self,
        username: &str,
    ) -> Result<Arc<dyn SshConnectionHandler>, HandlerError> {
        let mut state = self.inner.state.lock().await;
        if state.pod.is_some() {
            return Err(SessionError::HandshakeAlreadyComplete.into());
        }

        state.labels = BTreeMap::from([
            (
                LABEL_CONNECTION_ID.to_string(),
                self.inner.connection_id.clone(),
            ),
            (LABEL_USERNAME.to_string(), username.to_string()),
        ]);
        state.annotations = BTreeMap::from([(
            ANNOTATION_IP.to_string(),
            self.inner.client_addr.ip().to_string().replace(':', "-"),
        )]);

        if self.inner.config.pod.mode.is_connection() {
            let deadline = Instant::now() + self.inner.config.timeouts.pod_start();
            let pod = self
                .inner
                .cli
                .create_pod(
                    &state.labels,
                    &state.annotations,
                    &BTreeMap::new(),
                    None,
                    None,
                    deadline,
                )
                .await
                .map_err(SessionError::StartFailed)?;
            state.pod = Some(pod);
        }

        debug!(
            connection = %self.inner.connection_id,
            username,
            "handshake complete"
        );
        Ok(Arc::new(SshConnection {
            connection: self.clone(),
            username: username.to_string(),
            env: BTreeMap::new(),
        }))
    }

    async fn on_disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        if state.disconnected {
            // Repeated disconnects are expected from the shutdown path.
            return;
        }
        state.disconnected = true;
        if let Some(pod) = state.pod.take() {
            // Best effort: the SSH disconnect must not be held up by the
            // cluster.
            let deadline = Instant::now() + self.inner.config.timeouts.pod_stop();
            if let Err(e) = pod.remove(deadline).await {
                warn!(
                    code = e.code(),
                    connection = %self.inner.connection_id,
                    error = %e,
                    "failed to remove pod at disconnect"
                );
            }
        }
        drop(state);
        let _ = self.inner.done.send(true);
    }

    async fn on_shutdown(&self, shutdown: CancellationToken) {
        let mut done = self.inner.done.subscribe();
        let wait_done = async {
            let _ = done.wait_for(|finished| *finished).await;
        };
        tokio::select! {
            _ = wait_done => {}
            _ = shutdown.cancelled() => self.on_disconnect().await,
        }
    }
}

/// Handler for the established SSH connection; hands out channel handlers.
pub struct SshConnection {
    connection: ConnectionHandler,
    username: String,
    /// Connection-level environment, copied into every channel so
    /// per-channel mutations do not leak across channels.
    env: BTreeMap<String, String>,
}

#[async_trait]
impl SshConnectionHandler for SshConnection {
    async fn on_session_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn SessionChannelHandler>, HandlerError> {
        debug!(
            connection = %self.connection.connection_id(),
            username = %self.username,
            channel = channel_id,
            "session channel opened"
        );
        Ok(Arc::new(ChannelHandler::new(
            channel_id,
            self.connection.clone(),
            self.env.clone(),
        )))
    }
}

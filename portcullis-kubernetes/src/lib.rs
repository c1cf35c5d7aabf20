//! Kubernetes backend for the Portcullis SSH server.
//!
//! Every accepted SSH connection is delivered into a dynamically created pod:
//! the backend creates the pod, wires the client's standard streams to a
//! container's console, translates channel requests (pty, environment, exec,
//! shell, subsystem, window, signal) to the Kubernetes attach/exec streaming
//! protocol, and guarantees pod cleanup on disconnect or shutdown.
//!
//! Two execution modes are supported. In *connection* mode one pod serves the
//! whole SSH connection and every session runs through the exec facility
//! while the console container runs a configured idle command. In *session*
//! mode each session channel gets its own pod whose main process is the
//! requested program.
//!
//! A cooperating in-container guest agent, when present, reports the spawned
//! PID before any program output and forwards signals by PID; without it,
//! signal delivery is unavailable.
//!
//! The backend does not authenticate users: password and public-key attempts
//! report [`AuthResponse::Unavailable`](portcullis_sshserver::AuthResponse)
//! and authentication stays an upstream concern.

mod channel;
mod client;
pub mod codes;
mod config;
mod connection;
mod error;
mod exec;
mod metrics;
mod pod;
#[cfg(test)]
mod test_support;

pub use channel::ChannelHandler;
pub use client::{ClusterClient, ClusterExecution, ClusterPod, KubeClusterClient};
pub use config::{Config, ConnectionConfig, ExecutionMode, PodConfig, TimeoutConfig};
pub use connection::{ConnectionHandler, SshConnection};
pub use error::{
    BackendError, ClientError, ClientResult, ConfigError, SessionError, SessionResult, SignalError,
};
pub use metrics::{BackendMetrics, MetricsSnapshot};

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, warn};

/// Build the handler for one accepted network connection.
///
/// Validates the configuration eagerly and constructs the cluster client up
/// front, so configuration problems surface before the handshake instead of
/// at first use. The metrics counters are shared with the caller and
/// incremented around every cluster call.
pub async fn new(
    client_addr: SocketAddr,
    connection_id: String,
    config: Config,
    metrics: Arc<BackendMetrics>,
) -> Result<ConnectionHandler, BackendError> {
    if let Err(e) = config.validate() {
        error!(code = e.code(), error = %e, "invalid backend configuration");
        return Err(e.into());
    }

    if config.pod.disable_agent {
        warn!(
            code = codes::GUEST_AGENT_DISABLED,
            "running without the guest agent; signal delivery and PID-aware execution will not work"
        );
    }
    if config.connection.insecure {
        warn!(
            code = codes::KUBERUN_INSECURE,
            "server certificate validation is disabled; this is dangerous and retained only for legacy configurations"
        );
    }

    let config = Arc::new(config);
    let cli = KubeClusterClient::connect(Arc::clone(&config), metrics)
        .await
        .map_err(|e| {
            error!(code = codes::CONFIG_ERROR, error = %e, "failed to construct the cluster client");
            e
        })?;

    Ok(ConnectionHandler::with_client(
        client_addr,
        connection_id,
        config,
        Arc::new(cli),
    ))
}

//! Backend handler traits and the types they exchange.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Identifier of a channel within one SSH connection, assigned by the server.
pub type ChannelId = u64;

/// Exit status of a program run on behalf of a session channel.
pub type ExitStatus = u32;

/// One-shot sink for reporting a program's exit status upstream.
///
/// The server keeps the receiving half; a backend must deliver at most one
/// status per executed program.
pub type ExitSender = oneshot::Sender<ExitStatus>;

/// Error type crossing the server/backend boundary.
///
/// The server only needs `Display` for client-facing messages and logging;
/// backends keep their own typed errors and box them here.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResponse {
    /// The credentials were accepted.
    Success,
    /// The credentials were rejected.
    Failure,
    /// This backend cannot decide; the server should consult another
    /// authenticator.
    Unavailable,
}

/// Byte streams of one session channel.
///
/// `stdin` carries data from the SSH client, `stdout` and `stderr` carry data
/// back to it. When a pty is allocated the server multiplexes everything over
/// `stdout` and `stderr` stays silent.
pub struct SessionStreams {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Handler for one accepted network connection, before and after the SSH
/// handshake.
#[async_trait]
pub trait NetworkConnectionHandler: Send + Sync {
    /// Password authentication attempt.
    async fn on_auth_password(&self, username: &str, password: &[u8]) -> AuthResponse;

    /// Public-key authentication attempt. The key is passed in OpenSSH
    /// authorized-keys format.
    async fn on_auth_pubkey(&self, username: &str, public_key: &str) -> AuthResponse;

    /// The SSH handshake completed for `username`. Returns the handler that
    /// will receive channel events for this connection.
    async fn on_handshake_success(
        &self,
        username: &str,
    ) -> Result<std::sync::Arc<dyn SshConnectionHandler>, HandlerError>;

    /// The network connection went away. Called exactly once by the server,
    /// but implementations must tolerate repeated invocation.
    async fn on_disconnect(&self);

    /// The server is shutting down. Implementations should wait for their
    /// work to finish or for `shutdown` to be cancelled, whichever happens
    /// first, and clean up on cancellation.
    async fn on_shutdown(&self, shutdown: CancellationToken);
}

/// Handler for one established SSH connection.
#[async_trait]
pub trait SshConnectionHandler: Send + Sync {
    /// A new session channel was opened.
    async fn on_session_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<std::sync::Arc<dyn SessionChannelHandler>, HandlerError>;
}

/// Handler for one session channel.
///
/// The server guarantees per-channel request ordering as sent by the client;
/// it does not serialize across channels of the same connection.
#[async_trait]
pub trait SessionChannelHandler: Send + Sync {
    /// `env` request: record an environment variable for the program.
    async fn on_env(&self, name: &str, value: &str) -> Result<(), HandlerError>;

    /// `pty-req` request: record terminal type and geometry.
    async fn on_pty(
        &self,
        term: &str,
        columns: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
        modes: &[u8],
    ) -> Result<(), HandlerError>;

    /// `exec` request: run `program` with the channel's streams.
    async fn on_exec(
        &self,
        program: &str,
        streams: SessionStreams,
        exit: ExitSender,
    ) -> Result<(), HandlerError>;

    /// `shell` request.
    async fn on_shell(&self, streams: SessionStreams, exit: ExitSender)
        -> Result<(), HandlerError>;

    /// `subsystem` request (e.g. `sftp`).
    async fn on_subsystem(
        &self,
        name: &str,
        streams: SessionStreams,
        exit: ExitSender,
    ) -> Result<(), HandlerError>;

    /// `signal` request: deliver `signal` (without `SIG` prefix) to the
    /// running program.
    async fn on_signal(&self, signal: &str) -> Result<(), HandlerError>;

    /// `window-change` request.
    async fn on_window(&self, columns: u32, rows: u32) -> Result<(), HandlerError>;

    /// The channel was closed by the client.
    async fn on_close(&self);

    /// The server is shutting down; `shutdown` is cancelled when the grace
    /// period ends.
    async fn on_shutdown(&self, shutdown: CancellationToken);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_response_variants() {
        assert_ne!(AuthResponse::Success, AuthResponse::Failure);
        assert_ne!(AuthResponse::Failure, AuthResponse::Unavailable);
        let copied = AuthResponse::Unavailable;
        assert_eq!(copied, AuthResponse::Unavailable);
    }

    #[test]
    fn test_auth_response_debug() {
        assert_eq!(format!("{:?}", AuthResponse::Success), "Success");
    }

    #[tokio::test]
    async fn test_exit_sender_delivers_once() {
        let (tx, rx) = oneshot::channel::<ExitStatus>();
        tx.send(42).unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[test]
    fn test_session_streams_construction() {
        let (_client, server) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(server);
        let (_c2, s2) = tokio::io::duplex(64);
        let (_r2, w2) = tokio::io::split(s2);
        let streams = SessionStreams {
            stdin: Box::new(read_half),
            stdout: Box::new(write_half),
            stderr: Box::new(w2),
        };
        // Boxed trait objects are what the backends consume.
        let _: Box<dyn AsyncRead + Send + Unpin> = streams.stdin;
    }
}

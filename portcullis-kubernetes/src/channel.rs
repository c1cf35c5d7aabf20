//! Per-session-channel handler: environment and pty bookkeeping, program
//! dispatch, signal and window forwarding, and channel teardown.

use crate::client::{ClusterExecution, ClusterPod};
use crate::codes;
use crate::connection::ConnectionHandler;
use crate::error::{ClientError, SessionError, SessionResult, SignalError};
use async_trait::async_trait;
use portcullis_sshserver::{
    ChannelId, ExitSender, ExitStatus, HandlerError, SessionChannelHandler, SessionStreams,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handler for one session channel.
pub struct ChannelHandler {
    channel_id: ChannelId,
    connection: ConnectionHandler,
    state: Arc<Mutex<ChannelState>>,
}

struct ChannelState {
    env: BTreeMap<String, String>,
    pty: bool,
    columns: u32,
    rows: u32,
    exec: Option<Arc<dyn ClusterExecution>>,
    /// The pod owned by this channel; only set in session mode.
    pod: Option<Arc<dyn ClusterPod>>,
    exit: Option<ExitSender>,
    exit_sent: bool,
}

impl ChannelHandler {
    pub(crate) fn new(
        channel_id: ChannelId,
        connection: ConnectionHandler,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            channel_id,
            connection,
            state: Arc::new(Mutex::new(ChannelState {
                env,
                pty: false,
                columns: 0,
                rows: 0,
                exec: None,
                pod: None,
                exit: None,
                exit_sent: false,
            })),
        }
    }

    /// Start `program` and stream its stdio in the background.
    ///
    /// Runs under the connection mutex: mode-specific preparation, the
    /// launch of the streaming task, and the initial pty resize are one
    /// critical section.
    async fn run(
        &self,
        program: Vec<String>,
        streams: SessionStreams,
        exit: ExitSender,
    ) -> SessionResult<()> {
        let config = self.connection.config();
        let deadline = Instant::now() + config.timeouts.command_start();

        let conn = self.connection.state().lock().await;
        let mut ch = self.state.lock().await;
        if ch.exec.is_some() {
            warn!(
                code = codes::PROGRAM_ALREADY_RUNNING,
                channel = self.channel_id,
                "request to start a program while one is already running"
            );
            return Err(SessionError::ProgramAlreadyRunning);
        }

        let exec = if config.pod.mode.is_connection() {
            let pod = conn
                .pod
                .clone()
                .ok_or(SessionError::HandshakeNotComplete)?;
            timeout_at(deadline, pod.create_exec(program, &ch.env, ch.pty))
                .await
                .map_err(|_| SessionError::StartFailed(ClientError::DeadlineExceeded))??
        } else {
            let pod = self
                .connection
                .client()
                .create_pod(
                    &conn.labels,
                    &conn.annotations,
                    &ch.env,
                    Some(ch.pty),
                    Some(program),
                    deadline,
                )
                .await?;
            match timeout_at(deadline, pod.attach()).await {
                Ok(Ok(exec)) => {
                    ch.pod = Some(Arc::clone(&pod));
                    exec
                }
                Ok(Err(e)) => {
                    remove_pod(&self.connection, pod).await;
                    return Err(e.into());
                }
                Err(_) => {
                    remove_pod(&self.connection, pod).await;
                    return Err(SessionError::StartFailed(ClientError::DeadlineExceeded));
                }
            }
        };

        ch.exec = Some(Arc::clone(&exec));
        ch.exit = Some(exit);

        let connection = self.connection.clone();
        let state = Arc::clone(&self.state);
        let channel_id = self.channel_id;
        let streaming = Arc::clone(&exec);
        tokio::spawn(async move {
            let code = streaming.run(streams).await;
            deliver_exit(connection, state, channel_id, code).await;
        });

        // Seed the terminal size so the program sees its geometry before the
        // first output.
        if ch.pty {
            let rows = clamp_dimension(ch.rows);
            let columns = clamp_dimension(ch.columns);
            let failure = match timeout_at(deadline, exec.resize(rows, columns)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("deadline exceeded".to_string()),
            };
            if let Some(reason) = failure {
                warn!(
                    code = codes::EXEC_RESIZE_FAILED,
                    channel = self.channel_id,
                    error = %reason,
                    "failed to set the initial terminal size"
                );
                if config.pod.mode.is_session() {
                    if let Some(pod) = ch.pod.take() {
                        remove_pod(&self.connection, pod).await;
                    }
                    return Err(SessionError::TerminalSizeFailed(reason));
                }
            }
        }
        Ok(())
    }
}

/// Report the exit status upstream exactly once and, in session mode, remove
/// the channel's pod. Runs under the connection mutex like every other exit
/// and teardown path.
async fn deliver_exit(
    connection: ConnectionHandler,
    state: Arc<Mutex<ChannelState>>,
    channel_id: ChannelId,
    code: ExitStatus,
) {
    let _conn = connection.state().lock().await;
    let mut ch = state.lock().await;
    if ch.exit_sent {
        return;
    }
    ch.exit_sent = true;
    if let Some(exit) = ch.exit.take() {
        let _ = exit.send(code);
    }
    debug!(
        connection = %connection.connection_id(),
        channel = channel_id,
        exit_status = code,
        "program exited"
    );
    if connection.config().pod.mode.is_session() {
        if let Some(pod) = ch.pod.take() {
            remove_pod(&connection, pod).await;
        }
    }
}

/// Best-effort pod removal within the pod-stop timeout. Failures are logged
/// by the pod handle.
async fn remove_pod(connection: &ConnectionHandler, pod: Arc<dyn ClusterPod>) {
    let deadline = Instant::now() + connection.config().timeouts.pod_stop();
    let _ = pod.remove(deadline).await;
}

/// Tokenize an exec request. Parse failures and bare program words fall back
/// to a shell invocation of the raw string; only absolute and relative paths
/// run directly.
fn parse_program(program: &str) -> Vec<String> {
    match shell_words::split(program) {
        Ok(tokens)
            if tokens.first().is_some_and(|first| {
                first.starts_with('/') || first.starts_with("./") || first.starts_with("../")
            }) =>
        {
            tokens
        }
        _ => vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            program.to_string(),
        ],
    }
}

fn clamp_dimension(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

#[async_trait]
impl SessionChannelHandler for ChannelHandler {
    async fn on_env(&self, name: &str, value: &str) -> Result<(), HandlerError> {
        let _conn = self.connection.state().lock().await;
        let mut ch = self.state.lock().await;
        if ch.exec.is_some() {
            warn!(
                code = codes::PROGRAM_ALREADY_RUNNING,
                channel = self.channel_id,
                "environment change after program start"
            );
            return Err(SessionError::ProgramAlreadyRunning.into());
        }
        ch.env.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn on_pty(
        &self,
        term: &str,
        columns: u32,
        rows: u32,
        _width_px: u32,
        _height_px: u32,
        _modes: &[u8],
    ) -> Result<(), HandlerError> {
        let _conn = self.connection.state().lock().await;
        let mut ch = self.state.lock().await;
        if ch.exec.is_some() {
            warn!(
                code = codes::PROGRAM_ALREADY_RUNNING,
                channel = self.channel_id,
                "pty request after program start"
            );
            return Err(SessionError::ProgramAlreadyRunning.into());
        }
        ch.env.insert("TERM".to_string(), term.to_string());
        ch.pty = true;
        ch.columns = columns;
        ch.rows = rows;
        Ok(())
    }

    async fn on_exec(
        &self,
        program: &str,
        streams: SessionStreams,
        exit: ExitSender,
    ) -> Result<(), HandlerError> {
        if self.connection.config().pod.disable_command {
            warn!(
                code = codes::KUBERUN_EXEC_DISABLED,
                channel = self.channel_id,
                "program execution is disabled"
            );
            return Err(SessionError::ExecutionDisabled.into());
        }
        self.run(parse_program(program), streams, exit)
            .await
            .map_err(Into::into)
    }

    async fn on_shell(
        &self,
        streams: SessionStreams,
        exit: ExitSender,
    ) -> Result<(), HandlerError> {
        let shell = self.connection.config().pod.shell_command.clone();
        self.run(shell, streams, exit).await.map_err(Into::into)
    }

    async fn on_subsystem(
        &self,
        name: &str,
        streams: SessionStreams,
        exit: ExitSender,
    ) -> Result<(), HandlerError> {
        let Some(binary) = self.connection.config().pod.subsystems.get(name).cloned() else {
            warn!(
                code = codes::SUBSYSTEM_NOT_SUPPORTED,
                channel = self.channel_id,
                subsystem = name,
                "subsystem is not configured"
            );
            return Err(SessionError::SubsystemNotSupported(name.to_string()).into());
        };
        self.run(vec![binary], streams, exit)
            .await
            .map_err(Into::into)
    }

    async fn on_signal(&self, signal: &str) -> Result<(), HandlerError> {
        let _conn = self.connection.state().lock().await;
        let ch = self.state.lock().await;
        let Some(exec) = ch.exec.clone() else {
            warn!(
                code = codes::PROGRAM_NOT_RUNNING,
                channel = self.channel_id,
                "signal request without a running program"
            );
            return Err(SessionError::ProgramNotRunning.into());
        };
        match timeout(self.connection.config().timeouts.signal(), exec.signal(signal)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::from(e).into()),
            Err(_) => Err(SessionError::Signal(SignalError::Failed(
                "deadline exceeded".to_string(),
            ))
            .into()),
        }
    }

    async fn on_window(&self, columns: u32, rows: u32) -> Result<(), HandlerError> {
        let _conn = self.connection.state().lock().await;
        let ch = self.state.lock().await;
        let Some(exec) = ch.exec.clone() else {
            warn!(
                code = codes::PROGRAM_NOT_RUNNING,
                channel = self.channel_id,
                "window change without a running program"
            );
            return Err(SessionError::ProgramNotRunning.into());
        };
        let resize = exec.resize(clamp_dimension(rows), clamp_dimension(columns));
        match timeout(self.connection.config().timeouts.window(), resize).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::TerminalSizeFailed(e.to_string()).into()),
            Err(_) => Err(SessionError::TerminalSizeFailed("deadline exceeded".to_string()).into()),
        }
    }

    async fn on_close(&self) {
        let _conn = self.connection.state().lock().await;
        let mut ch = self.state.lock().await;
        let Some(exec) = ch.exec.clone() else {
            return;
        };
        if exec.is_done() {
            return;
        }
        if self.connection.config().pod.mode.is_session() {
            if let Some(pod) = ch.pod.take() {
                remove_pod(&self.connection, pod).await;
            }
        } else {
            exec.kill().await;
        }
    }

    async fn on_shutdown(&self, shutdown: CancellationToken) {
        let exec = {
            let _conn = self.connection.state().lock().await;
            let ch = self.state.lock().await;
            ch.exec.clone()
        };
        let Some(exec) = exec else {
            return;
        };
        if exec.is_done() {
            return;
        }

        let config = self.connection.config();
        let _ = timeout(config.timeouts.signal(), exec.term()).await;

        tokio::select! {
            _ = exec.done() => {}
            _ = shutdown.cancelled() => {
                if config.pod.mode.is_session() {
                    let pod = {
                        let _conn = self.connection.state().lock().await;
                        let mut ch = self.state.lock().await;
                        ch.pod.take()
                    };
                    if let Some(pod) = pod {
                        remove_pod(&self.connection, pod).await;
                    }
                } else {
                    exec.kill().await;
                }
            }
        }
    }
}

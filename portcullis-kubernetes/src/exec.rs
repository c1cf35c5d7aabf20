//! Execution handle: one running process inside a pod.
//!
//! Owns the bidirectional stream between the SSH channel and the container,
//! the last-write-wins terminal-size queue feeding the resize side channel,
//! the guest-agent PID framing, and signal delivery through the agent.

use crate::client::{ClusterContext, ClusterExecution};
use crate::codes;
use crate::error::{ClientError, ClientResult, SignalError};
use async_trait::async_trait;
use futures::SinkExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{AttachParams, AttachedProcess, TerminalSize};
use portcullis_sshserver::{ExitStatus, SessionStreams};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, warn};

/// Exit status reported when the stream fails without a typed exit code.
const EXIT_STREAM_FAILURE: ExitStatus = 137;

/// One process streaming through the remote-command protocol.
pub(crate) struct KubeExecution {
    shared: Arc<ExecShared>,
    process: Mutex<Option<AttachedProcess>>,
}

struct ExecShared {
    ctx: Arc<ClusterContext>,
    pod_name: String,
    container: String,
    tty: bool,
    /// PID reported by the guest agent; 0 while unknown.
    pid: AtomicU32,
    size_queue: SizeQueue,
    done: watch::Sender<bool>,
}

impl KubeExecution {
    pub(crate) fn new(
        ctx: Arc<ClusterContext>,
        pod_name: String,
        container: String,
        tty: bool,
        process: AttachedProcess,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(ExecShared {
                ctx,
                pod_name,
                container,
                tty,
                pid: AtomicU32::new(0),
                size_queue: SizeQueue::new(),
                done,
            }),
            process: Mutex::new(Some(process)),
        }
    }

    fn agent_enabled(&self) -> bool {
        self.shared.ctx.config.pod.agent_enabled()
    }

    fn session_mode(&self) -> bool {
        self.shared.ctx.config.pod.mode.is_session()
    }

    /// Run the guest agent's signal helper against the recorded PID.
    async fn send_signal_to_process(&self, signal: &str, pid: u32) -> Result<(), SignalError> {
        let pod_config = &self.shared.ctx.config.pod;
        debug!(
            code = codes::EXEC_SIGNAL,
            pod = %self.shared.pod_name,
            pid,
            signal,
            "delivering signal through the agent"
        );
        let command = vec![
            pod_config.agent_path.clone(),
            "signal".to_string(),
            "--pid".to_string(),
            pid.to_string(),
            "--signal".to_string(),
            signal.to_string(),
        ];
        let params = AttachParams::default()
            .container(self.shared.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);

        self.shared.ctx.throttle.acquire().await;
        self.shared.ctx.metrics.request();
        let mut helper = self
            .shared
            .ctx
            .api
            .exec(&self.shared.pod_name, command, &params)
            .await
            .map_err(|e| {
                self.shared.ctx.metrics.failure();
                warn!(
                    code = codes::EXEC_SIGNAL_FAILED,
                    pod = %self.shared.pod_name,
                    pid,
                    signal,
                    error = %e,
                    "cannot send signal"
                );
                SignalError::Failed(e.to_string())
            })?;

        let mut helper_stderr = Vec::new();
        if let Some(mut stderr) = helper.stderr() {
            let _ = stderr.read_to_end(&mut helper_stderr).await;
        }
        let status = match helper.take_status() {
            Some(status) => status.await,
            None => None,
        };
        let _ = helper.join().await;

        let exit = match status {
            Some(status) => exit_status_from(status).unwrap_or(EXIT_STREAM_FAILURE),
            None => 0,
        };
        if exit != 0 {
            self.shared.ctx.metrics.failure();
            warn!(
                code = codes::EXEC_SIGNAL_FAILED,
                pod = %self.shared.pod_name,
                pid,
                signal,
                helper_exit = exit,
                stderr = %String::from_utf8_lossy(&helper_stderr),
                "cannot send signal"
            );
            return Err(SignalError::Failed(format!(
                "signal helper exited with status {exit}"
            )));
        }
        debug!(
            code = codes::EXEC_SIGNAL_SUCCESSFUL,
            pod = %self.shared.pod_name,
            pid,
            signal,
            "signal delivered"
        );
        Ok(())
    }
}

#[async_trait]
impl ClusterExecution for KubeExecution {
    async fn run(&self, streams: SessionStreams) -> ExitStatus {
        let Some(mut process) = self.process.lock().await.take() else {
            warn!(code = codes::EXEC, pod = %self.shared.pod_name, "execution already consumed");
            return EXIT_STREAM_FAILURE;
        };
        let SessionStreams {
            stdin,
            stdout,
            stderr,
        } = streams;

        debug!(
            code = codes::EXEC,
            pod = %self.shared.pod_name,
            tty = self.shared.tty,
            "streaming process stdio"
        );
        self.shared.ctx.metrics.request();

        let agent = self.agent_enabled();
        let start_byte = agent && self.session_mode();

        // Resize side channel: feed the last-write-wins queue into the
        // protocol's resize stream until the queue closes.
        if let Some(mut size_tx) = process.terminal_size() {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                while let Some(size) = shared.size_queue.next().await {
                    if size_tx.send(size).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Client-to-container pump. In session mode the agent holds the
        // program until a single NUL byte arrives.
        if let Some(mut remote_stdin) = process.stdin() {
            tokio::spawn(async move {
                let mut stdin = stdin;
                if start_byte {
                    if let Err(e) = remote_stdin.write_all(&[0]).await {
                        warn!(error = %e, "failed to deliver the start byte to the agent");
                        return;
                    }
                }
                if let Err(e) = tokio::io::copy(&mut stdin, &mut remote_stdin).await {
                    if !is_closed_pipe(&e) {
                        warn!(error = %e, "stdin stream failed");
                    }
                }
            });
        }

        // Container-to-client pump. The agent writes the spawned PID as a
        // 4-byte little-endian frame before any program output; that frame
        // must never reach the client.
        let stdout_pump = process.stdout().map(|mut remote_stdout| {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if agent {
                    let mut pid_bytes = [0u8; 4];
                    match remote_stdout.read_exact(&mut pid_bytes).await {
                        Ok(_) => {
                            let pid = u32::from_le_bytes(pid_bytes);
                            shared.pid.store(pid, Ordering::Relaxed);
                            debug!(code = codes::PID_RECEIVED, pid, "guest agent reported PID");
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to read the PID frame from the program");
                        }
                    }
                }
                let mut stdout = stdout;
                if let Err(e) = tokio::io::copy(&mut remote_stdout, &mut stdout).await {
                    if !is_closed_pipe(&e) {
                        warn!(error = %e, "stdout stream failed");
                    }
                }
            })
        });
        let stderr_pump = process.stderr().map(|mut remote_stderr| {
            tokio::spawn(async move {
                let mut stderr = stderr;
                if let Err(e) = tokio::io::copy(&mut remote_stderr, &mut stderr).await {
                    if !is_closed_pipe(&e) {
                        warn!(error = %e, "stderr stream failed");
                    }
                }
            })
        });

        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };
        // Flush all output to the client before the exit status is reported.
        if let Some(pump) = stdout_pump {
            let _ = pump.await;
        }
        if let Some(pump) = stderr_pump {
            let _ = pump.await;
        }
        self.shared.size_queue.close().await;

        let join_result = process.join().await;
        let exit = match status {
            Some(status) => exit_status_from(status),
            None => match join_result {
                Ok(()) => Ok(0),
                Err(e) => Err(e.to_string()),
            },
        };
        let code = match exit {
            Ok(code) => code,
            Err(e) => {
                self.shared.ctx.metrics.failure();
                error!(
                    code = codes::EXIT_CODE_FAILED,
                    pod = %self.shared.pod_name,
                    error = %e,
                    "failed to determine the program exit code"
                );
                EXIT_STREAM_FAILURE
            }
        };
        let _ = self.shared.done.send(true);
        code
    }

    async fn resize(&self, rows: u16, cols: u16) -> ClientResult<()> {
        debug!(
            code = codes::EXEC_RESIZE,
            pod = %self.shared.pod_name,
            rows,
            cols,
            "resizing terminal"
        );
        let accepted = self
            .shared
            .size_queue
            .push(TerminalSize {
                width: cols,
                height: rows,
            })
            .await;
        if !accepted {
            let err = ClientError::ResizeFailed("stream already ended".to_string());
            warn!(code = err.code(), pod = %self.shared.pod_name, error = %err, "resize rejected");
            return Err(err);
        }
        Ok(())
    }

    async fn signal(&self, signal: &str) -> Result<(), SignalError> {
        // A finished agent-less execution satisfies several of these
        // predicates at once; the missing PID is reported first.
        let pid = self.shared.pid.load(Ordering::Relaxed);
        if pid == 0 {
            warn!(
                code = codes::SIGNAL_FAILED_NO_PID,
                pod = %self.shared.pod_name,
                signal,
                "cannot send signal: no PID recorded"
            );
            return Err(SignalError::NoPid);
        }
        if !self.agent_enabled() {
            warn!(
                code = codes::EXEC_SIGNAL_FAILED_NO_AGENT,
                pod = %self.shared.pod_name,
                signal,
                "cannot send signal: guest agent support is disabled"
            );
            return Err(SignalError::AgentDisabled);
        }
        if self.is_done() {
            warn!(
                code = codes::SIGNAL_FAILED_EXITED,
                pod = %self.shared.pod_name,
                signal,
                "cannot send signal: program already exited"
            );
            return Err(SignalError::Exited);
        }
        self.send_signal_to_process(signal, pid).await
    }

    async fn term(&self) {
        let _ = self.signal("TERM").await;
    }

    async fn kill(&self) {
        let _ = self.signal("KILL").await;
    }

    async fn done(&self) {
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn is_done(&self) -> bool {
        *self.shared.done.borrow()
    }
}

/// Whether an I/O error only reports the other side going away.
fn is_closed_pipe(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
    )
}

/// Map a remote-command status object to an exit code.
fn exit_status_from(status: Status) -> Result<ExitStatus, String> {
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }
    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|details| details.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|cause| cause.message.as_deref())
            .and_then(|message| message.parse::<ExitStatus>().ok());
        if let Some(code) = code {
            return Ok(code);
        }
    }
    Err(status
        .message
        .unwrap_or_else(|| "stream failed without a message".to_string()))
}

/// Last-write-wins slot delivering resize events to the streaming protocol.
///
/// Semantically a bounded queue of capacity one where a push replaces any
/// pending item; closing it makes the consumer observe the end of resizes.
pub(crate) struct SizeQueue {
    state: Mutex<SizeQueueState>,
    notify: Notify,
}

#[derive(Default)]
struct SizeQueueState {
    pending: Option<TerminalSize>,
    closed: bool,
}

impl SizeQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SizeQueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Store a size, replacing any pending one. Returns false once closed.
    pub(crate) async fn push(&self, size: TerminalSize) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        state.pending = Some(size);
        self.notify.notify_one();
        true
    }

    /// Close the queue; the consumer sees the end after draining the last
    /// pending size.
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        self.notify.notify_one();
    }

    /// Next size, or `None` once the queue is closed and drained.
    pub(crate) async fn next(&self) -> Option<TerminalSize> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(size) = state.pending.take() {
                    return Some(size);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    #[test]
    fn test_exit_status_success() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Status::default()
        };
        assert_eq!(exit_status_from(status).unwrap(), 0);
    }

    #[test]
    fn test_exit_status_non_zero() {
        let status = Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some("42".to_string()),
                    ..StatusCause::default()
                }]),
                ..StatusDetails::default()
            }),
            ..Status::default()
        };
        assert_eq!(exit_status_from(status).unwrap(), 42);
    }

    #[test]
    fn test_exit_status_failure_without_code() {
        let status = Status {
            status: Some("Failure".to_string()),
            message: Some("error executing command".to_string()),
            ..Status::default()
        };
        assert_eq!(
            exit_status_from(status).unwrap_err(),
            "error executing command"
        );
    }

    #[test]
    fn test_exit_status_unparsable_code() {
        let status = Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some("not-a-number".to_string()),
                    ..StatusCause::default()
                }]),
                ..StatusDetails::default()
            }),
            message: None,
            ..Status::default()
        };
        assert!(exit_status_from(status).is_err());
    }

    #[test]
    fn test_is_closed_pipe() {
        assert!(is_closed_pipe(&std::io::Error::from(
            std::io::ErrorKind::BrokenPipe
        )));
        assert!(!is_closed_pipe(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
    }

    #[tokio::test]
    async fn test_size_queue_delivers_latest() {
        let queue = SizeQueue::new();
        assert!(
            queue
                .push(TerminalSize {
                    width: 80,
                    height: 24
                })
                .await
        );
        assert!(
            queue
                .push(TerminalSize {
                    width: 120,
                    height: 30
                })
                .await
        );
        // Only the latest size matters.
        let size = queue.next().await.unwrap();
        assert_eq!(size.width, 120);
        assert_eq!(size.height, 30);
    }

    #[tokio::test]
    async fn test_size_queue_close_ends_consumer() {
        let queue = SizeQueue::new();
        queue.close().await;
        assert!(queue.next().await.is_none());
        assert!(
            !queue
                .push(TerminalSize {
                    width: 80,
                    height: 24
                })
                .await
        );
    }

    #[tokio::test]
    async fn test_size_queue_drains_pending_before_close() {
        let queue = SizeQueue::new();
        queue
            .push(TerminalSize {
                width: 100,
                height: 40
            })
            .await;
        queue.close().await;
        let size = queue.next().await.unwrap();
        assert_eq!(size.width, 100);
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_size_queue_wakes_waiting_consumer() {
        let queue = std::sync::Arc::new(SizeQueue::new());
        let consumer = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue
            .push(TerminalSize {
                width: 132,
                height: 43
            })
            .await;
        let size = consumer.await.unwrap().unwrap();
        assert_eq!(size.width, 132);
    }
}

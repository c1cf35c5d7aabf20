//! Error types for the Kubernetes backend.

use crate::codes;
use thiserror::Error;

/// Configuration validation errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No cluster host was configured.
    #[error("no host specified")]
    NoHost,

    /// No API path was configured.
    #[error("no API path specified")]
    NoApiPath,

    /// The configured bearer token file does not exist or is unreadable.
    #[error("bearer token file {path} not found: {source}")]
    BearerTokenFile {
        path: String,
        source: std::io::Error,
    },

    /// No namespace was configured in the pod metadata.
    #[error("no namespace specified in pod config")]
    NoNamespace,

    /// The pod spec contains no containers.
    #[error("no containers specified in the pod spec")]
    NoContainers,

    /// A container in the pod spec has no image.
    #[error("container {0} in pod spec has no image name")]
    MissingImage(usize),

    /// The console container number does not index into the container list.
    #[error("the specified console container {index} does not exist in the pod spec ({containers} containers)")]
    ConsoleContainerOutOfRange { index: usize, containers: usize },

    /// The agent path is empty while the agent is enabled.
    #[error("the agent path is required when the agent is not disabled")]
    AgentPathRequired,

    /// The idle command is missing in connection mode.
    #[error("idle command is required when the execution mode is connection")]
    IdleCommandRequired,

    /// The shell command is missing where it is required.
    #[error("shell command is required: {0}")]
    ShellCommandRequired(&'static str),

    /// The restart policy conflicts with session mode.
    #[error("invalid restart policy in session mode: {0}, only \"Never\" is allowed")]
    InvalidRestartPolicy(String),

    /// A timeout was configured as zero.
    #[error("timeout {0} must be positive")]
    ZeroTimeout(&'static str),
}

impl ConfigError {
    /// The stable log code for configuration errors.
    pub fn code(&self) -> &'static str {
        codes::CONFIG_ERROR
    }
}

/// Errors from cluster operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection configuration could not be turned into a working
    /// cluster client.
    #[error("invalid cluster configuration: {0}")]
    Config(String),

    /// Pod creation kept failing until the deadline expired.
    #[error("failed to create pod, giving up ({0})")]
    PodCreateFailed(String),

    /// The wait for the pod to become available failed.
    #[error("failed to wait for pod to become available ({0})")]
    PodWaitFailed(String),

    /// The pod was deleted while waiting for it to become available.
    #[error("pod was removed while waiting for it to become available")]
    PodDeleted,

    /// Pod removal kept failing until the deadline expired.
    #[error("failed to remove pod, giving up ({0})")]
    PodRemoveFailed(String),

    /// Attaching to the pod console failed.
    #[error("failed to attach to pod ({0})")]
    AttachFailed(String),

    /// Creating an execution in the pod failed.
    #[error("failed to create execution ({0})")]
    ExecFailed(String),

    /// The terminal could not be resized.
    #[error("failed to resize terminal ({0})")]
    ResizeFailed(String),

    /// The operation deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl ClientError {
    /// The stable log code matching this error.
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::Config(_) => codes::CONFIG_ERROR,
            ClientError::PodCreateFailed(_) => codes::POD_CREATE_FAILED,
            ClientError::PodWaitFailed(_) | ClientError::PodDeleted => codes::POD_WAIT_FAILED,
            ClientError::PodRemoveFailed(_) => codes::POD_REMOVE_FAILED,
            ClientError::AttachFailed(_) => codes::POD_ATTACH,
            ClientError::ExecFailed(_) => codes::EXEC,
            ClientError::ResizeFailed(_) => codes::EXEC_RESIZE_FAILED,
            ClientError::DeadlineExceeded => codes::POD_WAIT_FAILED,
        }
    }
}

/// Signal delivery errors, split by cause so each maps to its own code.
#[derive(Debug, Error)]
pub enum SignalError {
    /// No PID was recorded for the execution. Happens when the agent is
    /// disabled or PID framing failed.
    #[error("cannot send signal: no PID recorded")]
    NoPid,

    /// Guest agent support is disabled.
    #[error("cannot send signal: guest agent support is disabled")]
    AgentDisabled,

    /// The program already exited.
    #[error("cannot send signal: program already exited")]
    Exited,

    /// The signal helper failed inside the container.
    #[error("cannot send signal ({0})")]
    Failed(String),
}

impl SignalError {
    /// The stable log code matching this error.
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::NoPid => codes::SIGNAL_FAILED_NO_PID,
            SignalError::AgentDisabled => codes::EXEC_SIGNAL_FAILED_NO_AGENT,
            SignalError::Exited => codes::SIGNAL_FAILED_EXITED,
            SignalError::Failed(_) => codes::EXEC_SIGNAL_FAILED,
        }
    }
}

/// User-visible session errors. Non-fatal to the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A program is already running on this channel.
    #[error("program already running")]
    ProgramAlreadyRunning,

    /// The request requires a running program, but none is.
    #[error("program not running")]
    ProgramNotRunning,

    /// The requested subsystem is not configured.
    #[error("subsystem not supported: {0}")]
    SubsystemNotSupported(String),

    /// Program execution is disabled by the legacy configuration.
    #[error("command execution is disabled")]
    ExecutionDisabled,

    /// A second handshake was attempted on the same connection.
    #[error("handshake already complete")]
    HandshakeAlreadyComplete,

    /// A channel operation arrived before the handshake created the pod.
    #[error("handshake not complete")]
    HandshakeNotComplete,

    /// The initial terminal size could not be applied.
    #[error("failed to set terminal size ({0})")]
    TerminalSizeFailed(String),

    /// Starting the program failed.
    #[error("failed to start program ({0})")]
    StartFailed(#[from] ClientError),

    /// Signal delivery failed.
    #[error(transparent)]
    Signal(#[from] SignalError),
}

impl SessionError {
    /// The stable log code matching this error.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::ProgramAlreadyRunning => codes::PROGRAM_ALREADY_RUNNING,
            SessionError::ProgramNotRunning => codes::PROGRAM_NOT_RUNNING,
            SessionError::SubsystemNotSupported(_) => codes::SUBSYSTEM_NOT_SUPPORTED,
            SessionError::ExecutionDisabled => codes::KUBERUN_EXEC_DISABLED,
            SessionError::HandshakeAlreadyComplete | SessionError::HandshakeNotComplete => {
                codes::CONFIG_ERROR
            }
            SessionError::TerminalSizeFailed(_) => codes::EXEC_RESIZE_FAILED,
            SessionError::StartFailed(inner) => inner.code(),
            SessionError::Signal(inner) => inner.code(),
        }
    }
}

/// Errors constructing a connection handler.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The cluster client could not be constructed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Result of a cluster operation.
pub type ClientResult<T> = Result<T, ClientError>;

/// Result of a session operation.
pub type SessionResult<T> = Result<T, SessionError>;

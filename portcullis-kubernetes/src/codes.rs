//! Stable message codes for structured logging.
//!
//! Every log line that concerns the cluster or a session carries one of
//! these codes in its `code` field, so operators can alert on and document
//! specific conditions independently of the human-readable message text.

/// A pod is being created.
pub const POD_CREATE: &str = "KUBERNETES_POD_CREATE";

/// A pod creation attempt failed. This may be temporary and retried, or
/// permanent; check the attached error.
pub const POD_CREATE_FAILED: &str = "KUBERNETES_POD_CREATE_FAILED";

/// Waiting for a created pod to become available.
pub const POD_WAIT: &str = "KUBERNETES_POD_WAIT";

/// The wait for a pod to become available failed.
pub const POD_WAIT_FAILED: &str = "KUBERNETES_POD_WAIT_FAILED";

/// A pod is being removed.
pub const POD_REMOVE: &str = "KUBERNETES_POD_REMOVE";

/// A pod removal attempt failed. This may be temporary and retried, or
/// permanent; check the attached error.
pub const POD_REMOVE_FAILED: &str = "KUBERNETES_POD_REMOVE_FAILED";

/// A pod was removed.
pub const POD_REMOVE_SUCCESSFUL: &str = "KUBERNETES_POD_REMOVE_SUCCESSFUL";

/// Attaching to the console of a pod.
pub const POD_ATTACH: &str = "KUBERNETES_POD_ATTACH";

/// Creating an execution in a pod. Either a user-requested program, or an
/// internal helper invocation used to deliver a signal.
pub const EXEC: &str = "KUBERNETES_EXEC";

/// Resizing the terminal of an execution.
pub const EXEC_RESIZE: &str = "KUBERNETES_EXEC_RESIZE";

/// Resizing the terminal of an execution failed.
pub const EXEC_RESIZE_FAILED: &str = "KUBERNETES_EXEC_RESIZE_FAILED";

/// Delivering a signal to an execution.
pub const EXEC_SIGNAL: &str = "KUBERNETES_EXEC_SIGNAL";

/// Delivering a signal failed.
pub const EXEC_SIGNAL_FAILED: &str = "KUBERNETES_EXEC_SIGNAL_FAILED";

/// Delivering a signal failed because guest agent support is disabled.
pub const EXEC_SIGNAL_FAILED_NO_AGENT: &str = "KUBERNETES_EXEC_SIGNAL_FAILED_NO_AGENT";

/// The requested signal was delivered.
pub const EXEC_SIGNAL_SUCCESSFUL: &str = "KUBERNETES_EXEC_SIGNAL_SUCCESSFUL";

/// The exit code of a finished program could not be determined.
pub const EXIT_CODE_FAILED: &str = "KUBERNETES_EXIT_CODE_FAILED";

/// The guest agent reported the PID of the spawned program.
pub const PID_RECEIVED: &str = "KUBERNETES_PID_RECEIVED";

/// A request arrived that requires no program to be running, but one is.
/// This is a client error.
pub const PROGRAM_ALREADY_RUNNING: &str = "KUBERNETES_PROGRAM_ALREADY_RUNNING";

/// A request arrived that requires a running program, but none is.
/// This is a client error.
pub const PROGRAM_NOT_RUNNING: &str = "KUBERNETES_PROGRAM_NOT_RUNNING";

/// A signal could not be delivered because no PID was recorded, most likely
/// because guest agent support is disabled or PID framing failed.
pub const SIGNAL_FAILED_NO_PID: &str = "KUBERNETES_SIGNAL_FAILED_NO_PID";

/// A signal could not be delivered because the program already exited.
pub const SIGNAL_FAILED_EXITED: &str = "KUBERNETES_SIGNAL_FAILED_EXITED";

/// The requested subsystem is not configured.
pub const SUBSYSTEM_NOT_SUPPORTED: &str = "KUBERNETES_SUBSYSTEM_NOT_SUPPORTED";

/// The backend configuration is invalid.
pub const CONFIG_ERROR: &str = "KUBERNETES_CONFIG_ERROR";

/// Guest agent support is disabled. Several session features (signal
/// delivery, PID-aware execution) will not work without the agent installed
/// in the pod image.
pub const GUEST_AGENT_DISABLED: &str = "KUBERNETES_GUEST_AGENT_DISABLED";

/// Server certificate verification is disabled. Retained only for legacy
/// configuration compatibility.
pub const KUBERUN_INSECURE: &str = "KUBERUN_INSECURE";

/// A deprecated legacy configuration shape is in use.
pub const KUBERUN_DEPRECATED: &str = "KUBERUN_DEPRECATED";

/// Program execution was requested but is disabled by the legacy
/// configuration.
pub const KUBERUN_EXEC_DISABLED: &str = "KUBERUN_EXEC_DISABLED";

//! Backend configuration: cluster connection, pod template, timeouts.
//!
//! Loading these structures from a file and defaulting them from a
//! kubeconfig is the embedding server's concern; this module owns the shape,
//! the defaults and the validation rules.

use crate::error::ConfigError;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Restart policy allowed for session-mode pods.
const RESTART_POLICY_NEVER: &str = "Never";

/// Base configuration of the Kubernetes backend.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection to the Kubernetes cluster.
    pub connection: ConnectionConfig,
    /// The pod to launch and how to run programs in it.
    pub pod: PodConfig,
    /// Operation deadlines.
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Check all configuration sections; returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.pod.validate()?;
        self.timeouts.validate()?;
        Ok(())
    }
}

/// Connection to the Kubernetes apiserver.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// A host string, a `host:port` pair, or a URL to the base of the
    /// apiserver.
    pub host: String,
    /// Sub-path that points to the API root.
    pub api_path: String,

    /// Username for basic authentication.
    pub username: Option<String>,
    /// Password for basic authentication.
    pub password: Option<SecretString>,

    /// Server name passed for SNI and used to check server certificates.
    pub server_name: Option<String>,

    /// File containing the client certificate for TLS client certificate
    /// authentication.
    pub cert_file: Option<String>,
    /// File containing the client key.
    pub key_file: Option<String>,
    /// File containing trusted root certificates for the server.
    pub cacert_file: Option<String>,

    /// PEM-encoded client certificate.
    pub cert: Option<String>,
    /// PEM-encoded client key.
    pub key: Option<SecretString>,
    /// PEM-encoded trusted root certificates.
    pub cacert: Option<String>,

    /// Bearer (service) token authentication.
    pub bearer_token: Option<SecretString>,
    /// Path to a file containing a bearer token. Set to
    /// `/var/run/secrets/kubernetes.io/serviceaccount/token` to use the
    /// service account token inside a cluster.
    pub bearer_token_file: Option<String>,

    /// Maximum sustained queries per second to the apiserver.
    pub qps: f32,
    /// Maximum burst above the sustained rate.
    pub burst: u32,

    /// Disables server certificate validation. Retained for legacy
    /// configuration compatibility only; never serialized.
    #[serde(skip)]
    pub insecure: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "kubernetes.default.svc".to_string(),
            api_path: "/api".to_string(),
            username: None,
            password: None,
            server_name: None,
            cert_file: None,
            key_file: None,
            cacert_file: None,
            cert: None,
            key: None,
            cacert: None,
            bearer_token: None,
            bearer_token_file: None,
            qps: 5.0,
            burst: 10,
            insecure: false,
        }
    }
}

impl ConnectionConfig {
    /// Validate the connection settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::NoHost);
        }
        if self.api_path.is_empty() {
            return Err(ConfigError::NoApiPath);
        }
        if let Some(path) = &self.bearer_token_file {
            std::fs::metadata(path).map_err(|source| ConfigError::BearerTokenFile {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// The pod to launch for a connection or session.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    /// Pod metadata. The namespace is required; `generate_name` provides the
    /// name template.
    pub metadata: ObjectMeta,
    /// Pod specification to launch.
    pub spec: PodSpec,

    /// Which container the SSH connection is bound to.
    pub console_container_number: usize,

    /// Command run as the first process of the console container in
    /// connection mode; programs are then executed via the exec facility.
    pub idle_command: Vec<String>,
    /// Default shell command.
    pub shell_command: Vec<String>,
    /// Path to the guest agent inside the container image.
    pub agent_path: String,
    /// Disables the guest agent. Strongly discouraged: signal delivery and
    /// PID-aware execution stop working without it.
    pub disable_agent: bool,
    /// Subsystem name to executable map.
    pub subsystems: HashMap<String, String>,

    /// When a pod is launched: one per connection, or one per session.
    pub mode: ExecutionMode,

    /// Disables program execution. Retained for legacy configuration
    /// compatibility only; never serialized.
    #[serde(skip)]
    pub disable_command: bool,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                generate_name: Some("portcullis-".to_string()),
                ..ObjectMeta::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "shell".to_string(),
                    image: Some("portcullis/guest-image".to_string()),
                    ..Container::default()
                }],
                ..PodSpec::default()
            },
            console_container_number: 0,
            idle_command: vec![
                "/usr/bin/portcullis-agent".to_string(),
                "wait-signal".to_string(),
                "--signal".to_string(),
                "INT".to_string(),
                "--signal".to_string(),
                "TERM".to_string(),
            ],
            shell_command: vec!["/bin/bash".to_string()],
            agent_path: "/usr/bin/portcullis-agent".to_string(),
            disable_agent: false,
            subsystems: HashMap::from([(
                "sftp".to_string(),
                "/usr/lib/openssh/sftp-server".to_string(),
            )]),
            mode: ExecutionMode::default(),
            disable_command: false,
        }
    }
}

impl PodConfig {
    /// Whether the guest agent is in use.
    pub fn agent_enabled(&self) -> bool {
        !self.disable_agent
    }

    /// Name of the console container.
    ///
    /// Only valid after [`validate`](Self::validate) has passed.
    pub fn console_container_name(&self) -> &str {
        &self.spec.containers[self.console_container_number].name
    }

    /// Validate the pod settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .metadata
            .namespace
            .as_deref()
            .unwrap_or_default()
            .is_empty()
        {
            return Err(ConfigError::NoNamespace);
        }
        if self.spec.containers.is_empty() {
            return Err(ConfigError::NoContainers);
        }
        if self.console_container_number >= self.spec.containers.len() {
            return Err(ConfigError::ConsoleContainerOutOfRange {
                index: self.console_container_number,
                containers: self.spec.containers.len(),
            });
        }
        for (i, container) in self.spec.containers.iter().enumerate() {
            if container.image.as_deref().unwrap_or_default().is_empty() {
                return Err(ConfigError::MissingImage(i));
            }
        }
        if self.agent_enabled() && self.agent_path.is_empty() {
            return Err(ConfigError::AgentPathRequired);
        }
        match self.mode {
            ExecutionMode::Connection => {
                if self.idle_command.is_empty() {
                    return Err(ConfigError::IdleCommandRequired);
                }
                if self.shell_command.is_empty() {
                    return Err(ConfigError::ShellCommandRequired(
                        "the execution mode is connection",
                    ));
                }
            }
            ExecutionMode::Session => {
                if let Some(policy) = self.spec.restart_policy.as_deref() {
                    if policy != RESTART_POLICY_NEVER {
                        return Err(ConfigError::InvalidRestartPolicy(policy.to_string()));
                    }
                }
                if self.agent_enabled() && self.shell_command.is_empty() {
                    return Err(ConfigError::ShellCommandRequired("the agent is enabled"));
                }
            }
        }
        Ok(())
    }
}

/// When a pod is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One pod per SSH connection; programs run via the exec facility while
    /// the console container runs the idle command.
    #[default]
    Connection,
    /// One pod per SSH session; the program is the pod's main process.
    Session,
}

impl ExecutionMode {
    pub fn is_connection(&self) -> bool {
        matches!(self, ExecutionMode::Connection)
    }

    pub fn is_session(&self) -> bool {
        matches!(self, ExecutionMode::Session)
    }
}

/// Operation deadlines, in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Creating and starting a pod.
    pub pod_start_secs: u64,
    /// Stopping and removing a pod.
    pub pod_stop_secs: u64,
    /// Starting a program, including the initial terminal resize.
    pub command_start_secs: u64,
    /// Delivering a signal.
    pub signal_secs: u64,
    /// Applying a window size change.
    pub window_secs: u64,
    /// Cap on a single HTTP call to the apiserver.
    pub http_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            pod_start_secs: 60,
            pod_stop_secs: 60,
            command_start_secs: 60,
            signal_secs: 60,
            window_secs: 60,
            http_secs: 15,
        }
    }
}

impl TimeoutConfig {
    pub fn pod_start(&self) -> Duration {
        Duration::from_secs(self.pod_start_secs)
    }

    pub fn pod_stop(&self) -> Duration {
        Duration::from_secs(self.pod_stop_secs)
    }

    pub fn command_start(&self) -> Duration {
        Duration::from_secs(self.command_start_secs)
    }

    pub fn signal(&self) -> Duration {
        Duration::from_secs(self.signal_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http_secs)
    }

    /// Validate the timeout settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("pod_start", self.pod_start_secs),
            ("pod_stop", self.pod_stop_secs),
            ("command_start", self.command_start_secs),
            ("signal", self.signal_secs),
            ("window", self.window_secs),
            ("http", self.http_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        Ok(())
    }
}

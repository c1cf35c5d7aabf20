//! Pod handle: one live pod and its attach/exec/remove surface, plus the
//! construction of pod objects from the configured template.

use crate::client::{retry_with_backoff, ClusterContext, ClusterExecution, ClusterPod};
use crate::codes;
use crate::config::{ExecutionMode, PodConfig};
use crate::error::{ClientError, ClientResult};
use crate::exec::KubeExecution;
use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{EnvVar, Pod};
use kube::api::{AttachParams, DeleteParams};
use kube::runtime::{watcher, WatchStreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Restart policy forced onto session-mode pods without one.
const RESTART_POLICY_NEVER: &str = "Never";

/// One pod created for a connection or session.
pub(crate) struct KubePod {
    ctx: Arc<ClusterContext>,
    name: String,
    container: String,
    tty: Option<bool>,
    /// The effective pod object; replaced once the pod becomes available.
    pod: Pod,
}

impl KubePod {
    pub(crate) fn from_created(
        ctx: Arc<ClusterContext>,
        created: Pod,
        tty: Option<bool>,
    ) -> ClientResult<Self> {
        let name = created
            .metadata
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ClientError::PodCreateFailed("created pod has no name".to_string()))?;
        let container = ctx.config.pod.console_container_name().to_string();
        Ok(Self {
            ctx,
            name,
            container,
            tty,
            pod: created,
        })
    }

    fn namespace(&self) -> &str {
        self.pod.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Watch the single named pod until it is available: Running with a Ready
    /// condition, or already terminal (Succeeded/Failed, left to the caller
    /// to judge). Observing a delete during the wait is an error.
    pub(crate) async fn wait_available(&mut self, deadline: Instant) -> ClientResult<()> {
        debug!(
            code = codes::POD_WAIT,
            pod = %self.name,
            namespace = self.namespace(),
            "waiting for pod to become available"
        );
        self.ctx.metrics.request();

        let watch_config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let stream = watcher(self.ctx.api.clone(), watch_config).default_backoff();
        futures::pin_mut!(stream);

        let wait = async {
            loop {
                match stream.try_next().await {
                    Ok(Some(watcher::Event::Apply(pod)))
                    | Ok(Some(watcher::Event::InitApply(pod))) => {
                        if is_available(&pod) {
                            return Ok(pod);
                        }
                    }
                    Ok(Some(watcher::Event::Delete(_))) => return Err(ClientError::PodDeleted),
                    Ok(Some(watcher::Event::Init)) | Ok(Some(watcher::Event::InitDone)) => {}
                    Ok(None) => {
                        return Err(ClientError::PodWaitFailed(
                            "watch stream ended".to_string(),
                        ))
                    }
                    Err(e) => {
                        warn!(code = codes::POD_WAIT, pod = %self.name, error = %e, "pod watch interrupted, retrying");
                    }
                }
            }
        };

        match tokio::time::timeout_at(deadline, wait).await {
            Ok(Ok(pod)) => {
                self.pod = pod;
                Ok(())
            }
            Ok(Err(e)) => {
                self.ctx.metrics.failure();
                warn!(code = codes::POD_WAIT_FAILED, pod = %self.name, error = %e, "failed to wait for pod");
                Err(e)
            }
            Err(_) => {
                self.ctx.metrics.failure();
                let err = ClientError::PodWaitFailed("deadline exceeded".to_string());
                warn!(code = codes::POD_WAIT_FAILED, pod = %self.name, error = %err, "failed to wait for pod");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ClusterPod for KubePod {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attach(&self) -> ClientResult<Arc<dyn ClusterExecution>> {
        let tty = self.tty.unwrap_or(false);
        debug!(code = codes::POD_ATTACH, pod = %self.name, tty, "attaching to pod console");
        // Stderr is disabled with a tty: the stream carries a single
        // multiplexed pty in that case.
        let params = AttachParams::default()
            .container(self.container.clone())
            .stdin(true)
            .stdout(true)
            .stderr(!tty)
            .tty(tty);
        self.ctx.throttle.acquire().await;
        self.ctx.metrics.request();
        let process = self.ctx.api.attach(&self.name, &params).await.map_err(|e| {
            self.ctx.metrics.failure();
            let err = ClientError::AttachFailed(e.to_string());
            warn!(code = err.code(), pod = %self.name, error = %err, "attach failed");
            err
        })?;
        Ok(Arc::new(KubeExecution::new(
            Arc::clone(&self.ctx),
            self.name.clone(),
            self.container.clone(),
            tty,
            process,
        )))
    }

    async fn create_exec(
        &self,
        program: Vec<String>,
        env: &BTreeMap<String, String>,
        tty: bool,
    ) -> ClientResult<Arc<dyn ClusterExecution>> {
        let command = if self.ctx.config.pod.agent_enabled() {
            agent_exec_command(&self.ctx.config.pod, program, env)
        } else {
            program
        };
        debug!(code = codes::EXEC, pod = %self.name, tty, "creating execution");
        let params = AttachParams::default()
            .container(self.container.clone())
            .stdin(true)
            .stdout(true)
            .stderr(!tty)
            .tty(tty);
        self.ctx.throttle.acquire().await;
        self.ctx.metrics.request();
        let process = self
            .ctx
            .api
            .exec(&self.name, command, &params)
            .await
            .map_err(|e| {
                self.ctx.metrics.failure();
                let err = ClientError::ExecFailed(e.to_string());
                warn!(code = err.code(), pod = %self.name, error = %err, "exec failed");
                err
            })?;
        Ok(Arc::new(KubeExecution::new(
            Arc::clone(&self.ctx),
            self.name.clone(),
            self.container.clone(),
            tty,
            process,
        )))
    }

    async fn remove(&self, deadline: Instant) -> ClientResult<()> {
        debug!(
            code = codes::POD_REMOVE,
            pod = %self.name,
            namespace = self.namespace(),
            "removing pod"
        );
        let http = self.ctx.config.timeouts.http();
        let ctx = Arc::clone(&self.ctx);
        let name = self.name.clone();
        retry_with_backoff(
            deadline,
            &self.ctx.metrics,
            codes::POD_REMOVE_FAILED,
            "remove pod",
            move || {
                let ctx = Arc::clone(&ctx);
                let name = name.clone();
                async move {
                    ctx.throttle.acquire().await;
                    match tokio::time::timeout(http, ctx.api.delete(&name, &DeleteParams::default()))
                        .await
                    {
                        Ok(result) => result.map(|_| ()).map_err(|e| e.to_string()),
                        Err(_) => Err("HTTP call timed out".to_string()),
                    }
                }
            },
        )
        .await
        .map_err(|last_error| {
            let err = ClientError::PodRemoveFailed(last_error);
            warn!(code = err.code(), pod = %self.name, error = %err, "giving up on pod removal");
            err
        })?;
        info!(code = codes::POD_REMOVE_SUCCESSFUL, pod = %self.name, "pod removed");
        Ok(())
    }
}

/// Whether the watched pod counts as available.
fn is_available(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    match status.phase.as_deref() {
        // Terminal phases end the wait; the caller decides what a dead pod
        // means for the session.
        Some("Succeeded") | Some("Failed") => true,
        Some("Running") => status
            .conditions
            .as_ref()
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            }),
        _ => false,
    }
}

/// Build the pod object to create by deep-copying the configured template
/// and mutating the console container for the requested mode.
pub(crate) fn build_pod(
    pod_config: &PodConfig,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    env: &BTreeMap<String, String>,
    tty: Option<bool>,
    cmd: Option<&[String]>,
) -> Pod {
    let mut metadata = pod_config.metadata.clone();
    let mut spec = pod_config.spec.clone();
    let console = pod_config.console_container_number;

    match pod_config.mode {
        ExecutionMode::Session => {
            let container = &mut spec.containers[console];
            if let Some(tty) = tty {
                container.tty = Some(tty);
                container.stdin = Some(true);
                container.stdin_once = Some(true);
            }
            if pod_config.agent_enabled() {
                container.command =
                    Some(agent_console_command(pod_config, cmd.unwrap_or_default()));
            } else {
                container.command = cmd.map(<[String]>::to_vec);
            }
            if spec.restart_policy.is_none() {
                spec.restart_policy = Some(RESTART_POLICY_NEVER.to_string());
            }
        }
        ExecutionMode::Connection => {
            spec.containers[console].command = Some(pod_config.idle_command.clone());
        }
    }

    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));

    let container_env = spec.containers[console].env.get_or_insert_with(Vec::new);
    for (name, value) in env {
        container_env.push(EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        });
    }

    Pod {
        metadata,
        spec: Some(spec),
        status: None,
    }
}

/// Wrap the session-mode main command in the guest agent invocation. The
/// agent holds the program until a NUL byte arrives on stdin and reports the
/// spawned PID before any program output.
fn agent_console_command(pod_config: &PodConfig, cmd: &[String]) -> Vec<String> {
    let mut command = vec![
        pod_config.agent_path.clone(),
        "console".to_string(),
        "--wait".to_string(),
        "--pid".to_string(),
        "--".to_string(),
    ];
    command.extend(cmd.iter().cloned());
    command
}

/// Wrap an exec program in the guest agent invocation, carrying the
/// environment as explicit flags.
fn agent_exec_command(
    pod_config: &PodConfig,
    program: Vec<String>,
    env: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut command = vec![
        pod_config.agent_path.clone(),
        "console".to_string(),
        "--pid".to_string(),
    ];
    for (name, value) in env {
        command.push("--env".to_string());
        command.push(format!("{name}={value}"));
    }
    command.push("--".to_string());
    command.extend(program);
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn running_pod(ready: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn test_is_available_running_ready() {
        assert!(is_available(&running_pod(true)));
        assert!(!is_available(&running_pod(false)));
    }

    #[test]
    fn test_is_available_terminal_phases() {
        for phase in ["Succeeded", "Failed"] {
            let pod = Pod {
                status: Some(PodStatus {
                    phase: Some(phase.to_string()),
                    ..PodStatus::default()
                }),
                ..Pod::default()
            };
            assert!(is_available(&pod), "{phase} should end the wait");
        }
    }

    #[test]
    fn test_is_available_pending() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..PodStatus::default()
            }),
            ..Pod::default()
        };
        assert!(!is_available(&pod));
        assert!(!is_available(&Pod::default()));
    }

    #[test]
    fn test_agent_console_command() {
        let config = Config::default();
        let command = agent_console_command(&config.pod, &strings(&["/bin/bash", "-l"]));
        assert_eq!(
            command,
            strings(&[
                "/usr/bin/portcullis-agent",
                "console",
                "--wait",
                "--pid",
                "--",
                "/bin/bash",
                "-l"
            ])
        );
    }

    #[test]
    fn test_agent_exec_command_carries_env() {
        let config = Config::default();
        let env = BTreeMap::from([
            ("MESSAGE".to_string(), "Hello world!".to_string()),
            ("TERM".to_string(), "xterm".to_string()),
        ]);
        let command = agent_exec_command(&config.pod, strings(&["/usr/bin/env"]), &env);
        assert_eq!(
            command,
            strings(&[
                "/usr/bin/portcullis-agent",
                "console",
                "--pid",
                "--env",
                "MESSAGE=Hello world!",
                "--env",
                "TERM=xterm",
                "--",
                "/usr/bin/env"
            ])
        );
    }

    #[test]
    fn test_build_pod_connection_mode_forces_idle_command() {
        let config = Config::default();
        let pod = build_pod(
            &config.pod,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            None,
            None,
        );
        let spec = pod.spec.unwrap();
        assert_eq!(
            spec.containers[0].command.as_ref().unwrap(),
            &config.pod.idle_command
        );
        assert!(spec.containers[0].tty.is_none());
        assert!(spec.containers[0].stdin.is_none());
        assert!(spec.restart_policy.is_none());
    }

    #[test]
    fn test_build_pod_session_mode_with_agent() {
        let mut config = Config::default();
        config.pod.mode = ExecutionMode::Session;
        let pod = build_pod(
            &config.pod,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            Some(true),
            Some(&strings(&["/bin/sh", "-c", "exit 42"])),
        );
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];
        assert_eq!(container.tty, Some(true));
        assert_eq!(container.stdin, Some(true));
        assert_eq!(container.stdin_once, Some(true));
        let command = container.command.as_ref().unwrap();
        assert_eq!(command[0], "/usr/bin/portcullis-agent");
        assert_eq!(command[1], "console");
        assert!(command.contains(&"--wait".to_string()));
        assert_eq!(&command[command.len() - 3..], &strings(&["/bin/sh", "-c", "exit 42"])[..]);
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn test_build_pod_session_mode_without_agent() {
        let mut config = Config::default();
        config.pod.mode = ExecutionMode::Session;
        config.pod.disable_agent = true;
        let pod = build_pod(
            &config.pod,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            None,
            Some(&strings(&["/usr/bin/true"])),
        );
        let spec = pod.spec.unwrap();
        assert_eq!(
            spec.containers[0].command.as_ref().unwrap(),
            &strings(&["/usr/bin/true"])
        );
        assert!(spec.containers[0].tty.is_none());
    }

    #[test]
    fn test_build_pod_session_mode_keeps_explicit_restart_policy() {
        let mut config = Config::default();
        config.pod.mode = ExecutionMode::Session;
        config.pod.spec.restart_policy = Some("Never".to_string());
        let pod = build_pod(
            &config.pod,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            None,
            None,
        );
        assert_eq!(pod.spec.unwrap().restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn test_build_pod_merges_labels_and_annotations() {
        let mut config = Config::default();
        config.pod.metadata.labels =
            Some(BTreeMap::from([("app".to_string(), "guest".to_string())]));
        let labels = BTreeMap::from([(
            "containerssh_connection_id".to_string(),
            "abc123".to_string(),
        )]);
        let annotations =
            BTreeMap::from([("containerssh_ip".to_string(), "127.0.0.1".to_string())]);
        let pod = build_pod(
            &config.pod,
            &labels,
            &annotations,
            &BTreeMap::new(),
            None,
            None,
        );
        let meta_labels = pod.metadata.labels.unwrap();
        assert_eq!(meta_labels.get("app").map(String::as_str), Some("guest"));
        assert_eq!(
            meta_labels
                .get("containerssh_connection_id")
                .map(String::as_str),
            Some("abc123")
        );
        assert_eq!(
            pod.metadata
                .annotations
                .unwrap()
                .get("containerssh_ip")
                .map(String::as_str),
            Some("127.0.0.1")
        );
    }

    #[test]
    fn test_build_pod_appends_env() {
        let config = Config::default();
        let env = BTreeMap::from([("MESSAGE".to_string(), "Hello world!".to_string())]);
        let pod = build_pod(
            &config.pod,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &env,
            None,
            None,
        );
        let containers = pod.spec.unwrap().containers;
        let container_env = containers[0].env.as_ref().unwrap();
        assert_eq!(container_env.len(), 1);
        assert_eq!(container_env[0].name, "MESSAGE");
        assert_eq!(container_env[0].value.as_deref(), Some("Hello world!"));
    }

    #[test]
    fn test_build_pod_respects_console_container_number() {
        let mut config = Config::default();
        config.pod.spec.containers.push(
            k8s_openapi::api::core::v1::Container {
                name: "sidecar".to_string(),
                image: Some("example/sidecar".to_string()),
                ..Default::default()
            },
        );
        config.pod.console_container_number = 1;
        let pod = build_pod(
            &config.pod,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            None,
            None,
        );
        let spec = pod.spec.unwrap();
        assert_eq!(
            spec.containers[1].command.as_ref().unwrap(),
            &config.pod.idle_command
        );
        assert!(spec.containers[0].command.is_none());
    }
}

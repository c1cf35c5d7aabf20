//! Cluster client: the capability to create, watch and remove pods and to
//! open executions inside them.
//!
//! The handlers only ever see the traits defined here; the kube-backed
//! implementation lives alongside so tests can substitute their own cluster.

use crate::codes;
use crate::config::{Config, ConnectionConfig};
use crate::error::{ClientError, ClientResult, SignalError};
use crate::metrics::BackendMetrics;
use crate::pod::{build_pod, KubePod};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::header::{HeaderValue, USER_AGENT};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::client::ClientBuilder;
use kube::config::{KubeConfigOptions, Kubeconfig};
use portcullis_sshserver::{ExitStatus, SessionStreams};
use secrecy::ExposeSecret;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower_http::set_header::SetRequestHeaderLayer;
use tracing::{debug, error, warn};

/// Delay between attempts of a failed cluster call.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// User agent presented to the apiserver.
const USER_AGENT_VALUE: &str = "ContainerSSH";

/// Capability to create pods in the cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create and start the configured pod. The returned handle must be
    /// removed by the caller, even when a later step fails.
    ///
    /// `tty` and `cmd` only matter in session mode, where the program is the
    /// pod's main process; connection mode runs the configured idle command.
    async fn create_pod(
        &self,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        env: &BTreeMap<String, String>,
        tty: Option<bool>,
        cmd: Option<Vec<String>>,
        deadline: Instant,
    ) -> ClientResult<Arc<dyn ClusterPod>>;
}

/// One live pod.
#[async_trait]
pub trait ClusterPod: Send + Sync {
    /// The pod name assigned by the cluster.
    fn name(&self) -> &str;

    /// Attach to the console container's main process.
    async fn attach(&self) -> ClientResult<Arc<dyn ClusterExecution>>;

    /// Start `program` in the console container via the exec facility.
    async fn create_exec(
        &self,
        program: Vec<String>,
        env: &BTreeMap<String, String>,
        tty: bool,
    ) -> ClientResult<Arc<dyn ClusterExecution>>;

    /// Remove the pod, retrying until `deadline`.
    async fn remove(&self, deadline: Instant) -> ClientResult<()>;
}

/// One running process inside a pod.
#[async_trait]
pub trait ClusterExecution: Send + Sync {
    /// Stream stdio between the session channel and the process until the
    /// process finishes; returns its exit status. Consumes the execution:
    /// a second call reports a stream failure.
    async fn run(&self, streams: SessionStreams) -> ExitStatus;

    /// Deliver a new terminal size. Only the latest size matters; pending
    /// sizes are overwritten.
    async fn resize(&self, rows: u16, cols: u16) -> ClientResult<()>;

    /// Deliver `signal` (without `SIG` prefix) to the process.
    async fn signal(&self, signal: &str) -> Result<(), SignalError>;

    /// Best-effort SIGTERM, used by the graceful shutdown path.
    async fn term(&self);

    /// Best-effort SIGKILL, used by the forced cleanup path.
    async fn kill(&self);

    /// Wait until the process has finished and its exit status was computed.
    async fn done(&self);

    /// Whether the process has already finished.
    fn is_done(&self) -> bool;
}

/// Shared plumbing handed to every pod and execution handle.
pub(crate) struct ClusterContext {
    pub(crate) api: Api<Pod>,
    pub(crate) config: Arc<Config>,
    pub(crate) metrics: Arc<BackendMetrics>,
    pub(crate) throttle: Throttle,
}

/// Kube-backed cluster client.
pub struct KubeClusterClient {
    ctx: Arc<ClusterContext>,
}

impl KubeClusterClient {
    /// Build a client for the configured cluster. Validates that the
    /// connection configuration can actually be turned into a working client.
    pub async fn connect(
        config: Arc<Config>,
        metrics: Arc<BackendMetrics>,
    ) -> ClientResult<Self> {
        let namespace = config
            .pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let client = build_client(&config.connection, config.timeouts.http()).await?;
        let api: Api<Pod> = Api::namespaced(client, &namespace);
        let throttle = Throttle::new(config.connection.qps, config.connection.burst);
        Ok(Self {
            ctx: Arc::new(ClusterContext {
                api,
                config,
                metrics,
                throttle,
            }),
        })
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_pod(
        &self,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        env: &BTreeMap<String, String>,
        tty: Option<bool>,
        cmd: Option<Vec<String>>,
        deadline: Instant,
    ) -> ClientResult<Arc<dyn ClusterPod>> {
        let template = build_pod(
            &self.ctx.config.pod,
            labels,
            annotations,
            env,
            tty,
            cmd.as_deref(),
        );
        debug!(
            code = codes::POD_CREATE,
            namespace = template.metadata.namespace.as_deref().unwrap_or_default(),
            "creating pod"
        );

        let http = self.ctx.config.timeouts.http();
        let ctx = Arc::clone(&self.ctx);
        let created = retry_with_backoff(
            deadline,
            &self.ctx.metrics,
            codes::POD_CREATE_FAILED,
            "create pod",
            move || {
                let ctx = Arc::clone(&ctx);
                let pod = template.clone();
                async move {
                    ctx.throttle.acquire().await;
                    match tokio::time::timeout(http, ctx.api.create(&PostParams::default(), &pod))
                        .await
                    {
                        Ok(result) => result.map_err(|e| e.to_string()),
                        Err(_) => Err("HTTP call timed out".to_string()),
                    }
                }
            },
        )
        .await
        .map_err(|last_error| {
            let err = ClientError::PodCreateFailed(last_error);
            error!(code = err.code(), error = %err, "giving up on pod creation");
            err
        })?;

        let mut pod = KubePod::from_created(Arc::clone(&self.ctx), created, tty)?;
        pod.wait_available(deadline).await?;
        Ok(Arc::new(pod))
    }
}

/// Run `attempt` until it succeeds or `deadline` passes, sleeping
/// [`RETRY_DELAY`] between attempts. Increments the request counter per
/// attempt and the failure counter per failed attempt. On expiry the last
/// error description is returned.
pub(crate) async fn retry_with_backoff<T, E, F, Fut>(
    deadline: Instant,
    metrics: &BackendMetrics,
    code: &'static str,
    what: &'static str,
    mut attempt: F,
) -> Result<T, String>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut last_error = "timeout".to_string();
    loop {
        metrics.request();
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                metrics.failure();
                warn!(code = code, error = %e, "failed to {}, retrying in 10 seconds", what);
                last_error = e.to_string();
            }
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Err(last_error),
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }
    }
}

/// Token bucket enforcing the configured QPS/burst against the apiserver.
///
/// A non-positive QPS disables throttling.
pub(crate) struct Throttle {
    state: Option<tokio::sync::Mutex<ThrottleState>>,
    qps: f64,
    burst: f64,
}

struct ThrottleState {
    tokens: f64,
    refilled: Instant,
}

impl Throttle {
    pub(crate) fn new(qps: f32, burst: u32) -> Self {
        let enabled = qps > 0.0;
        Self {
            state: enabled.then(|| {
                tokio::sync::Mutex::new(ThrottleState {
                    tokens: burst.max(1) as f64,
                    refilled: Instant::now(),
                })
            }),
            qps: f64::from(qps),
            burst: f64::from(burst.max(1)),
        }
    }

    /// Take one token, waiting for the bucket to refill when empty.
    pub(crate) async fn acquire(&self) {
        let Some(state) = &self.state else { return };
        loop {
            let wait = {
                let mut state = state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.refilled).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
                state.refilled = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.qps))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Build a kube client from the connection configuration.
///
/// The configuration is expressed as a kubeconfig document so path- and
/// inline-PEM credentials go through the same loading code the rest of the
/// ecosystem uses. Inline PEM material is base64-encoded on the way in, as
/// kubeconfig data fields require.
pub(crate) async fn build_client(
    conn: &ConnectionConfig,
    http_timeout: Duration,
) -> ClientResult<kube::Client> {
    let kubeconfig = kubeconfig_for(conn)?;
    let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ClientError::Config(e.to_string()))?;
    config.connect_timeout = Some(http_timeout);

    let client = ClientBuilder::try_from(config)
        .map_err(|e| ClientError::Config(e.to_string()))?
        .with_layer(&SetRequestHeaderLayer::overriding(
            USER_AGENT,
            HeaderValue::from_static(USER_AGENT_VALUE),
        ))
        .build();
    Ok(client)
}

/// Express the connection configuration as a single-context kubeconfig.
fn kubeconfig_for(conn: &ConnectionConfig) -> ClientResult<Kubeconfig> {
    const NAME: &str = "portcullis";

    let document = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": NAME,
            "cluster": {
                "server": server_url(&conn.host),
                "insecure-skip-tls-verify": conn.insecure,
                "certificate-authority": conn.cacert_file,
                "certificate-authority-data":
                    conn.cacert.as_ref().map(|pem| BASE64.encode(pem)),
                "tls-server-name": conn.server_name,
            },
        }],
        "users": [{
            "name": NAME,
            "user": {
                "username": conn.username,
                "password": conn.password.as_ref().map(|p| p.expose_secret().to_string()),
                "token": conn.bearer_token.as_ref().map(|t| t.expose_secret().to_string()),
                "tokenFile": conn.bearer_token_file,
                "client-certificate": conn.cert_file,
                "client-certificate-data": conn.cert.as_ref().map(|pem| BASE64.encode(pem)),
                "client-key": conn.key_file,
                "client-key-data":
                    conn.key.as_ref().map(|pem| BASE64.encode(pem.expose_secret())),
            },
        }],
        "contexts": [{
            "name": NAME,
            "context": { "cluster": NAME, "user": NAME },
        }],
        "current-context": NAME,
    });
    serde_json::from_value(document).map_err(|e| ClientError::Config(e.to_string()))
}

/// Turn the configured host into a server URL. Plain `host` or `host:port`
/// values default to HTTPS.
fn server_url(host: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

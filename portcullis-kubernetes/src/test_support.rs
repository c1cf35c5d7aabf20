//! Shared test scaffolding: an in-memory cluster so handler behavior can be
//! exercised without a real apiserver.

use crate::client::{ClusterClient, ClusterExecution, ClusterPod};
use crate::config::Config;
use crate::connection::ConnectionHandler;
use crate::error::{ClientError, ClientResult, SignalError};
use async_trait::async_trait;
use portcullis_sshserver::{ExitStatus, SessionStreams};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;

/// Scripted behavior for the next execution handed out by the mock cluster.
#[derive(Clone)]
pub(crate) struct ExecScript {
    pub exit_code: ExitStatus,
    pub stdout: Vec<u8>,
    /// Keep the program "running" until [`MockExecution::release`] is called.
    pub hold: bool,
    /// Reported PID; 0 means the agent never framed one.
    pub pid: u32,
    pub fail_resize: bool,
}

impl Default for ExecScript {
    fn default() -> Self {
        Self {
            exit_code: 0,
            stdout: Vec::new(),
            hold: false,
            pid: 0,
            fail_resize: false,
        }
    }
}

/// In-memory stand-in for the cluster client.
pub(crate) struct MockCluster {
    scripts: Arc<Mutex<VecDeque<ExecScript>>>,
    pods: Mutex<Vec<Arc<MockPod>>>,
    create_failures: AtomicU32,
    counter: AtomicU32,
}

impl MockCluster {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            pods: Mutex::new(Vec::new()),
            create_failures: AtomicU32::new(0),
            counter: AtomicU32::new(0),
        })
    }

    /// Script the next execution.
    pub(crate) async fn push_script(&self, script: ExecScript) {
        self.scripts.lock().await.push_back(script);
    }

    /// Make the next `n` pod creations fail.
    pub(crate) fn fail_creates(&self, n: u32) {
        self.create_failures.store(n, Ordering::SeqCst);
    }

    pub(crate) async fn pods(&self) -> Vec<Arc<MockPod>> {
        self.pods.lock().await.clone()
    }

    /// Pods that were created and not yet removed.
    pub(crate) async fn alive_pods(&self) -> usize {
        self.pods
            .lock()
            .await
            .iter()
            .filter(|pod| !pod.removed.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn create_pod(
        &self,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        env: &BTreeMap<String, String>,
        tty: Option<bool>,
        cmd: Option<Vec<String>>,
        _deadline: Instant,
    ) -> ClientResult<Arc<dyn ClusterPod>> {
        if self.create_failures.load(Ordering::SeqCst) > 0 {
            self.create_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ClientError::PodCreateFailed("injected failure".to_string()));
        }
        let pod = Arc::new(MockPod {
            name: format!("mock-{}", self.counter.fetch_add(1, Ordering::SeqCst)),
            labels: labels.clone(),
            annotations: annotations.clone(),
            env: env.clone(),
            tty,
            cmd,
            removed: AtomicBool::new(false),
            remove_calls: AtomicU32::new(0),
            fail_remove: AtomicBool::new(false),
            scripts: Arc::clone(&self.scripts),
            execs: Mutex::new(Vec::new()),
        });
        self.pods.lock().await.push(Arc::clone(&pod));
        Ok(pod)
    }
}

/// One pod created through the mock cluster.
pub(crate) struct MockPod {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    #[allow(dead_code)]
    pub env: BTreeMap<String, String>,
    pub tty: Option<bool>,
    pub cmd: Option<Vec<String>>,
    pub removed: AtomicBool,
    pub remove_calls: AtomicU32,
    pub fail_remove: AtomicBool,
    scripts: Arc<Mutex<VecDeque<ExecScript>>>,
    pub execs: Mutex<Vec<Arc<MockExecution>>>,
}

impl MockPod {
    async fn next_execution(
        &self,
        program: Option<Vec<String>>,
        env: BTreeMap<String, String>,
        tty: bool,
    ) -> Arc<MockExecution> {
        let script = self.scripts.lock().await.pop_front().unwrap_or_default();
        let (done, _) = watch::channel(false);
        let exec = Arc::new(MockExecution {
            script,
            program,
            env,
            tty,
            resizes: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            release: Notify::new(),
            done,
        });
        self.execs.lock().await.push(Arc::clone(&exec));
        exec
    }
}

#[async_trait]
impl ClusterPod for MockPod {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attach(&self) -> ClientResult<Arc<dyn ClusterExecution>> {
        let exec = self
            .next_execution(None, BTreeMap::new(), self.tty.unwrap_or(false))
            .await;
        Ok(exec)
    }

    async fn create_exec(
        &self,
        program: Vec<String>,
        env: &BTreeMap<String, String>,
        tty: bool,
    ) -> ClientResult<Arc<dyn ClusterExecution>> {
        let exec = self.next_execution(Some(program), env.clone(), tty).await;
        Ok(exec)
    }

    async fn remove(&self, _deadline: Instant) -> ClientResult<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(ClientError::PodRemoveFailed("injected failure".to_string()));
        }
        self.removed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One scripted execution.
pub(crate) struct MockExecution {
    script: ExecScript,
    /// Program recorded by `create_exec`; `None` for attach.
    pub program: Option<Vec<String>>,
    #[allow(dead_code)]
    pub env: BTreeMap<String, String>,
    #[allow(dead_code)]
    pub tty: bool,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    /// Attempted signals, recorded before any delivery check.
    pub signals: Mutex<Vec<String>>,
    release: Notify,
    done: watch::Sender<bool>,
}

impl MockExecution {
    /// Let a held execution finish.
    pub(crate) fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl ClusterExecution for MockExecution {
    async fn run(&self, streams: SessionStreams) -> ExitStatus {
        let SessionStreams {
            stdin,
            mut stdout,
            stderr,
        } = streams;
        drop(stdin);
        drop(stderr);
        if !self.script.stdout.is_empty() {
            let _ = stdout.write_all(&self.script.stdout).await;
        }
        let _ = stdout.shutdown().await;
        if self.script.hold {
            self.release.notified().await;
        }
        let _ = self.done.send(true);
        self.script.exit_code
    }

    async fn resize(&self, rows: u16, cols: u16) -> ClientResult<()> {
        if self.script.fail_resize {
            return Err(ClientError::ResizeFailed("injected failure".to_string()));
        }
        self.resizes.lock().await.push((rows, cols));
        Ok(())
    }

    async fn signal(&self, signal: &str) -> Result<(), SignalError> {
        self.signals.lock().await.push(signal.to_string());
        // Same precedence as the real execution: a missing PID is reported
        // before the already-exited state.
        if self.script.pid == 0 {
            return Err(SignalError::NoPid);
        }
        if self.is_done() {
            return Err(SignalError::Exited);
        }
        Ok(())
    }

    async fn term(&self) {
        let _ = self.signal("TERM").await;
    }

    async fn kill(&self) {
        let _ = self.signal("KILL").await;
    }

    async fn done(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn is_done(&self) -> bool {
        *self.done.borrow()
    }
}

/// Session streams plus the client-side ends to drive them.
pub(crate) struct TestStreams {
    #[allow(dead_code)]
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    #[allow(dead_code)]
    pub stderr: DuplexStream,
}

pub(crate) fn test_streams() -> (SessionStreams, TestStreams) {
    let (client_stdin, backend_stdin) = tokio::io::duplex(4096);
    let (backend_stdout, client_stdout) = tokio::io::duplex(4096);
    let (backend_stderr, client_stderr) = tokio::io::duplex(4096);
    (
        SessionStreams {
            stdin: Box::new(backend_stdin),
            stdout: Box::new(backend_stdout),
            stderr: Box::new(backend_stderr),
        },
        TestStreams {
            stdin: client_stdin,
            stdout: client_stdout,
            stderr: client_stderr,
        },
    )
}

/// A connection handler wired to the mock cluster.
pub(crate) fn test_connection(config: Config, cluster: Arc<MockCluster>) -> ConnectionHandler {
    test_connection_from("127.0.0.1:39155", config, cluster)
}

pub(crate) fn test_connection_from(
    client_addr: &str,
    config: Config,
    cluster: Arc<MockCluster>,
) -> ConnectionHandler {
    ConnectionHandler::with_client(
        client_addr.parse().expect("test client address"),
        uuid::Uuid::new_v4().to_string(),
        Arc::new(config),
        cluster,
    )
}

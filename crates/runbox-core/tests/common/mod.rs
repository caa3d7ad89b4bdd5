#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use runbox_core::wire;
use runbox_core::{ContainerRuntime, SandboxError};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// What a mock worker received for one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceivedJob {
    pub command: String,
    pub args: Vec<String>,
    pub mapping: BTreeMap<String, i64>,
    pub cwd: String,
    pub files: Vec<String>,
    pub has_app: bool,
}

/// How a mock worker answers a job.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum WorkerBehavior {
    /// Zip of stdout plus one output file, exit code 0.
    #[default]
    Complete,
    /// `500 Internal Server Error` with an empty body.
    Fail,
    /// Headers and half of a result archive, then nothing.
    Stall,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MockOptions {
    /// `address()` blocks until [`MockRuntime::release_address`].
    pub gate_addresses: bool,
    /// Workers hold every job until [`MockRuntime::release_job`].
    pub gate_jobs: bool,
    pub behavior: WorkerBehavior,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    addresses: HashMap<String, String>,
    servers: HashMap<String, JoinHandle<()>>,
    created: Vec<String>,
    removed: Vec<String>,
}

#[derive(Clone)]
struct WorkerContext {
    job_gate: Arc<Semaphore>,
    received: Arc<Mutex<Vec<ReceivedJob>>>,
    behavior: Arc<Mutex<WorkerBehavior>>,
}

/// In-memory container runtime. Starting a "container" spawns an axum mock
/// worker on an ephemeral local port.
pub struct MockRuntime {
    state: Mutex<MockState>,
    started_tx: mpsc::UnboundedSender<String>,
    started_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    address_gate: Arc<Semaphore>,
    worker: WorkerContext,
}

impl MockRuntime {
    pub fn new(options: MockOptions) -> Arc<Self> {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        let open = |gated: bool| {
            Arc::new(Semaphore::new(if gated { 0 } else { Semaphore::MAX_PERMITS }))
        };
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            started_tx,
            started_rx: tokio::sync::Mutex::new(started_rx),
            address_gate: open(options.gate_addresses),
            worker: WorkerContext {
                job_gate: open(options.gate_jobs),
                received: Arc::new(Mutex::new(Vec::new())),
                behavior: Arc::new(Mutex::new(options.behavior)),
            },
        })
    }

    /// Address of the next worker that starts listening.
    pub async fn next_started(&self) -> String {
        let mut rx = self.started_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no worker started in time")
            .expect("runtime dropped")
    }

    pub fn release_address(&self) {
        self.address_gate.add_permits(1);
    }

    pub fn release_job(&self) {
        self.worker.job_gate.add_permits(1);
    }

    /// Applies to jobs answered from now on, on every worker.
    pub fn set_behavior(&self, behavior: WorkerBehavior) {
        *self.worker.behavior.lock().unwrap() = behavior;
    }

    pub fn received(&self) -> Vec<ReceivedJob> {
        self.worker.received.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self) -> Result<String, SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        state.created.push(id.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let app = Router::new()
            .route("/", post(handle_job))
            .with_state(self.worker.clone());
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        {
            let mut state = self.state.lock().unwrap();
            state.addresses.insert(id.to_string(), address.clone());
            state.servers.insert(id.to_string(), server);
        }
        let _ = self.started_tx.send(address);
        Ok(())
    }

    async fn address(&self, id: &str) -> Result<String, SandboxError> {
        self.address_gate
            .acquire()
            .await
            .map_err(|e| SandboxError::Runtime(e.to_string()))?
            .forget();
        self.state
            .lock()
            .unwrap()
            .addresses
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::Runtime(format!("unknown container {}", id)))
    }

    async fn stop(&self, id: &str) -> Result<(), SandboxError> {
        if let Some(server) = self.state.lock().unwrap().servers.remove(id) {
            server.abort();
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        if let Some(server) = state.servers.remove(id) {
            server.abort();
        }
        state.removed.push(id.to_string());
        Ok(())
    }
}

async fn handle_job(State(ctx): State<WorkerContext>, mut multipart: Multipart) -> Response {
    let mut job = ReceivedJob::default();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().map(str::to_string).unwrap_or_default();
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.unwrap_or_default();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        match name.as_str() {
            wire::FIELD_COMMAND => job.command = text,
            wire::FIELD_ARGS => job.args = serde_json::from_str(&text).unwrap_or_default(),
            wire::FIELD_MAPPING => job.mapping = serde_json::from_str(&text).unwrap_or_default(),
            wire::FIELD_CWD => job.cwd = text,
            wire::FIELD_APP => job.has_app = true,
            wire::FIELD_FILES => job.files.extend(file_name),
            _ => {}
        }
    }

    let args = job.args.join(" ");
    ctx.received.lock().unwrap().push(job);
    if let Ok(permit) = ctx.job_gate.acquire().await {
        permit.forget();
    }

    let behavior = *ctx.behavior.lock().unwrap();
    if behavior == WorkerBehavior::Fail {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("stdout"), args).unwrap();
    std::fs::create_dir(dir.path().join("files")).unwrap();
    std::fs::write(dir.path().join("files").join("out.txt"), "done").unwrap();
    let archive = wire::pack_results(dir.path()).unwrap();

    match behavior {
        WorkerBehavior::Stall => {
            let half = Bytes::from(archive[..archive.len() / 2].to_vec());
            let body = stream::once(async move { Ok::<_, std::io::Error>(half) })
                .chain(stream::pending());
            Body::from_stream(body).into_response()
        }
        _ => ([(wire::EXIT_CODE_HEADER, "0")], archive).into_response(),
    }
}

/// Polls `check` until it holds, panicking after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

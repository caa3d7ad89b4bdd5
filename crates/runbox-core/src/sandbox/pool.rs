//! Container pool
//!
//! Keeps `size` workers booting or available and hands each job to exactly
//! one of them. Every dispatch consumes a handle and boots a replacement, so
//! the pool never reuses a worker. Jobs that arrive while nothing is
//! available wait in a FIFO queue and are dispatched in arrival order.
//!
//! A worker becomes available only once two things are known: the address
//! the runtime reports for its container and the worker's own readiness
//! announcement for that address. Either may come first.

use super::container::{ContainerHandle, HandleState};
use super::job::Job;
use super::runtime::ContainerRuntime;
use crate::errors::SandboxError;
use futures_util::future::join_all;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Snapshot of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub booting: usize,
    /// Booting handles whose address is known but which have not announced.
    pub awaiting_ready: usize,
    pub waiting_jobs: usize,
    /// Announcements received before the matching address was discovered.
    pub pending_announcements: usize,
}

#[derive(Default)]
struct PoolState {
    available: VecDeque<ContainerHandle>,
    booting: Vec<ContainerHandle>,
    waiting_jobs: VecDeque<Job>,
    announced: HashSet<String>,
    shutting_down: bool,
}

struct PoolInner {
    runtime: Arc<dyn ContainerRuntime>,
    client: reqwest::Client,
    size: usize,
    state: Mutex<PoolState>,
    next_seq: AtomicU64,
    booted: AtomicUsize,
}

#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("size", &self.inner.size)
            .field("booted", &self.booted_total())
            .finish()
    }
}

impl PoolManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, size: usize) -> Result<Self, SandboxError> {
        if size == 0 {
            return Err(SandboxError::InvalidPoolSize(size));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                runtime,
                client: reqwest::Client::new(),
                size,
                state: Mutex::new(PoolState::default()),
                next_seq: AtomicU64::new(1),
                booted: AtomicUsize::new(0),
            }),
        })
    }

    /// Starts booting the initial set of workers without waiting for them.
    pub fn initialize(&self) {
        log::info!("Booting {} sandbox worker(s)", self.inner.size);
        for _ in 0..self.inner.size {
            self.spawn_boot();
        }
    }

    /// Dispatches `job` right away when a worker is available, otherwise
    /// queues it behind the jobs already waiting.
    pub async fn execute_job(&self, job: Job) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            drop(state);
            job.finish(Err(SandboxError::ShuttingDown));
            return;
        }
        state.waiting_jobs.push_back(job);
        self.dispatch_locked(&mut state);
        if !state.waiting_jobs.is_empty() {
            log::debug!("{} job(s) waiting for a worker", state.waiting_jobs.len());
        }
    }

    /// Readiness announcement from a worker listening on `address`.
    pub async fn register_ready(&self, address: &str) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return;
        }

        if let Some(pos) = state
            .booting
            .iter()
            .position(|h| h.address() == Some(address))
        {
            self.promote_locked(&mut state, pos);
            return;
        }
        if state.available.iter().any(|h| h.address() == Some(address)) {
            log::debug!("Duplicate readiness announcement from {}", address);
            return;
        }
        log::debug!("Worker {} announced before its address was discovered", address);
        state.announced.insert(address.to_string());
    }

    /// Retires every idle or booting worker and fails the queued jobs.
    /// Workers busy with a job retire themselves when it ends.
    pub async fn shutdown(&self) {
        let (handles, jobs) = {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.announced.clear();
            let mut handles: Vec<ContainerHandle> = state.available.drain(..).collect();
            handles.append(&mut state.booting);
            let jobs: Vec<Job> = state.waiting_jobs.drain(..).collect();
            (handles, jobs)
        };

        log::info!(
            "Shutting down sandbox pool: retiring {} worker(s), cancelling {} job(s)",
            handles.len(),
            jobs.len()
        );
        for job in jobs {
            job.finish(Err(SandboxError::ShuttingDown));
        }
        join_all(handles.into_iter().map(|mut handle| async move {
            handle.retire().await;
        }))
        .await;
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        PoolStats {
            available: state.available.len(),
            booting: state.booting.len(),
            awaiting_ready: state
                .booting
                .iter()
                .filter(|h| h.state() == HandleState::AwaitingReady && h.address().is_some())
                .count(),
            waiting_jobs: state.waiting_jobs.len(),
            pending_announcements: state.announced.len(),
        }
    }

    /// Containers created since the pool was built.
    pub fn booted_total(&self) -> usize {
        self.inner.booted.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Pairs available handles with waiting jobs. Each pairing claims the
    /// handle, boots its replacement and starts the job as one step under
    /// the pool lock.
    fn dispatch_locked(&self, state: &mut PoolState) {
        while !state.available.is_empty() && !state.waiting_jobs.is_empty() {
            let (Some(handle), Some(job)) =
                (state.available.pop_front(), state.waiting_jobs.pop_front())
            else {
                break;
            };
            log::debug!("Dispatching job to container {}", handle.id());
            self.spawn_boot();
            tokio::spawn(handle.execute(self.inner.client.clone(), job));
        }
    }

    fn promote_locked(&self, state: &mut PoolState, pos: usize) {
        let mut handle = state.booting.remove(pos);
        if !handle.promote() {
            state.booting.insert(pos, handle);
            return;
        }
        log::info!(
            "Worker {} is available at {}",
            handle.id(),
            handle.address().unwrap_or_default()
        );
        state.available.push_back(handle);
        self.dispatch_locked(state);
    }

    fn spawn_boot(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pool.boot_container().await {
                log::error!("Failed to boot sandbox worker: {}", e);
            }
        });
    }

    async fn boot_container(&self) -> Result<(), SandboxError> {
        let runtime = self.inner.runtime.clone();
        let id = runtime.create().await?;
        self.inner.booted.fetch_add(1, Ordering::SeqCst);
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down {
                drop(state);
                ContainerHandle::new(seq, id, runtime).retire().await;
                return Ok(());
            }
            state
                .booting
                .push(ContainerHandle::new(seq, id.clone(), runtime.clone()));
        }

        if let Err(e) = runtime.start(&id).await {
            self.discard(seq).await;
            return Err(e);
        }
        {
            let mut state = self.inner.state.lock().await;
            match state.booting.iter_mut().find(|h| h.seq() == seq) {
                Some(handle) => handle.mark_started(),
                None => return Ok(()),
            }
        }

        let address = match runtime.address(&id).await {
            Ok(address) => address,
            Err(e) => {
                self.discard(seq).await;
                return Err(e);
            }
        };

        let mut state = self.inner.state.lock().await;
        let Some(pos) = state.booting.iter().position(|h| h.seq() == seq) else {
            return Ok(());
        };
        log::debug!("Container {} reachable at {}", id, address);
        state.booting[pos].set_address(address.clone());
        if state.announced.remove(&address) {
            self.promote_locked(&mut state, pos);
        }
        Ok(())
    }

    async fn discard(&self, seq: u64) {
        let handle = {
            let mut state = self.inner.state.lock().await;
            state
                .booting
                .iter()
                .position(|h| h.seq() == seq)
                .map(|pos| state.booting.remove(pos))
        };
        if let Some(mut handle) = handle {
            handle.retire().await;
        }
    }
}

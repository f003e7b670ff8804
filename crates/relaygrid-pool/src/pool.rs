//! Worker pool — warm, capped set of worker processes on one host.
//!
//! Workers live in exactly one of two queues:
//!
//! - `idle`: launched and unassigned, handed out FIFO
//! - `busy`: handed out at least once; reused round-robin only when the
//!   pool is at `max_processes`
//!
//! Each worker has a supervisor task that waits for the process to exit,
//! purges it from the pool and refills. `fill()` keeps
//! `idle + busy <= max_processes` and `idle <= prerun_processes`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use relaygrid_core::config::PoolConfig;
use relaygrid_core::{AgentId, PoolInfo, WorkerId};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::address::{self, HostAddress};
use crate::error::{PoolError, PoolResult};
use crate::launcher::{LaunchSpec, Launcher, WorkerProcess};

/// A launched worker the pool still owns.
struct TrackedWorker {
    pid: Option<u32>,
    /// Taken when the worker is dropped; a live worker always has one.
    kill: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<WorkerId>,
    busy: VecDeque<WorkerId>,
    processes: HashMap<WorkerId, TrackedWorker>,
    host: Option<HostAddress>,
    shutting_down: bool,
}

/// Worker pool of one agent.
///
/// Cloning yields another handle onto the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    agent_id: AgentId,
    config: PoolConfig,
    launcher: Arc<dyn Launcher>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(agent_id: impl Into<AgentId>, config: PoolConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                agent_id: agent_id.into(),
                config,
                launcher,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn max_processes(&self) -> usize {
        self.inner.config.max_processes
    }

    pub fn prerun_processes(&self) -> usize {
        self.inner.config.prerun_processes
    }

    /// Resolve the host address and pre-launch workers.
    ///
    /// Fails only if the address cannot be resolved.
    pub async fn start(&self) -> PoolResult<()> {
        let host = address::resolve(&self.inner.config)?;
        self.inner.state.lock().await.host = Some(host);

        self.fill().await;

        info!(
            agent_id = %self.inner.agent_id,
            max = self.max_processes(),
            prerun = self.prerun_processes(),
            "worker pool started"
        );
        Ok(())
    }

    /// Launch workers until the pool bounds are reached.
    ///
    /// A launch failure ends the round; the next exit or hand-out retries.
    pub async fn fill(&self) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return;
        }

        let max = self.max_processes();
        let prerun = self.prerun_processes();
        while state.idle.len() + state.busy.len() < max && state.idle.len() < prerun {
            match self.launch(&mut state) {
                Ok(worker_id) => state.idle.push_back(worker_id),
                Err(e) => {
                    warn!(agent_id = %self.inner.agent_id, error = %e, "worker launch failed, ending fill round");
                    break;
                }
            }
        }
    }

    /// Hand out a worker.
    ///
    /// Prefers an idle worker, then a fresh launch, then sharing the
    /// longest-busy worker. Sharing has no upper bound.
    pub async fn get_worker(&self) -> PoolResult<WorkerId> {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return Err(PoolError::ShuttingDown);
        }

        if let Some(worker_id) = state.idle.pop_front() {
            state.busy.push_back(worker_id.clone());
            debug!(%worker_id, "handing out idle worker");
            return Ok(worker_id);
        }

        let max = self.max_processes();
        let mut launch_error = None;
        if state.busy.len() < max {
            match self.launch(&mut state) {
                Ok(worker_id) => {
                    state.busy.push_back(worker_id.clone());
                    debug!(%worker_id, "handing out freshly launched worker");
                    return Ok(worker_id);
                }
                Err(e) => {
                    warn!(agent_id = %self.inner.agent_id, error = %e, "worker launch failed");
                    launch_error = Some(e);
                }
            }
        }

        if let Some(worker_id) = state.busy.pop_front() {
            state.busy.push_back(worker_id.clone());
            warn!(
                agent_id = %self.inner.agent_id,
                %worker_id,
                busy = state.busy.len(),
                max,
                "worker capacity exhausted, sharing a busy worker"
            );
            return Ok(worker_id);
        }

        Err(launch_error.unwrap_or(PoolError::NoCapacity { max }))
    }

    /// Kill a worker. Returns `false` if the pool does not know it.
    pub async fn drop_worker(&self, worker_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        state.idle.retain(|id| id != worker_id);
        state.busy.retain(|id| id != worker_id);

        let Some(kill) = state.processes.get_mut(worker_id).and_then(|w| w.kill.take()) else {
            debug!(%worker_id, "drop requested for unknown worker");
            return false;
        };
        let _ = kill.send(());
        info!(%worker_id, "worker dropped");
        true
    }

    /// Whether `worker_id` is running and has not been dropped.
    pub async fn is_worker_alive(&self, worker_id: &str) -> bool {
        let state = self.inner.state.lock().await;
        state
            .processes
            .get(worker_id)
            .is_some_and(|w| w.kill.is_some())
    }

    pub async fn info(&self) -> PoolInfo {
        let state = self.inner.state.lock().await;
        PoolInfo {
            agent_id: self.inner.agent_id.clone(),
            idle: state.idle.len(),
            busy: state.busy.len(),
            max_processes: self.max_processes(),
            prerun_processes: self.prerun_processes(),
        }
    }

    /// Kill every worker and wait for the supervisors. The pool does not
    /// refill afterwards.
    pub async fn cleanup(&self) {
        let supervisors: Vec<JoinHandle<()>> = {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;
            state.idle.clear();
            state.busy.clear();
            state
                .processes
                .values_mut()
                .filter_map(|worker| {
                    if let Some(kill) = worker.kill.take() {
                        let _ = kill.send(());
                    }
                    worker.supervisor.take()
                })
                .collect()
        };

        let count = supervisors.len();
        for supervisor in supervisors {
            let _ = supervisor.await;
        }
        info!(agent_id = %self.inner.agent_id, killed = count, "worker pool cleaned up");
    }

    /// Launch one worker and start supervising it. The caller queues it.
    fn launch(&self, state: &mut PoolState) -> PoolResult<WorkerId> {
        let host = state.host.as_ref().ok_or(PoolError::NotStarted)?;
        let worker_id = Uuid::new_v4().to_string();
        let spec = LaunchSpec {
            agent_id: self.inner.agent_id.clone(),
            worker_id: worker_id.clone(),
            private_ip: host.private_ip.clone(),
            public_ip: host.public_ip.clone(),
        };

        let process = self.inner.launcher.launch(&spec)?;
        let pid = process.pid();
        let (kill_tx, kill_rx) = oneshot::channel();

        // The supervisor needs the state lock to purge, which the caller
        // holds, so it cannot finish before the worker is tracked.
        let supervisor = tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            worker_id.clone(),
            process,
            kill_rx,
        ));

        state.processes.insert(
            worker_id.clone(),
            TrackedWorker {
                pid,
                kill: Some(kill_tx),
                supervisor: Some(supervisor),
            },
        );
        info!(agent_id = %self.inner.agent_id, %worker_id, ?pid, "worker launched");
        Ok(worker_id)
    }

    /// Forget an exited worker and refill.
    async fn handle_exit(&self, worker_id: &str) {
        let refill = {
            let mut state = self.inner.state.lock().await;
            state.idle.retain(|id| id != worker_id);
            state.busy.retain(|id| id != worker_id);
            if let Some(worker) = state.processes.remove(worker_id) {
                debug!(%worker_id, pid = ?worker.pid, "worker purged");
            }
            !state.shutting_down
        };

        if refill {
            self.fill().await;
        }
    }
}

/// Wait for a worker to exit on its own or be killed, then purge it.
///
/// A dropped pool counts as a kill request.
async fn supervise(
    pool: Weak<PoolInner>,
    worker_id: WorkerId,
    mut process: Box<dyn WorkerProcess>,
    kill_rx: oneshot::Receiver<()>,
) {
    let exited = tokio::select! {
        status = process.wait() => Some(status),
        _ = kill_rx => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = process.kill().await {
                warn!(%worker_id, error = %e, "failed to kill worker");
            }
            process.wait().await
        }
    };

    match status {
        Ok(Some(0)) => info!(%worker_id, "worker exited"),
        Ok(Some(code)) => warn!(%worker_id, code, "worker exited with error"),
        Ok(None) => info!(%worker_id, "worker terminated by signal"),
        Err(e) => warn!(%worker_id, error = %e, "failed to wait for worker"),
    }

    if let Some(inner) = pool.upgrade() {
        WorkerPool { inner }.handle_exit(&worker_id).await;
    }
}

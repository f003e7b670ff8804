//! Worker allocator — fills registry slots with workers from pool agents.
//!
//! The first caller for an empty slot marks it pending and asks the shared
//! pool queue for a worker; later callers for the same slot wait for that
//! result instead of allocating again. Retries live here, not in the RPC
//! layer.

use std::sync::Arc;

use relaygrid_bus::{agent_queue, CallOutcome, RpcEndpoint, POOL_QUEUE};
use relaygrid_core::config::SlotsConfig;
use relaygrid_core::{WorkerGrant, WorkerId};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{SlotError, SlotResult};
use crate::registry::{SlotRegistry, WorkerSlot};

/// Hands out per-position workers and keeps them alive.
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone)]
pub struct WorkerAllocator {
    registry: Arc<Mutex<SlotRegistry>>,
    endpoint: RpcEndpoint,
    config: SlotsConfig,
}

impl WorkerAllocator {
    /// `endpoint` must be connected.
    pub fn new(endpoint: RpcEndpoint, config: SlotsConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(SlotRegistry::new(config.capacity))),
            endpoint,
            config,
        }
    }

    pub fn registry(&self) -> Arc<Mutex<SlotRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Worker for `position`, allocating one if the slot is empty.
    pub async fn get_worker(&self, position: usize) -> SlotResult<WorkerGrant> {
        let waiter = {
            let mut registry = self.registry.lock().await;
            if let Some(grant) = registry.get(position).grant() {
                return Ok(grant);
            }
            if registry.is_pending(position) {
                Some(registry.on_worker_received(position))
            } else {
                registry.mark_as_pending(position);
                None
            }
        };

        if let Some(waiter) = waiter {
            debug!(position, "allocation in flight, waiting");
            return match waiter.await {
                Ok(Some(grant)) => Ok(grant),
                _ => Err(SlotError::Unavailable { position }),
            };
        }

        match self.create_worker().await {
            Ok(grant) => {
                self.registry.lock().await.set(position, grant.clone());
                info!(position, worker_id = %grant.worker_id, agent_id = %grant.agent_id, "worker allocated");
                Ok(grant)
            }
            Err(e) => {
                warn!(position, error = %e, "worker allocation failed");
                self.registry.lock().await.reset(position);
                Err(e)
            }
        }
    }

    /// Ask the pool for a worker, up to `create_attempts` times.
    async fn create_worker(&self) -> SlotResult<WorkerGrant> {
        let attempts = self.config.create_attempts.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match self.endpoint.call(POOL_QUEUE, "createWorker", Value::Null).await? {
                CallOutcome::Data(data) => {
                    if let Some(message) = data.get("error").and_then(Value::as_str) {
                        warn!(attempt, error = %message, "pool refused createWorker");
                        reason = message.to_string();
                        continue;
                    }
                    match serde_json::from_value::<WorkerGrant>(data) {
                        Ok(grant) => return Ok(grant),
                        Err(e) => {
                            warn!(attempt, error = %e, "malformed createWorker reply");
                            reason = e.to_string();
                        }
                    }
                }
                CallOutcome::Timeout => {
                    warn!(attempt, "createWorker timed out");
                    reason = "timed out".to_string();
                }
            }
        }

        Err(SlotError::CreateFailed { attempts, reason })
    }

    /// Clear `position` and drop its worker on the owning agent.
    ///
    /// An allocation in flight for `position` is awaited first and its
    /// worker released, so the slot never holds a worker nobody owns.
    ///
    /// Returns whether the agent knew the worker; `false` for empty slots.
    pub async fn release(&self, position: usize) -> SlotResult<bool> {
        let slot = loop {
            let waiter = {
                let mut registry = self.registry.lock().await;
                if !registry.is_pending(position) {
                    break registry.reset(position);
                }
                registry.on_worker_received(position)
            };
            debug!(position, "release waits for allocation in flight");
            let _ = waiter.await;
        };
        let Some(agent_id) = slot.agent_id.as_deref() else {
            return Ok(false);
        };
        let Some(worker_id) = slot.agent_worker_id() else {
            return Ok(false);
        };

        let dropped = drop_worker(&self.endpoint, agent_id, worker_id).await?;
        info!(position, %worker_id, %agent_id, dropped, "worker released");
        Ok(dropped)
    }

    /// Check every distinct worker once. Workers past the miss limit are
    /// removed from the registry and dropped; their ids are returned.
    pub async fn keepalive_sweep(&self) -> Vec<WorkerId> {
        let workers = self.registry.lock().await.unique_workers();

        let mut checks = JoinSet::new();
        for slot in workers {
            let endpoint = self.endpoint.clone();
            checks.spawn(async move {
                let alive = is_alive(&endpoint, &slot).await;
                (slot, alive)
            });
        }

        let mut expired = Vec::new();
        while let Some(joined) = checks.join_next().await {
            let Ok((slot, alive)) = joined else { continue };
            let Some(worker_id) = slot.worker_id.clone() else { continue };

            let misses = self.registry.lock().await.record_keepalive(&worker_id, alive);
            if misses > self.config.max_keepalive_misses {
                warn!(%worker_id, misses, "worker stopped answering keepalives, removing");
                self.forget(&slot, &worker_id).await;
                expired.push(worker_id);
            }
        }
        expired
    }

    /// Remove every slot holding `worker_id` and drop it on its agent.
    async fn forget(&self, slot: &WorkerSlot, worker_id: &str) {
        {
            let mut registry = self.registry.lock().await;
            while registry.delete_by_id(worker_id).is_some() {}
        }

        if let (Some(agent_id), Some(agent_worker_id)) = (slot.agent_id.as_deref(), slot.agent_worker_id()) {
            if let Err(e) = drop_worker(&self.endpoint, agent_id, agent_worker_id).await {
                debug!(%worker_id, error = %e, "drop after missed keepalives failed");
            }
        }
    }

    /// Sweep every keepalive interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.keepalive_interval();
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?period, max_misses = self.config.max_keepalive_misses, "worker keepalive started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.keepalive_sweep().await;
                }
                _ = shutdown.changed() => {
                    info!("worker keepalive shutting down");
                    break;
                }
            }
        }
    }
}

/// Ask the owning agent whether a worker is alive. Timeouts count as dead.
async fn is_alive(endpoint: &RpcEndpoint, slot: &WorkerSlot) -> bool {
    let (Some(agent_id), Some(worker_id)) = (slot.agent_id.as_deref(), slot.agent_worker_id()) else {
        return false;
    };
    match endpoint
        .call(&agent_queue(agent_id), "isWorkerAlive", json!({ "workerId": worker_id }))
        .await
    {
        Ok(CallOutcome::Data(data)) => data.as_bool().unwrap_or(false),
        Ok(CallOutcome::Timeout) => {
            debug!(%worker_id, %agent_id, "keepalive timed out");
            false
        }
        Err(e) => {
            warn!(%worker_id, error = %e, "keepalive call failed");
            false
        }
    }
}

async fn drop_worker(endpoint: &RpcEndpoint, agent_id: &str, worker_id: &str) -> SlotResult<bool> {
    let target = agent_queue(agent_id);
    match endpoint
        .call(&target, "dropWorker", json!({ "workerId": worker_id }))
        .await?
    {
        CallOutcome::Data(data) => data
            .get("dropped")
            .and_then(Value::as_bool)
            .ok_or_else(|| SlotError::Reply {
                method: "dropWorker".to_string(),
                reason: data.to_string(),
            }),
        CallOutcome::Timeout => Err(SlotError::Timeout {
            target,
            method: "dropWorker".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_bus::{error_reply, MemoryBroker, MethodTable};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Pool agent double on `relay.pool` and `relay.pool.agent-1`.
    #[derive(Default)]
    struct FakePool {
        created: AtomicU32,
        /// Number of createWorker calls to refuse first.
        refuse: AtomicU32,
        dropped: StdMutex<Vec<String>>,
        dead: StdMutex<HashSet<String>>,
    }

    async fn serve_fake_pool(broker: &MemoryBroker, pool: Arc<FakePool>, create_delay: Duration) -> RpcEndpoint {
        let endpoint = RpcEndpoint::new(Arc::new(broker.clone()));
        let mut methods = MethodTable::new();

        let p = Arc::clone(&pool);
        methods.register("createWorker", move |_| {
            let pool = Arc::clone(&p);
            async move {
                time::sleep(create_delay).await;
                if pool.refuse.load(Ordering::SeqCst) > 0 {
                    pool.refuse.fetch_sub(1, Ordering::SeqCst);
                    return error_reply("no worker capacity");
                }
                let n = pool.created.fetch_add(1, Ordering::SeqCst) + 1;
                json!({ "workerId": format!("w{n}"), "agentId": "agent-1" })
            }
        });

        let p = Arc::clone(&pool);
        methods.register("dropWorker", move |args| {
            let pool = Arc::clone(&p);
            async move {
                let id = args["workerId"].as_str().unwrap_or_default().to_string();
                pool.dropped.lock().unwrap().push(id);
                json!({ "dropped": true })
            }
        });

        let p = Arc::clone(&pool);
        methods.register("isWorkerAlive", move |args| {
            let pool = Arc::clone(&p);
            async move {
                let id = args["workerId"].as_str().unwrap_or_default();
                json!(!pool.dead.lock().unwrap().contains(id))
            }
        });

        endpoint.add_methods(methods).await;
        endpoint.bind(POOL_QUEUE).await.unwrap();
        endpoint.bind(&agent_queue("agent-1")).await.unwrap();
        endpoint
    }

    async fn setup(create_delay: Duration) -> (WorkerAllocator, Arc<FakePool>, RpcEndpoint) {
        let broker = MemoryBroker::new();
        let pool = Arc::new(FakePool::default());
        let server = serve_fake_pool(&broker, Arc::clone(&pool), create_delay).await;

        let endpoint = RpcEndpoint::new(Arc::new(broker));
        endpoint.connect().await.unwrap();
        let config = SlotsConfig {
            capacity: 10,
            ..SlotsConfig::default()
        };
        (WorkerAllocator::new(endpoint, config), pool, server)
    }

    #[tokio::test]
    async fn allocates_once_per_slot() {
        let (allocator, pool, _server) = setup(Duration::ZERO).await;

        let first = allocator.get_worker(3).await.unwrap();
        let again = allocator.get_worker(3).await.unwrap();
        let aliased = allocator.get_worker(13).await.unwrap();

        assert_eq!(first.worker_id, "w1");
        assert_eq!(again, first);
        assert_eq!(aliased, first);
        assert_eq!(pool.created.load(Ordering::SeqCst), 1);

        let other = allocator.get_worker(4).await.unwrap();
        assert_eq!(other.worker_id, "w2");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_allocation() {
        let (allocator, pool, _server) = setup(Duration::from_millis(50)).await;

        let (a, b) = tokio::join!(allocator.get_worker(7), allocator.get_worker(7));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(pool.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_requests_are_retried() {
        let (allocator, pool, _server) = setup(Duration::ZERO).await;
        pool.refuse.store(2, Ordering::SeqCst);

        let grant = allocator.get_worker(0).await.unwrap();
        assert_eq!(grant.worker_id, "w1");
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_the_slot_and_its_waiters() {
        let (allocator, pool, _server) = setup(Duration::from_millis(20)).await;
        pool.refuse.store(10, Ordering::SeqCst);

        let (first, second) = tokio::join!(allocator.get_worker(1), allocator.get_worker(1));
        assert!(matches!(first, Err(SlotError::CreateFailed { attempts: 3, .. })));
        assert!(matches!(second, Err(SlotError::Unavailable { position: 1 })));

        let registry = allocator.registry();
        let registry = registry.lock().await;
        assert!(!registry.is_pending(1));
        assert!(registry.get(1).worker_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_pool_times_out_every_attempt() {
        let broker = MemoryBroker::new();
        let endpoint = RpcEndpoint::new(Arc::new(broker));
        endpoint.connect().await.unwrap();
        let allocator = WorkerAllocator::new(endpoint, SlotsConfig::default());

        let err = allocator.get_worker(0).await.unwrap_err();
        match err {
            SlotError::CreateFailed { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, "timed out");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn release_drops_on_owning_agent() {
        let (allocator, pool, _server) = setup(Duration::ZERO).await;
        let grant = allocator.get_worker(2).await.unwrap();

        assert!(allocator.release(2).await.unwrap());
        assert_eq!(*pool.dropped.lock().unwrap(), vec![grant.worker_id]);
        assert!(allocator.registry().lock().await.get(2).worker_id.is_none());

        assert!(!allocator.release(2).await.unwrap());
    }

    #[tokio::test]
    async fn release_during_allocation_drops_the_late_worker() {
        let (allocator, pool, _server) = setup(Duration::from_millis(50)).await;

        let in_flight = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.get_worker(5).await })
        };
        time::sleep(Duration::from_millis(10)).await;

        assert!(allocator.release(5).await.unwrap());
        let first = in_flight.await.unwrap().unwrap();
        assert_eq!(*pool.dropped.lock().unwrap(), vec![first.worker_id.clone()]);

        // The slot is empty again, so the next caller gets a fresh worker.
        let second = allocator.get_worker(5).await.unwrap();
        assert_ne!(second.worker_id, first.worker_id);
        assert_eq!(pool.created.load(Ordering::SeqCst), 2);
        assert_eq!(
            allocator.registry().lock().await.get(5).worker_id.as_deref(),
            Some(second.worker_id.as_str())
        );
    }

    #[tokio::test]
    async fn callers_during_allocation_see_one_worker_despite_release() {
        let (allocator, pool, _server) = setup(Duration::from_millis(50)).await;

        let spawn_get = |allocator: WorkerAllocator| tokio::spawn(async move { allocator.get_worker(5).await });
        let first = spawn_get(allocator.clone());
        time::sleep(Duration::from_millis(5)).await;
        let second = spawn_get(allocator.clone());
        time::sleep(Duration::from_millis(5)).await;

        assert!(allocator.release(5).await.unwrap());
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(pool.created.load(Ordering::SeqCst), 1);
        assert_eq!(*pool.dropped.lock().unwrap(), vec![first.worker_id]);
        assert!(allocator.registry().lock().await.get(5).worker_id.is_none());
    }

    #[tokio::test]
    async fn release_after_failed_allocation_is_a_no_op() {
        let (allocator, pool, _server) = setup(Duration::from_millis(20)).await;
        pool.refuse.store(10, Ordering::SeqCst);

        let in_flight = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.get_worker(2).await })
        };
        time::sleep(Duration::from_millis(5)).await;

        assert!(!allocator.release(2).await.unwrap());
        assert!(in_flight.await.unwrap().is_err());
        assert!(pool.dropped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_workers_are_removed_after_miss_limit() {
        let (allocator, pool, _server) = setup(Duration::ZERO).await;
        let alive = allocator.get_worker(0).await.unwrap();
        let dead = allocator.get_worker(1).await.unwrap();
        pool.dead.lock().unwrap().insert(dead.worker_id.clone());

        // Five misses are tolerated.
        for _ in 0..5 {
            assert!(allocator.keepalive_sweep().await.is_empty());
        }
        assert_eq!(allocator.registry().lock().await.get(1).ka_count, 5);

        assert_eq!(allocator.keepalive_sweep().await, vec![dead.worker_id.clone()]);
        let registry = allocator.registry();
        let registry = registry.lock().await;
        assert!(registry.find_by_id(&dead.worker_id).is_none());
        assert_eq!(registry.get(0).grant(), Some(alive));
        drop(registry);

        assert_eq!(*pool.dropped.lock().unwrap(), vec![dead.worker_id]);
    }
}

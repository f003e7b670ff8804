//! Slot registry — fixed ring of worker slots indexed by position.
//!
//! Position `p` maps to slot `p % capacity`. Positions that differ by a
//! multiple of the capacity therefore share a slot: the second one sees the
//! first one's worker (or its pending allocation). Callers that need
//! distinct workers must keep live positions within one capacity window.
//!
//! Waiters registered with [`SlotRegistry::on_worker_received`] are told
//! exactly once, when the slot is set or reset.

use std::collections::{HashMap, HashSet};

use relaygrid_core::{AgentId, WorkerGrant, WorkerId};
use tokio::sync::oneshot;
use tracing::debug;

/// Receives the slot's worker once it is set; `None` if the allocation
/// failed.
pub type WorkerWaiter = oneshot::Receiver<Option<WorkerGrant>>;

/// One ring entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSlot {
    /// An allocation for this slot is in flight.
    pub pending: bool,
    pub worker_id: Option<WorkerId>,
    pub agent_id: Option<AgentId>,
    pub worker_id_for_agent: Option<WorkerId>,
    /// Consecutive failed keepalives.
    pub ka_count: u32,
}

impl WorkerSlot {
    /// The slot's worker, if one is set.
    pub fn grant(&self) -> Option<WorkerGrant> {
        if self.pending {
            return None;
        }
        Some(WorkerGrant {
            worker_id: self.worker_id.clone()?,
            agent_id: self.agent_id.clone()?,
            worker_id_for_agent: self.worker_id_for_agent.clone(),
        })
    }

    /// Id the owning agent knows the worker by.
    pub fn agent_worker_id(&self) -> Option<&str> {
        self.worker_id_for_agent
            .as_deref()
            .or(self.worker_id.as_deref())
    }
}

pub struct SlotRegistry {
    slots: Vec<WorkerSlot>,
    waiters: HashMap<usize, Vec<oneshot::Sender<Option<WorkerGrant>>>>,
}

impl SlotRegistry {
    /// A ring of `capacity` empty slots (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![WorkerSlot::default(); capacity.max(1)],
            waiters: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, position: usize) -> usize {
        position % self.slots.len()
    }

    pub fn get(&self, position: usize) -> &WorkerSlot {
        &self.slots[self.index(position)]
    }

    pub fn is_pending(&self, position: usize) -> bool {
        self.get(position).pending
    }

    pub fn mark_as_pending(&mut self, position: usize) {
        let index = self.index(position);
        self.slots[index].pending = true;
    }

    /// Store a worker in the slot and wake its waiters. Returns how many
    /// waiters were notified.
    pub fn set(&mut self, position: usize, grant: WorkerGrant) -> usize {
        let index = self.index(position);
        self.slots[index] = WorkerSlot {
            pending: false,
            worker_id: Some(grant.worker_id.clone()),
            agent_id: Some(grant.agent_id.clone()),
            worker_id_for_agent: grant.worker_id_for_agent.clone(),
            ka_count: 0,
        };

        let waiters = self.waiters.remove(&index).unwrap_or_default();
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Some(grant.clone()));
        }
        debug!(position, index, worker_id = %grant.worker_id, notified = count, "slot set");
        count
    }

    /// Wait for the slot's next `set` or `reset`.
    pub fn on_worker_received(&mut self, position: usize) -> WorkerWaiter {
        let (tx, rx) = oneshot::channel();
        let index = self.index(position);
        self.waiters.entry(index).or_default().push(tx);
        rx
    }

    /// Clear the slot and fail its waiters. Returns the previous content.
    pub fn reset(&mut self, position: usize) -> WorkerSlot {
        let index = self.index(position);
        for waiter in self.waiters.remove(&index).unwrap_or_default() {
            let _ = waiter.send(None);
        }
        std::mem::take(&mut self.slots[index])
    }

    /// Index of the first slot holding `worker_id`.
    pub fn find_by_id(&self, worker_id: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.worker_id.as_deref() == Some(worker_id))
    }

    /// Clear the first slot holding `worker_id`. Returns its previous content.
    pub fn delete_by_id(&mut self, worker_id: &str) -> Option<WorkerSlot> {
        let index = self.find_by_id(worker_id)?;
        Some(self.reset(index))
    }

    /// Run `task` once per distinct worker id.
    pub fn for_each_unique_worker<F>(&self, mut task: F)
    where
        F: FnMut(&WorkerSlot),
    {
        let mut seen = HashSet::new();
        for slot in &self.slots {
            if let Some(worker_id) = &slot.worker_id {
                if seen.insert(worker_id.as_str()) {
                    task(slot);
                }
            }
        }
    }

    /// One slot per distinct worker id, cloned.
    pub fn unique_workers(&self) -> Vec<WorkerSlot> {
        let mut workers = Vec::new();
        self.for_each_unique_worker(|slot| workers.push(slot.clone()));
        workers
    }

    /// Record a keepalive result for every slot holding `worker_id`.
    /// Returns the resulting miss count.
    pub fn record_keepalive(&mut self, worker_id: &str, alive: bool) -> u32 {
        let mut misses = 0;
        for slot in &mut self.slots {
            if slot.worker_id.as_deref() == Some(worker_id) {
                slot.ka_count = if alive { 0 } else { slot.ka_count + 1 };
                misses = misses.max(slot.ka_count);
            }
        }
        misses
    }
}

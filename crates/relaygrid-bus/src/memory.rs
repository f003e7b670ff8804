//! In-process broker.
//!
//! Used directly by single-process deployments and tests, and as the
//! routing table behind the TCP broker hub. A queue exists while it has
//! consumers: dropping the last subscription removes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::broker::{Broker, Subscription};
use crate::error::BusResult;

type Queues = Mutex<HashMap<String, ConsumerGroup>>;

/// Consumers attached to one queue, served in rotation.
#[derive(Default)]
struct ConsumerGroup {
    consumers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    /// Index of the consumer that gets the next delivery.
    next: usize,
}

impl ConsumerGroup {
    /// Drop closed consumers. The rotation carries on from the same
    /// consumer it would have picked before.
    fn prune(&mut self) {
        let mut index = 0;
        let mut removed_before_next = 0;
        let next = self.next;
        self.consumers.retain(|tx| {
            let keep = !tx.is_closed();
            if !keep && index < next {
                removed_before_next += 1;
            }
            index += 1;
            keep
        });
        self.next -= removed_before_next;
    }

    /// Hand `payload` to the next live consumer, or give it back if none is
    /// left.
    fn deliver(&mut self, mut payload: Vec<u8>) -> Result<(), Vec<u8>> {
        self.prune();
        while !self.consumers.is_empty() {
            let idx = self.next % self.consumers.len();
            match self.consumers[idx].send(payload) {
                Ok(()) => {
                    self.next = idx + 1;
                    return Ok(());
                }
                Err(mpsc::error::SendError(returned)) => {
                    // Receiver went away between the prune and the send.
                    self.consumers.remove(idx);
                    self.next = idx;
                    payload = returned;
                }
            }
        }
        Err(payload)
    }
}

/// A broker whose queues live in this process.
///
/// Cloning yields another handle onto the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Queues>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, ConsumerGroup>> {
        lock(&self.queues)
    }

    /// Number of live consumers attached to `queue`.
    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.queues()
            .get(queue)
            .map(|g| g.consumers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of queues with at least one consumer attached.
    pub async fn queue_count(&self) -> usize {
        self.queues().len()
    }
}

fn lock(queues: &Queues) -> MutexGuard<'_, HashMap<String, ConsumerGroup>> {
    queues.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forget `queue` once its last consumer is gone.
fn detach(queues: &Weak<Queues>, queue: &str) {
    let Some(queues) = queues.upgrade() else { return };
    let mut queues = lock(&queues);
    let Some(group) = queues.get_mut(queue) else { return };
    group.prune();
    if group.consumers.is_empty() {
        queues.remove(queue);
        trace!(%queue, "last consumer detached, queue removed");
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn consume(&self, queue: &str) -> BusResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues().entry(queue.to_string()).or_default().consumers.push(tx);
        debug!(%queue, "consumer attached");

        let queues = Arc::downgrade(&self.queues);
        let name = queue.to_string();
        Ok(Subscription::new(queue, rx).on_detach(Box::new(move || detach(&queues, &name))))
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> BusResult<()> {
        let mut queues = self.queues();
        let Some(group) = queues.get_mut(queue) else {
            trace!(%queue, "no consumers, message dropped");
            return Ok(());
        };

        if group.deliver(payload).is_err() {
            queues.remove(queue);
            trace!(%queue, "no consumers, message dropped");
        }
        Ok(())
    }
}

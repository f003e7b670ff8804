//! Broker abstraction — fire-and-forget named queues.
//!
//! A queue may have several consumers; each delivery goes to exactly one
//! of them, chosen round-robin. A message published to a queue nobody
//! consumes is dropped, like an unroutable message on a direct exchange.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BusResult;

/// A publish/consume transport the RPC layer runs on.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Attach a new consumer to `queue`.
    ///
    /// The consumer stays attached until the returned subscription is dropped.
    async fn consume(&self, queue: &str) -> BusResult<Subscription>;

    /// Publish `payload` to `queue`.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> BusResult<()>;
}

/// Runs once when a subscription is dropped, after its receiver closed.
pub(crate) type DetachHook = Box<dyn FnOnce() + Send>;

/// The receiving side of a queue consumer.
pub struct Subscription {
    queue: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    on_detach: Option<DetachHook>,
}

impl Subscription {
    pub(crate) fn new(queue: &str, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            queue: queue.to_string(),
            rx,
            on_detach: None,
        }
    }

    pub(crate) fn on_detach(mut self, hook: DetachHook) -> Self {
        self.on_detach = Some(hook);
        self
    }

    /// Wait for the next delivery. `None` once the broker side is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(hook) = self.on_detach.take() {
            hook();
        }
    }
}

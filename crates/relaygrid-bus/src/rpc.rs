//! RPC endpoint — request/response calls over a fire-and-forget broker.
//!
//! Every endpoint owns a uniquely named reply queue. Outgoing calls carry
//! a per-endpoint correlation id and the reply queue name; the pending-call
//! table maps correlation ids to one-shot callbacks. Whichever of
//! {reply, deadline} removes the table entry first settles the call, so a
//! callback runs exactly once even when the broker redelivers a reply or a
//! reply arrives after the deadline.
//!
//! No retries happen here. Callers that want them issue a new call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::{BusError, BusResult};
use crate::message::{CallMessage, ReplyMessage};
use crate::methods::MethodTable;

/// Deadline applied to calls when none is configured.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(2000);

/// How a call settled.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The callee replied with this `data`.
    Data(Value),
    /// No reply arrived before the deadline.
    Timeout,
}

impl CallOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallOutcome::Timeout)
    }

    /// The reply data, `None` on timeout.
    pub fn into_data(self) -> Option<Value> {
        match self {
            CallOutcome::Data(data) => Some(data),
            CallOutcome::Timeout => None,
        }
    }
}

type Callback = Box<dyn FnOnce(CallOutcome) + Send>;

/// One outstanding call.
struct PendingCall {
    callback: Callback,
    deadline: JoinHandle<()>,
}

type PendingTable = Arc<Mutex<HashMap<u64, PendingCall>>>;

/// A node's handle onto the message bus, both as caller and as callee.
///
/// Cloning yields another handle onto the same endpoint.
#[derive(Clone)]
pub struct RpcEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    broker: Arc<dyn Broker>,
    reply_to: String,
    timeout: Duration,
    next_correlation_id: AtomicU64,
    pending: PendingTable,
    methods: Arc<RwLock<MethodTable>>,
    connected: Mutex<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl RpcEndpoint {
    /// Create an endpoint on `broker` with the default call deadline.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_timeout(broker, DEFAULT_RPC_TIMEOUT)
    }

    /// Create an endpoint whose calls time out after `timeout`.
    pub fn with_timeout(broker: Arc<dyn Broker>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                broker,
                reply_to: format!("relay.reply.{}", Uuid::new_v4().simple()),
                timeout,
                next_correlation_id: AtomicU64::new(1),
                pending: Arc::new(Mutex::new(HashMap::new())),
                methods: Arc::new(RwLock::new(MethodTable::new())),
                connected: Mutex::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Name of this endpoint's reply queue.
    pub fn reply_to(&self) -> &str {
        &self.inner.reply_to
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Declare the reply queue and start settling replies.
    ///
    /// Must complete before the first call.
    pub async fn connect(&self) -> BusResult<()> {
        let mut connected = self.inner.connected.lock().await;
        if *connected {
            return Err(BusError::AlreadyConnected);
        }

        let mut replies = self.inner.broker.consume(&self.inner.reply_to).await?;
        let pending = Arc::clone(&self.inner.pending);

        let task = tokio::spawn(async move {
            while let Some(payload) = replies.recv().await {
                match serde_json::from_slice::<ReplyMessage>(&payload) {
                    Ok(reply) => {
                        settle_reply(&pending, reply.correlation_id, reply.data).await;
                    }
                    Err(e) => warn!(error = %e, "dropping malformed rpc reply"),
                }
            }
            debug!("reply queue closed");
        });

        self.inner.tasks.lock().await.push(task);
        *connected = true;
        info!(reply_to = %self.inner.reply_to, "rpc endpoint connected");
        Ok(())
    }

    /// Add methods to the table served by every bound queue.
    pub async fn add_methods(&self, methods: MethodTable) {
        self.inner.methods.write().await.merge(methods);
    }

    /// Serve calls published to `id`.
    ///
    /// May be called for several ids; they all dispatch into the same
    /// method table. Each call runs on its own task, so a slow method does
    /// not hold up the queue. Calls to unknown methods are dropped and the
    /// caller sees a timeout.
    pub async fn bind(&self, id: &str) -> BusResult<()> {
        let mut calls = self.inner.broker.consume(id).await?;
        let broker = Arc::clone(&self.inner.broker);
        let methods = Arc::clone(&self.inner.methods);
        let queue = id.to_string();

        let task = tokio::spawn(async move {
            while let Some(payload) = calls.recv().await {
                let call: CallMessage = match serde_json::from_slice(&payload) {
                    Ok(call) => call,
                    Err(e) => {
                        warn!(%queue, error = %e, "dropping malformed rpc call");
                        continue;
                    }
                };

                let handler = methods.read().await.get(&call.method);
                let Some(handler) = handler else {
                    warn!(%queue, method = %call.method, "call to unknown method dropped");
                    continue;
                };

                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    let data = handler(call.args).await;
                    let reply = ReplyMessage {
                        data,
                        correlation_id: call.correlation_id,
                    };
                    let published = match serde_json::to_vec(&reply) {
                        Ok(payload) => broker.publish(&call.reply_to, payload).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = published {
                        warn!(
                            method = %call.method,
                            reply_to = %call.reply_to,
                            error = %e,
                            "failed to publish rpc reply"
                        );
                    }
                });
            }
            debug!(%queue, "call queue closed");
        });

        self.inner.tasks.lock().await.push(task);
        info!(queue = %id, "rpc endpoint bound");
        Ok(())
    }

    /// Issue a call; `callback` runs exactly once with the outcome.
    ///
    /// Returns the call's correlation id. Fails only if the endpoint is not
    /// connected, in which case `callback` is dropped without running. A
    /// failed publish is logged and left to the deadline.
    pub async fn call_rpc<F>(
        &self,
        target: &str,
        method: &str,
        args: Value,
        callback: F,
    ) -> BusResult<u64>
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        if !*self.inner.connected.lock().await {
            return Err(BusError::NotConnected);
        }

        let correlation_id = self.inner.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_vec(&CallMessage {
            method: method.to_string(),
            args,
            correlation_id,
            reply_to: self.inner.reply_to.clone(),
        })?;

        {
            // The deadline task needs this lock to fire, so it cannot
            // observe the table before the entry is in it.
            let mut pending = self.inner.pending.lock().await;
            let table = Arc::clone(&self.inner.pending);
            let timeout = self.inner.timeout;
            let target = target.to_string();
            let method_name = method.to_string();

            let deadline = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let expired = table.lock().await.remove(&correlation_id);
                if let Some(call) = expired {
                    debug!(%target, method = %method_name, correlation_id, "rpc call timed out");
                    (call.callback)(CallOutcome::Timeout);
                }
            });

            pending.insert(
                correlation_id,
                PendingCall {
                    callback: Box::new(callback),
                    deadline,
                },
            );
        }

        if let Err(e) = self.inner.broker.publish(target, payload).await {
            warn!(%target, %method, correlation_id, error = %e, "failed to publish rpc call");
        }

        Ok(correlation_id)
    }

    /// Issue a call and wait for its outcome.
    pub async fn call(&self, target: &str, method: &str, args: Value) -> BusResult<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.call_rpc(target, method, args, move |outcome| {
            let _ = tx.send(outcome);
        })
        .await?;
        rx.await.map_err(|_| BusError::Closed)
    }

    /// Number of calls still waiting for a reply or deadline.
    pub async fn pending_calls(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Stop serving and settle every outstanding call as timed out.
    pub async fn close(&self) {
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        *self.inner.connected.lock().await = false;

        let drained: Vec<PendingCall> = {
            let mut pending = self.inner.pending.lock().await;
            pending.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            call.deadline.abort();
            (call.callback)(CallOutcome::Timeout);
        }
        info!(reply_to = %self.inner.reply_to, settled = count, "rpc endpoint closed");
    }
}

/// Settle a call from its reply. Replies for settled calls are discarded.
async fn settle_reply(pending: &PendingTable, correlation_id: u64, data: Value) {
    let entry = pending.lock().await.remove(&correlation_id);
    match entry {
        Some(call) => {
            call.deadline.abort();
            (call.callback)(CallOutcome::Data(data));
        }
        None => {
            debug!(correlation_id, "discarding reply for settled call");
        }
    }
}

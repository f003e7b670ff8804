//! TCP broker — a hub process plus a client-side [`Broker`] implementation.
//!
//! The hub keeps all queues in a [`MemoryBroker`] and relays frames between
//! it and connected clients. Each `Consume` frame becomes one hub-side
//! consumer, so competing consumers work across processes exactly as they
//! do in-process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Subscription};
use crate::codec::{read_frame, write_frame, Frame};
use crate::error::{BusError, BusResult};
use crate::memory::MemoryBroker;

// ── Hub ────────────────────────────────────────────────────────────

/// The broker hub every process of a deployment connects to.
pub struct BrokerServer {
    listener: TcpListener,
    hub: MemoryBroker,
}

impl BrokerServer {
    /// Bind the hub to `bind_addr` (e.g. "0.0.0.0:5680").
    pub async fn bind(bind_addr: &str) -> BusResult<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| BusError::Connect(format!("failed to bind to {bind_addr}: {e}")))?;
        Ok(Self {
            listener,
            hub: MemoryBroker::new(),
        })
    }

    pub fn local_addr(&self) -> BusResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The hub's queues, for endpoints living in the hub's own process.
    pub fn hub(&self) -> MemoryBroker {
        self.hub.clone()
    }

    /// Accept connections until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> BusResult<()> {
        info!(addr = ?self.listener.local_addr().ok(), "broker hub accepting connections");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "broker client connected");
                    let hub = self.hub.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, hub).await {
                            warn!(%peer, error = %e, "broker connection failed");
                        }
                        debug!(%peer, "broker client disconnected");
                    });
                }
                _ = shutdown.changed() => {
                    info!("broker hub shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Relay frames for one client until it disconnects.
async fn serve_connection(stream: TcpStream, hub: MemoryBroker) -> BusResult<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, "broker write failed");
                break;
            }
        }
    });

    // Consumer tag → task forwarding hub deliveries to this client.
    let mut forwarders: HashMap<u64, JoinHandle<()>> = HashMap::new();

    let result = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        match frame {
            Frame::Consume { tag, queue } => {
                let mut sub = match hub.consume(&queue).await {
                    Ok(sub) => sub,
                    Err(e) => break Err(e),
                };
                let out = out_tx.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(payload) = sub.recv().await {
                        if out.send(Frame::Deliver { tag, payload }).is_err() {
                            break;
                        }
                    }
                });
                if let Some(old) = forwarders.insert(tag, forwarder) {
                    old.abort();
                }
            }
            Frame::Publish { queue, payload } => {
                if let Err(e) = hub.publish(&queue, payload).await {
                    break Err(e);
                }
            }
            Frame::Cancel { tag } => {
                if let Some(forwarder) = forwarders.remove(&tag) {
                    forwarder.abort();
                }
            }
            Frame::Deliver { tag, .. } => {
                warn!(tag, "ignoring deliver frame sent by a client");
            }
        }
    };

    // Dropping the hub-side subscriptions detaches this client's consumers.
    for (_, forwarder) in forwarders {
        forwarder.abort();
    }
    writer_task.abort();
    result
}

// ── Client ─────────────────────────────────────────────────────────

/// Local consumer registered with the hub.
struct LocalConsumer {
    queue: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

type ConsumerMap = Arc<Mutex<HashMap<u64, LocalConsumer>>>;

/// A [`Broker`] backed by a connection to a [`BrokerServer`].
#[derive(Clone)]
pub struct TcpBroker {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    out: mpsc::UnboundedSender<Frame>,
    consumers: ConsumerMap,
    next_tag: AtomicU64,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl TcpBroker {
    /// Connect to the hub at `addr`.
    pub async fn connect(addr: &str) -> BusResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BusError::Connect(format!("failed to connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let consumers: ConsumerMap = Arc::new(Mutex::new(HashMap::new()));

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!(error = %e, "broker write failed");
                    break;
                }
            }
        });

        let reader_consumers = Arc::clone(&consumers);
        let reader_out = out_tx.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(Frame::Deliver { tag, payload })) => {
                        deliver_local(&reader_consumers, &reader_out, tag, payload).await;
                    }
                    Ok(Some(other)) => {
                        warn!(frame = ?other, "unexpected frame from broker hub");
                    }
                    Ok(None) => {
                        warn!("broker hub closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "broker read failed");
                        break;
                    }
                }
            }
            // Ends every local subscription.
            reader_consumers.lock().await.clear();
        });

        info!(%addr, "connected to broker hub");

        Ok(Self {
            inner: Arc::new(ClientInner {
                out: out_tx,
                consumers,
                next_tag: AtomicU64::new(1),
                reader_task,
                writer_task,
            }),
        })
    }

    fn send(&self, frame: Frame) -> BusResult<()> {
        self.inner.out.send(frame).map_err(|_| BusError::Closed)
    }
}

/// Hand a delivery to its local consumer. A consumer whose subscription was
/// dropped is cancelled at the hub and the payload goes back to its queue.
async fn deliver_local(
    consumers: &ConsumerMap,
    out: &mpsc::UnboundedSender<Frame>,
    tag: u64,
    payload: Vec<u8>,
) {
    let mut consumers = consumers.lock().await;
    let Some(consumer) = consumers.get(&tag) else {
        debug!(tag, "delivery for unknown consumer dropped");
        return;
    };

    if let Err(mpsc::error::SendError(payload)) = consumer.tx.send(payload) {
        let queue = consumer.queue.clone();
        consumers.remove(&tag);
        debug!(tag, %queue, "local consumer gone, requeueing delivery");
        let _ = out.send(Frame::Cancel { tag });
        let _ = out.send(Frame::Publish { queue, payload });
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn consume(&self, queue: &str) -> BusResult<Subscription> {
        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.consumers.lock().await.insert(
            tag,
            LocalConsumer {
                queue: queue.to_string(),
                tx,
            },
        );
        self.send(Frame::Consume {
            tag,
            queue: queue.to_string(),
        })?;
        Ok(Subscription::new(queue, rx))
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> BusResult<()> {
        self.send(Frame::Publish {
            queue: queue.to_string(),
            payload,
        })
    }
}

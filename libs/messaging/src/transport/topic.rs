//! # Reliable-Topic Transport
//!
//! Publish/subscribe on a named topic via a shared in-process cluster
//! client: a TCP peer mesh with local loopback delivery. Publishing frames
//! the payload under its topic name and writes it to every configured peer,
//! and simultaneously delivers it to local subscribers — the dispatch core's
//! node-id suppression then drops the publisher's own copy.
//!
//! The cluster client is lease-counted because co-resident components may
//! share it; closing the receiver releases its lease and shuts the client
//! down only when no other holder remains. Per-topic subscription channels
//! live in an arena keyed by topic name with explicit teardown.

use crate::config::TopicConfig;
use crate::dispatch::EventHandler;
use crate::error::{MessagingError, Result};
use crate::event::{Event, EventKind};
use crate::serializer::Serializer;
use crate::transport::{prepare_outgoing, report_send, Receiver, ReceiverCore, Sender};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Upper bound for one framed topic message
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
/// Buffered messages per local topic subscription
const TOPIC_CHANNEL_CAPACITY: usize = 256;

/// Shared in-process cluster client: one TCP listener, a peer set, and a
/// per-topic subscription arena.
pub struct ClusterClient {
    local_addr: SocketAddr,
    peers: DashMap<SocketAddr, ()>,
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    leases: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl ClusterClient {
    /// Bind the client's listener and start accepting peer connections.
    /// A bind failure is a fatal configuration error.
    pub async fn start(config: &TopicConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
            MessagingError::configuration(
                format!(
                    "failed to bind cluster client on {}: {}",
                    config.bind_address, e
                ),
                Some("topic.bind_address"),
            )
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MessagingError::io("cluster client local address", e))?;

        let peers = DashMap::new();
        for peer in &config.peers {
            let addr: SocketAddr = peer.parse().map_err(|_| {
                MessagingError::configuration(
                    format!("invalid peer address: {}", peer),
                    Some("topic.peers"),
                )
            })?;
            peers.insert(addr, ());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = Arc::new(Self {
            local_addr,
            peers,
            topics: DashMap::new(),
            leases: AtomicUsize::new(0),
            shutdown_tx,
        });

        info!(addr = %local_addr, peers = client.peers.len(), "cluster client listening");
        tokio::spawn(Self::accept_loop(Arc::clone(&client), listener, shutdown_rx));
        Ok(client)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn add_peer(&self, addr: SocketAddr) {
        self.peers.insert(addr, ());
    }

    pub fn remove_peer(&self, addr: &SocketAddr) {
        self.peers.remove(addr);
    }

    /// Take a lease on the client. Every holder must release it again.
    pub fn retain(&self) {
        self.leases.fetch_add(1, Ordering::SeqCst);
    }

    /// Release a lease; the last release shuts the client down.
    pub fn release(&self) {
        if self.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            info!(addr = %self.local_addr, "last lease released, shutting cluster client down");
            let _ = self.shutdown_tx.send(true);
            self.topics.clear();
        } else {
            debug!(addr = %self.local_addr, "cluster client still leased, leaving it running");
        }
    }

    /// Subscribe to a named topic.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop a topic's subscription channel from the arena.
    pub fn teardown(&self, topic: &str) {
        if self.topics.remove(topic).is_some() {
            debug!(topic, "topic subscription torn down");
        }
    }

    /// Publish a payload under a topic: loopback to local subscribers, then
    /// best-effort delivery to every peer.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if let Some(tx) = self.topics.get(topic) {
            // no local subscribers is fine
            let _ = tx.send(payload.clone());
        }

        for peer in self.peers.iter() {
            let addr = *peer.key();
            if let Err(e) = Self::send_frame(addr, topic, &payload).await {
                warn!(peer = %addr, topic, error = %e, "peer publish failed");
            }
        }
        Ok(())
    }

    async fn send_frame(addr: SocketAddr, topic: &str, payload: &Bytes) -> std::io::Result<()> {
        let mut stream = TcpStream::connect(addr).await?;
        let topic_bytes = topic.as_bytes();
        let total = 2 + topic_bytes.len() + payload.len();
        stream.write_all(&(total as u32).to_be_bytes()).await?;
        stream.write_all(&(topic_bytes.len() as u16).to_be_bytes()).await?;
        stream.write_all(topic_bytes).await?;
        stream.write_all(payload).await?;
        stream.shutdown().await
    }

    async fn accept_loop(
        client: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(addr = %client.local_addr, "cluster client accept loop stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "peer connected");
                        let client = Arc::clone(&client);
                        tokio::spawn(async move {
                            if let Err(e) = client.read_frames(stream).await {
                                debug!(peer = %peer, error = %e, "peer connection closed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept peer connection"),
                }
            }
        }
    }

    async fn read_frames(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let mut len_buf = [0u8; 4];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return Ok(()); // EOF between frames
            }
            let total = u32::from_be_bytes(len_buf) as usize;
            if total < 2 || total > MAX_FRAME_BYTES {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid frame length {}", total),
                ));
            }

            let mut topic_len_buf = [0u8; 2];
            stream.read_exact(&mut topic_len_buf).await?;
            let topic_len = u16::from_be_bytes(topic_len_buf) as usize;
            if topic_len > total - 2 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "topic length exceeds frame",
                ));
            }

            let mut topic_buf = vec![0u8; topic_len];
            stream.read_exact(&mut topic_buf).await?;
            let mut payload = vec![0u8; total - 2 - topic_len];
            stream.read_exact(&mut payload).await?;

            let topic = String::from_utf8_lossy(&topic_buf).into_owned();
            if let Some(tx) = self.topics.get(&topic) {
                let _ = tx.send(Bytes::from(payload));
            } else {
                debug!(topic, "no local subscription for topic, dropping frame");
            }
        }
    }
}

/// Receiving half of the reliable-topic transport
pub struct TopicReceiver {
    core: ReceiverCore,
    client: Arc<ClusterClient>,
    topic: String,
    sender: Arc<TopicSender>,
    shutdown_tx: watch::Sender<bool>,
}

impl TopicReceiver {
    /// Start the shared cluster client and subscribe to the configured
    /// topic.
    pub async fn configure(serializer: Arc<dyn Serializer>) -> Result<Self> {
        let config = serializer.platform_config();
        let topic = config.channel.clone();
        let client = ClusterClient::start(&config.topic).await?;
        client.retain();

        let core = ReceiverCore::new(serializer);
        let sender = Arc::new(TopicSender {
            serializer: Arc::clone(&core.serializer),
            client: Arc::clone(&client),
            topic: topic.clone(),
            counters: Arc::clone(&core.counters),
        });
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            core,
            client,
            topic,
            sender,
            shutdown_tx,
        })
    }

    /// The shared cluster client, for co-resident components that want to
    /// lease it.
    pub fn cluster_client(&self) -> Arc<ClusterClient> {
        Arc::clone(&self.client)
    }

    pub fn counters(&self) -> crate::transport::CounterSnapshot {
        self.core.counters.snapshot()
    }
}

#[async_trait]
impl Receiver for TopicReceiver {
    async fn run(&self) -> Result<()> {
        let mut rx = self.client.subscribe(&self.topic);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(topic = %self.topic, "topic receiver running");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                received = rx.recv() => match received {
                    Ok(raw) => self.core.dispatch(&raw, false).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %self.topic, skipped, "topic receiver lagged, messages dropped");
                        self.core.counters.record_dropped();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(topic = %self.topic, "topic subscription closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn register_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.core.registry.register(kind, handler);
    }

    fn set_default_handler(&self, handler: Arc<dyn EventHandler>) {
        self.core.registry.set_default_handler(handler);
    }

    fn create_sender(&self) -> Arc<dyn Sender> {
        Arc::clone(&self.sender) as Arc<dyn Sender>
    }

    async fn close(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.client.teardown(&self.topic);
        self.client.release();
        Ok(())
    }
}

/// Sending half of the reliable-topic transport
pub struct TopicSender {
    serializer: Arc<dyn Serializer>,
    client: Arc<ClusterClient>,
    topic: String,
    counters: Arc<crate::transport::TransportCounters>,
}

#[async_trait]
impl Sender for TopicSender {
    async fn send(&self, event: Event) -> bool {
        let (event, raw) = match prepare_outgoing(self.serializer.as_ref(), event) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, "could not serialize event");
                self.counters.record_send_error();
                return false;
            }
        };
        let result = self.client.publish(&self.topic, Bytes::from(raw)).await;
        report_send(&self.counters, &event, result)
    }
}

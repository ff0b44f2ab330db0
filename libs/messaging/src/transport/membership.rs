//! # Membership Transport
//!
//! Self-managed cluster membership: nodes announce themselves with
//! periodic UDP heartbeats carrying their advertised TCP address, and
//! events travel over per-send TCP connections to every live member.
//! Members silent for longer than the configured timeout are pruned from
//! the member table.
//!
//! Loop prevention is address-based and coarse: inbound frames carry the
//! sender's advertised address, and only frames from this node's own
//! advertised address are rejected outright. Everything else is handed to
//! the dispatch core with the accept override set, so events from another
//! node that happens to share an address still go through.

use crate::config::MembershipConfig;
use crate::dispatch::EventHandler;
use crate::error::{MessagingError, Result};
use crate::event::{Event, EventKind};
use crate::serializer::Serializer;
use crate::transport::{prepare_outgoing, report_send, Receiver, ReceiverCore, Sender};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

type MemberTable = Arc<DashMap<SocketAddr, Instant>>;

/// Receiving half of the membership transport
pub struct MembershipReceiver {
    core: ReceiverCore,
    config: MembershipConfig,
    listener: TcpListener,
    heartbeat_socket: UdpSocket,
    advertised: SocketAddr,
    members: MemberTable,
    sender: Arc<MembershipSender>,
    shutdown_tx: watch::Sender<bool>,
}

impl MembershipReceiver {
    /// Bind the reliable channel listener and the heartbeat socket, and
    /// resolve the address this node advertises to its peers.
    pub async fn configure(serializer: Arc<dyn Serializer>) -> Result<Self> {
        let config = serializer.platform_config().membership.clone();

        let listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
            MessagingError::configuration(
                format!("failed to bind membership channel on {}: {}", config.bind_address, e),
                Some("membership.bind_address"),
            )
        })?;
        let bound = listener
            .local_addr()
            .map_err(|e| MessagingError::io("membership channel local address", e))?;
        let advertised = match &config.advertised_address {
            Some(address) => address.parse().map_err(|_| {
                MessagingError::configuration(
                    format!("invalid advertised address: {}", address),
                    Some("membership.advertised_address"),
                )
            })?,
            None => bound,
        };

        let heartbeat_socket = UdpSocket::bind(&config.heartbeat_bind_address)
            .await
            .map_err(|e| {
                MessagingError::configuration(
                    format!(
                        "failed to bind heartbeat socket on {}: {}",
                        config.heartbeat_bind_address, e
                    ),
                    Some("membership.heartbeat_bind_address"),
                )
            })?;
        info!(channel = %bound, advertised = %advertised, "membership receiver bound");

        let members: MemberTable = Arc::new(DashMap::new());
        let core = ReceiverCore::new(serializer);
        let sender = Arc::new(MembershipSender {
            serializer: Arc::clone(&core.serializer),
            members: Arc::clone(&members),
            advertised,
            counters: Arc::clone(&core.counters),
        });
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            core,
            config,
            listener,
            heartbeat_socket,
            advertised,
            members,
            sender,
            shutdown_tx,
        })
    }

    /// Currently known member channel addresses.
    pub fn members(&self) -> Vec<SocketAddr> {
        self.members.iter().map(|entry| *entry.key()).collect()
    }

    async fn send_heartbeats(&self) {
        let payload = self.advertised.to_string();
        for peer in &self.config.peers {
            if let Err(e) = self.heartbeat_socket.send_to(payload.as_bytes(), peer).await {
                debug!(peer = %peer, error = %e, "heartbeat send failed");
            }
        }
    }

    fn prune_members(&self) {
        let timeout = Duration::from_millis(self.config.member_timeout_ms);
        let now = Instant::now();
        self.members.retain(|address, last_heard| {
            let alive = now.duration_since(*last_heard) < timeout;
            if !alive {
                info!(member = %address, "member timed out");
            }
            alive
        });
    }

    fn record_heartbeat(&self, datagram: &[u8]) {
        let Ok(text) = std::str::from_utf8(datagram) else {
            debug!("malformed heartbeat datagram, ignoring");
            return;
        };
        let Ok(address) = text.parse::<SocketAddr>() else {
            debug!(heartbeat = text, "unparseable heartbeat address, ignoring");
            return;
        };
        if address == self.advertised {
            return;
        }
        if self.members.insert(address, Instant::now()).is_none() {
            info!(member = %address, "member joined");
        }
    }
}

#[async_trait]
impl Receiver for MembershipReceiver {
    async fn run(&self) -> Result<()> {
        let mut heartbeat_buffer = [0u8; 256];
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.config.heartbeat_interval_ms.max(1),
        ));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                _ = ticker.tick() => {
                    self.send_heartbeats().await;
                    self.prune_members();
                }
                received = self.heartbeat_socket.recv_from(&mut heartbeat_buffer) => match received {
                    Ok((length, _)) => self.record_heartbeat(&heartbeat_buffer[..length]),
                    Err(e) => warn!(error = %e, "heartbeat receive failed"),
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let core = self.core.clone();
                        let advertised = self.advertised;
                        tokio::spawn(async move {
                            if let Err(e) = read_channel_frame(stream, core, advertised).await {
                                debug!(peer = %peer, error = %e, "membership channel read failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept membership connection"),
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
        Ok(())
    }
}

/// Read one framed event off a channel connection and dispatch it. Frames
/// from this node's own advertised address are dropped before dispatch.
async fn read_channel_frame(
    mut stream: TcpStream,
    core: ReceiverCore,
    advertised: SocketAddr,
) -> std::io::Result<()> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let payload_len = u32::from_be_bytes(len_buf) as usize;
    if payload_len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid frame length {}", payload_len),
        ));
    }

    let mut addr_len_buf = [0u8; 2];
    stream.read_exact(&mut addr_len_buf).await?;
    let addr_len = u16::from_be_bytes(addr_len_buf) as usize;
    let mut addr_buf = vec![0u8; addr_len];
    stream.read_exact(&mut addr_buf).await?;
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;

    let sender_addr = String::from_utf8_lossy(&addr_buf).into_owned();
    if sender_addr == advertised.to_string() {
        debug!(sender = %sender_addr, "frame from own address, dropping");
        core.counters.record_dropped();
        return Ok(());
    }

    core.dispatch(&payload, true).await;
    Ok(())
}

/// Sending half of the membership transport. Connects to every live
/// member per send; the send counts as failed only when members exist and
/// none of them could be reached.
pub struct MembershipSender {
    serializer: Arc<dyn Serializer>,
    members: MemberTable,
    advertised: SocketAddr,
    counters: Arc<crate::transport::TransportCounters>,
}

impl MembershipSender {
    async fn send_frame(&self, member: SocketAddr, raw: &[u8]) -> std::io::Result<()> {
        let mut stream = TcpStream::connect(member).await?;
        let addr = self.advertised.to_string();
        stream.write_all(&(raw.len() as u32).to_be_bytes()).await?;
        stream.write_all(&(addr.len() as u16).to_be_bytes()).await?;
        stream.write_all(addr.as_bytes()).await?;
        stream.write_all(raw).await?;
        stream.shutdown().await
    }
}

#[async_trait]
impl Sender for MembershipSender {
    async fn send(&self, event: Event) -> bool {
        let (event, raw) = match prepare_outgoing(self.serializer.as_ref(), event) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, "could not serialize event");
                self.counters.record_send_error();
                return false;
            }
        };

        let members: Vec<SocketAddr> = self.members.iter().map(|entry| *entry.key()).collect();
        if members.is_empty() {
            debug!(event = %event, "no members known, nothing to deliver");
            self.counters.record_sent();
            return true;
        }

        let mut delivered = 0usize;
        for member in &members {
            match self.send_frame(*member, &raw).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(member = %member, error = %e, "member delivery failed"),
            }
        }

        let result = if delivered > 0 {
            Ok(())
        } else {
            Err(MessagingError::transport(format!(
                "no member reachable ({} tried)",
                members.len()
            )))
        };
        report_send(&self.counters, &event, result)
    }
}

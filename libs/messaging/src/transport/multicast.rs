//! # Multicast Transport
//!
//! Raw serialized events as UDP datagrams on a multicast group, no
//! framing. The receiver joins the group and reads into a fixed 1 MB
//! buffer; the sender binds a transient socket per send and drops it
//! afterwards.
//!
//! Loop prevention is address-based here, not node-id-based: when a
//! datagram's source address belongs to one of this host's own interfaces
//! the dispatch core is told to accept it anyway. That keeps multi-node
//!-on-one-host setups working, at the cost of re-processing a node's own
//! datagrams on single-node hosts.

use crate::config::MulticastConfig;
use crate::dispatch::EventHandler;
use crate::error::{MessagingError, Result};
use crate::event::{Event, EventKind};
use crate::serializer::Serializer;
use crate::transport::{prepare_outgoing, report_send, Receiver, ReceiverCore, Sender};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Receive buffer size; datagrams larger than this are truncated by the OS
const RECEIVE_BUFFER_BYTES: usize = 1024 * 1024;

/// Bind the group port with the reuse flags set so several node processes
/// on one host can all listen on it.
fn bind_reusable(port: u16) -> std::io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], port)).into())?;
    UdpSocket::from_std(socket.into())
}

/// Addresses of this host's own network interfaces.
fn own_interface_addresses() -> Result<HashSet<IpAddr>> {
    let mut addresses = HashSet::new();
    let interfaces = nix::ifaddrs::getifaddrs()
        .map_err(|e| MessagingError::transport_with_source("could not enumerate interfaces", e))?;
    for interface in interfaces {
        if let Some(address) = interface.address {
            if let Some(ipv4) = address.as_sockaddr_in() {
                addresses.insert(IpAddr::V4(ipv4.ip()));
            } else if let Some(ipv6) = address.as_sockaddr_in6() {
                addresses.insert(IpAddr::V6(ipv6.ip()));
            }
        }
    }
    Ok(addresses)
}

fn parse_group(config: &MulticastConfig) -> Result<Ipv4Addr> {
    config.group_address.parse().map_err(|_| {
        MessagingError::configuration(
            format!("invalid multicast group address: {}", config.group_address),
            Some("multicast.group_address"),
        )
    })
}

fn parse_allowed_senders(config: &MulticastConfig) -> Result<HashSet<IpAddr>> {
    let mut allowed = HashSet::new();
    for sender in &config.allowed_senders {
        let address: IpAddr = sender.parse().map_err(|_| {
            MessagingError::configuration(
                format!("invalid allowed sender address: {}", sender),
                Some("multicast.allowed_senders"),
            )
        })?;
        allowed.insert(address);
    }
    Ok(allowed)
}

/// Receiving half of the multicast transport
pub struct MulticastReceiver {
    core: ReceiverCore,
    socket: UdpSocket,
    /// Empty means any sender is accepted
    allowed_senders: HashSet<IpAddr>,
    own_addresses: HashSet<IpAddr>,
    sender: Arc<MulticastSender>,
    shutdown_tx: watch::Sender<bool>,
}

impl MulticastReceiver {
    /// Join the multicast group and resolve this host's own interface
    /// addresses for the address-based loop check.
    pub async fn configure(serializer: Arc<dyn Serializer>) -> Result<Self> {
        let config = serializer.platform_config().multicast.clone();
        let group = parse_group(&config)?;
        let allowed_senders = parse_allowed_senders(&config)?;
        let own_addresses = own_interface_addresses()?;

        let socket = bind_reusable(config.port).map_err(|e| {
            MessagingError::io(format!("multicast bind on port {}", config.port), e)
        })?;
        socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| MessagingError::io(format!("join multicast group {}", group), e))?;
        info!(group = %group, port = config.port, "multicast receiver joined group");

        let core = ReceiverCore::new(serializer);
        let sender = Arc::new(MulticastSender {
            serializer: Arc::clone(&core.serializer),
            config,
            group,
            counters: Arc::clone(&core.counters),
        });
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            core,
            socket,
            allowed_senders,
            own_addresses,
            sender,
            shutdown_tx,
        })
    }
}

#[async_trait]
impl Receiver for MulticastReceiver {
    async fn run(&self) -> Result<()> {
        let mut buffer = vec![0u8; RECEIVE_BUFFER_BYTES];
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                received = self.socket.recv_from(&mut buffer) => {
                    let (length, source) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!(error = %e, "multicast receive failed");
                            continue;
                        }
                    };
                    let source_ip = source.ip();
                    if !self.allowed_senders.is_empty() && !self.allowed_senders.contains(&source_ip) {
                        debug!(source = %source_ip, "sender not in allow list, dropping datagram");
                        self.core.counters.record_dropped();
                        continue;
                    }
                    let alternative_accept = self.own_addresses.contains(&source_ip);
                    self.core.dispatch(&buffer[..length], alternative_accept).await;
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

/// Sending half of the multicast transport. Binds a transient socket per
/// send.
pub struct MulticastSender {
    serializer: Arc<dyn Serializer>,
    config: MulticastConfig,
    group: Ipv4Addr,
    counters: Arc<crate::transport::TransportCounters>,
}

impl MulticastSender {
    fn bind_address(&self) -> String {
        match &self.config.bind_address {
            Some(address) if address.contains(':') => address.clone(),
            Some(address) => format!("{}:0", address),
            None => "0.0.0.0:0".to_string(),
        }
    }

    async fn publish(&self, raw: Vec<u8>) -> Result<()> {
        let socket = UdpSocket::bind(self.bind_address())
            .await
            .map_err(|e| MessagingError::io("multicast send socket bind", e))?;
        let target = SocketAddr::from((self.group, self.config.port));
        socket
            .send_to(&raw, target)
            .await
            .map_err(|e| MessagingError::io(format!("multicast send to {}", target), e))?;
        Ok(())
    }
}

#[async_trait]
impl Sender for MulticastSender {
    async fn send(&self, event: Event) -> bool {
        if self.config.send_disabled {
            debug!(event = %event, "multicast sending disabled, dropping event");
            return true;
        }
        let (event, raw) = match prepare_outgoing(self.serializer.as_ref(), event) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, "could not serialize event");
                self.counters.record_send_error();
                return false;
            }
        };
        let result = self.publish(raw).await;
        report_send(&self.counters, &event, result)
    }
}

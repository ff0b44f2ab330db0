//! # Transport Adapters
//!
//! Five interchangeable wire transports behind one `Sender`/`Receiver`
//! contract, so the platform can run against whatever clustering or
//! messaging infrastructure an operator already has: the shared cluster
//! client (reliable topic), a key-value broker, a message broker, plain UDP
//! multicast with no infrastructure at all, or a group-membership channel.
//! Exactly one transport is active per deployment; the factory selects it
//! from configuration at startup.
//!
//! Loop prevention intentionally differs between transports: the topic,
//! key-value and broker transports rely on the dispatch core's node-id
//! comparison, while the raw-datagram and membership transports filter by
//! address at the transport layer. The inconsistency is inherited behavior,
//! preserved per transport rather than unified.

use crate::dispatch::{handle_event, EventHandler, EventRegistry};
use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::serializer::Serializer;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub mod broker;
pub mod keyvalue;
pub mod membership;
pub mod multicast;
pub mod topic;

pub use broker::{BrokerReceiver, BrokerSender};
pub use keyvalue::{KeyValueReceiver, KeyValueSender};
pub use membership::{MembershipReceiver, MembershipSender};
pub use multicast::{MulticastReceiver, MulticastSender};
pub use topic::{ClusterClient, TopicReceiver, TopicSender};

/// Sending half of a transport. `send` is synchronous fire-and-forget: it
/// stamps the origin, serializes and transmits once; transmission failures
/// are logged and surfaced only as `false`, never as an error, and callers
/// must not assume delivery.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, event: Event) -> bool;
}

/// Receiving half of a transport
#[async_trait]
pub trait Receiver: Send + Sync {
    /// The long-lived receive loop. Runs until the transport is closed.
    async fn run(&self) -> Result<()>;

    /// Append a handler for an event kind.
    fn register_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>);

    /// Replace the fallback handler used when no specific handler matches.
    fn set_default_handler(&self, handler: Arc<dyn EventHandler>);

    /// A sender sharing this receiver's transport resources.
    fn create_sender(&self) -> Arc<dyn Sender>;

    /// Release transport resources and stop the receive loop.
    async fn close(&self) -> Result<()>;
}

/// Lightweight per-transport traffic counters
#[derive(Debug, Default)]
pub struct TransportCounters {
    sent: AtomicU64,
    received: AtomicU64,
    send_errors: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time view of [`TransportCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub sent: u64,
    pub received: u64,
    pub send_errors: u64,
    pub dropped: u64,
}

impl TransportCounters {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every receiver implementation: the serializer, the
/// handler registry and the traffic counters.
#[derive(Clone)]
pub(crate) struct ReceiverCore {
    pub serializer: Arc<dyn Serializer>,
    pub registry: Arc<EventRegistry>,
    pub counters: Arc<TransportCounters>,
}

impl ReceiverCore {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            serializer,
            registry: Arc::new(EventRegistry::new()),
            counters: Arc::new(TransportCounters::default()),
        }
    }

    /// Feed one raw wire payload into the dispatch core.
    pub async fn dispatch(&self, raw: &[u8], alternative_accept: bool) {
        self.counters.record_received();
        handle_event(&self.registry, &self.serializer, raw, alternative_accept).await;
    }
}

/// Create the receiver for the transport selected by the platform
/// configuration. Setup hard failures (unreachable broker, socket bind
/// failure) escalate as fatal configuration errors.
pub async fn create_receiver(serializer: Arc<dyn Serializer>) -> Result<Arc<dyn Receiver>> {
    use crate::config::TransportMode;

    match serializer.platform_config().transport {
        TransportMode::Topic => {
            let receiver = TopicReceiver::configure(serializer).await?;
            Ok(Arc::new(receiver))
        }
        TransportMode::KeyValue => {
            let receiver = KeyValueReceiver::configure(serializer)?;
            Ok(Arc::new(receiver))
        }
        TransportMode::Broker => {
            let receiver = BrokerReceiver::configure(serializer).await?;
            Ok(Arc::new(receiver))
        }
        TransportMode::Multicast => {
            let receiver = MulticastReceiver::configure(serializer).await?;
            Ok(Arc::new(receiver))
        }
        TransportMode::Membership => {
            let receiver = MembershipReceiver::configure(serializer).await?;
            Ok(Arc::new(receiver))
        }
    }
}

/// Stamp the local node identity onto an outgoing event and serialize it.
pub(crate) fn prepare_outgoing(serializer: &dyn Serializer, mut event: Event) -> Result<(Event, Vec<u8>)> {
    event.stamp_origin(serializer.node_id());
    let raw = serializer.serialize(&event)?;
    Ok((event, raw))
}

/// Shared send-side bookkeeping: log + count the outcome of a transmission.
pub(crate) fn report_send(counters: &TransportCounters, event: &Event, result: Result<()>) -> bool {
    match result {
        Ok(()) => {
            counters.record_sent();
            true
        }
        Err(e) => {
            counters.record_send_error();
            tracing::error!(event = %event, error = %e, "send failed");
            false
        }
    }
}

//! # Siteplex Messaging
//!
//! Cluster messaging for multi-node site hosting: node-to-node event
//! publication and broadcast over interchangeable wire transports, a
//! gossip-maintained view of every node's hosted sites, and quorum-aware
//! coordination of rolling site reloads.
//!
//! ## Architecture
//!
//! - [`event`] — the event model: one serializable [`event::Event`] per
//!   cluster operation, carrying its own receive-side effect
//! - [`dispatch`] — the shared receive path every transport feeds into:
//!   decoding, loop suppression, isolated handler invocation
//! - [`transport`] — the five wire transports behind the
//!   [`transport::Sender`]/[`transport::Receiver`] contracts
//! - [`cluster`] — per-node state gossip and the reload quorum gate
//! - [`platform`] — the narrow contracts to the hosting platform
//! - [`serializer`] — pluggable wire codec
//! - [`config`] — file- and environment-driven configuration
//!
//! ## Usage
//!
//! ```no_run
//! use siteplex_messaging::{init_messaging, spawn_receiver, Event, MessagingConfig};
//! use siteplex_messaging::platform::{MapEnvironment, SiteRegistry};
//! use std::sync::Arc;
//!
//! # async fn run() -> siteplex_messaging::Result<()> {
//! let environment = Arc::new(MapEnvironment::new());
//! let sites = Arc::new(SiteRegistry::new());
//! let (receiver, sender) =
//!     init_messaging(MessagingConfig::default(), "node-1", environment, sites).await?;
//! spawn_receiver(Arc::clone(&receiver));
//!
//! sender.send(Event::reload_site("my-site", None)).await;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod platform;
pub mod serializer;
pub mod testing;
pub mod transport;

pub use cluster::{ClusterState, NodeState, SiteState};
pub use config::{MessagingConfig, TransportMode, DEFAULT_CHANNEL};
pub use dispatch::{EventHandler, EventRegistry};
pub use error::{MessagingError, Result};
pub use event::{broadcast_node_state, Event, EventKind, EventPayload};
pub use serializer::{EventCodec, Serializer};
pub use transport::{create_receiver, Receiver, Sender};

use platform::{Environment, SiteRegistry};
use std::sync::Arc;

/// Wire the messaging subsystem into `environment` and start the
/// configured transport: registers the node identity, an empty cluster
/// state, the reload settings and the site registry, then builds the
/// receiver and publishes its sender for event effects to use.
///
/// The returned receiver is not yet running; pass it to
/// [`spawn_receiver`] or drive [`Receiver::run`] yourself.
pub async fn init_messaging(
    config: MessagingConfig,
    node_id: &str,
    environment: Arc<dyn Environment>,
    sites: Arc<SiteRegistry>,
) -> Result<(Arc<dyn Receiver>, Arc<dyn Sender>)> {
    platform::register_node_id(environment.as_ref(), node_id);
    platform::register_cluster_state(environment.as_ref(), Arc::new(ClusterState::new()));
    platform::register_reload_settings(environment.as_ref(), config.reload.clone());
    platform::register_sites(environment.as_ref(), Arc::clone(&sites));

    let serializer: Arc<dyn Serializer> = Arc::new(EventCodec::new(
        node_id,
        Arc::clone(&environment),
        config,
        sites,
    ));
    let receiver = transport::create_receiver(serializer).await?;
    let sender = receiver.create_sender();
    platform::register_sender(environment.as_ref(), Arc::clone(&sender));
    Ok((receiver, sender))
}

/// Drive a receiver's run loop on the runtime. The loop only terminates on
/// close or on a fatal transport error, which is logged.
pub fn spawn_receiver(receiver: Arc<dyn Receiver>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = receiver.run().await {
            tracing::error!(error = %e, "receiver loop terminated");
        }
    })
}

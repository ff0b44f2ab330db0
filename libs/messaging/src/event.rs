//! # Cluster Event Model
//!
//! The closed set of messages broadcast between cluster members. Every event
//! carries the identity of its origin node and knows how to apply itself on
//! a receiving node via [`Event::perform`]. Administrative events may carry
//! a target node id; when present, `perform` runs only on the addressed
//! node, absence means "all nodes".
//!
//! Origin stamping happens exactly once, pre-send: the sender writes the
//! local node id into events constructed with an empty origin. Node-state
//! gossip is the one exception — it pre-stamps a `#state` sub-origin at
//! construction so a node's own snapshot broadcast survives the self-origin
//! suppression of the dispatch core and the node tracks itself in the
//! cluster map.

use crate::cluster::{quorum, NodeState, SiteState};
use crate::error::{MessagingError, Result};
use crate::platform::{self, Environment, Site};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sub-origin suffix stamped on node-state gossip broadcasts
pub const NODE_STATE_SUFFIX: &str = "#state";

/// Discriminant of an event, used as the handler-registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    NodeState,
    SiteStateChanged,
    ReloadSite,
    StopSite,
    SiteDeleted,
    ReloadTemplate,
    RequestNodeState,
    NodeShutdown,
}

/// Variant-specific payload of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Full state snapshot of the origin node (gossip)
    NodeState(NodeState),
    /// One site changed state on the origin node
    SiteStateChanged { state: SiteState },
    /// Reload the site, gated by the quorum wait
    ReloadSite,
    /// Stop the site, no quorum wait
    StopSite,
    /// The site was deleted; shut down and clean up local resources
    SiteDeleted,
    /// Reload the platform template for the site
    ReloadTemplate,
    /// Ask the receiving node to broadcast its own full snapshot
    RequestNodeState,
    /// The origin node is shutting down
    NodeShutdown,
}

/// A broadcast message replayed on every cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    origin_node_id: String,
    site_name: Option<String>,
    target_node_id: Option<String>,
    payload: EventPayload,
}

impl Event {
    fn new(site_name: Option<&str>, target_node_id: Option<&str>, payload: EventPayload) -> Self {
        Self {
            origin_node_id: String::new(),
            site_name: site_name.map(String::from),
            target_node_id: target_node_id.map(String::from),
            payload,
        }
    }

    /// Gossip broadcast of a full local snapshot. Pre-stamps the `#state`
    /// sub-origin so the sender's own broadcast is not self-suppressed.
    pub fn node_state(snapshot: NodeState) -> Self {
        let origin = format!("{}{}", snapshot.node_id, NODE_STATE_SUFFIX);
        Self {
            origin_node_id: origin,
            site_name: None,
            target_node_id: None,
            payload: EventPayload::NodeState(snapshot),
        }
    }

    pub fn site_state_changed(site_name: &str, state: SiteState) -> Self {
        Self::new(Some(site_name), None, EventPayload::SiteStateChanged { state })
    }

    pub fn reload_site(site_name: &str, target_node_id: Option<&str>) -> Self {
        Self::new(Some(site_name), target_node_id, EventPayload::ReloadSite)
    }

    pub fn stop_site(site_name: &str, target_node_id: Option<&str>) -> Self {
        Self::new(Some(site_name), target_node_id, EventPayload::StopSite)
    }

    pub fn site_deleted(site_name: &str) -> Self {
        Self::new(Some(site_name), None, EventPayload::SiteDeleted)
    }

    pub fn reload_template(site_name: &str) -> Self {
        Self::new(Some(site_name), None, EventPayload::ReloadTemplate)
    }

    pub fn request_node_state() -> Self {
        Self::new(None, None, EventPayload::RequestNodeState)
    }

    pub fn node_shutdown() -> Self {
        Self::new(None, None, EventPayload::NodeShutdown)
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::NodeState(_) => EventKind::NodeState,
            EventPayload::SiteStateChanged { .. } => EventKind::SiteStateChanged,
            EventPayload::ReloadSite => EventKind::ReloadSite,
            EventPayload::StopSite => EventKind::StopSite,
            EventPayload::SiteDeleted => EventKind::SiteDeleted,
            EventPayload::ReloadTemplate => EventKind::ReloadTemplate,
            EventPayload::RequestNodeState => EventKind::RequestNodeState,
            EventPayload::NodeShutdown => EventKind::NodeShutdown,
        }
    }

    pub fn origin_node_id(&self) -> &str {
        &self.origin_node_id
    }

    /// Origin with any sub-origin suffix stripped: the actual node identity.
    pub fn base_origin(&self) -> &str {
        self.origin_node_id
            .split_once('#')
            .map(|(base, _)| base)
            .unwrap_or(&self.origin_node_id)
    }

    pub fn site_name(&self) -> Option<&str> {
        self.site_name.as_deref()
    }

    pub fn target_node_id(&self) -> Option<&str> {
        self.target_node_id.as_deref()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Whether handlers for this event are fanned out on the task pool
    /// instead of being awaited in wire order.
    pub fn is_async(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::NodeState | EventKind::RequestNodeState
        )
    }

    /// A missing target means "all nodes".
    pub fn matches_target(&self, local_node_id: &str) -> bool {
        self.target_node_id
            .as_deref()
            .map_or(true, |target| target == local_node_id)
    }

    /// Stamp the origin to the sending node's identity. A no-op for events
    /// that pre-stamped a sub-origin at construction.
    pub(crate) fn stamp_origin(&mut self, node_id: &str) {
        if self.origin_node_id.is_empty() {
            self.origin_node_id = node_id.to_string();
        }
    }

    /// Apply this event on the receiving node.
    pub async fn perform(
        &self,
        environment: &Arc<dyn Environment>,
        _site: Option<&Arc<dyn Site>>,
    ) -> Result<()> {
        match &self.payload {
            EventPayload::NodeState(snapshot) => {
                let cluster = required_cluster_state(environment)?;
                cluster.put_node(snapshot.clone());
                Ok(())
            }

            EventPayload::SiteStateChanged { state } => {
                let site_name = self.required_site_name()?;
                let cluster = required_cluster_state(environment)?;
                cluster.apply_site_state(self.base_origin(), site_name, *state);
                debug!(
                    node = self.base_origin(),
                    site = site_name,
                    state = %state,
                    "applied site state change"
                );
                // piggyback a resync ping on the cheap incremental signal:
                // every peer, the origin included, answers with a full
                // snapshot broadcast
                match platform::sender(environment.as_ref()) {
                    Some(sender) => {
                        sender.send(Event::request_node_state()).await;
                    }
                    None => warn!("no sender registered, skipping state resync ping"),
                }
                Ok(())
            }

            EventPayload::ReloadSite => {
                let local_node_id = required_node_id(environment)?;
                if !self.matches_target(&local_node_id) {
                    debug!(
                        target = ?self.target_node_id,
                        node = %local_node_id,
                        "reload not addressed to this node, ignoring"
                    );
                    return Ok(());
                }
                let site_name = self.required_site_name()?;
                let settings = platform::reload_settings(environment.as_ref()).unwrap_or_default();

                let delay =
                    quorum::jittered_delay(Duration::from_millis(settings.max_random_delay_ms));
                debug!(site = site_name, ?delay, "delaying reload");
                tokio::time::sleep(delay).await;

                if settings.quorum_enabled {
                    let cluster = required_cluster_state(environment)?;
                    quorum::await_site_quorum(&cluster, site_name, &settings).await;
                }

                info!(site = site_name, "reloading site");
                required_initializer(environment)?
                    .load_site(Arc::clone(environment), site_name)
                    .await
            }

            EventPayload::StopSite => {
                let local_node_id = required_node_id(environment)?;
                if !self.matches_target(&local_node_id) {
                    debug!(
                        target = ?self.target_node_id,
                        node = %local_node_id,
                        "stop not addressed to this node, ignoring"
                    );
                    return Ok(());
                }
                let site_name = self.required_site_name()?;
                info!(site = site_name, "stopping site");
                required_initializer(environment)?
                    .stop_site(Arc::clone(environment), site_name)
                    .await
            }

            EventPayload::SiteDeleted => {
                let site_name = self.required_site_name()?;
                info!(site = site_name, "site deleted, shutting down local instance");
                if let Some(cluster) = platform::cluster_state(environment.as_ref()) {
                    cluster.forget_site(site_name);
                }
                if let Some(sites) = platform::sites(environment.as_ref()) {
                    sites.remove(site_name);
                }
                required_initializer(environment)?
                    .shutdown_site(Arc::clone(environment), site_name)
                    .await
            }

            EventPayload::ReloadTemplate => {
                let site_name = self.required_site_name()?;
                info!(site = site_name, "reloading template");
                required_template_service(environment)?
                    .reload_template(Arc::clone(environment), site_name)
                    .await
            }

            EventPayload::RequestNodeState => {
                broadcast_node_state(environment).await;
                Ok(())
            }

            EventPayload::NodeShutdown => {
                let node = self.base_origin();
                let cluster = required_cluster_state(environment)?;
                if cluster.remove_node(node) {
                    info!(node, "removed node from cluster state");
                }
                Ok(())
            }
        }
    }

    fn required_site_name(&self) -> Result<&str> {
        self.site_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                MessagingError::handler("perform", format!("{:?} event without a site name", self.kind()))
            })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} from {}",
            self.kind(),
            if self.origin_node_id.is_empty() {
                "<unstamped>"
            } else {
                &self.origin_node_id
            }
        )?;
        if let Some(site) = &self.site_name {
            write!(f, " (site {})", site)?;
        }
        if let Some(target) = &self.target_node_id {
            write!(f, " -> {}", target)?;
        }
        Ok(())
    }
}

/// Broadcast a fresh full snapshot of the local node via the active sender.
pub async fn broadcast_node_state(environment: &Arc<dyn Environment>) {
    let Some(node_id) = platform::node_id(environment.as_ref()) else {
        warn!("no local node id registered, skipping node state broadcast");
        return;
    };
    let Some(sender) = platform::sender(environment.as_ref()) else {
        warn!("no sender registered, skipping node state broadcast");
        return;
    };
    let site_states = platform::sites(environment.as_ref())
        .map(|sites| sites.snapshot_states())
        .unwrap_or_default();
    let snapshot = NodeState::capture(&node_id, site_states);
    if !sender.send(Event::node_state(snapshot)).await {
        warn!(node = %node_id, "node state broadcast failed");
    }
}

fn required_node_id(environment: &Arc<dyn Environment>) -> Result<String> {
    platform::node_id(environment.as_ref())
        .ok_or_else(|| MessagingError::configuration("local node id not registered", None))
}

fn required_cluster_state(
    environment: &Arc<dyn Environment>,
) -> Result<Arc<crate::cluster::ClusterState>> {
    platform::cluster_state(environment.as_ref())
        .ok_or_else(|| MessagingError::configuration("cluster state not registered", None))
}

fn required_initializer(
    environment: &Arc<dyn Environment>,
) -> Result<Arc<dyn platform::SiteInitializer>> {
    platform::initializer(environment.as_ref())
        .ok_or_else(|| MessagingError::configuration("site initializer not registered", None))
}

fn required_template_service(
    environment: &Arc<dyn Environment>,
) -> Result<Arc<dyn platform::TemplateService>> {
    platform::template_service(environment.as_ref())
        .ok_or_else(|| MessagingError::configuration("template service not registered", None))
}

//! # Platform Collaborator Contracts
//!
//! The messaging subsystem consumes the rest of the platform only through
//! the narrow contracts defined here: a scoped attribute store
//! ([`Environment`]), the hosted-site surface ([`Site`]), and the services
//! that actually load, stop and re-template sites. Event effects resolve
//! their collaborators from the platform scope of the environment, so the
//! subsystem stays free of direct dependencies on the hosting process.

use crate::cluster::{ClusterState, SiteState};
use crate::config::ReloadConfig;
use crate::error::Result;
use crate::transport::Sender;
use async_trait::async_trait;
use dashmap::DashMap;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Attribute scopes of the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Process-wide platform attributes
    Platform,
    /// Per-site attributes
    Site,
    /// Per-node attributes
    Node,
}

/// Scoped attribute store shared with the hosting platform
pub trait Environment: Send + Sync {
    fn attribute(&self, scope: Scope, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
    fn set_attribute(&self, scope: Scope, name: &str, value: Arc<dyn Any + Send + Sync>);
    fn remove_attribute(&self, scope: Scope, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Map-backed environment, the default for embedding and tests
#[derive(Default)]
pub struct MapEnvironment {
    attributes: DashMap<(Scope, String), Arc<dyn Any + Send + Sync>>,
}

impl MapEnvironment {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Environment for MapEnvironment {
    fn attribute(&self, scope: Scope, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attributes
            .get(&(scope, name.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    fn set_attribute(&self, scope: Scope, name: &str, value: Arc<dyn Any + Send + Sync>) {
        self.attributes.insert((scope, name.to_string()), value);
    }

    fn remove_attribute(&self, scope: Scope, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attributes
            .remove(&(scope, name.to_string()))
            .map(|(_, value)| value)
    }
}

/// A hosted web-application instance managed by the platform
pub trait Site: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> SiteState;
    fn set_state(&self, state: SiteState);
    fn property(&self, name: &str) -> Option<String>;
}

/// Process-wide registry of the sites hosted by this node, keyed by name.
/// Entries are registered as sites come up and explicitly removed on site
/// deletion.
#[derive(Default)]
pub struct SiteRegistry {
    sites: DashMap<String, Arc<dyn Site>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, site: Arc<dyn Site>) {
        self.sites.insert(site.name().to_string(), site);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Site>> {
        self.sites.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Site>> {
        self.sites.remove(name).map(|(_, site)| site)
    }

    /// Current lifecycle state of every hosted site, for gossip snapshots.
    pub fn snapshot_states(&self) -> HashMap<String, SiteState> {
        self.sites
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}

/// Service loading, stopping and shutting down sites on the local node
#[async_trait]
pub trait SiteInitializer: Send + Sync {
    /// (Re)load a site, replacing the running instance.
    async fn load_site(&self, environment: Arc<dyn Environment>, site_name: &str) -> Result<()>;
    /// Stop a running site without unloading its resources.
    async fn stop_site(&self, environment: Arc<dyn Environment>, site_name: &str) -> Result<()>;
    /// Shut a site down and clean up its local resources.
    async fn shutdown_site(&self, environment: Arc<dyn Environment>, site_name: &str)
        -> Result<()>;
}

/// Service exposing the platform template reload
#[async_trait]
pub trait TemplateService: Send + Sync {
    async fn reload_template(
        &self,
        environment: Arc<dyn Environment>,
        site_name: &str,
    ) -> Result<()>;
}

/// Platform-scope attribute names used by the messaging subsystem
pub mod attrs {
    pub const NODE_ID: &str = "messaging.nodeId";
    pub const CLUSTER_STATE: &str = "messaging.clusterState";
    pub const SENDER: &str = "messaging.sender";
    pub const SITES: &str = "platform.sites";
    pub const INITIALIZER: &str = "platform.initializer";
    pub const TEMPLATE_SERVICE: &str = "platform.templateService";
    pub const RELOAD_SETTINGS: &str = "messaging.reloadSettings";
}

/// The local node's cluster identity.
pub fn node_id(environment: &dyn Environment) -> Option<String> {
    environment
        .attribute(Scope::Platform, attrs::NODE_ID)?
        .downcast::<String>()
        .ok()
        .map(|id| (*id).clone())
}

pub fn register_node_id(environment: &dyn Environment, node_id: &str) {
    environment.set_attribute(
        Scope::Platform,
        attrs::NODE_ID,
        Arc::new(node_id.to_string()),
    );
}

/// The process-wide cluster state map.
pub fn cluster_state(environment: &dyn Environment) -> Option<Arc<ClusterState>> {
    environment
        .attribute(Scope::Platform, attrs::CLUSTER_STATE)?
        .downcast::<ClusterState>()
        .ok()
}

pub fn register_cluster_state(environment: &dyn Environment, state: Arc<ClusterState>) {
    environment.set_attribute(Scope::Platform, attrs::CLUSTER_STATE, state);
}

/// The sender of the active transport.
pub fn sender(environment: &dyn Environment) -> Option<Arc<dyn Sender>> {
    let value = environment.attribute(Scope::Platform, attrs::SENDER)?;
    let sender = value.downcast::<Arc<dyn Sender>>().ok()?;
    Some((*sender).clone())
}

pub fn register_sender(environment: &dyn Environment, sender: Arc<dyn Sender>) {
    environment.set_attribute(Scope::Platform, attrs::SENDER, Arc::new(sender));
}

/// The registry of locally hosted sites.
pub fn sites(environment: &dyn Environment) -> Option<Arc<SiteRegistry>> {
    environment
        .attribute(Scope::Platform, attrs::SITES)?
        .downcast::<SiteRegistry>()
        .ok()
}

pub fn register_sites(environment: &dyn Environment, sites: Arc<SiteRegistry>) {
    environment.set_attribute(Scope::Platform, attrs::SITES, sites);
}

/// The site initializer service.
pub fn initializer(environment: &dyn Environment) -> Option<Arc<dyn SiteInitializer>> {
    let value = environment.attribute(Scope::Platform, attrs::INITIALIZER)?;
    let service = value.downcast::<Arc<dyn SiteInitializer>>().ok()?;
    Some((*service).clone())
}

pub fn register_initializer(environment: &dyn Environment, service: Arc<dyn SiteInitializer>) {
    environment.set_attribute(Scope::Platform, attrs::INITIALIZER, Arc::new(service));
}

/// The template reload service.
pub fn template_service(environment: &dyn Environment) -> Option<Arc<dyn TemplateService>> {
    let value = environment.attribute(Scope::Platform, attrs::TEMPLATE_SERVICE)?;
    let service = value.downcast::<Arc<dyn TemplateService>>().ok()?;
    Some((*service).clone())
}

pub fn register_template_service(environment: &dyn Environment, service: Arc<dyn TemplateService>) {
    environment.set_attribute(Scope::Platform, attrs::TEMPLATE_SERVICE, Arc::new(service));
}

/// The reload coordination settings.
pub fn reload_settings(environment: &dyn Environment) -> Option<ReloadConfig> {
    environment
        .attribute(Scope::Platform, attrs::RELOAD_SETTINGS)?
        .downcast::<ReloadConfig>()
        .ok()
        .map(|settings| (*settings).clone())
}

pub fn register_reload_settings(environment: &dyn Environment, settings: ReloadConfig) {
    environment.set_attribute(Scope::Platform, attrs::RELOAD_SETTINGS, Arc::new(settings));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_round_trip() {
        let env = MapEnvironment::new();
        env.set_attribute(Scope::Platform, "answer", Arc::new(42u32));

        let value = env.attribute(Scope::Platform, "answer").unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 42);

        // scopes are independent namespaces
        assert!(env.attribute(Scope::Site, "answer").is_none());

        env.remove_attribute(Scope::Platform, "answer");
        assert!(env.attribute(Scope::Platform, "answer").is_none());
    }

    #[test]
    fn test_typed_platform_accessors() {
        let env = MapEnvironment::new();
        assert!(node_id(&env).is_none());
        assert!(cluster_state(&env).is_none());

        register_node_id(&env, "node-1");
        register_cluster_state(&env, Arc::new(ClusterState::new()));
        register_reload_settings(&env, ReloadConfig::default());

        assert_eq!(node_id(&env).as_deref(), Some("node-1"));
        assert_eq!(cluster_state(&env).unwrap().node_count(), 0);
        assert_eq!(reload_settings(&env).unwrap().max_random_delay_ms, 6_000);
    }

    #[test]
    fn test_site_registry_snapshot() {
        use crate::testing::StaticSite;

        let registry = SiteRegistry::new();
        registry.put(Arc::new(StaticSite::new("foo", SiteState::Started)));
        registry.put(Arc::new(StaticSite::new("bar", SiteState::Starting)));

        let states = registry.snapshot_states();
        assert_eq!(states.get("foo"), Some(&SiteState::Started));
        assert_eq!(states.get("bar"), Some(&SiteState::Starting));

        registry.remove("foo");
        assert!(registry.get("foo").is_none());
        assert_eq!(registry.snapshot_states().len(), 1);
    }
}

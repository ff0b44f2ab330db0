//! # Event Wire Codec
//!
//! The [`Serializer`] contract turns events into transport-opaque bytes and
//! back, and gives the dispatch core access to the local node identity, the
//! environment, the platform configuration and site lookup. Transports carry
//! the serialized bytes verbatim inside their native envelopes.
//!
//! Malformed input never errors: [`Serializer::deserialize`] returns `None`
//! and the caller logs and drops the payload.

use crate::config::MessagingConfig;
use crate::error::{MessagingError, Result};
use crate::event::Event;
use crate::platform::{Environment, Site, SiteRegistry};
use std::sync::Arc;

/// Byte (de)serialization of events plus the platform accessors the
/// dispatch core needs
pub trait Serializer: Send + Sync {
    fn serialize(&self, event: &Event) -> Result<Vec<u8>>;
    /// Returns `None` for corrupt or foreign payloads, never an error.
    fn deserialize(&self, raw: &[u8]) -> Option<Event>;
    fn node_id(&self) -> &str;
    fn environment(&self) -> Arc<dyn Environment>;
    fn platform_config(&self) -> &MessagingConfig;
    fn site(&self, name: &str) -> Option<Arc<dyn Site>>;
}

/// Default bincode-backed serializer
pub struct EventCodec {
    node_id: String,
    environment: Arc<dyn Environment>,
    config: MessagingConfig,
    sites: Arc<SiteRegistry>,
}

impl EventCodec {
    pub fn new(
        node_id: &str,
        environment: Arc<dyn Environment>,
        config: MessagingConfig,
        sites: Arc<SiteRegistry>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            environment,
            config,
            sites,
        }
    }
}

impl Serializer for EventCodec {
    fn serialize(&self, event: &Event) -> Result<Vec<u8>> {
        bincode::serialize(event)
            .map_err(|e| MessagingError::serialization(format!("event encode failed: {}", e)))
    }

    fn deserialize(&self, raw: &[u8]) -> Option<Event> {
        bincode::deserialize(raw).ok()
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn environment(&self) -> Arc<dyn Environment> {
        Arc::clone(&self.environment)
    }

    fn platform_config(&self) -> &MessagingConfig {
        &self.config
    }

    fn site(&self, name: &str) -> Option<Arc<dyn Site>> {
        self.sites.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NodeState, SiteState};
    use crate::event::EventKind;
    use crate::platform::MapEnvironment;
    use std::collections::HashMap;

    fn codec(node_id: &str) -> EventCodec {
        EventCodec::new(
            node_id,
            Arc::new(MapEnvironment::new()),
            MessagingConfig::default(),
            Arc::new(SiteRegistry::new()),
        )
    }

    #[test]
    fn test_round_trip_preserves_identity() {
        let codec = codec("node-a");

        let mut event = Event::reload_site("foo", Some("node-b"));
        event.stamp_origin("node-a");
        let raw = codec.serialize(&event).unwrap();
        let decoded = codec.deserialize(&raw).unwrap();

        assert_eq!(decoded.kind(), EventKind::ReloadSite);
        assert_eq!(decoded.origin_node_id(), "node-a");
        assert_eq!(decoded.site_name(), Some("foo"));
        assert_eq!(decoded.target_node_id(), Some("node-b"));
    }

    #[test]
    fn test_round_trip_node_state_payload() {
        let codec = codec("node-a");

        let mut sites = HashMap::new();
        sites.insert("foo".to_string(), SiteState::Started);
        let event = Event::node_state(NodeState::capture("node-a", sites));

        let raw = codec.serialize(&event).unwrap();
        let decoded = codec.deserialize(&raw).unwrap();
        assert_eq!(decoded.origin_node_id(), "node-a#state");
        match decoded.payload() {
            crate::event::EventPayload::NodeState(state) => {
                assert_eq!(state.node_id, "node-a");
                assert_eq!(state.site_states.get("foo"), Some(&SiteState::Started));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_input_yields_none() {
        let codec = codec("node-a");
        assert!(codec.deserialize(b"not an event").is_none());
        assert!(codec.deserialize(&[]).is_none());
    }
}

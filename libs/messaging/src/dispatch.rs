//! # Dispatch Core
//!
//! The single shared procedure every transport's receive path feeds raw
//! bytes into. It turns a wire payload into safe, isolated handler
//! invocations: decode failures are logged and dropped, self-originated
//! events are suppressed (unless the transport supplies an alternative
//! accept condition), and each handler failure is contained to a log line.
//! A single malformed payload or failing handler never stops subsequent
//! message processing on the transport.
//!
//! Handlers of a synchronous event are awaited in wire-arrival order on the
//! receive loop — a slow handler delays subsequent messages on that
//! transport, traded deliberately for simple in-order semantics. Handlers of
//! an async event are each spawned onto the runtime and the loop moves on.

use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::platform::{Environment, Site};
use crate::serializer::Serializer;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A receive-side consumer of events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Identity used in error logs.
    fn name(&self) -> &str {
        "handler"
    }

    async fn on_event(
        &self,
        event: &Event,
        environment: &Arc<dyn Environment>,
        site: Option<&Arc<dyn Site>>,
    ) -> Result<()>;
}

/// Default handler: delegates to the event's own effect.
struct PerformHandler;

#[async_trait]
impl EventHandler for PerformHandler {
    fn name(&self) -> &str {
        "perform"
    }

    async fn on_event(
        &self,
        event: &Event,
        environment: &Arc<dyn Environment>,
        site: Option<&Arc<dyn Site>>,
    ) -> Result<()> {
        event.perform(environment, site).await
    }
}

/// Per-process mapping from event kind to zero-or-more handlers, plus one
/// default handler used when no specific match exists. Populated at startup,
/// read-only during steady-state dispatch.
pub struct EventRegistry {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    default_handler: RwLock<Arc<dyn EventHandler>>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(Arc::new(PerformHandler)),
        }
    }

    /// Append a handler to the ordered list for `kind`.
    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Replace the default handler.
    pub fn set_default_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.default_handler.write() = handler;
    }

    /// The handlers to invoke for `kind`; falls back to the default handler
    /// when none are registered.
    pub fn handlers_for(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        let handlers = self.handlers.read();
        match handlers.get(&kind) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => vec![Arc::clone(&self.default_handler.read())],
        }
    }
}

/// Decode a raw wire payload and run the matching handlers.
///
/// `alternative_accept` overrides the default self-origin suppression; the
/// raw-datagram transport sets it for packets sourced from one of the
/// receiving host's own interface addresses, because multiple node
/// processes can share a host and must not suppress each other.
pub async fn handle_event(
    registry: &EventRegistry,
    serializer: &Arc<dyn Serializer>,
    raw: &[u8],
    alternative_accept: bool,
) {
    let Some(event) = serializer.deserialize(raw) else {
        warn!(bytes = raw.len(), "could not read event, ignoring");
        return;
    };

    // resolve the site exactly once; every handler sees the same reference
    let site = event
        .site_name()
        .filter(|name| !name.trim().is_empty())
        .and_then(|name| serializer.site(name));

    let same_origin = event.origin_node_id() == serializer.node_id();
    if same_origin && !alternative_accept {
        debug!(event = %event, "event from myself, ignoring");
        return;
    }

    debug!(event = %event, "handling event");
    let environment = serializer.environment();
    for handler in registry.handlers_for(event.kind()) {
        if event.is_async() {
            let handler = Arc::clone(&handler);
            let event = event.clone();
            let environment = Arc::clone(&environment);
            let site = site.clone();
            tokio::spawn(async move {
                safe_invoke(handler.as_ref(), &event, &environment, site.as_ref()).await;
            });
        } else {
            safe_invoke(handler.as_ref(), &event, &environment, site.as_ref()).await;
        }
    }
}

/// Invoke one handler; failures are logged with event and handler identity
/// and never propagate.
async fn safe_invoke(
    handler: &dyn EventHandler,
    event: &Event,
    environment: &Arc<dyn Environment>,
    site: Option<&Arc<dyn Site>>,
) {
    if let Err(e) = handler.on_event(event, environment, site).await {
        error!(
            event = %event,
            handler = handler.name(),
            error = %e,
            "error while handling event"
        );
    }
}

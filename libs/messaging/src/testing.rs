//! # Test Doubles
//!
//! In-memory stand-ins for the platform collaborators and an in-process
//! loopback transport, shared between this crate's unit tests and the
//! end-to-end suite.

use crate::dispatch::EventHandler;
use crate::error::{MessagingError, Result};
use crate::event::{Event, EventKind};
use crate::platform::{Environment, Site, SiteInitializer, TemplateService};
use crate::serializer::Serializer;
use crate::transport::{prepare_outgoing, report_send, Receiver, ReceiverCore, Sender};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};

/// A site with a fixed name and a mutable state, nothing else.
pub struct StaticSite {
    name: String,
    state: Mutex<crate::cluster::SiteState>,
}

impl StaticSite {
    pub fn new(name: &str, state: crate::cluster::SiteState) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(state),
        }
    }
}

impl Site for StaticSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> crate::cluster::SiteState {
        *self.state.lock()
    }

    fn set_state(&self, state: crate::cluster::SiteState) {
        *self.state.lock() = state;
    }

    fn property(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Handler that records every event it sees.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Wait until at least `count` events were recorded, or `timeout`
    /// elapses. Returns whether the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count() >= count {
                return true;
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() >= count;
            }
        }
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_event(
        &self,
        event: &Event,
        _environment: &Arc<dyn Environment>,
        _site: Option<&Arc<dyn Site>>,
    ) -> Result<()> {
        self.events.lock().push(event.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Site initializer that records `(operation, site)` pairs.
#[derive(Default)]
pub struct RecordingInitializer {
    calls: Mutex<Vec<(String, String)>>,
    notify: Notify,
}

impl RecordingInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.calls.lock().len() >= count {
                return true;
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.calls.lock().len() >= count;
            }
        }
    }

    fn record(&self, operation: &str, site_name: &str) {
        self.calls
            .lock()
            .push((operation.to_string(), site_name.to_string()));
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl SiteInitializer for RecordingInitializer {
    async fn load_site(&self, _environment: Arc<dyn Environment>, site_name: &str) -> Result<()> {
        self.record("load", site_name);
        Ok(())
    }

    async fn stop_site(&self, _environment: Arc<dyn Environment>, site_name: &str) -> Result<()> {
        self.record("stop", site_name);
        Ok(())
    }

    async fn shutdown_site(
        &self,
        _environment: Arc<dyn Environment>,
        site_name: &str,
    ) -> Result<()> {
        self.record("shutdown", site_name);
        Ok(())
    }
}

/// Template service that records reloaded site names.
#[derive(Default)]
pub struct RecordingTemplateService {
    reloads: Mutex<Vec<String>>,
}

impl RecordingTemplateService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reloads(&self) -> Vec<String> {
        self.reloads.lock().clone()
    }
}

#[async_trait]
impl TemplateService for RecordingTemplateService {
    async fn reload_template(
        &self,
        _environment: Arc<dyn Environment>,
        site_name: &str,
    ) -> Result<()> {
        self.reloads.lock().push(site_name.to_string());
        Ok(())
    }
}

const LOOPBACK_CAPACITY: usize = 64;

/// In-process transport: serialized events travel over a broadcast channel
/// shared by every node attached to the same bus.
#[derive(Clone)]
pub struct LoopbackBus {
    tx: broadcast::Sender<Vec<u8>>,
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(LOOPBACK_CAPACITY).0,
        }
    }

    /// Put raw bytes on the bus, bypassing serialization.
    pub fn inject(&self, raw: Vec<u8>) {
        let _ = self.tx.send(raw);
    }

    /// Attach a node to the bus.
    pub fn receiver(&self, serializer: Arc<dyn Serializer>) -> LoopbackReceiver {
        let core = ReceiverCore::new(serializer);
        let sender = Arc::new(LoopbackSender {
            serializer: Arc::clone(&core.serializer),
            tx: self.tx.clone(),
            counters: Arc::clone(&core.counters),
        });
        let (shutdown_tx, _) = watch::channel(false);
        LoopbackReceiver {
            core,
            tx: self.tx.clone(),
            // subscribe now so events sent between attach and run are kept
            rx: Mutex::new(Some(self.tx.subscribe())),
            sender,
            shutdown_tx,
        }
    }
}

pub struct LoopbackReceiver {
    core: ReceiverCore,
    tx: broadcast::Sender<Vec<u8>>,
    rx: Mutex<Option<broadcast::Receiver<Vec<u8>>>>,
    sender: Arc<LoopbackSender>,
    shutdown_tx: watch::Sender<bool>,
}

#[async_trait]
impl Receiver for LoopbackReceiver {
    async fn run(&self) -> Result<()> {
        let mut rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => self.tx.subscribe(),
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                received = rx.recv() => match received {
                    Ok(raw) => self.core.dispatch(&raw, false).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.core.counters.record_dropped();
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
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

pub struct LoopbackSender {
    serializer: Arc<dyn Serializer>,
    tx: broadcast::Sender<Vec<u8>>,
    counters: Arc<crate::transport::TransportCounters>,
}

#[async_trait]
impl Sender for LoopbackSender {
    async fn send(&self, event: Event) -> bool {
        let (event, raw) = match prepare_outgoing(self.serializer.as_ref(), event) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!(error = %e, "could not serialize event");
                self.counters.record_send_error();
                return false;
            }
        };
        let result = self
            .tx
            .send(raw)
            .map(|_| ())
            .map_err(|_| MessagingError::transport("loopback bus has no subscribers"));
        report_send(&self.counters, &event, result)
    }
}

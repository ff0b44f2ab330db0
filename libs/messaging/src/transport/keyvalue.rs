//! # Key-Value Store Transport
//!
//! Publish/subscribe through a key-value store's pub/sub facility. The
//! receiver holds one long-lived subscription connection; the sender opens
//! a short-lived connection per publish and drops it immediately after.
//! Loop prevention relies entirely on the dispatch core's node-id
//! suppression, since the store echoes every publish back to the
//! publisher's own subscription.

use crate::config::KeyValueConfig;
use crate::dispatch::EventHandler;
use crate::error::{MessagingError, Result};
use crate::event::{Event, EventKind};
use crate::serializer::Serializer;
use crate::transport::{prepare_outgoing, report_send, Receiver, ReceiverCore, Sender};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

fn connection_url(config: &KeyValueConfig) -> String {
    if config.password.is_empty() {
        format!("redis://{}:{}/", config.host, config.port)
    } else {
        format!("redis://:{}@{}:{}/", config.password, config.host, config.port)
    }
}

/// Receiving half of the key-value transport
pub struct KeyValueReceiver {
    core: ReceiverCore,
    client: redis::Client,
    channel: String,
    connect_timeout_ms: Option<u64>,
    sender: Arc<KeyValueSender>,
    shutdown_tx: watch::Sender<bool>,
}

impl KeyValueReceiver {
    /// Validate the connection parameters and build the receiver. The
    /// actual subscription connection is opened by [`Receiver::run`].
    pub fn configure(serializer: Arc<dyn Serializer>) -> Result<Self> {
        let config = serializer.platform_config();
        let channel = config.channel.clone();
        let connect_timeout_ms = config.keyvalue.timeout_ms;
        let url = connection_url(&config.keyvalue);
        let client = redis::Client::open(url.as_str()).map_err(|e| {
            MessagingError::configuration(
                format!("invalid key-value store address {}:{}: {}", config.keyvalue.host, config.keyvalue.port, e),
                Some("keyvalue"),
            )
        })?;

        let core = ReceiverCore::new(serializer);
        let sender = Arc::new(KeyValueSender {
            serializer: Arc::clone(&core.serializer),
            url,
            channel: channel.clone(),
            counters: Arc::clone(&core.counters),
        });
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            core,
            client,
            channel,
            connect_timeout_ms,
            sender,
            shutdown_tx,
        })
    }
}

#[async_trait]
impl Receiver for KeyValueReceiver {
    async fn run(&self) -> Result<()> {
        let connect = self.client.get_async_pubsub();
        let mut pubsub = match self.connect_timeout_ms {
            Some(timeout_ms) => {
                tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), connect)
                    .await
                    .map_err(|_| {
                        MessagingError::timeout("key-value subscription connect", timeout_ms)
                    })?
            }
            None => connect.await,
        }
        .map_err(|e| {
            MessagingError::transport_with_source("key-value subscription connect failed", e)
        })?;
        pubsub.subscribe(&self.channel).await.map_err(|e| {
            MessagingError::transport_with_source(
                format!("could not subscribe to channel {}", self.channel),
                e,
            )
        })?;
        info!(channel = %self.channel, "key-value receiver subscribed");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                message = stream.next() => match message {
                    Some(message) => {
                        let raw: Vec<u8> = match message.get_payload() {
                            Ok(raw) => raw,
                            Err(e) => {
                                debug!(error = %e, "unreadable pub/sub payload, dropping");
                                self.core.counters.record_dropped();
                                continue;
                            }
                        };
                        self.core.dispatch(&raw, false).await;
                    }
                    None => {
                        debug!(channel = %self.channel, "key-value subscription stream ended");
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
        Ok(())
    }
}

/// Sending half of the key-value transport. Stateless between sends: each
/// publish opens a fresh connection and drops it afterwards.
pub struct KeyValueSender {
    serializer: Arc<dyn Serializer>,
    url: String,
    channel: String,
    counters: Arc<crate::transport::TransportCounters>,
}

impl KeyValueSender {
    async fn publish(&self, raw: Vec<u8>) -> Result<()> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| MessagingError::transport_with_source("key-value client open failed", e))?;
        let mut conn = client.get_multiplexed_async_connection().await.map_err(|e| {
            MessagingError::transport_with_source("key-value publish connect failed", e)
        })?;
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(raw)
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::transport_with_source("key-value publish failed", e))?;
        Ok(())
    }
}

#[async_trait]
impl Sender for KeyValueSender {
    async fn send(&self, event: Event) -> bool {
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

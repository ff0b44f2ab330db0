//! Shared fixtures for the end-to-end suite: multi-node clusters wired
//! over the in-process loopback bus.

use siteplex_messaging::config::ReloadConfig;
use siteplex_messaging::platform::{self, Environment, MapEnvironment, SiteRegistry};
use siteplex_messaging::testing::{LoopbackBus, LoopbackReceiver};
use siteplex_messaging::{ClusterState, EventCodec, MessagingConfig, Receiver, Sender, Serializer};
use std::sync::Arc;
use std::time::Duration;

/// One simulated cluster node attached to a loopback bus.
pub struct TestNode {
    pub node_id: String,
    pub environment: Arc<dyn Environment>,
    pub sites: Arc<SiteRegistry>,
    pub cluster: Arc<ClusterState>,
    pub receiver: Arc<LoopbackReceiver>,
    pub sender: Arc<dyn Sender>,
}

impl TestNode {
    /// Drive the node's receive loop on the runtime.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let receiver: Arc<dyn Receiver> = Arc::clone(&self.receiver) as Arc<dyn Receiver>;
        siteplex_messaging::spawn_receiver(receiver)
    }
}

/// Route crate logs to the test harness output, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "siteplex_messaging=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Build a node with the full platform wiring and attach it to `bus`.
/// Reload coordination runs without jitter or quorum so tests stay fast;
/// tests that exercise the quorum gate override the settings themselves.
pub fn attach_node(bus: &LoopbackBus, node_id: &str) -> TestNode {
    init_tracing();
    let environment: Arc<dyn Environment> = Arc::new(MapEnvironment::new());
    let cluster = Arc::new(ClusterState::new());
    let sites = Arc::new(SiteRegistry::new());
    platform::register_node_id(environment.as_ref(), node_id);
    platform::register_cluster_state(environment.as_ref(), Arc::clone(&cluster));
    platform::register_sites(environment.as_ref(), Arc::clone(&sites));
    platform::register_reload_settings(
        environment.as_ref(),
        ReloadConfig {
            max_random_delay_ms: 0,
            quorum_enabled: false,
            poll_interval_ms: 10,
            max_wait_ms: 100,
        },
    );

    let serializer: Arc<dyn Serializer> = Arc::new(EventCodec::new(
        node_id,
        Arc::clone(&environment),
        MessagingConfig::default(),
        Arc::clone(&sites),
    ));
    let receiver = Arc::new(bus.receiver(serializer));
    let sender = receiver.create_sender();
    platform::register_sender(environment.as_ref(), Arc::clone(&sender));

    TestNode {
        node_id: node_id.to_string(),
        environment,
        sites,
        cluster,
        receiver,
        sender,
    }
}

/// Poll `condition` until it holds or two seconds elapse.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

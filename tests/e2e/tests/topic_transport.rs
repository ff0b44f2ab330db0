//! Two nodes exchanging events over the reliable-topic transport's real
//! TCP peer mesh on localhost.

use siteplex_messaging::config::{MessagingConfig, TopicConfig, TransportMode};
use siteplex_messaging::platform::{self, Environment, MapEnvironment, SiteRegistry};
use siteplex_messaging::testing::RecordingHandler;
use siteplex_messaging::transport::TopicReceiver;
use siteplex_messaging::{ClusterState, Event, EventCodec, EventKind, Receiver, Serializer};
use std::sync::Arc;
use std::time::Duration;

fn topic_serializer(node_id: &str) -> Arc<dyn Serializer> {
    let environment: Arc<dyn Environment> = Arc::new(MapEnvironment::new());
    platform::register_node_id(environment.as_ref(), node_id);
    platform::register_cluster_state(environment.as_ref(), Arc::new(ClusterState::new()));
    let sites = Arc::new(SiteRegistry::new());
    platform::register_sites(environment.as_ref(), Arc::clone(&sites));

    let config = MessagingConfig {
        transport: TransportMode::Topic,
        topic: TopicConfig {
            bind_address: "127.0.0.1:0".to_string(),
            peers: Vec::new(),
        },
        ..MessagingConfig::default()
    };
    Arc::new(EventCodec::new(node_id, environment, config, sites))
}

#[tokio::test]
async fn test_two_nodes_exchange_events_over_tcp() -> anyhow::Result<()> {
    siteplex_e2e::init_tracing();
    let a = Arc::new(TopicReceiver::configure(topic_serializer("node-a")).await?);
    let b = Arc::new(TopicReceiver::configure(topic_serializer("node-b")).await?);
    a.cluster_client().add_peer(b.cluster_client().local_addr());
    b.cluster_client().add_peer(a.cluster_client().local_addr());

    let recorder = Arc::new(RecordingHandler::new());
    b.register_handler(EventKind::StopSite, recorder.clone());

    {
        let a = Arc::clone(&a);
        tokio::spawn(async move { a.run().await });
    }
    {
        let b = Arc::clone(&b);
        tokio::spawn(async move { b.run().await });
    }
    // give both receive loops time to subscribe
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sender = a.create_sender();
    assert!(sender.send(Event::stop_site("foo", None)).await);

    assert!(recorder.wait_for(1, Duration::from_secs(2)).await);
    assert_eq!(recorder.events()[0].origin_node_id(), "node-a");

    a.close().await?;
    b.close().await?;
    Ok(())
}

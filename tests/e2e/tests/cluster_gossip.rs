//! Gossip propagation across a two-node loopback cluster.

use siteplex_e2e::{attach_node, eventually};
use siteplex_messaging::cluster::SiteState;
use siteplex_messaging::testing::{LoopbackBus, StaticSite};
use siteplex_messaging::Event;
use std::sync::Arc;

#[tokio::test]
async fn test_site_state_change_reaches_peer_cluster_view() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    a.start();
    b.start();

    a.sites
        .put(Arc::new(StaticSite::new("foo", SiteState::Started)));
    a.sender
        .send(Event::site_state_changed("foo", SiteState::Started))
        .await;

    // the peer records the change under the originating node
    assert!(
        eventually(|| b.cluster.site_state("node-a", "foo") == Some(SiteState::Started)).await
    );
}

#[tokio::test]
async fn test_state_change_draws_full_snapshot_from_origin_node() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    a.start();
    b.start();

    a.sites
        .put(Arc::new(StaticSite::new("foo", SiteState::Starting)));
    a.sites
        .put(Arc::new(StaticSite::new("bar", SiteState::Started)));
    a.sender
        .send(Event::site_state_changed("foo", SiteState::Starting))
        .await;

    // the change makes the peer ping for snapshots; the origin answers with
    // its full state, so the peer converges beyond the one changed site
    assert!(
        eventually(|| {
            b.cluster.site_state("node-a", "foo") == Some(SiteState::Starting)
                && b.cluster.site_state("node-a", "bar") == Some(SiteState::Started)
        })
        .await
    );
}

#[tokio::test]
async fn test_request_node_state_collects_snapshots() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    a.start();
    b.start();

    b.sites
        .put(Arc::new(StaticSite::new("shop", SiteState::Started)));
    a.sender.send(Event::request_node_state()).await;

    assert!(
        eventually(|| a.cluster.site_state("node-b", "shop") == Some(SiteState::Started)).await
    );
}

#[tokio::test]
async fn test_node_shutdown_removes_node_from_peer_view() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    a.start();
    b.start();

    a.sites
        .put(Arc::new(StaticSite::new("foo", SiteState::Started)));
    b.sender.send(Event::request_node_state()).await;
    assert!(eventually(|| b.cluster.node("node-a").is_some()).await);

    a.sender.send(Event::node_shutdown()).await;
    assert!(eventually(|| b.cluster.node("node-a").is_none()).await);
}

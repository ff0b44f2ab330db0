//! Site lifecycle operations across the loopback cluster: reloads, stops,
//! deletions and template reloads landing on the right nodes.

use siteplex_e2e::{attach_node, eventually};
use siteplex_messaging::cluster::SiteState;
use siteplex_messaging::platform::{self, SiteInitializer, TemplateService};
use siteplex_messaging::testing::{
    LoopbackBus, RecordingInitializer, RecordingTemplateService, StaticSite,
};
use siteplex_messaging::Event;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_reload_site_invokes_initializer_on_peers() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    let initializer = Arc::new(RecordingInitializer::new());
    platform::register_initializer(
        b.environment.as_ref(),
        Arc::clone(&initializer) as Arc<dyn SiteInitializer>,
    );
    a.start();
    b.start();

    a.sender.send(Event::reload_site("foo", None)).await;

    assert!(initializer.wait_for(1, Duration::from_secs(2)).await);
    assert_eq!(initializer.calls(), vec![("load".to_string(), "foo".to_string())]);
}

#[tokio::test]
async fn test_targeted_reload_skips_other_nodes() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    let c = attach_node(&bus, "node-c");
    let b_init = Arc::new(RecordingInitializer::new());
    let c_init = Arc::new(RecordingInitializer::new());
    platform::register_initializer(
        b.environment.as_ref(),
        Arc::clone(&b_init) as Arc<dyn SiteInitializer>,
    );
    platform::register_initializer(
        c.environment.as_ref(),
        Arc::clone(&c_init) as Arc<dyn SiteInitializer>,
    );
    a.start();
    b.start();
    c.start();

    a.sender
        .send(Event::reload_site("foo", Some("node-b")))
        .await;

    assert!(b_init.wait_for(1, Duration::from_secs(2)).await);
    assert!(c_init.calls().is_empty());
}

#[tokio::test]
async fn test_stop_site_invokes_initializer() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    let initializer = Arc::new(RecordingInitializer::new());
    platform::register_initializer(
        b.environment.as_ref(),
        Arc::clone(&initializer) as Arc<dyn SiteInitializer>,
    );
    a.start();
    b.start();

    a.sender.send(Event::stop_site("foo", None)).await;

    assert!(initializer.wait_for(1, Duration::from_secs(2)).await);
    assert_eq!(initializer.calls(), vec![("stop".to_string(), "foo".to_string())]);
}

#[tokio::test]
async fn test_site_deleted_cleans_registry_and_cluster_view() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    let initializer = Arc::new(RecordingInitializer::new());
    platform::register_initializer(
        b.environment.as_ref(),
        Arc::clone(&initializer) as Arc<dyn SiteInitializer>,
    );
    a.start();
    b.start();

    b.sites
        .put(Arc::new(StaticSite::new("doomed", SiteState::Started)));
    b.sender
        .send(Event::site_state_changed("doomed", SiteState::Started))
        .await;
    assert!(
        eventually(|| a.cluster.site_state("node-b", "doomed") == Some(SiteState::Started)).await
    );

    a.sender.send(Event::site_deleted("doomed")).await;

    assert!(initializer.wait_for(1, Duration::from_secs(2)).await);
    assert_eq!(
        initializer.calls(),
        vec![("shutdown".to_string(), "doomed".to_string())]
    );
    assert!(eventually(|| b.sites.get("doomed").is_none()).await);
    // every node's view of the deleted site is gone
    assert!(eventually(|| b.cluster.site_state("node-b", "doomed").is_none()).await);
}

#[tokio::test]
async fn test_reload_template_invokes_template_service() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    let templates = Arc::new(RecordingTemplateService::new());
    platform::register_template_service(
        b.environment.as_ref(),
        Arc::clone(&templates) as Arc<dyn TemplateService>,
    );
    a.start();
    b.start();

    a.sender.send(Event::reload_template("foo")).await;

    assert!(eventually(|| templates.reloads() == vec!["foo".to_string()]).await);
}

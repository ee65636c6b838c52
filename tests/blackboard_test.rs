//! Blackboard staging, atomic save, and reconciliation against main-branch
//! changes.

mod common;

use common::{lref, resource_view, start, GROUP_URL, TOOL};
use depi::events::Update;
use depi::model::{ChangeType, ResourceChange, ResourceGroupChange, ResourceRefPattern};
use depi::rpc::{
    AddResourcesToBlackboardRequest, BlackboardLinksRequest, GetResourcesRequest, SessionRequest,
    UpdateResourceGroupRequest,
};

#[tokio::test]
async fn save_promotes_resources_and_links_and_notifies() {
    let server = start().await;
    server.seed_group(&[]).await;

    let mut depi_rx = server
        .service
        .watch_depi(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;

    let resp = server
        .service
        .add_resources_to_blackboard(AddResourcesToBlackboardRequest {
            session_id: server.session_id.clone(),
            resources: vec![resource_view("/a"), resource_view("/b")],
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let resp = server
        .service
        .link_blackboard_resources(BlackboardLinksRequest {
            session_id: server.session_id.clone(),
            links: vec![lref("/a", "/b")],
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let resp = server
        .service
        .save_blackboard(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    // Main now holds both resources and the link.
    let resources = server
        .service
        .get_resources(GetResourcesRequest {
            session_id: server.session_id.clone(),
            patterns: vec![ResourceRefPattern::new(TOOL, GROUP_URL, ".*")],
            include_deleted: false,
        })
        .await;
    assert!(resources.ok);
    let urls: Vec<&str> = resources.resources.iter().map(|r| r.url.as_str()).collect();
    assert!(urls.contains(&"/a"));
    assert!(urls.contains(&"/b"));

    // The blackboard is empty again.
    let bb = server
        .service
        .get_blackboard_resources(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert!(bb.ok);
    assert!(bb.resources.is_empty());
    assert!(bb.links.is_empty());

    // The depi watcher sees AddResource x2 then AddLink, in that order.
    let update = depi_rx.recv().await.expect("expected a depi update");
    assert!(update.ok);
    assert_eq!(update.updates.len(), 3);
    assert!(matches!(&update.updates[0], Update::AddResource { resource } if resource.url == "/a"));
    assert!(matches!(&update.updates[1], Update::AddResource { resource } if resource.url == "/b"));
    assert!(matches!(&update.updates[2], Update::AddLink { link }
        if link.from_res.url == "/a" && link.to_res.url == "/b"));
}

#[tokio::test]
async fn save_fails_on_group_version_mismatch() {
    let server = start().await;
    // Main knows the group at v0.
    server.seed_group(&[]).await;

    let mut stale = resource_view("/a");
    stale.resource_group_version = "v-stale".to_string();
    let resp = server
        .service
        .add_resources_to_blackboard(AddResourcesToBlackboardRequest {
            session_id: server.session_id.clone(),
            resources: vec![stale],
        })
        .await;
    assert!(resp.ok);

    let resp = server
        .service
        .save_blackboard(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert!(!resp.ok);
    assert!(resp.msg.contains("does not match"), "msg: {}", resp.msg);

    // Nothing was promoted.
    let resources = server
        .service
        .get_resources(GetResourcesRequest {
            session_id: server.session_id.clone(),
            patterns: vec![ResourceRefPattern::new(TOOL, GROUP_URL, ".*")],
            include_deleted: true,
        })
        .await;
    assert!(resources.ok);
    assert!(resources.resources.is_empty());

    // The blackboard still holds the staged resource.
    let bb = server
        .service
        .get_blackboard_resources(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert_eq!(bb.resources.len(), 1);
}

#[tokio::test]
async fn main_branch_changes_reconcile_staged_state() {
    let server = start().await;
    server.seed_group(&["/a", "/b"]).await;

    server
        .service
        .add_resources_to_blackboard(AddResourcesToBlackboardRequest {
            session_id: server.session_id.clone(),
            resources: vec![resource_view("/a"), resource_view("/b")],
        })
        .await;
    server
        .service
        .link_blackboard_resources(BlackboardLinksRequest {
            session_id: server.session_id.clone(),
            links: vec![lref("/a", "/b")],
        })
        .await;

    let mut bb_rx = server
        .service
        .watch_blackboard(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;

    // A rename lands on main; the staged resource and link follow it.
    let change = ResourceGroupChange::new("testrepo", TOOL, GROUP_URL, "v1").with_change(
        ResourceChange::new("a", "a", "/a", ChangeType::Renamed).renamed_to("a2", "a2", "/a2"),
    );
    let resp = server
        .service
        .update_resource_group(UpdateResourceGroupRequest {
            session_id: server.session_id.clone(),
            resource_group: change,
            update_branch: String::new(),
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let bb = server
        .service
        .get_blackboard_resources(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    let urls: Vec<&str> = bb.resources.iter().map(|r| r.url.as_str()).collect();
    assert!(urls.contains(&"/a2"));
    assert!(!urls.contains(&"/a"));
    assert_eq!(bb.links.len(), 1);
    assert_eq!(bb.links[0].from_res.url, "/a2");

    let update = bb_rx.recv().await.expect("expected a blackboard update");
    assert!(update.ok);
    assert!(update
        .updates
        .iter()
        .any(|u| matches!(u, Update::ResourceGroupVersionChanged { new_version, .. } if new_version == "v1")));
    assert!(update
        .updates
        .iter()
        .any(|u| matches!(u, Update::RenameResource { .. })));
    assert!(update
        .updates
        .iter()
        .any(|u| matches!(u, Update::RenameLink { .. })));
}

#[tokio::test]
async fn removed_resource_drops_staged_links() {
    let server = start().await;
    server.seed_group(&["/a", "/b"]).await;

    server
        .service
        .add_resources_to_blackboard(AddResourcesToBlackboardRequest {
            session_id: server.session_id.clone(),
            resources: vec![resource_view("/a"), resource_view("/b")],
        })
        .await;
    server
        .service
        .link_blackboard_resources(BlackboardLinksRequest {
            session_id: server.session_id.clone(),
            links: vec![lref("/a", "/b")],
        })
        .await;

    let change = ResourceGroupChange::new("testrepo", TOOL, GROUP_URL, "v1")
        .with_change(ResourceChange::new("a", "a", "/a", ChangeType::Removed));
    let resp = server
        .service
        .update_resource_group(UpdateResourceGroupRequest {
            session_id: server.session_id.clone(),
            resource_group: change,
            update_branch: String::new(),
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let bb = server
        .service
        .get_blackboard_resources(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert!(bb.links.is_empty());
    let urls: Vec<&str> = bb.resources.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(urls, vec!["/b"]);
}

#[tokio::test]
async fn unlink_then_relink_on_the_blackboard() {
    let server = start().await;
    server.seed_group(&[]).await;

    server
        .service
        .add_resources_to_blackboard(AddResourcesToBlackboardRequest {
            session_id: server.session_id.clone(),
            resources: vec![resource_view("/a"), resource_view("/b")],
        })
        .await;
    let link_req = || BlackboardLinksRequest {
        session_id: server.session_id.clone(),
        links: vec![lref("/a", "/b")],
    };

    server.service.link_blackboard_resources(link_req()).await;
    server.service.unlink_blackboard_resources(link_req()).await;

    let bb = server
        .service
        .get_blackboard_resources(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert!(bb.links.is_empty());

    server.service.link_blackboard_resources(link_req()).await;
    let bb = server
        .service
        .get_blackboard_resources(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert_eq!(bb.links.len(), 1);
}

#[tokio::test]
async fn clear_blackboard_discards_staged_state() {
    let server = start().await;
    server.seed_group(&[]).await;

    server
        .service
        .add_resources_to_blackboard(AddResourcesToBlackboardRequest {
            session_id: server.session_id.clone(),
            resources: vec![resource_view("/a")],
        })
        .await;
    let resp = server
        .service
        .clear_blackboard(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert!(resp.ok);

    let bb = server
        .service
        .get_blackboard_resources(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert!(bb.resources.is_empty());
    assert!(bb.links.is_empty());
}

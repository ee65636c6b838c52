//! End-to-end dirtiness scenarios against a fresh snapshot backend.

mod common;

use common::{lref, rref, start, GROUP_URL, TOOL, VERSION};
use depi::model::{ChangeType, ResourceChange, ResourceGroupChange, ResourceRefPattern};
use depi::rpc::{
    GetDirtyLinksRequest, GetResourcesRequest, MarkLinksCleanRequest, UpdateResourceGroupRequest,
};

fn change_request(session_id: &str, change: ResourceGroupChange) -> UpdateResourceGroupRequest {
    UpdateResourceGroupRequest {
        session_id: session_id.to_string(),
        resource_group: change,
        update_branch: String::new(),
    }
}

fn group_change(version: &str) -> ResourceGroupChange {
    ResourceGroupChange::new("testrepo", TOOL, GROUP_URL, version)
}

#[tokio::test]
async fn linear_chain_dirtiness_and_clean_propagation() -> anyhow::Result<()> {
    let server = start().await;
    server.seed_group(&["/r1", "/r2", "/r3", "/r4", "/r5"]).await;
    for pair in [("/r1", "/r2"), ("/r2", "/r3"), ("/r3", "/r4"), ("/r4", "/r5")] {
        server.link(pair.0, pair.1).await;
    }

    // Modify r2; only the link out of r2 becomes dirty, the links further
    // downstream pick up inferred dirtiness from (r2, v0).
    let change = group_change("v1")
        .with_change(ResourceChange::new("r2", "r2", "/r2", ChangeType::Modified));
    let resp = server
        .service
        .update_resource_group(change_request(&server.session_id, change))
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let branch = server.db.branch("main").await?;
    let links = branch.get_all_links(false).await?;
    assert_eq!(links.len(), 4);

    let by_from = |url: &str| links.iter().find(|l| l.from_res.url == url).unwrap();

    let r2_link = by_from("/r2");
    assert!(r2_link.dirty);
    assert_eq!(r2_link.last_clean_version, VERSION);
    assert!(r2_link.inferred_dirtiness.is_empty());

    for url in ["/r3", "/r4"] {
        let link = by_from(url);
        assert!(!link.dirty, "link from {url} must not be dirty");
        assert_eq!(link.inferred_dirtiness.len(), 1);
        assert_eq!(link.inferred_dirtiness[0].resource.url, "/r2");
        assert_eq!(link.inferred_dirtiness[0].last_clean_version, VERSION);
    }

    let r1_link = by_from("/r1");
    assert!(!r1_link.dirty);
    assert!(r1_link.inferred_dirtiness.is_empty());

    // Clean with propagation: the chain goes fully quiet.
    let resp = server
        .service
        .mark_links_clean(MarkLinksCleanRequest {
            session_id: server.session_id.clone(),
            links: vec![lref("/r2", "/r3")],
            propagate_cleanliness: true,
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let dirty = server
        .service
        .get_dirty_links(GetDirtyLinksRequest {
            session_id: server.session_id.clone(),
            tool_id: TOOL.to_string(),
            url: GROUP_URL.to_string(),
            with_inferred: true,
        })
        .await;
    assert!(dirty.ok);
    assert!(dirty.links.is_empty(), "expected no dirty links after clean");

    let links = branch.get_all_links(false).await?;
    assert!(links.iter().all(|l| !l.dirty));
    assert!(links.iter().all(|l| l.inferred_dirtiness.is_empty()));
    assert!(links.iter().all(|l| l.last_clean_version.is_empty()));
    Ok(())
}

#[tokio::test]
async fn folder_link_dirties_on_descendant_but_not_sibling() -> anyhow::Result<()> {
    let server = start().await;
    server
        .seed_group(&["/folder/", "/folderX/", "/x", "/y"])
        .await;
    server.link("/folder/", "/x").await;
    server.link("/folderX/", "/y").await;

    let change = group_change("v1")
        .with_change(ResourceChange::new("a.c", "a.c", "/folder/a.c", ChangeType::Added));
    let resp = server
        .service
        .update_resource_group(change_request(&server.session_id, change))
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let branch = server.db.branch("main").await?;
    let links = branch.get_all_links(false).await?;
    let dirty: Vec<_> = links.iter().filter(|l| l.dirty).collect();
    assert_eq!(dirty.len(), 1);
    assert_eq!(dirty[0].from_res.url, "/folder/");
    assert_eq!(dirty[0].last_clean_version, VERSION);
    Ok(())
}

#[tokio::test]
async fn rename_rewrites_endpoint_without_dirtying() -> anyhow::Result<()> {
    let server = start().await;
    server.seed_group(&["/r1", "/r2"]).await;
    server.link("/r1", "/r2").await;

    let change = group_change("v1").with_change(
        ResourceChange::new("r2", "r2", "/r2", ChangeType::Renamed).renamed_to("r2b", "r2b", "/r2b"),
    );
    let resp = server
        .service
        .update_resource_group(change_request(&server.session_id, change))
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let branch = server.db.branch("main").await?;
    let links = branch.get_all_links(false).await?;
    assert_eq!(links.len(), 1);
    assert!(!links[0].dirty);
    assert_eq!(links[0].to_res.url, "/r2b");
    assert!(links[0].inferred_dirtiness.is_empty());

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
    assert!(!urls.contains(&"/r2"));
    assert!(urls.contains(&"/r2b"));
    Ok(())
}

#[tokio::test]
async fn delete_then_clean_reclaims_the_resource() -> anyhow::Result<()> {
    let server = start().await;
    server.seed_group(&["/r1", "/r2"]).await;
    server.link("/r1", "/r2").await;

    let change = group_change("v1")
        .with_change(ResourceChange::new("r1", "r1", "/r1", ChangeType::Removed));
    let resp = server
        .service
        .update_resource_group(change_request(&server.session_id, change))
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let branch = server.db.branch("main").await?;

    // The link survives as a dirty tombstone, the resource as a soft delete.
    let links = branch.get_all_links(true).await?;
    assert_eq!(links.len(), 1);
    assert!(links[0].dirty);
    assert!(links[0].deleted);

    assert!(branch.get_resource(&rref("/r1"), false).await?.is_none());
    let tombstone = branch.get_resource(&rref("/r1"), true).await?.unwrap();
    assert!(tombstone.deleted);

    // Cleaning the link removes both the tombstone link and the resource.
    let resp = server
        .service
        .mark_links_clean(MarkLinksCleanRequest {
            session_id: server.session_id.clone(),
            links: vec![lref("/r1", "/r2")],
            propagate_cleanliness: true,
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    assert!(branch.get_all_links(true).await?.is_empty());
    assert!(branch.get_resource(&rref("/r1"), true).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn modified_rename_both_dirties_and_rewrites() -> anyhow::Result<()> {
    let server = start().await;
    server.seed_group(&["/r1", "/r2"]).await;
    server.link("/r2", "/r1").await;

    let change = group_change("v1").with_change(
        ResourceChange::new("r2", "r2", "/r2", ChangeType::Modified).renamed_to("r2b", "r2b", "/r2b"),
    );
    let resp = server
        .service
        .update_resource_group(change_request(&server.session_id, change))
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let branch = server.db.branch("main").await?;
    let links = branch.get_all_links(false).await?;
    assert_eq!(links.len(), 1);
    assert!(links[0].dirty);
    assert_eq!(links[0].last_clean_version, VERSION);
    assert_eq!(links[0].from_res.url, "/r2b");
    Ok(())
}

#[tokio::test]
async fn dependency_graph_honors_depth_bound() -> anyhow::Result<()> {
    use depi::rpc::{DependenciesType, GetDependencyGraphRequest};

    let server = start().await;
    server.seed_group(&["/r1", "/r2", "/r3", "/r4", "/r5"]).await;
    for pair in [("/r1", "/r2"), ("/r2", "/r3"), ("/r3", "/r4"), ("/r4", "/r5")] {
        server.link(pair.0, pair.1).await;
    }

    let resp = server
        .service
        .get_dependency_graph(GetDependencyGraphRequest {
            session_id: server.session_id.clone(),
            resource: rref("/r1"),
            dependencies_type: DependenciesType::Dependants,
            max_depth: 2,
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);
    assert_eq!(resp.links.len(), 2);

    let resp = server
        .service
        .get_dependency_graph(GetDependencyGraphRequest {
            session_id: server.session_id.clone(),
            resource: rref("/r1"),
            dependencies_type: DependenciesType::Dependants,
            max_depth: 0,
        })
        .await;
    assert!(resp.ok);
    assert_eq!(resp.links.len(), 4);

    let resp = server
        .service
        .get_dependency_graph(GetDependencyGraphRequest {
            session_id: server.session_id.clone(),
            resource: rref("/r5"),
            dependencies_type: DependenciesType::Dependencies,
            max_depth: 1,
        })
        .await;
    assert!(resp.ok);
    assert_eq!(resp.links.len(), 1);
    assert_eq!(resp.links[0].from_res.url, "/r4");
    Ok(())
}

#[tokio::test]
async fn cleaning_single_inferred_source_without_propagation() -> anyhow::Result<()> {
    use depi::rpc::MarkInferredDirtinessCleanRequest;

    let server = start().await;
    server.seed_group(&["/r1", "/r2", "/r3", "/r4"]).await;
    for pair in [("/r1", "/r2"), ("/r2", "/r3"), ("/r3", "/r4")] {
        server.link(pair.0, pair.1).await;
    }

    let change = group_change("v1")
        .with_change(ResourceChange::new("r1", "r1", "/r1", ChangeType::Modified));
    let resp = server
        .service
        .update_resource_group(change_request(&server.session_id, change))
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let resp = server
        .service
        .mark_inferred_dirtiness_clean(MarkInferredDirtinessCleanRequest {
            session_id: server.session_id.clone(),
            link: lref("/r2", "/r3"),
            dirtiness_source: rref("/r1"),
            propagate_cleanliness: false,
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let branch = server.db.branch("main").await?;
    let links = branch.get_all_links(false).await?;
    let by_from = |url: &str| links.iter().find(|l| l.from_res.url == url).unwrap();
    assert!(by_from("/r2").inferred_dirtiness.is_empty());
    // Without propagation the entry further downstream stays.
    assert_eq!(by_from("/r3").inferred_dirtiness.len(), 1);
    Ok(())
}

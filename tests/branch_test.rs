//! Branch/tag catalog behavior and authorization gating through the RPC
//! surface.

mod common;

use common::{start, start_with, GROUP_URL, TOOL};
use depi::model::{ChangeType, ResourceChange, ResourceGroupChange};
use depi::rpc::{
    CreateBranchRequest, CreateTagRequest, GetResourceGroupsForTagRequest, LinkResourcesRequest,
    SessionRequest, SetBranchRequest, UpdateDepiRequest, UpdateResourceGroupRequest,
};

#[tokio::test]
async fn tag_then_branch_reproduces_state_including_dirtiness() {
    let server = start().await;
    server.seed_group(&["/r1", "/r2", "/r3"]).await;
    server.link("/r1", "/r2").await;
    server.link("/r2", "/r3").await;

    // Make r1 -> r2 dirty so the fork carries dirtiness state.
    let change = ResourceGroupChange::new("testrepo", TOOL, GROUP_URL, "v1")
        .with_change(ResourceChange::new("r1", "r1", "/r1", ChangeType::Modified));
    let resp = server
        .service
        .update_resource_group(UpdateResourceGroupRequest {
            session_id: server.session_id.clone(),
            resource_group: change,
            update_branch: String::new(),
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let resp = server
        .service
        .create_tag(CreateTagRequest {
            session_id: server.session_id.clone(),
            tag_name: "rel-1".to_string(),
            from_branch: String::new(),
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let resp = server
        .service
        .create_branch(CreateBranchRequest {
            session_id: server.session_id.clone(),
            branch_name: "hotfix".to_string(),
            from_branch: String::new(),
            from_tag: "rel-1".to_string(),
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let main = server.db.branch("main").await.unwrap();
    let hotfix = server.db.branch("hotfix").await.unwrap();

    let main_links = main.get_all_links(true).await.unwrap();
    let hotfix_links = hotfix.get_all_links(true).await.unwrap();
    assert_eq!(main_links, hotfix_links);

    let main_groups = main.get_resource_groups().await.unwrap();
    let hotfix_groups = hotfix.get_resource_groups().await.unwrap();
    assert_eq!(main_groups.len(), hotfix_groups.len());
    assert_eq!(main_groups[0].version, hotfix_groups[0].version);
}

#[tokio::test]
async fn branch_diverges_from_main_after_fork() {
    let server = start().await;
    server.seed_group(&["/r1", "/r2"]).await;
    server.link("/r1", "/r2").await;

    let resp = server
        .service
        .create_branch(CreateBranchRequest {
            session_id: server.session_id.clone(),
            branch_name: "dev".to_string(),
            from_branch: "main".to_string(),
            from_tag: String::new(),
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let resp = server
        .service
        .set_branch(SetBranchRequest {
            session_id: server.session_id.clone(),
            branch: "dev".to_string(),
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let current = server
        .service
        .current_branch(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert_eq!(current.branch, "dev");

    // A change applied on dev leaves main untouched.
    let change = ResourceGroupChange::new("testrepo", TOOL, GROUP_URL, "v1")
        .with_change(ResourceChange::new("r1", "r1", "/r1", ChangeType::Modified));
    let resp = server
        .service
        .update_resource_group(UpdateResourceGroupRequest {
            session_id: server.session_id.clone(),
            resource_group: change,
            update_branch: String::new(),
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let main = server.db.branch("main").await.unwrap();
    let dev = server.db.branch("dev").await.unwrap();
    assert!(main.get_all_links(false).await.unwrap().iter().all(|l| !l.dirty));
    assert!(dev.get_all_links(false).await.unwrap().iter().any(|l| l.dirty));
}

#[tokio::test]
async fn duplicate_names_and_unknown_branches_are_rejected() {
    let server = start().await;

    let resp = server
        .service
        .create_branch(CreateBranchRequest {
            session_id: server.session_id.clone(),
            branch_name: "main".to_string(),
            from_branch: "main".to_string(),
            from_tag: String::new(),
        })
        .await;
    assert!(!resp.ok);
    assert!(resp.msg.contains("already exists"));

    let resp = server
        .service
        .create_branch(CreateBranchRequest {
            session_id: server.session_id.clone(),
            branch_name: "b2".to_string(),
            from_branch: "nope".to_string(),
            from_tag: String::new(),
        })
        .await;
    assert!(!resp.ok);

    let resp = server
        .service
        .set_branch(SetBranchRequest {
            session_id: server.session_id.clone(),
            branch: "nope".to_string(),
        })
        .await;
    assert!(!resp.ok);
}

#[tokio::test]
async fn tags_are_not_switchable_but_are_listable() {
    let server = start().await;
    server.seed_group(&["/r1"]).await;

    server
        .service
        .create_tag(CreateTagRequest {
            session_id: server.session_id.clone(),
            tag_name: "rel-1".to_string(),
            from_branch: "main".to_string(),
        })
        .await;

    let list = server
        .service
        .get_branch_list(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert!(list.ok);
    assert!(list.branches.contains(&"main".to_string()));
    assert!(list.tags.contains(&"rel-1".to_string()));

    // A tag name is not a branch name.
    let resp = server
        .service
        .set_branch(SetBranchRequest {
            session_id: server.session_id.clone(),
            branch: "rel-1".to_string(),
        })
        .await;
    assert!(!resp.ok);

    let groups = server
        .service
        .get_resource_groups_for_tag(GetResourceGroupsForTagRequest {
            session_id: server.session_id.clone(),
            tag: "rel-1".to_string(),
        })
        .await;
    assert!(groups.ok);
    assert_eq!(groups.resource_groups.len(), 1);
}

#[tokio::test]
async fn invalid_sessions_are_refused() {
    let server = start().await;

    let resp = server
        .service
        .ping(SessionRequest {
            session_id: "bogus".to_string(),
        })
        .await;
    assert!(!resp.ok);
    assert!(resp.msg.contains("Invalid session"));

    let resp = server
        .service
        .logout(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert!(resp.ok);

    // The session is gone after logout.
    let resp = server
        .service
        .ping(SessionRequest {
            session_id: server.session_id.clone(),
        })
        .await;
    assert!(!resp.ok);
}

#[tokio::test]
async fn authorization_gates_link_creation() {
    let server = start_with(|config| {
        config.server.authorization_enabled = true;
        config.users[0].auth_rules = vec![
            "CapResGroup*(*,*)".to_string(),
            "CapResource*(*,*,*)".to_string(),
            "CapLinkRead(*,*,*,*,*,*)".to_string(),
            "CapBranch*".to_string(),
        ];
    })
    .await;
    server.seed_group(&["/r1", "/r2"]).await;

    let resp = server
        .service
        .link_resources(LinkResourcesRequest {
            session_id: server.session_id.clone(),
            link: common::lref("/r1", "/r2"),
        })
        .await;
    assert!(!resp.ok);
    assert!(resp.msg.contains("not authorized"), "msg: {}", resp.msg);
}

#[tokio::test]
async fn batched_update_skips_unauthorized_sub_updates() {
    use depi::events::Update;
    use depi::model::LinkView;

    let server = start_with(|config| {
        config.server.authorization_enabled = true;
        config.users[0].auth_rules = vec![
            "CapResGroup*(*,*)".to_string(),
            "CapResource*(*,*,*)".to_string(),
            "CapLinkRead(*,*,*,*,*,*)".to_string(),
        ];
    })
    .await;
    server.seed_group(&["/r1", "/r2"]).await;

    // The resource add is allowed, the link add is not; the batch still
    // succeeds and applies what it may.
    let resp = server
        .service
        .update_depi(UpdateDepiRequest {
            session_id: server.session_id.clone(),
            updates: vec![
                Update::AddResource {
                    resource: common::resource_view("/r3"),
                },
                Update::AddLink {
                    link: LinkView::new(
                        common::resource_view("/r1"),
                        common::resource_view("/r2"),
                    ),
                },
            ],
        })
        .await;
    assert!(resp.ok, "{}", resp.msg);

    let main = server.db.branch("main").await.unwrap();
    assert!(main
        .get_resource(&common::rref("/r3"), false)
        .await
        .unwrap()
        .is_some());
    assert!(main.get_all_links(false).await.unwrap().is_empty());
}

//! Shared fixtures for the integration tests: a service over a fresh
//! snapshot backend in a temp directory, plus builders for the test
//! resource group.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;

use depi::config::{DepiConfig, ToolConfig, UserConfig};
use depi::model::{LinkRef, ResourceRef, ResourceView};
use depi::rpc::{AddResourceRequest, DepiService, LoginRequest};
use depi::storage::DepiDatabase;

pub const TOOL: &str = "git";
pub const GROUP_URL: &str = "rg1";
pub const VERSION: &str = "v0";

pub struct TestServer {
    pub service: Arc<DepiService>,
    pub db: Arc<dyn DepiDatabase>,
    pub session_id: String,
    _dir: TempDir,
}

pub async fn start() -> TestServer {
    start_with(|_| {}).await
}

pub async fn start_with(customize: impl FnOnce(&mut DepiConfig)) -> TestServer {
    let dir = TempDir::new().unwrap();
    let mut config = DepiConfig::default();
    config.db.state_dir = dir
        .path()
        .join("state")
        .to_string_lossy()
        .to_string();
    config.audit.directory = String::new();
    config.tools.insert(TOOL.to_string(), ToolConfig::default());
    config.users.push(UserConfig {
        name: "mark".to_string(),
        password: "mark".to_string(),
        auth_rules: Vec::new(),
    });
    customize(&mut config);

    let config = Arc::new(config);
    let db = depi::storage::open_database(Arc::clone(&config))
        .await
        .unwrap();
    let service = DepiService::with_database(config, Arc::clone(&db)).unwrap();

    let login = service
        .login(LoginRequest {
            user: "mark".to_string(),
            password: "mark".to_string(),
            project: "testproj".to_string(),
            tool_id: TOOL.to_string(),
        })
        .await;
    assert!(login.ok, "login failed: {}", login.msg);

    TestServer {
        service,
        db,
        session_id: login.session_id,
        _dir: dir,
    }
}

pub fn rref(url: &str) -> ResourceRef {
    ResourceRef::new(TOOL, GROUP_URL, url)
}

pub fn lref(from: &str, to: &str) -> LinkRef {
    LinkRef::new(rref(from), rref(to))
}

pub fn resource_view(url: &str) -> ResourceView {
    let name = url.trim_start_matches('/').to_string();
    ResourceView {
        tool_id: TOOL.to_string(),
        resource_group_url: GROUP_URL.to_string(),
        resource_group_name: "testrepo".to_string(),
        resource_group_version: VERSION.to_string(),
        name: name.clone(),
        url: url.to_string(),
        id: name,
        deleted: false,
    }
}

impl TestServer {
    /// Create the test group and the given resources through the RPC
    /// surface.
    pub async fn seed_group(&self, urls: &[&str]) {
        use depi::model::ResourceGroup;
        use depi::rpc::AddResourceGroupRequest;

        let resp = self
            .service
            .add_resource_group(AddResourceGroupRequest {
                session_id: self.session_id.clone(),
                resource_group: ResourceGroup::new("testrepo", TOOL, GROUP_URL, VERSION),
            })
            .await;
        assert!(resp.ok, "add_resource_group failed: {}", resp.msg);

        for url in urls {
            let name = url.trim_start_matches('/').to_string();
            let resp = self
                .service
                .add_resource(AddResourceRequest {
                    session_id: self.session_id.clone(),
                    tool_id: TOOL.to_string(),
                    resource_group_url: GROUP_URL.to_string(),
                    url: url.to_string(),
                    name: name.clone(),
                    id: name,
                })
                .await;
            assert!(resp.ok, "add_resource {url} failed: {}", resp.msg);
        }
    }

    pub async fn link(&self, from: &str, to: &str) {
        use depi::rpc::LinkResourcesRequest;
        let resp = self
            .service
            .link_resources(LinkResourcesRequest {
                session_id: self.session_id.clone(),
                link: lref(from, to),
            })
            .await;
        assert!(resp.ok, "link {from} -> {to} failed: {}", resp.msg);
    }
}

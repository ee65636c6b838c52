//! The RPC service: session validation, authorization checks, delegation to
//! the branch store, event fan-out, and audit logging for every method of
//! the surface.
//!
//! All mutating methods serialize through one process-wide write lock held
//! for the mutation and the ensuing fan-out compile; reads do not take it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::auth::{Authorization, CapabilityKind, RuleBundles, User};
use crate::blackboard::Blackboard;
use crate::config::DepiConfig;
use crate::error::{DepiError, Result};
use crate::events::{
    push_event, BlackboardUpdate, DepiUpdate, QueueItem, ResourceUpdateNotice,
    ResourcesUpdatedNotification, Update,
};
use crate::model::{
    ChangeType, LinkRef, LinkView, Resource, ResourceGroup, ResourceRef, ResourceView,
};
use crate::rpc::messages::*;
use crate::session::{Session, SessionManager};
use crate::storage::DepiDatabase;

/// Blackboard saves insert resources and links in batches of this size.
const BLACKBOARD_BATCH: usize = 1000;

pub struct DepiService {
    config: Arc<DepiConfig>,
    db: Arc<dyn DepiDatabase>,
    sessions: Arc<SessionManager>,
    blackboards: Mutex<HashMap<String, Blackboard>>,
    users: HashMap<String, Arc<User>>,
    tokens: Mutex<HashMap<String, String>>,
    write_lock: tokio::sync::Mutex<()>,
    audit: AuditLog,
    authorization_enabled: bool,
}

impl DepiService {
    /// Build the service over an already-opened backend.
    pub fn with_database(config: Arc<DepiConfig>, db: Arc<dyn DepiDatabase>) -> Result<Arc<Self>> {
        let authorization_enabled = config.server.authorization_enabled;
        let bundles = if authorization_enabled {
            match &config.authorization.auth_def_file {
                Some(path) => RuleBundles::load(path)?,
                None => RuleBundles::empty(),
            }
        } else {
            RuleBundles::empty()
        };

        let mut users = HashMap::new();
        for user in &config.users {
            let authorization = if authorization_enabled {
                Some(Authorization::from_user_config(
                    &user.auth_rules,
                    &bundles,
                    &user.name,
                ))
            } else {
                None
            };
            users.insert(
                user.name.clone(),
                Arc::new(User {
                    name: user.name.clone(),
                    password: user.password.clone(),
                    authorization,
                }),
            );
        }

        Ok(Arc::new(Self {
            audit: AuditLog::new(&config.audit.directory),
            sessions: Arc::new(SessionManager::new(config.server.session_timeout)),
            blackboards: Mutex::new(HashMap::new()),
            users,
            tokens: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            authorization_enabled,
            db,
            config,
        }))
    }

    /// Open the configured backend and build the service.
    pub async fn new(config: Arc<DepiConfig>) -> Result<Arc<Self>> {
        let db = crate::storage::open_database(Arc::clone(&config)).await?;
        Self::with_database(config, db)
    }

    /// Start the session-expiration sweeper.
    pub fn start_background_tasks(&self) {
        self.sessions.spawn_sweeper();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.all().len()
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| DepiError::InvalidSession(session_id.to_string()))
    }

    fn has_capability(&self, user: &User, kind: CapabilityKind) -> bool {
        if !self.authorization_enabled {
            return true;
        }
        user.authorization
            .as_ref()
            .map(|a| a.has_capability(kind))
            .unwrap_or(false)
    }

    fn is_authorized(&self, user: &User, kind: CapabilityKind, args: &[&str]) -> bool {
        if !self.authorization_enabled {
            return true;
        }
        user.authorization
            .as_ref()
            .map(|a| a.is_authorized(kind, args))
            .unwrap_or(false)
    }

    fn link_auth_args<'a>(from: &'a ResourceRef, to: &'a ResourceRef) -> [&'a str; 6] {
        [
            &from.tool_id,
            &from.resource_group_url,
            &from.url,
            &to.tool_id,
            &to.resource_group_url,
            &to.url,
        ]
    }

    fn blackboard_for<'a>(
        guard: &'a mut HashMap<String, Blackboard>,
        user: &str,
    ) -> &'a mut Blackboard {
        guard.entry(user.to_string()).or_default()
    }

    fn lock_blackboards(&self) -> std::sync::MutexGuard<'_, HashMap<String, Blackboard>> {
        match self.blackboards.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ---- fan-out -------------------------------------------------------

    /// Deliver a depi update to watchers, optionally restricted to sessions
    /// on the given branch.
    fn fan_out_depi(&self, branch_name: Option<&str>, update: &DepiUpdate) {
        for session in self.sessions.all() {
            if let Some(branch) = branch_name {
                if session.branch_name() != branch {
                    continue;
                }
            }
            if let Some(tx) = session.depi_sender() {
                push_event(&tx, update.clone());
            }
        }
    }

    /// Deliver a blackboard update, optionally restricted to one user's
    /// sessions (reconciliation events target the blackboard's owner).
    fn fan_out_blackboard(&self, owner: Option<&str>, update: &BlackboardUpdate) {
        for session in self.sessions.all() {
            if let Some(owner) = owner {
                if session.user.name != owner {
                    continue;
                }
            }
            if let Some(tx) = session.blackboard_sender() {
                push_event(&tx, update.clone());
            }
        }
    }

    /// Deliver a dirty-link notice to sessions on the branch watching the
    /// target's resource group.
    fn fan_out_resource(&self, branch_name: &str, notice: &ResourceUpdateNotice) {
        for session in self.sessions.all() {
            if session.branch_name() != branch_name {
                continue;
            }
            if !session.watches_group(
                &notice.watched_resource.tool_id,
                &notice.watched_resource.resource_group_url,
            ) {
                continue;
            }
            if let Some(tx) = session.resource_sender() {
                push_event(&tx, notice.clone());
            }
        }
    }

    // ---- session lifecycle --------------------------------------------

    pub async fn login(&self, req: LoginRequest) -> LoginResponse {
        let fail = |msg: String| LoginResponse {
            ok: false,
            msg,
            session_id: String::new(),
            login_token: String::new(),
        };
        let Some(user) = self.users.get(&req.user) else {
            return fail("Invalid login".to_string());
        };
        if user.password != req.password {
            return fail("Invalid login".to_string());
        }
        if !self.config.known_tool(&req.tool_id) {
            return fail(format!("Invalid toolId {}", req.tool_id));
        }
        let branch = match self.db.branch("main").await {
            Ok(branch) => branch,
            Err(err) => return fail(format!("Cannot open main branch: {err}")),
        };

        let session_id = Uuid::new_v4().simple().to_string();
        let login_token = Uuid::new_v4().simple().to_string();
        self.sessions.add(Arc::new(Session::new(
            session_id.clone(),
            req.tool_id.clone(),
            Arc::clone(user),
            branch,
        )));
        self.lock_tokens()
            .insert(login_token.clone(), user.name.clone());
        self.lock_blackboards()
            .entry(user.name.clone())
            .or_default();

        LoginResponse {
            ok: true,
            msg: String::new(),
            session_id,
            login_token,
        }
    }

    pub async fn login_with_token(&self, req: LoginWithTokenRequest) -> LoginResponse {
        let user_name = self.lock_tokens().get(&req.login_token).cloned();
        let Some(user_name) = user_name else {
            return LoginResponse {
                ok: false,
                msg: "Invalid login token".to_string(),
                session_id: String::new(),
                login_token: String::new(),
            };
        };
        let Some(user) = self.users.get(&user_name) else {
            return LoginResponse {
                ok: false,
                msg: "Invalid login token".to_string(),
                session_id: String::new(),
                login_token: String::new(),
            };
        };
        self.login(LoginRequest {
            user: user.name.clone(),
            password: user.password.clone(),
            project: req.project,
            tool_id: req.tool_id,
        })
        .await
    }

    pub async fn logout(&self, req: SessionRequest) -> GenericResponse {
        GenericResponse::from_result((|| {
            let session = self.session(&req.session_id)?;
            session.close();
            self.sessions.remove(&req.session_id);
            Ok(())
        })())
    }

    pub async fn ping(&self, req: SessionRequest) -> GenericResponse {
        GenericResponse::from_result(self.session(&req.session_id).map(|_| ()))
    }

    // ---- branch & tag catalog -----------------------------------------

    pub async fn get_branch_list(&self, req: SessionRequest) -> GetBranchListResponse {
        let fail = |msg: String| GetBranchListResponse {
            ok: false,
            msg,
            branches: Vec::new(),
            tags: Vec::new(),
        };
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => return fail(err.to_string()),
        };
        if !self.has_capability(&session.user, CapabilityKind::BranchList) {
            return fail(format!(
                "User {} is not authorized to list branches",
                session.user.name
            ));
        }
        let branches = match self.db.branch_list().await {
            Ok(list) => list,
            Err(err) => return fail(err.to_string()),
        };
        let tags = match self.db.tag_list().await {
            Ok(list) => list,
            Err(err) => return fail(err.to_string()),
        };
        GetBranchListResponse {
            ok: true,
            msg: String::new(),
            branches,
            tags,
        }
    }

    pub async fn current_branch(&self, req: SessionRequest) -> CurrentBranchResponse {
        match self.session(&req.session_id) {
            Ok(session) => CurrentBranchResponse {
                ok: true,
                msg: String::new(),
                branch: session.branch_name(),
            },
            Err(err) => CurrentBranchResponse {
                ok: false,
                msg: err.to_string(),
                branch: String::new(),
            },
        }
    }

    pub async fn set_branch(&self, req: SetBranchRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                if !self.is_authorized(&session.user, CapabilityKind::BranchSwitch, &[]) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to switch branches",
                        session.user.name
                    )));
                }
                if !self.db.branch_exists(&req.branch).await? {
                    return Err(DepiError::not_found(format!("branch {}", req.branch)));
                }
                let branch = self.db.branch(&req.branch).await?;
                session.set_branch(branch);
                Ok(())
            }
            .await,
        )
    }

    pub async fn create_branch(&self, req: CreateBranchRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                if self.db.branch_exists(&req.branch_name).await? {
                    return Err(DepiError::conflict("Branch already exists"));
                }

                let mut from_tag = req.from_tag.clone();
                let mut from_branch = req.from_branch.clone();
                if !from_branch.is_empty() {
                    // A branch source may actually name a tag.
                    if !self.db.branch_exists(&from_branch).await? {
                        if self.db.tag_exists(&from_branch).await? {
                            from_tag = from_branch.clone();
                            from_branch.clear();
                        } else {
                            return Err(DepiError::not_found("Unknown branch"));
                        }
                    }
                } else if !from_tag.is_empty() {
                    if !self.db.tag_exists(&from_tag).await? {
                        return Err(DepiError::not_found("Unknown tag"));
                    }
                } else {
                    from_branch = session.branch_name();
                }

                if !self.is_authorized(&session.user, CapabilityKind::BranchCreate, &[]) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to create a branch",
                        session.user.name
                    )));
                }

                let (operation, from_name) = if from_branch.is_empty() {
                    self.db
                        .create_branch_from_tag(&req.branch_name, &from_tag)
                        .await?;
                    ("CreateBranchFromTag", from_tag)
                } else {
                    self.db.create_branch(&req.branch_name, &from_branch).await?;
                    ("CreateBranch", from_branch)
                };
                self.audit.write_entry(
                    &session.user.name,
                    operation,
                    &format!("from={};to={}", from_name, req.branch_name),
                );
                Ok(())
            }
            .await,
        )
    }

    pub async fn create_tag(&self, req: CreateTagRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let from_branch = if req.from_branch.is_empty() {
                    session.branch_name()
                } else {
                    if !self.db.branch_exists(&req.from_branch).await? {
                        return Err(DepiError::not_found("Unknown branch"));
                    }
                    req.from_branch.clone()
                };
                if !self.is_authorized(&session.user, CapabilityKind::BranchTag, &[]) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to create a tag",
                        session.user.name
                    )));
                }
                self.db.create_tag(&req.tag_name, &from_branch).await?;
                self.audit.write_entry(
                    &session.user.name,
                    "CreateTag",
                    &format!("from={};to={}", from_branch, req.tag_name),
                );
                Ok(())
            }
            .await,
        )
    }

    pub async fn get_resource_groups_for_tag(
        &self,
        req: GetResourceGroupsForTagRequest,
    ) -> GetResourceGroupsResponse {
        let fail = |msg: String| GetResourceGroupsResponse {
            ok: false,
            msg,
            resource_groups: Vec::new(),
        };
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => return fail(err.to_string()),
        };
        if !self.has_capability(&session.user, CapabilityKind::ResGroupRead) {
            return fail(format!(
                "User {} not authorized to read any resource groups",
                session.user.name
            ));
        }
        let tag = match self.db.tag(&req.tag).await {
            Ok(tag) => tag,
            Err(err) => return fail(err.to_string()),
        };
        let groups = match tag.get_resource_groups().await {
            Ok(groups) => groups,
            Err(err) => return fail(err.to_string()),
        };
        GetResourceGroupsResponse {
            ok: true,
            msg: String::new(),
            resource_groups: groups
                .into_iter()
                .filter(|rg| {
                    self.is_authorized(
                        &session.user,
                        CapabilityKind::ResGroupRead,
                        &[&rg.tool_id, &rg.url],
                    )
                })
                .collect(),
        }
    }

    pub async fn get_resource_groups(&self, req: SessionRequest) -> GetResourceGroupsResponse {
        let fail = |msg: String| GetResourceGroupsResponse {
            ok: false,
            msg,
            resource_groups: Vec::new(),
        };
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => return fail(err.to_string()),
        };
        if !self.has_capability(&session.user, CapabilityKind::ResGroupRead) {
            return fail(format!(
                "User {} not authorized to read any resource groups",
                session.user.name
            ));
        }
        let groups = match session.branch().get_resource_groups().await {
            Ok(groups) => groups,
            Err(err) => return fail(err.to_string()),
        };
        GetResourceGroupsResponse {
            ok: true,
            msg: String::new(),
            resource_groups: groups
                .into_iter()
                .filter(|rg| {
                    self.is_authorized(
                        &session.user,
                        CapabilityKind::ResGroupRead,
                        &[&rg.tool_id, &rg.url],
                    )
                })
                .collect(),
        }
    }

    pub async fn get_last_known_version(
        &self,
        req: GetLastKnownVersionRequest,
    ) -> GetLastKnownVersionResponse {
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => {
                return GetLastKnownVersionResponse {
                    ok: false,
                    msg: err.to_string(),
                    version: String::new(),
                }
            }
        };
        match session
            .branch()
            .get_resource_group_version(&req.tool_id, &req.url)
            .await
        {
            Ok(version) => GetLastKnownVersionResponse {
                ok: true,
                msg: String::new(),
                version,
            },
            Err(err) => GetLastKnownVersionResponse {
                ok: false,
                msg: err.to_string(),
                version: String::new(),
            },
        }
    }

    // ---- resource-group management ------------------------------------

    pub async fn add_resource_group(&self, req: AddResourceGroupRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let branch = session.branch();

                if !self.has_capability(&session.user, CapabilityKind::ResGroupAdd) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to create resource groups",
                        session.user.name
                    )));
                }
                if !self.is_authorized(
                    &session.user,
                    CapabilityKind::ResGroupAdd,
                    &[&req.resource_group.tool_id, &req.resource_group.url],
                ) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to create this resource group",
                        session.user.name
                    )));
                }

                branch.add_resource(&req.resource_group, None).await?;
                branch.save_branch_state().await?;

                let update = DepiUpdate::new(vec![Update::AddResourceGroup {
                    resource_group: req.resource_group.header(),
                }]);
                self.fan_out_depi(Some(&branch.name()), &update);

                self.audit.write_entry(
                    &session.user.name,
                    "AddResourceGroup",
                    &format!(
                        "toolId={};URL={};name={};version={}",
                        req.resource_group.tool_id,
                        req.resource_group.url,
                        req.resource_group.name,
                        req.resource_group.version
                    ),
                );
                Ok(())
            }
            .await,
        )
    }

    pub async fn edit_resource_group(&self, req: EditResourceGroupRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let branch = session.branch();
                let edit = &req.resource_group;

                if !self.has_capability(&session.user, CapabilityKind::ResGroupChange) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to change resource groups",
                        session.user.name
                    )));
                }
                if !self.is_authorized(
                    &session.user,
                    CapabilityKind::ResGroupChange,
                    &[&edit.tool_id, &edit.url],
                ) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to change this resource group",
                        session.user.name
                    )));
                }

                let old = ResourceGroup::new("", edit.tool_id.clone(), edit.url.clone(), "");
                let new = ResourceGroup::new(
                    edit.new_name.clone(),
                    edit.new_tool_id.clone(),
                    edit.new_url.clone(),
                    edit.new_version.clone(),
                );
                branch.edit_resource_group(&old, &new).await?;
                branch.save_branch_state().await?;

                let update = DepiUpdate::new(vec![Update::EditResourceGroup { edit: edit.clone() }]);
                self.fan_out_depi(Some(&branch.name()), &update);

                self.audit.write_entry(
                    &session.user.name,
                    "EditResourceGroup",
                    &format!(
                        "toolId={};URL={};newToolId={};newURL={};newName={};newVersion={}",
                        edit.tool_id,
                        edit.url,
                        edit.new_tool_id,
                        edit.new_url,
                        edit.new_name,
                        edit.new_version
                    ),
                );
                Ok(())
            }
            .await,
        )
    }

    pub async fn remove_resource_group(&self, req: RemoveResourceGroupRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let branch = session.branch();

                if !self.has_capability(&session.user, CapabilityKind::ResGroupRemove) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to remove resource groups",
                        session.user.name
                    )));
                }
                if !self.is_authorized(
                    &session.user,
                    CapabilityKind::ResGroupRemove,
                    &[&req.tool_id, &req.url],
                ) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to remove this resource group",
                        session.user.name
                    )));
                }

                branch.remove_resource_group(&req.tool_id, &req.url).await?;
                branch.save_branch_state().await?;

                let update = DepiUpdate::new(vec![Update::RemoveResourceGroup {
                    tool_id: req.tool_id.clone(),
                    url: req.url.clone(),
                }]);
                self.fan_out_depi(Some(&branch.name()), &update);

                self.audit.write_entry(
                    &session.user.name,
                    "RemoveResourceGroup",
                    &format!("toolId={};URL={}", req.tool_id, req.url),
                );
                Ok(())
            }
            .await,
        )
    }

    // ---- resource management ------------------------------------------

    pub async fn add_resource(&self, req: AddResourceRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let branch = session.branch();

                if !self.has_capability(&session.user, CapabilityKind::ResourceAdd) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to create resources",
                        session.user.name
                    )));
                }
                if !self.is_authorized(
                    &session.user,
                    CapabilityKind::ResourceAdd,
                    &[&req.tool_id, &req.resource_group_url, &req.url],
                ) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to create this resource",
                        session.user.name
                    )));
                }

                let rg = branch
                    .get_resource_group(&req.tool_id, &req.resource_group_url)
                    .await?
                    .ok_or_else(|| {
                        DepiError::not_found(format!(
                            "resource group {} {}",
                            req.tool_id, req.resource_group_url
                        ))
                    })?;
                let res = Resource::new(req.name.clone(), req.id.clone(), req.url.clone());
                branch.add_resource(&rg, Some(&res)).await?;
                branch.save_branch_state().await?;

                let update = DepiUpdate::new(vec![Update::AddResource {
                    resource: ResourceView::new(&rg, &res),
                }]);
                self.fan_out_depi(Some(&branch.name()), &update);

                self.audit.write_entry(
                    &session.user.name,
                    "AddResource",
                    &format!(
                        "toolId={};rgURL={};URL={};name={};id={}",
                        req.tool_id, req.resource_group_url, req.url, req.name, req.id
                    ),
                );
                Ok(())
            }
            .await,
        )
    }

    pub async fn get_resources(&self, req: GetResourcesRequest) -> GetResourcesResponse {
        let fail = |msg: String| GetResourcesResponse {
            ok: false,
            msg,
            resources: Vec::new(),
        };
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => return fail(err.to_string()),
        };
        if !self.has_capability(&session.user, CapabilityKind::ResourceRead) {
            return fail(format!(
                "User {} is not authorized to read resources",
                session.user.name
            ));
        }
        let patterns: Vec<_> = req
            .patterns
            .iter()
            .filter(|p| {
                self.is_authorized(
                    &session.user,
                    CapabilityKind::ResGroupRead,
                    &[&p.tool_id, &p.resource_group_url],
                )
            })
            .cloned()
            .collect();
        match session
            .branch()
            .get_resources(&patterns, req.include_deleted)
            .await
        {
            Ok(resources) => GetResourcesResponse {
                ok: true,
                msg: String::new(),
                resources: resources
                    .into_iter()
                    .filter(|r| {
                        self.is_authorized(
                            &session.user,
                            CapabilityKind::ResourceRead,
                            &[&r.tool_id, &r.resource_group_url, &r.url],
                        )
                    })
                    .collect(),
            },
            Err(err) => fail(err.to_string()),
        }
    }

    pub async fn get_resources_stream(
        &self,
        req: GetResourcesRequest,
    ) -> mpsc::Receiver<GetResourcesStreamItem> {
        let fail = |msg: String| GetResourcesStreamItem {
            ok: false,
            msg,
            resource: None,
        };
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => return single_item(fail(err.to_string())),
        };
        if !self.has_capability(&session.user, CapabilityKind::ResourceRead) {
            return single_item(fail(format!(
                "User {} is not authorized to read resources",
                session.user.name
            )));
        }
        let patterns: Vec<_> = req
            .patterns
            .iter()
            .filter(|p| {
                self.is_authorized(
                    &session.user,
                    CapabilityKind::ResGroupRead,
                    &[&p.tool_id, &p.resource_group_url],
                )
            })
            .cloned()
            .collect();
        let mut source = match session.branch().get_resources_stream(&patterns).await {
            Ok(rx) => rx,
            Err(err) => return single_item(fail(err.to_string())),
        };

        let (tx, rx) = mpsc::channel(64);
        let service_enabled = self.authorization_enabled;
        let user = Arc::clone(&session.user);
        tokio::spawn(async move {
            while let Some(view) = source.recv().await {
                let allowed = !service_enabled
                    || user
                        .authorization
                        .as_ref()
                        .map(|a| {
                            a.is_authorized(
                                CapabilityKind::ResourceRead,
                                &[&view.tool_id, &view.resource_group_url, &view.url],
                            )
                        })
                        .unwrap_or(false);
                if !allowed {
                    continue;
                }
                let item = GetResourcesStreamItem {
                    ok: true,
                    msg: String::new(),
                    resource: Some(view),
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    // ---- link management ----------------------------------------------

    pub async fn link_resources(&self, req: LinkResourcesRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let branch = session.branch();
                let link = &req.link;

                if !self.has_capability(&session.user, CapabilityKind::LinkAdd) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to create links",
                        session.user.name
                    )));
                }
                if !self.is_authorized(
                    &session.user,
                    CapabilityKind::LinkAdd,
                    &Self::link_auth_args(&link.from_res, &link.to_res),
                ) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to create this link",
                        session.user.name
                    )));
                }

                let from = branch
                    .get_resource(&link.from_res, false)
                    .await?
                    .ok_or_else(|| DepiError::not_found(format!("resource {}", link.from_res.url)))?;
                let to = branch
                    .get_resource(&link.to_res, false)
                    .await?
                    .ok_or_else(|| DepiError::not_found(format!("resource {}", link.to_res.url)))?;

                let view = LinkView::new(from, to);
                branch.add_link(&view).await?;
                branch.save_branch_state().await?;

                let update = DepiUpdate::new(vec![Update::AddLink { link: view }]);
                self.fan_out_depi(Some(&branch.name()), &update);

                self.audit.write_entry(
                    &session.user.name,
                    "LinkResources",
                    &format!(
                        "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                        link.from_res.tool_id,
                        link.from_res.resource_group_url,
                        link.from_res.url,
                        link.to_res.tool_id,
                        link.to_res.resource_group_url,
                        link.to_res.url
                    ),
                );
                Ok(())
            }
            .await,
        )
    }

    pub async fn unlink_resources(&self, req: LinkResourcesRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let branch = session.branch();
                let link = &req.link;

                if !self.has_capability(&session.user, CapabilityKind::LinkRemove) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to remove links",
                        session.user.name
                    )));
                }
                if !self.is_authorized(
                    &session.user,
                    CapabilityKind::LinkRemove,
                    &Self::link_auth_args(&link.from_res, &link.to_res),
                ) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to remove this link",
                        session.user.name
                    )));
                }

                let expanded = branch.expand_links(std::slice::from_ref(link)).await?;
                branch.remove_link(link).await?;
                branch.save_branch_state().await?;

                if let Some(view) = expanded.into_iter().next() {
                    let update = DepiUpdate::new(vec![Update::RemoveLink { link: view }]);
                    self.fan_out_depi(Some(&branch.name()), &update);
                }

                self.audit.write_entry(
                    &session.user.name,
                    "UnlinkResources",
                    &format!(
                        "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                        link.from_res.tool_id,
                        link.from_res.resource_group_url,
                        link.from_res.url,
                        link.to_res.tool_id,
                        link.to_res.resource_group_url,
                        link.to_res.url
                    ),
                );
                Ok(())
            }
            .await,
        )
    }

    fn filter_links_by_read_auth(&self, user: &User, links: Vec<LinkView>) -> Vec<LinkView> {
        links
            .into_iter()
            .filter(|lk| {
                let from = lk.from_res.to_ref();
                let to = lk.to_res.to_ref();
                let allowed = self.is_authorized(
                    user,
                    CapabilityKind::LinkRead,
                    &Self::link_auth_args(&from, &to),
                );
                if !allowed {
                    warn!(
                        "User {} is not authorized to read link {} {} {} -> {} {} {}",
                        user.name,
                        from.tool_id,
                        from.resource_group_url,
                        from.url,
                        to.tool_id,
                        to.resource_group_url,
                        to.url
                    );
                }
                allowed
            })
            .collect()
    }

    pub async fn get_links(&self, req: GetLinksRequest) -> GetLinksResponse {
        let fail = |msg: String| GetLinksResponse {
            ok: false,
            msg,
            resource_links: Vec::new(),
        };
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => return fail(err.to_string()),
        };
        if !self.has_capability(&session.user, CapabilityKind::LinkRead) {
            return fail(format!(
                "User {} is not authorized to read links",
                session.user.name
            ));
        }
        match session.branch().get_links(&req.patterns).await {
            Ok(links) => GetLinksResponse {
                ok: true,
                msg: String::new(),
                resource_links: self.filter_links_by_read_auth(&session.user, links),
            },
            Err(err) => fail(err.to_string()),
        }
    }

    pub async fn get_links_stream(
        &self,
        req: GetLinksRequest,
    ) -> mpsc::Receiver<GetLinksStreamItem> {
        let response = self.get_links(req).await;
        links_to_stream(response)
    }

    pub async fn get_all_links_stream(
        &self,
        req: SessionRequest,
    ) -> mpsc::Receiver<GetLinksStreamItem> {
        let fail = |msg: String| GetLinksStreamItem {
            ok: false,
            msg,
            resource_link: None,
        };
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => return single_item(fail(err.to_string())),
        };
        if !self.has_capability(&session.user, CapabilityKind::LinkRead) {
            return single_item(fail(format!(
                "User {} is not authorized to read links",
                session.user.name
            )));
        }
        let links = match session.branch().get_all_links(false).await {
            Ok(links) => links,
            Err(err) => return single_item(fail(err.to_string())),
        };
        let links = self.filter_links_by_read_auth(&session.user, links);
        items_to_stream(links.into_iter().map(|lk| GetLinksStreamItem {
            ok: true,
            msg: String::new(),
            resource_link: Some(lk),
        }))
    }

    pub async fn get_dependency_graph(
        &self,
        req: GetDependencyGraphRequest,
    ) -> GetDependencyGraphResponse {
        let fail = |msg: String| GetDependencyGraphResponse {
            ok: false,
            msg,
            resource: None,
            links: Vec::new(),
        };
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => return fail(err.to_string()),
        };
        if !self.has_capability(&session.user, CapabilityKind::LinkRead) {
            return fail(format!(
                "User {} is not authorized to read links",
                session.user.name
            ));
        }
        let branch = session.branch();
        let parent = match branch.get_resource(&req.resource, true).await {
            Ok(Some(resource)) => resource,
            Ok(None) => return fail("Parent resource not found".to_string()),
            Err(err) => return fail(err.to_string()),
        };
        let upstream = req.dependencies_type == DependenciesType::Dependencies;
        match branch
            .get_dependency_graph(&req.resource, upstream, req.max_depth)
            .await
        {
            Ok(links) => GetDependencyGraphResponse {
                ok: true,
                msg: String::new(),
                resource: Some(parent),
                links: self.filter_links_by_read_auth(&session.user, links),
            },
            Err(err) => fail(err.to_string()),
        }
    }

    // ---- the central change RPC ---------------------------------------

    pub async fn update_resource_group(&self, req: UpdateResourceGroupRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;

                let mut branch = session.branch();
                if !req.update_branch.is_empty() && req.update_branch != branch.name() {
                    branch = self.db.branch(&req.update_branch).await?;
                }

                if !self.has_capability(&session.user, CapabilityKind::ResGroupChange) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to change resource groups",
                        session.user.name
                    )));
                }
                if !self.has_capability(&session.user, CapabilityKind::ResourceChange) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to change resources",
                        session.user.name
                    )));
                }
                if !self.is_authorized(
                    &session.user,
                    CapabilityKind::ResGroupChange,
                    &[&req.resource_group.tool_id, &req.resource_group.url],
                ) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to change this resource group",
                        session.user.name
                    )));
                }

                // Filter the change set down to the resources this user may
                // touch; refused sub-changes are skipped with a warning.
                let mut change = req.resource_group.clone();
                let group_header = change.to_resource_group();
                let change_tool_id = change.tool_id.clone();
                let change_url = change.url.clone();
                let mut depi_updates = Vec::new();
                change.resources.retain(|url, rc| {
                    let (kind, verb) = match rc.change_type {
                        ChangeType::Added => (CapabilityKind::ResourceAdd, "add"),
                        ChangeType::Modified | ChangeType::Renamed => {
                            (CapabilityKind::ResourceChange, "change")
                        }
                        ChangeType::Removed => (CapabilityKind::ResourceRemove, "remove"),
                    };
                    let allowed = self.is_authorized(
                        &session.user,
                        kind,
                        &[&change_tool_id, &change_url, url],
                    );
                    if !allowed {
                        warn!(
                            "User {} is not allowed to {} resource {} {} {}",
                            session.user.name, verb, change_tool_id, change_url, url
                        );
                    }
                    allowed
                });
                for rc in change.resources.values() {
                    let view = ResourceView::new(&group_header, &rc.to_resource());
                    depi_updates.push(match rc.change_type {
                        ChangeType::Added => Update::AddResource { resource: view },
                        ChangeType::Modified => Update::ChangeResource { resource: view },
                        ChangeType::Renamed => Update::RenameResource { change: rc.clone() },
                        ChangeType::Removed => Update::RemoveResource { resource: view },
                    });
                }

                let dirtied = branch.update_resource_group(&change).await?;
                branch.save_branch_state().await?;

                if branch.name() == "main" {
                    self.reconcile_blackboards(&change);
                }

                debug!("sending resource update for {} links", dirtied.len());
                for link in &dirtied {
                    let notice = ResourceUpdateNotice {
                        watched_resource: link.to_res.clone(),
                        updated_resource: link.from_res.clone(),
                    };
                    self.fan_out_resource(&branch.name(), &notice);
                    depi_updates.push(Update::MarkLinkDirty {
                        link: link.link_ref(),
                    });
                }
                self.fan_out_depi(Some(&branch.name()), &DepiUpdate::new(depi_updates));

                for (url, rc) in &change.resources {
                    let change_type = match rc.change_type {
                        ChangeType::Added => "add",
                        ChangeType::Modified => "modify",
                        ChangeType::Renamed => "rename",
                        ChangeType::Removed => "remove",
                    };
                    self.audit.write_entry(
                        &session.user.name,
                        "UpdateResourceGroupResource",
                        &format!(
                            "toolId={};rgURL={};URL={};changeType={}",
                            change.tool_id, change.url, url, change_type
                        ),
                    );
                }
                Ok(())
            }
            .await,
        )
    }

    /// Rewrite every user's blackboard after a change set landed on main,
    /// pushing the adjustments to the owner's sessions.
    fn reconcile_blackboards(&self, change: &crate::model::ResourceGroupChange) {
        let mut blackboards = self.lock_blackboards();
        for (owner, blackboard) in blackboards.iter_mut() {
            let updates = blackboard.reconcile(change);
            if !updates.is_empty() {
                self.fan_out_blackboard(Some(owner), &BlackboardUpdate::new(updates));
            }
        }
    }

    // ---- dirty & clean -------------------------------------------------

    pub async fn get_dirty_links(&self, req: GetDirtyLinksRequest) -> GetDirtyLinksResponse {
        let fail = |msg: String| GetDirtyLinksResponse {
            ok: false,
            msg,
            resources: Vec::new(),
            links: Vec::new(),
        };
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => return fail(err.to_string()),
        };
        if !self.has_capability(&session.user, CapabilityKind::LinkRead) {
            return fail(format!("User {} cannot read links", session.user.name));
        }
        debug!("fetching dirty links for {} {}", req.tool_id, req.url);
        let group = ResourceGroup::new("", req.tool_id.clone(), req.url.clone(), "");
        let links = match session
            .branch()
            .get_dirty_links(&group, req.with_inferred)
            .await
        {
            Ok(links) => links,
            Err(err) => return fail(err.to_string()),
        };
        let links = self.filter_links_by_read_auth(&session.user, links);
        GetDirtyLinksResponse {
            ok: true,
            msg: String::new(),
            resources: links.iter().map(|lk| lk.to_res.clone()).collect(),
            links,
        }
    }

    pub async fn get_dirty_links_stream(
        &self,
        req: GetDirtyLinksRequest,
    ) -> mpsc::Receiver<GetDirtyLinksStreamItem> {
        let response = self.get_dirty_links(req).await;
        if !response.ok {
            return single_item(GetDirtyLinksStreamItem {
                ok: false,
                msg: response.msg,
                resource: None,
                link: None,
            });
        }
        items_to_stream(response.links.into_iter().map(|lk| GetDirtyLinksStreamItem {
            ok: true,
            msg: String::new(),
            resource: Some(lk.to_res.clone()),
            link: Some(lk),
        }))
    }

    pub async fn mark_links_clean(&self, req: MarkLinksCleanRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let branch = session.branch();

                if !self.has_capability(&session.user, CapabilityKind::LinkMarkClean) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to mark links clean",
                        session.user.name
                    )));
                }
                for link in &req.links {
                    if !self.is_authorized(
                        &session.user,
                        CapabilityKind::LinkMarkClean,
                        &Self::link_auth_args(&link.from_res, &link.to_res),
                    ) {
                        return Err(DepiError::not_authorized(format!(
                            "User {} is not authorized to mark link {} {} {} -> {} {} {} clean",
                            session.user.name,
                            link.from_res.tool_id,
                            link.from_res.resource_group_url,
                            link.from_res.url,
                            link.to_res.tool_id,
                            link.to_res.resource_group_url,
                            link.to_res.url
                        )));
                    }
                }

                let cleaned = branch.expand_links(&req.links).await?;
                branch
                    .mark_links_clean(&req.links, req.propagate_cleanliness)
                    .await?;
                branch.save_branch_state().await?;

                if !cleaned.is_empty() {
                    let updates = cleaned
                        .iter()
                        .map(|link| Update::MarkLinkClean { link: link.clone() })
                        .collect();
                    self.fan_out_depi(Some(&branch.name()), &DepiUpdate::new(updates));
                }

                for link in &cleaned {
                    self.audit.write_entry(
                        &session.user.name,
                        "CleanedLink",
                        &format!(
                            "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                            link.from_res.tool_id,
                            link.from_res.resource_group_url,
                            link.from_res.url,
                            link.to_res.tool_id,
                            link.to_res.resource_group_url,
                            link.to_res.url
                        ),
                    );
                }
                Ok(())
            }
            .await,
        )
    }

    pub async fn mark_inferred_dirtiness_clean(
        &self,
        req: MarkInferredDirtinessCleanRequest,
    ) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let branch = session.branch();

                if !self.has_capability(&session.user, CapabilityKind::LinkMarkClean) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to mark links clean",
                        session.user.name
                    )));
                }
                if !self.is_authorized(
                    &session.user,
                    CapabilityKind::LinkMarkClean,
                    &Self::link_auth_args(&req.link.from_res, &req.link.to_res),
                ) {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to mark link {} {} {} -> {} {} {} clean",
                        session.user.name,
                        req.link.from_res.tool_id,
                        req.link.from_res.resource_group_url,
                        req.link.from_res.url,
                        req.link.to_res.tool_id,
                        req.link.to_res.resource_group_url,
                        req.link.to_res.url
                    )));
                }

                let cleaned = branch
                    .mark_inferred_dirtiness_clean(
                        &req.link,
                        &req.dirtiness_source,
                        req.propagate_cleanliness,
                    )
                    .await?;
                branch.save_branch_state().await?;

                if !cleaned.is_empty() {
                    let refs: Vec<LinkRef> = cleaned.iter().map(|(lref, _)| lref.clone()).collect();
                    let views = branch.expand_links(&refs).await?;
                    let updates = views
                        .into_iter()
                        .zip(cleaned.iter())
                        .map(|(link, (_, source))| Update::MarkInferredLinkClean {
                            link,
                            source: source.clone(),
                        })
                        .collect();
                    self.fan_out_depi(Some(&branch.name()), &DepiUpdate::new(updates));
                }

                self.audit.write_entry(
                    &session.user.name,
                    "CleanedInferredLink",
                    &format!(
                        "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={};sourceToolId={};sourceRgURL={};sourceURL={};propagate={}",
                        req.link.from_res.tool_id,
                        req.link.from_res.resource_group_url,
                        req.link.from_res.url,
                        req.link.to_res.tool_id,
                        req.link.to_res.resource_group_url,
                        req.link.to_res.url,
                        req.dirtiness_source.tool_id,
                        req.dirtiness_source.resource_group_url,
                        req.dirtiness_source.url,
                        req.propagate_cleanliness
                    ),
                );
                Ok(())
            }
            .await,
        )
    }

    // ---- blackboard ----------------------------------------------------

    pub async fn add_resources_to_blackboard(
        &self,
        req: AddResourcesToBlackboardRequest,
    ) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let mut updates = Vec::new();
                {
                    let mut blackboards = self.lock_blackboards();
                    let blackboard = Self::blackboard_for(&mut blackboards, &session.user.name);
                    for view in &req.resources {
                        let added =
                            blackboard.add_resource(&view.group_header(), &view.resource());
                        if added {
                            updates.push(Update::AddResource {
                                resource: view.clone(),
                            });
                        }
                    }
                }
                if !updates.is_empty() {
                    self.fan_out_blackboard(None, &BlackboardUpdate::new(updates));
                }
                Ok(())
            }
            .await,
        )
    }

    pub async fn remove_resources_from_blackboard(
        &self,
        req: RemoveResourcesFromBlackboardRequest,
    ) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let mut updates = Vec::new();
                {
                    let mut blackboards = self.lock_blackboards();
                    let blackboard = Self::blackboard_for(&mut blackboards, &session.user.name);
                    for rr in &req.resource_refs {
                        let expanded =
                            blackboard.expand_resource(&rr.tool_id, &rr.resource_group_url, &rr.url);
                        if blackboard.remove_resource(rr) {
                            if let Some((rg, res)) = expanded {
                                updates.push(Update::RemoveResource {
                                    resource: ResourceView::new(&rg, &res),
                                });
                            }
                        }
                    }
                }
                if !updates.is_empty() {
                    self.fan_out_blackboard(None, &BlackboardUpdate::new(updates));
                }
                Ok(())
            }
            .await,
        )
    }

    fn lookup_blackboard_links(
        blackboard: &Blackboard,
        links: &[LinkRef],
    ) -> Result<Vec<LinkView>> {
        let mut result = Vec::with_capacity(links.len());
        for link in links {
            let (from_rg, from_res) = blackboard
                .expand_resource(
                    &link.from_res.tool_id,
                    &link.from_res.resource_group_url,
                    &link.from_res.url,
                )
                .ok_or_else(|| DepiError::validation("Invalid from resource"))?;
            let (to_rg, to_res) = blackboard
                .expand_resource(
                    &link.to_res.tool_id,
                    &link.to_res.resource_group_url,
                    &link.to_res.url,
                )
                .ok_or_else(|| DepiError::validation("Invalid to resource"))?;
            result.push(LinkView::new(
                ResourceView::new(&from_rg, &from_res),
                ResourceView::new(&to_rg, &to_res),
            ));
        }
        Ok(result)
    }

    pub async fn link_blackboard_resources(&self, req: BlackboardLinksRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let updates = {
                    let mut blackboards = self.lock_blackboards();
                    let blackboard = Self::blackboard_for(&mut blackboards, &session.user.name);
                    let links = Self::lookup_blackboard_links(blackboard, &req.links)?;
                    blackboard.link_resources(links)
                };
                if !updates.is_empty() {
                    self.fan_out_blackboard(None, &BlackboardUpdate::new(updates));
                }
                Ok(())
            }
            .await,
        )
    }

    pub async fn unlink_blackboard_resources(
        &self,
        req: BlackboardLinksRequest,
    ) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let updates = {
                    let mut blackboards = self.lock_blackboards();
                    let blackboard = Self::blackboard_for(&mut blackboards, &session.user.name);
                    let links = Self::lookup_blackboard_links(blackboard, &req.links)?;
                    blackboard.unlink_resources(&links)
                };
                if !updates.is_empty() {
                    self.fan_out_blackboard(None, &BlackboardUpdate::new(updates));
                }
                Ok(())
            }
            .await,
        )
    }

    pub async fn get_blackboard_resources(
        &self,
        req: SessionRequest,
    ) -> GetBlackboardResourcesResponse {
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => {
                return GetBlackboardResourcesResponse {
                    ok: false,
                    msg: err.to_string(),
                    resources: Vec::new(),
                    links: Vec::new(),
                }
            }
        };
        let mut blackboards = self.lock_blackboards();
        let blackboard = Self::blackboard_for(&mut blackboards, &session.user.name);

        let mut resources: Vec<ResourceView> = Vec::new();
        let mut push_unique = |view: ResourceView| {
            if !resources
                .iter()
                .any(|r| r.to_ref() == view.to_ref())
            {
                resources.push(view);
            }
        };
        for link in blackboard.changed_links() {
            if !link.deleted {
                push_unique(link.from_res.clone());
                push_unique(link.to_res.clone());
            }
        }
        for (rg, res) in blackboard.get_resources() {
            push_unique(ResourceView::new(&rg, &res));
        }
        GetBlackboardResourcesResponse {
            ok: true,
            msg: String::new(),
            resources,
            links: blackboard.changed_links().to_vec(),
        }
    }

    pub async fn save_blackboard(&self, req: SessionRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;

                // Blackboards promote to main regardless of the session's
                // current branch.
                let branch = self.db.branch("main").await?;

                let (resources, changed_links) = {
                    let mut blackboards = self.lock_blackboards();
                    let blackboard = Self::blackboard_for(&mut blackboards, &session.user.name);
                    (
                        blackboard.get_resources(),
                        blackboard.changed_links().to_vec(),
                    )
                };

                if !resources.is_empty()
                    && !self.has_capability(&session.user, CapabilityKind::ResourceAdd)
                {
                    return Err(DepiError::not_authorized(format!(
                        "User {} is not authorized to add resources",
                        session.user.name
                    )));
                }

                // Optimistic validation plus URL normalization against the
                // tool's path separator.
                let mut checked_versions = std::collections::HashSet::new();
                let mut normalized = Vec::with_capacity(resources.len());
                for (rg, mut res) in resources {
                    if checked_versions.insert((rg.tool_id.clone(), rg.url.clone())) {
                        let branch_version = branch
                            .get_resource_group_version(&rg.tool_id, &rg.url)
                            .await?;
                        if !branch_version.is_empty() && branch_version != rg.version {
                            return Err(DepiError::conflict(format!(
                                "Resource version in blackboard {} does not match resource version in Depi {}",
                                rg.version, branch_version
                            )));
                        }
                    }
                    let sep = self.config.path_separator(&rg.tool_id);
                    if !res.url.starts_with(sep) {
                        res.url = format!("{sep}{}", res.url);
                    }
                    if !self.is_authorized(
                        &session.user,
                        CapabilityKind::ResourceAdd,
                        &[&rg.tool_id, &rg.url, &res.url],
                    ) {
                        return Err(DepiError::not_authorized(format!(
                            "User {} is not authorized to add resources",
                            session.user.name
                        )));
                    }
                    normalized.push((rg, res));
                }

                for chunk in normalized.chunks(BLACKBOARD_BATCH) {
                    branch.add_resources(chunk).await?;
                }
                for chunk in changed_links.chunks(BLACKBOARD_BATCH) {
                    branch.add_links(chunk).await?;
                }
                branch.save_branch_state().await?;

                let mut updates: Vec<Update> = normalized
                    .iter()
                    .map(|(rg, res)| Update::AddResource {
                        resource: ResourceView::new(rg, res),
                    })
                    .collect();
                updates.extend(changed_links.iter().map(|link| Update::AddLink {
                    link: link.clone(),
                }));

                self.clear_blackboard_inner(&session.user.name);

                debug!(
                    "sending depi update for {} blackboard items",
                    updates.len()
                );
                self.fan_out_depi(None, &DepiUpdate::new(updates));

                for (rg, res) in &normalized {
                    self.audit.write_entry(
                        &session.user.name,
                        "AddResource",
                        &format!("toolId={};rgURL={};URL={}", rg.tool_id, rg.url, res.url),
                    );
                }
                for link in &changed_links {
                    self.audit.write_entry(
                        &session.user.name,
                        "LinkResources",
                        &format!(
                            "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                            link.from_res.tool_id,
                            link.from_res.resource_group_url,
                            link.from_res.url,
                            link.to_res.tool_id,
                            link.to_res.resource_group_url,
                            link.to_res.url
                        ),
                    );
                }
                Ok(())
            }
            .await,
        )
    }

    fn clear_blackboard_inner(&self, user: &str) {
        let updates = {
            let mut blackboards = self.lock_blackboards();
            let blackboard = Self::blackboard_for(&mut blackboards, user);
            let updates = blackboard.drain_updates();
            *blackboard = Blackboard::new();
            updates
        };
        if !updates.is_empty() {
            self.fan_out_blackboard(None, &BlackboardUpdate::new(updates));
        }
    }

    pub async fn clear_blackboard(&self, req: SessionRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                self.clear_blackboard_inner(&session.user.name);
                Ok(())
            }
            .await,
        )
    }

    // ---- subscriptions -------------------------------------------------

    pub async fn watch_depi(&self, req: SessionRequest) -> mpsc::Receiver<DepiUpdate> {
        match self.session(&req.session_id) {
            Ok(session) => queue_to_stream(session.watch_depi()),
            Err(err) => single_item(DepiUpdate {
                ok: false,
                msg: err.to_string(),
                updates: Vec::new(),
            }),
        }
    }

    pub async fn unwatch_depi(&self, req: SessionRequest) -> GenericResponse {
        GenericResponse::from_result((|| {
            let session = self.session(&req.session_id)?;
            session.unwatch_depi();
            Ok(())
        })())
    }

    pub async fn watch_blackboard(&self, req: SessionRequest) -> mpsc::Receiver<BlackboardUpdate> {
        match self.session(&req.session_id) {
            Ok(session) => queue_to_stream(session.watch_blackboard()),
            Err(err) => single_item(BlackboardUpdate {
                ok: false,
                msg: err.to_string(),
                updates: Vec::new(),
            }),
        }
    }

    pub async fn unwatch_blackboard(&self, req: SessionRequest) -> GenericResponse {
        GenericResponse::from_result((|| {
            let session = self.session(&req.session_id)?;
            session.unwatch_blackboard();
            Ok(())
        })())
    }

    pub async fn watch_resource_group(&self, req: WatchResourceGroupRequest) -> GenericResponse {
        GenericResponse::from_result((|| {
            let session = self.session(&req.session_id)?;
            session.add_watched_group(req.tool_id.clone(), req.url.clone());
            Ok(())
        })())
    }

    pub async fn unwatch_resource_group(&self, req: WatchResourceGroupRequest) -> GenericResponse {
        GenericResponse::from_result((|| {
            let session = self.session(&req.session_id)?;
            session.remove_watched_group(&req.tool_id, &req.url);
            Ok(())
        })())
    }

    /// Server stream of resource updates for the session's watched groups.
    pub async fn register_callback(
        &self,
        req: SessionRequest,
    ) -> mpsc::Receiver<ResourcesUpdatedNotification> {
        let session = match self.session(&req.session_id) {
            Ok(session) => session,
            Err(err) => {
                return single_item(ResourcesUpdatedNotification {
                    ok: false,
                    msg: err.to_string(),
                    updates: Vec::new(),
                })
            }
        };
        let mut source = session.watch_resources();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(item) = source.recv().await {
                match item {
                    QueueItem::Event(notice) => {
                        let notification = ResourcesUpdatedNotification {
                            ok: true,
                            msg: String::new(),
                            updates: vec![notice],
                        };
                        if tx.send(notification).await.is_err() {
                            break;
                        }
                    }
                    QueueItem::Quit => break,
                }
            }
        });
        rx
    }

    // ---- batched updates ----------------------------------------------

    pub async fn update_depi(&self, req: UpdateDepiRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                let branch = session.branch();

                let mut applied = Vec::new();
                for update in &req.updates {
                    match update {
                        Update::AddResource { resource } => {
                            if self.is_authorized(
                                &session.user,
                                CapabilityKind::ResourceAdd,
                                &[&resource.tool_id, &resource.resource_group_url, &resource.url],
                            ) {
                                let rg = resource.group_header();
                                let res = resource.resource();
                                if branch.add_resource(&rg, Some(&res)).await? {
                                    applied.push(update.clone());
                                }
                            } else {
                                warn!(
                                    "User {} not authorized to add resource {} {} {}",
                                    session.user.name,
                                    resource.tool_id,
                                    resource.resource_group_url,
                                    resource.url
                                );
                            }
                            self.audit.write_entry(
                                &session.user.name,
                                "AddResource",
                                &format!(
                                    "toolId={};rgURL={};URL={};name={};id={}",
                                    resource.tool_id,
                                    resource.resource_group_url,
                                    resource.url,
                                    resource.name,
                                    resource.id
                                ),
                            );
                        }
                        Update::RemoveResource { resource } => {
                            if self.is_authorized(
                                &session.user,
                                CapabilityKind::ResourceRemove,
                                &[&resource.tool_id, &resource.resource_group_url, &resource.url],
                            ) {
                                if branch.remove_resource(&resource.to_ref()).await? {
                                    applied.push(update.clone());
                                }
                            } else {
                                warn!(
                                    "User {} not authorized to remove resource {} {} {}",
                                    session.user.name,
                                    resource.tool_id,
                                    resource.resource_group_url,
                                    resource.url
                                );
                            }
                            self.audit.write_entry(
                                &session.user.name,
                                "RemoveResource",
                                &format!(
                                    "toolId={};rgURL={};URL={};name={};id={}",
                                    resource.tool_id,
                                    resource.resource_group_url,
                                    resource.url,
                                    resource.name,
                                    resource.id
                                ),
                            );
                        }
                        Update::AddLink { link } => {
                            let from = link.from_res.to_ref();
                            let to = link.to_res.to_ref();
                            if self.is_authorized(
                                &session.user,
                                CapabilityKind::LinkAdd,
                                &Self::link_auth_args(&from, &to),
                            ) {
                                if branch.add_link(link).await? {
                                    applied.push(update.clone());
                                }
                            } else {
                                warn!(
                                    "User {} not authorized to add link {} {} {} -> {} {} {}",
                                    session.user.name,
                                    from.tool_id,
                                    from.resource_group_url,
                                    from.url,
                                    to.tool_id,
                                    to.resource_group_url,
                                    to.url
                                );
                            }
                            self.audit.write_entry(
                                &session.user.name,
                                "LinkResources",
                                &format!(
                                    "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                                    from.tool_id,
                                    from.resource_group_url,
                                    from.url,
                                    to.tool_id,
                                    to.resource_group_url,
                                    to.url
                                ),
                            );
                        }
                        Update::RemoveLink { link } => {
                            let from = link.from_res.to_ref();
                            let to = link.to_res.to_ref();
                            if self.is_authorized(
                                &session.user,
                                CapabilityKind::LinkRemove,
                                &Self::link_auth_args(&from, &to),
                            ) {
                                if branch.remove_link(&link.link_ref()).await? {
                                    applied.push(update.clone());
                                }
                            } else {
                                warn!(
                                    "User {} not authorized to remove link {} {} {} -> {} {} {}",
                                    session.user.name,
                                    from.tool_id,
                                    from.resource_group_url,
                                    from.url,
                                    to.tool_id,
                                    to.resource_group_url,
                                    to.url
                                );
                            }
                            self.audit.write_entry(
                                &session.user.name,
                                "UnlinkResources",
                                &format!(
                                    "fromToolId={};fromRgURL={};fromURL={};toToolId={};toRgURL={};toURL={}",
                                    from.tool_id,
                                    from.resource_group_url,
                                    from.url,
                                    to.tool_id,
                                    to.resource_group_url,
                                    to.url
                                ),
                            );
                        }
                        other => {
                            warn!("unsupported update type in UpdateDepi: {:?}", other);
                        }
                    }
                }

                branch.save_branch_state().await?;
                if !applied.is_empty() {
                    self.fan_out_depi(Some(&branch.name()), &DepiUpdate::new(applied));
                }
                Ok(())
            }
            .await,
        )
    }

    /// Diagnostic endpoint kept for compatibility; serializes against
    /// in-flight mutations and returns.
    pub async fn dump_database(&self, req: SessionRequest) -> GenericResponse {
        GenericResponse::from_result(
            async {
                let _session = self.session(&req.session_id)?;
                let _guard = self.write_lock.lock().await;
                Ok(())
            }
            .await,
        )
    }
}

// ---- stream helpers ----------------------------------------------------

fn single_item<T: Send + 'static>(item: T) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(item);
    rx
}

fn items_to_stream<T, I>(items: I) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn links_to_stream(response: GetLinksResponse) -> mpsc::Receiver<GetLinksStreamItem> {
    if !response.ok {
        return single_item(GetLinksStreamItem {
            ok: false,
            msg: response.msg,
            resource_link: None,
        });
    }
    items_to_stream(
        response
            .resource_links
            .into_iter()
            .map(|lk| GetLinksStreamItem {
                ok: true,
                msg: String::new(),
                resource_link: Some(lk),
            }),
    )
}

/// Forward a watch queue until its `Quit` sentinel.
fn queue_to_stream<T: Send + 'static>(mut source: mpsc::Receiver<QueueItem<T>>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(crate::events::EVENT_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(item) = source.recv().await {
            match item {
                QueueItem::Event(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                QueueItem::Quit => break,
            }
        }
    });
    rx
}

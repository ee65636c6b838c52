//! Request and response shapes for the RPC surface.
//!
//! Every response carries `(ok, msg)`; streaming methods deliver a sequence
//! of item records whose first failure record terminates the stream.

use serde::{Deserialize, Serialize};

use crate::error::DepiError;
use crate::events::{ResourceGroupEdit, Update};
use crate::model::{
    LinkRef, LinkView, ResourceGroup, ResourceGroupChange, ResourceLinkPattern, ResourceRef,
    ResourceRefPattern, ResourceView,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericResponse {
    pub ok: bool,
    pub msg: String,
}

impl GenericResponse {
    pub fn success() -> Self {
        Self {
            ok: true,
            msg: String::new(),
        }
    }

    pub fn failure(msg: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            msg: msg.to_string(),
        }
    }

    pub fn from_result(result: Result<(), DepiError>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(err) => Self::failure(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub project: String,
    pub tool_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginWithTokenRequest {
    pub login_token: String,
    #[serde(default)]
    pub project: String,
    pub tool_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub ok: bool,
    pub msg: String,
    pub session_id: String,
    #[serde(default)]
    pub login_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetBranchListResponse {
    pub ok: bool,
    pub msg: String,
    pub branches: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentBranchResponse {
    pub ok: bool,
    pub msg: String,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBranchRequest {
    pub session_id: String,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBranchRequest {
    pub session_id: String,
    pub branch_name: String,
    #[serde(default)]
    pub from_branch: String,
    #[serde(default)]
    pub from_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTagRequest {
    pub session_id: String,
    pub tag_name: String,
    #[serde(default)]
    pub from_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResourceGroupsForTagRequest {
    pub session_id: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResourceGroupRequest {
    pub session_id: String,
    pub resource_group: ResourceGroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditResourceGroupRequest {
    pub session_id: String,
    pub resource_group: ResourceGroupEdit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveResourceGroupRequest {
    pub session_id: String,
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResourceGroupsResponse {
    pub ok: bool,
    pub msg: String,
    pub resource_groups: Vec<ResourceGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLastKnownVersionRequest {
    pub session_id: String,
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLastKnownVersionResponse {
    pub ok: bool,
    pub msg: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResourceRequest {
    pub session_id: String,
    pub tool_id: String,
    #[serde(rename = "resourceGroupURL")]
    pub resource_group_url: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResourcesRequest {
    pub session_id: String,
    pub patterns: Vec<ResourceRefPattern>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResourcesResponse {
    pub ok: bool,
    pub msg: String,
    pub resources: Vec<ResourceView>,
}

/// One record of the resource stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResourcesStreamItem {
    pub ok: bool,
    pub msg: String,
    pub resource: Option<ResourceView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkResourcesRequest {
    pub session_id: String,
    pub link: LinkRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLinksRequest {
    pub session_id: String,
    pub patterns: Vec<ResourceLinkPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLinksResponse {
    pub ok: bool,
    pub msg: String,
    pub resource_links: Vec<LinkView>,
}

/// One record of the link streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLinksStreamItem {
    pub ok: bool,
    pub msg: String,
    pub resource_link: Option<LinkView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependenciesType {
    /// Upstream: what the resource depends on.
    Dependencies,
    /// Downstream: what depends on the resource.
    Dependants,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDependencyGraphRequest {
    pub session_id: String,
    pub resource: ResourceRef,
    pub dependencies_type: DependenciesType,
    #[serde(default)]
    pub max_depth: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDependencyGraphResponse {
    pub ok: bool,
    pub msg: String,
    pub resource: Option<ResourceView>,
    pub links: Vec<LinkView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResourceGroupRequest {
    pub session_id: String,
    pub resource_group: ResourceGroupChange,
    #[serde(default)]
    pub update_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkLinksCleanRequest {
    pub session_id: String,
    pub links: Vec<LinkRef>,
    #[serde(default)]
    pub propagate_cleanliness: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkInferredDirtinessCleanRequest {
    pub session_id: String,
    pub link: LinkRef,
    pub dirtiness_source: ResourceRef,
    #[serde(default)]
    pub propagate_cleanliness: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDirtyLinksRequest {
    pub session_id: String,
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(default)]
    pub with_inferred: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDirtyLinksResponse {
    pub ok: bool,
    pub msg: String,
    pub resources: Vec<ResourceView>,
    pub links: Vec<LinkView>,
}

/// One record of the dirty-link stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDirtyLinksStreamItem {
    pub ok: bool,
    pub msg: String,
    pub resource: Option<ResourceView>,
    pub link: Option<LinkView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResourcesToBlackboardRequest {
    pub session_id: String,
    pub resources: Vec<ResourceView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveResourcesFromBlackboardRequest {
    pub session_id: String,
    pub resource_refs: Vec<ResourceRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlackboardLinksRequest {
    pub session_id: String,
    pub links: Vec<LinkRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetBlackboardResourcesResponse {
    pub ok: bool,
    pub msg: String,
    pub resources: Vec<ResourceView>,
    pub links: Vec<LinkView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResourceGroupRequest {
    pub session_id: String,
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDepiRequest {
    pub session_id: String,
    pub updates: Vec<Update>,
}

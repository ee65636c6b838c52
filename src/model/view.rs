use serde::{Deserialize, Serialize};

use super::{InferredDirtiness, Link, LinkRef, Resource, ResourceGroup, ResourceRef};

/// A resource materialized with its group coordinates, the shape clients see
/// on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub tool_id: String,
    #[serde(rename = "resourceGroupURL")]
    pub resource_group_url: String,
    pub resource_group_name: String,
    pub resource_group_version: String,
    pub name: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

impl ResourceView {
    pub fn new(rg: &ResourceGroup, res: &Resource) -> Self {
        Self {
            tool_id: rg.tool_id.clone(),
            resource_group_url: rg.url.clone(),
            resource_group_name: rg.name.clone(),
            resource_group_version: rg.version.clone(),
            name: res.name.clone(),
            url: res.url.clone(),
            id: res.id.clone(),
            deleted: res.deleted,
        }
    }

    pub fn to_ref(&self) -> ResourceRef {
        ResourceRef::new(
            self.tool_id.clone(),
            self.resource_group_url.clone(),
            self.url.clone(),
        )
    }

    pub fn group_header(&self) -> ResourceGroup {
        ResourceGroup::new(
            self.resource_group_name.clone(),
            self.tool_id.clone(),
            self.resource_group_url.clone(),
            self.resource_group_version.clone(),
        )
    }

    pub fn resource(&self) -> Resource {
        let mut res = Resource::new(self.name.clone(), self.id.clone(), self.url.clone());
        res.deleted = self.deleted;
        res
    }
}

/// A materialized inferred-dirtiness entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferredDirtinessView {
    pub resource: ResourceView,
    pub last_clean_version: String,
}

impl InferredDirtinessView {
    pub fn to_entry(&self) -> InferredDirtiness {
        InferredDirtiness {
            source: self.resource.to_ref(),
            last_clean_version: self.last_clean_version.clone(),
        }
    }
}

/// A link materialized with full resource information for the read path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkView {
    pub from_res: ResourceView,
    pub to_res: ResourceView,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub last_clean_version: String,
    #[serde(default)]
    pub inferred_dirtiness: Vec<InferredDirtinessView>,
}

impl LinkView {
    pub fn new(from_res: ResourceView, to_res: ResourceView) -> Self {
        Self {
            from_res,
            to_res,
            dirty: false,
            deleted: false,
            last_clean_version: String::new(),
            inferred_dirtiness: Vec::new(),
        }
    }

    pub fn link_ref(&self) -> LinkRef {
        LinkRef::new(self.from_res.to_ref(), self.to_res.to_ref())
    }

    /// Collapse back to the stored reference form.
    pub fn to_link(&self) -> Link {
        let mut link = Link::new(self.from_res.to_ref(), self.to_res.to_ref());
        link.dirty = self.dirty;
        link.deleted = self.deleted;
        link.last_clean_version = self.last_clean_version.clone();
        link.inferred_dirtiness = self.inferred_dirtiness.iter().map(|i| i.to_entry()).collect();
        link
    }

    pub fn same_endpoints(&self, other: &LinkRef) -> bool {
        self.from_res.to_ref() == other.from_res && self.to_res.to_ref() == other.to_res
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// A single traceable artifact inside a resource group: a file in a git
/// repository, a node in a model, a goal in a GSN tree.
///
/// Identity is `(id, url)`; `name` is display-only. A resource may be
/// tombstoned (`deleted`) while dirty links still reference it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub name: String,
    pub id: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(default)]
    pub deleted: bool,
}

impl Resource {
    pub fn new(name: impl Into<String>, id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            url: url.into(),
            deleted: false,
        }
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.url == other.url
    }
}

impl Eq for Resource {}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.url.hash(state);
    }
}

/// A versioned container of resources inside one external tool. Identity
/// within a branch is `(tool_id, url)`; `version` is an opaque tool-supplied
/// string such as a commit hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    pub name: String,
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub version: String,
    #[serde(default)]
    pub resources: BTreeMap<String, Resource>,
}

impl ResourceGroup {
    pub fn new(
        name: impl Into<String>,
        tool_id: impl Into<String>,
        url: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            tool_id: tool_id.into(),
            url: url.into(),
            version: version.into(),
            resources: BTreeMap::new(),
        }
    }

    /// A copy without the resource map, for embedding in views and events.
    pub fn header(&self) -> Self {
        Self {
            name: self.name.clone(),
            tool_id: self.tool_id.clone(),
            url: self.url.clone(),
            version: self.version.clone(),
            resources: BTreeMap::new(),
        }
    }

    pub fn get_resource(&self, url: &str) -> Option<&Resource> {
        self.resources.get(url)
    }

    /// Insert `res` unless a resource with that URL already exists.
    pub fn add_resource(&mut self, res: Resource) -> bool {
        if self.resources.contains_key(&res.url) {
            return false;
        }
        self.resources.insert(res.url.clone(), res);
        true
    }

    pub fn remove_resource(&mut self, url: &str) -> bool {
        self.resources.remove(url).is_some()
    }
}

impl PartialEq for ResourceGroup {
    fn eq(&self, other: &Self) -> bool {
        self.tool_id == other.tool_id && self.url == other.url
    }
}

impl Eq for ResourceGroup {}

/// Foreign key to a resource: names it without owning it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub tool_id: String,
    #[serde(rename = "resourceGroupURL")]
    pub resource_group_url: String,
    #[serde(rename = "URL")]
    pub url: String,
}

impl ResourceRef {
    pub fn new(
        tool_id: impl Into<String>,
        resource_group_url: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            tool_id: tool_id.into(),
            resource_group_url: resource_group_url.into(),
            url: url.into(),
        }
    }

    pub fn from_group_and_resource(rg: &ResourceGroup, res: &Resource) -> Self {
        Self::new(rg.tool_id.clone(), rg.url.clone(), res.url.clone())
    }

    /// True when this ref points into the given group.
    pub fn in_group(&self, tool_id: &str, group_url: &str) -> bool {
        self.tool_id == tool_id && self.resource_group_url == group_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_identity_ignores_name_and_deleted() {
        let a = Resource::new("a", "id1", "/x");
        let mut b = Resource::new("b", "id1", "/x");
        b.deleted = true;
        assert_eq!(a, b);
        assert_ne!(a, Resource::new("a", "id2", "/x"));
    }

    #[test]
    fn group_add_is_idempotent_on_url() {
        let mut rg = ResourceGroup::new("repo", "git", "rg1", "v0");
        assert!(rg.add_resource(Resource::new("r1", "r1", "/r1")));
        assert!(!rg.add_resource(Resource::new("other", "other", "/r1")));
        assert_eq!(rg.resources.len(), 1);
    }
}

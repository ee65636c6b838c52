use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Resource, ResourceGroup};

/// Classification of a single resource change, supplied pre-computed by the
/// tool adapter that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Added,
    Modified,
    Renamed,
    Removed,
}

/// One changed resource inside a [`ResourceGroupChange`]. The `new_*` fields
/// carry the post-change coordinates for renames; for other change types they
/// repeat the old values or stay empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceChange {
    pub name: String,
    pub id: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(default)]
    pub new_name: String,
    #[serde(default)]
    pub new_id: String,
    #[serde(rename = "newURL", default)]
    pub new_url: String,
    pub change_type: ChangeType,
}

impl ResourceChange {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        url: impl Into<String>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            url: url.into(),
            new_name: String::new(),
            new_id: String::new(),
            new_url: String::new(),
            change_type,
        }
    }

    pub fn renamed_to(
        mut self,
        new_name: impl Into<String>,
        new_id: impl Into<String>,
        new_url: impl Into<String>,
    ) -> Self {
        self.new_name = new_name.into();
        self.new_id = new_id.into();
        self.new_url = new_url.into();
        self
    }

    pub fn to_resource(&self) -> Resource {
        Resource::new(self.name.clone(), self.id.clone(), self.url.clone())
    }

    /// True for changes that move the resource to new coordinates: a pure
    /// `Renamed`, or a `Modified` whose url/name/id differ from the old ones.
    pub fn moves_resource(&self) -> bool {
        match self.change_type {
            ChangeType::Renamed => true,
            ChangeType::Modified => {
                (!self.new_url.is_empty() && self.new_url != self.url)
                    || (!self.new_name.is_empty() && self.new_name != self.name)
                    || (!self.new_id.is_empty() && self.new_id != self.id)
            }
            _ => false,
        }
    }
}

/// A change set for one resource group: the group's new version plus the
/// changed resources keyed by their (old) URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupChange {
    pub name: String,
    pub tool_id: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub version: String,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceChange>,
}

impl ResourceGroupChange {
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

    pub fn with_change(mut self, change: ResourceChange) -> Self {
        self.resources.insert(change.url.clone(), change);
        self
    }

    pub fn to_resource_group(&self) -> ResourceGroup {
        ResourceGroup::new(
            self.name.clone(),
            self.tool_id.clone(),
            self.url.clone(),
            self.version.clone(),
        )
    }

    /// A group built from the change set itself, used when the change names
    /// a group the branch has never seen.
    pub fn materialize_group(&self) -> ResourceGroup {
        let mut rg = self.to_resource_group();
        for change in self.resources.values() {
            rg.add_resource(change.to_resource());
        }
        rg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modified_with_new_url_moves() {
        let change = ResourceChange::new("r2", "r2", "/r2", ChangeType::Modified)
            .renamed_to("r2", "r2", "/r2b");
        assert!(change.moves_resource());
    }

    #[test]
    fn modified_in_place_does_not_move() {
        let change =
            ResourceChange::new("r2", "r2", "/r2", ChangeType::Modified).renamed_to("r2", "r2", "/r2");
        assert!(!change.moves_resource());
    }

    #[test]
    fn renamed_always_moves() {
        let change = ResourceChange::new("r2", "r2", "/r2", ChangeType::Renamed);
        assert!(change.moves_resource());
    }
}

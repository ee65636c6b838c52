use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

use super::{Resource, ResourceGroup, ResourceRef};

/// Folder-prefix matching between a link's source URL and a changed resource
/// URL, using the owning tool's path separator.
///
/// A link from `"/folder/"` covers any descendant `"/folder/x"`; a link from
/// `"/folder"` covers only children reached through `"/folder" + sep`.
/// The candidate URL is separator-prefixed first so that adapters reporting
/// bare paths (`"a.c"`) still match a root link (`"/"`).
pub fn url_prefix_matches(sep: &str, link_url: &str, res_url: &str) -> bool {
    if link_url == res_url {
        return true;
    }
    let candidate = if res_url.starts_with(sep) {
        res_url.to_string()
    } else {
        format!("{sep}{res_url}")
    };
    if link_url.ends_with(sep) {
        candidate.starts_with(link_url)
    } else {
        candidate.starts_with(&format!("{link_url}{sep}"))
    }
}

/// One recorded source of second-order dirtiness on a link: the resource
/// whose change started the cascade, at the version its group had when the
/// cascade began.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredDirtiness {
    #[serde(rename = "res")]
    pub source: ResourceRef,
    #[serde(rename = "lastCleanVersion")]
    pub last_clean_version: String,
}

/// A directed dependency edge between two resources, stored by reference.
/// Identity is the endpoint pair; the remaining fields are mutable state of
/// the dirty/clean machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub from_res: ResourceRef,
    pub to_res: ResourceRef,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub last_clean_version: String,
    #[serde(default)]
    pub inferred_dirtiness: Vec<InferredDirtiness>,
}

impl Link {
    pub fn new(from_res: ResourceRef, to_res: ResourceRef) -> Self {
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
        LinkRef {
            from_res: self.from_res.clone(),
            to_res: self.to_res.clone(),
        }
    }

    pub fn same_endpoints(&self, other: &LinkRef) -> bool {
        self.from_res == other.from_res && self.to_res == other.to_res
    }

    pub fn has_from_ref(&self, rr: &ResourceRef) -> bool {
        self.from_res == *rr
    }

    pub fn has_to_ref(&self, rr: &ResourceRef) -> bool {
        self.to_res == *rr
    }

    /// Source endpoint equals `res` exactly, within `rg`.
    pub fn has_from_link(&self, rg: &ResourceGroup, res: &Resource) -> bool {
        self.from_res.in_group(&rg.tool_id, &rg.url) && self.from_res.url == res.url
    }

    /// Source endpoint equals `res` or is a folder-prefix of it, within `rg`.
    pub fn has_from_link_ext(&self, rg: &ResourceGroup, res: &Resource, sep: &str) -> bool {
        self.from_res.in_group(&rg.tool_id, &rg.url)
            && url_prefix_matches(sep, &self.from_res.url, &res.url)
    }

    /// Target endpoint equals `res` exactly, within `rg`.
    pub fn has_to_link(&self, rg: &ResourceGroup, res: &Resource) -> bool {
        self.to_res.in_group(&rg.tool_id, &rg.url) && self.to_res.url == res.url
    }

    pub fn has_inferred_source(&self, source: &ResourceRef) -> bool {
        self.inferred_dirtiness.iter().any(|inf| inf.source == *source)
    }

    /// Record a dirtiness source unless already present.
    pub fn add_inferred_source(&mut self, source: ResourceRef, last_clean_version: String) -> bool {
        if self.has_inferred_source(&source) {
            return false;
        }
        self.inferred_dirtiness.push(InferredDirtiness {
            source,
            last_clean_version,
        });
        true
    }

    /// Drop every inferred entry whose source is `source`; returns how many
    /// entries were removed.
    pub fn remove_inferred_source(&mut self, source: &ResourceRef) -> usize {
        let before = self.inferred_dirtiness.len();
        self.inferred_dirtiness.retain(|inf| inf.source != *source);
        before - self.inferred_dirtiness.len()
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.from_res == other.from_res && self.to_res == other.to_res
    }
}

impl Eq for Link {}

impl Hash for Link {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.from_res.hash(state);
        self.to_res.hash(state);
    }
}

/// A link named by its endpoints only, as it travels in requests and
/// notifications that do not need materialized state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRef {
    pub from_res: ResourceRef,
    pub to_res: ResourceRef,
}

impl LinkRef {
    pub fn new(from_res: ResourceRef, to_res: ResourceRef) -> Self {
        Self { from_res, to_res }
    }

    pub fn to_link(&self) -> Link {
        Link::new(self.from_res.clone(), self.to_res.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_with_trailing_separator() {
        assert!(url_prefix_matches("/", "/folder/", "/folder/a.c"));
        assert!(url_prefix_matches("/", "/folder/", "/folder/sub/b.c"));
        assert!(!url_prefix_matches("/", "/folder/", "/folderX/a.c"));
    }

    #[test]
    fn prefix_match_without_trailing_separator() {
        assert!(url_prefix_matches("/", "/folder", "/folder"));
        assert!(url_prefix_matches("/", "/folder", "/folder/a.c"));
        assert!(!url_prefix_matches("/", "/folder", "/folderX/a.c"));
        assert!(!url_prefix_matches("/", "/folder", "/folderX"));
    }

    #[test]
    fn prefix_match_normalizes_bare_urls() {
        assert!(url_prefix_matches("/", "/", "a.c"));
        assert!(url_prefix_matches("/", "/folder/", "folder/a.c"));
    }

    #[test]
    fn inferred_sources_deduplicate() {
        let mut link = Link::new(
            ResourceRef::new("git", "rg1", "/a"),
            ResourceRef::new("git", "rg1", "/b"),
        );
        let src = ResourceRef::new("git", "rg1", "/c");
        assert!(link.add_inferred_source(src.clone(), "v0".into()));
        assert!(!link.add_inferred_source(src.clone(), "v1".into()));
        assert_eq!(link.inferred_dirtiness.len(), 1);
        assert_eq!(link.remove_inferred_source(&src), 1);
        assert!(link.inferred_dirtiness.is_empty());
    }
}

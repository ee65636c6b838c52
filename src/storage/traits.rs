//! The storage contract: a branch/tag catalog ([`DepiDatabase`]) and the
//! per-branch operations ([`Branch`]) every backend implements.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::error::StorageResult;
use crate::model::{
    Link, LinkRef, LinkView, Resource, ResourceGroup, ResourceGroupChange, ResourceLinkPattern,
    ResourceRef, ResourceRefPattern, ResourceView,
};

/// Buffer size for the streaming query variants.
const STREAM_BUFFER: usize = 64;

/// Catalog of named branches and immutable tags.
#[async_trait]
pub trait DepiDatabase: Send + Sync {
    async fn branch(&self, name: &str) -> StorageResult<Arc<dyn Branch>>;

    async fn tag(&self, name: &str) -> StorageResult<Arc<dyn Branch>>;

    async fn branch_exists(&self, name: &str) -> StorageResult<bool>;

    async fn tag_exists(&self, name: &str) -> StorageResult<bool>;

    /// Copy-on-write fork of an existing branch.
    async fn create_branch(&self, name: &str, from_branch: &str) -> StorageResult<()>;

    /// Fork history pinned by a tag into a new writable branch.
    async fn create_branch_from_tag(&self, name: &str, from_tag: &str) -> StorageResult<()>;

    /// Pin an immutable snapshot of a branch.
    async fn create_tag(&self, name: &str, from_branch: &str) -> StorageResult<()>;

    async fn branch_list(&self) -> StorageResult<Vec<String>>;

    async fn tag_list(&self) -> StorageResult<Vec<String>>;
}

/// Operations on one branch. Mutations against a tag fail with a conflict.
///
/// The streaming variants have default implementations that materialize the
/// unary result and feed it through a bounded channel; backends with a
/// cheaper row-at-a-time path may override them.
#[async_trait]
pub trait Branch: Send + Sync {
    fn name(&self) -> String;

    fn is_tag(&self) -> bool;

    /// Ensure the group exists and optionally insert one resource. Returns
    /// whether anything changed (re-adding a live resource is a no-op, but
    /// re-adding a tombstoned one revives it).
    async fn add_resource(&self, rg: &ResourceGroup, res: Option<&Resource>)
        -> StorageResult<bool>;

    async fn add_resources(&self, resources: &[(ResourceGroup, Resource)]) -> StorageResult<()>;

    /// Insert a link (creating missing endpoint resources). Returns false if
    /// the link already exists live; a deleted link is revived.
    async fn add_link(&self, link: &LinkView) -> StorageResult<bool>;

    async fn add_links(&self, links: &[LinkView]) -> StorageResult<()>;

    /// Tombstone a resource and mark links referencing it deleted.
    async fn remove_resource(&self, rr: &ResourceRef) -> StorageResult<bool>;

    /// Physically remove a link by its endpoints.
    async fn remove_link(&self, link: &LinkRef) -> StorageResult<bool>;

    async fn get_resource(
        &self,
        rr: &ResourceRef,
        include_deleted: bool,
    ) -> StorageResult<Option<ResourceView>>;

    async fn get_resource_by_id(
        &self,
        tool_id: &str,
        group_url: &str,
        res_id: &str,
    ) -> StorageResult<Option<ResourceView>>;

    async fn get_resource_group(
        &self,
        tool_id: &str,
        url: &str,
    ) -> StorageResult<Option<ResourceGroup>>;

    /// Group version, or the empty string when the group is unknown.
    async fn get_resource_group_version(&self, tool_id: &str, url: &str) -> StorageResult<String>;

    async fn get_resource_groups(&self) -> StorageResult<Vec<ResourceGroup>>;

    async fn get_resources(
        &self,
        patterns: &[ResourceRefPattern],
        include_deleted: bool,
    ) -> StorageResult<Vec<ResourceView>>;

    async fn get_resources_stream(
        &self,
        patterns: &[ResourceRefPattern],
    ) -> StorageResult<mpsc::Receiver<ResourceView>> {
        let resources = self.get_resources(patterns, false).await?;
        Ok(spawn_feeder(resources))
    }

    async fn get_links(
        &self,
        patterns: &[ResourceLinkPattern],
    ) -> StorageResult<Vec<LinkView>>;

    async fn get_links_stream(
        &self,
        patterns: &[ResourceLinkPattern],
    ) -> StorageResult<mpsc::Receiver<LinkView>> {
        let links = self.get_links(patterns).await?;
        Ok(spawn_feeder(links))
    }

    async fn get_all_links(&self, include_deleted: bool) -> StorageResult<Vec<LinkView>>;

    async fn get_all_links_stream(&self) -> StorageResult<mpsc::Receiver<LinkView>> {
        let links = self.get_all_links(false).await?;
        Ok(spawn_feeder(links))
    }

    /// Links whose target lies in `group` and which are dirty (or carry
    /// inferred dirtiness, when `with_inferred` is set).
    async fn get_dirty_links(
        &self,
        group: &ResourceGroup,
        with_inferred: bool,
    ) -> StorageResult<Vec<LinkView>>;

    async fn get_dirty_links_stream(
        &self,
        group: &ResourceGroup,
        with_inferred: bool,
    ) -> StorageResult<mpsc::Receiver<LinkView>> {
        let links = self.get_dirty_links(group, with_inferred).await?;
        Ok(spawn_feeder(links))
    }

    /// Materialize stored state for the given endpoint pairs; links unknown
    /// to the branch are materialized from the refs alone.
    async fn expand_links(&self, links: &[LinkRef]) -> StorageResult<Vec<LinkView>>;

    /// Breadth-first traversal from `rr`. `upstream` follows inbound edges;
    /// `max_depth <= 0` means unbounded.
    async fn get_dependency_graph(
        &self,
        rr: &ResourceRef,
        upstream: bool,
        max_depth: i32,
    ) -> StorageResult<Vec<LinkView>>;

    /// The change processor: apply one group change set, dirtying and
    /// rewriting links. Returns the links that became dirty.
    async fn update_resource_group(&self, change: &ResourceGroupChange)
        -> StorageResult<Vec<Link>>;

    async fn edit_resource_group(
        &self,
        old: &ResourceGroup,
        new: &ResourceGroup,
    ) -> StorageResult<()>;

    /// Cascading delete: links referencing the group, then its resources,
    /// then the group itself.
    async fn remove_resource_group(&self, tool_id: &str, url: &str) -> StorageResult<()>;

    async fn mark_links_clean(&self, links: &[LinkRef], propagate: bool) -> StorageResult<()>;

    /// Remove `source` from the link's inferred set, walking downstream when
    /// `propagate` is set. Returns the `(link, source)` pairs cleaned.
    async fn mark_inferred_dirtiness_clean(
        &self,
        link: &LinkRef,
        source: &ResourceRef,
        propagate: bool,
    ) -> StorageResult<Vec<(LinkRef, ResourceRef)>>;

    /// Commit the branch's current state.
    async fn save_branch_state(&self) -> StorageResult<()>;
}

fn spawn_feeder<T: Send + 'static>(items: Vec<T>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

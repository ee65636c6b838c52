//! Snapshot storage backend: branch state held in memory and committed as
//! numbered JSON documents, one directory per branch.
//!
//! Layout under the configured state directory:
//!
//! ```text
//! <stateDir>/<branch>/<N>     snapshot N of the branch (JSON)
//! <stateDir>/tags/<name>      tag pointer {branch, version}
//! ```
//!
//! Load-time scan picks the highest-numbered snapshot per branch. Tags load
//! the pinned snapshot of their source branch and refuse every mutation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

use async_trait::async_trait;

use super::error::{StorageError, StorageResult};
use super::state::BranchState;
use super::traits::{Branch, DepiDatabase};
use crate::config::DepiConfig;
use crate::model::{
    Link, LinkRef, LinkView, Resource, ResourceGroup, ResourceGroupChange, ResourceLinkPattern,
    ResourceRef, ResourceRefPattern, ResourceView,
};

/// Tag pointer document stored under `<stateDir>/tags/<name>`.
#[derive(Debug, Serialize, Deserialize)]
struct TagPointer {
    branch: String,
    version: u64,
}

/// One branch of the snapshot backend.
pub struct MemBranch {
    state_dir: PathBuf,
    config: Arc<DepiConfig>,
    is_tag: bool,
    state: RwLock<BranchState>,
}

impl MemBranch {
    fn new(state_dir: PathBuf, config: Arc<DepiConfig>, is_tag: bool, state: BranchState) -> Self {
        Self {
            state_dir,
            config,
            is_tag,
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, BranchState>> {
        self.state
            .read()
            .map_err(|_| StorageError::database("branch state lock poisoned"))
    }

    fn write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, BranchState>> {
        if self.is_tag {
            return Err(StorageError::conflict("cannot modify a tag"));
        }
        self.state
            .write()
            .map_err(|_| StorageError::database("branch state lock poisoned"))
    }

    /// Serialize under the lock, write the snapshot file outside it. The
    /// service-level write lock serializes mutations, so snapshot numbers
    /// stay monotonic.
    fn save_now(&self) -> StorageResult<()> {
        let (name, version, body) = {
            let mut state = self.write()?;
            state.last_version += 1;
            (
                state.name.clone(),
                state.last_version,
                serde_json::to_string_pretty(&*state)?,
            )
        };
        let branch_dir = self.state_dir.join(&name);
        std::fs::create_dir_all(&branch_dir)?;
        std::fs::write(branch_dir.join(version.to_string()), body)?;
        Ok(())
    }
}

#[async_trait]
impl Branch for MemBranch {
    fn name(&self) -> String {
        match self.state.read() {
            Ok(state) => state.name.clone(),
            Err(_) => String::new(),
        }
    }

    fn is_tag(&self) -> bool {
        self.is_tag
    }

    async fn add_resource(
        &self,
        rg: &ResourceGroup,
        res: Option<&Resource>,
    ) -> StorageResult<bool> {
        Ok(self.write()?.add_resource(rg, res))
    }

    async fn add_resources(&self, resources: &[(ResourceGroup, Resource)]) -> StorageResult<()> {
        let mut state = self.write()?;
        for (rg, res) in resources {
            state.add_resource(rg, Some(res));
        }
        Ok(())
    }

    async fn add_link(&self, link: &LinkView) -> StorageResult<bool> {
        Ok(self.write()?.add_link(link))
    }

    async fn add_links(&self, links: &[LinkView]) -> StorageResult<()> {
        let mut state = self.write()?;
        for link in links {
            state.add_link(link);
        }
        Ok(())
    }

    async fn remove_resource(&self, rr: &ResourceRef) -> StorageResult<bool> {
        Ok(self.write()?.remove_resource(rr))
    }

    async fn remove_link(&self, link: &LinkRef) -> StorageResult<bool> {
        Ok(self.write()?.remove_link(link))
    }

    async fn get_resource(
        &self,
        rr: &ResourceRef,
        include_deleted: bool,
    ) -> StorageResult<Option<ResourceView>> {
        let state = self.read()?;
        Ok(state
            .resource_view(rr)
            .filter(|v| include_deleted || !v.deleted))
    }

    async fn get_resource_by_id(
        &self,
        tool_id: &str,
        group_url: &str,
        res_id: &str,
    ) -> StorageResult<Option<ResourceView>> {
        let state = self.read()?;
        let Some(group) = state.group(tool_id, group_url) else {
            return Ok(None);
        };
        Ok(group
            .resources
            .values()
            .find(|r| r.id == res_id)
            .map(|r| ResourceView::new(group, r)))
    }

    async fn get_resource_group(
        &self,
        tool_id: &str,
        url: &str,
    ) -> StorageResult<Option<ResourceGroup>> {
        Ok(self.read()?.group(tool_id, url).cloned())
    }

    async fn get_resource_group_version(&self, tool_id: &str, url: &str) -> StorageResult<String> {
        Ok(self
            .read()?
            .group(tool_id, url)
            .map(|rg| rg.version.clone())
            .unwrap_or_default())
    }

    async fn get_resource_groups(&self) -> StorageResult<Vec<ResourceGroup>> {
        let state = self.read()?;
        Ok(state
            .tools
            .values()
            .flat_map(|tool| tool.values().map(|rg| rg.header()))
            .collect())
    }

    async fn get_resources(
        &self,
        patterns: &[ResourceRefPattern],
        include_deleted: bool,
    ) -> StorageResult<Vec<ResourceView>> {
        self.read()?.get_resources(patterns, include_deleted)
    }

    async fn get_links(&self, patterns: &[ResourceLinkPattern]) -> StorageResult<Vec<LinkView>> {
        self.read()?.get_links(patterns)
    }

    async fn get_all_links(&self, include_deleted: bool) -> StorageResult<Vec<LinkView>> {
        Ok(self.read()?.get_all_links(include_deleted))
    }

    async fn get_dirty_links(
        &self,
        group: &ResourceGroup,
        with_inferred: bool,
    ) -> StorageResult<Vec<LinkView>> {
        Ok(self.read()?.get_dirty_links(group, with_inferred))
    }

    async fn expand_links(&self, links: &[LinkRef]) -> StorageResult<Vec<LinkView>> {
        Ok(self.read()?.expand_links(links))
    }

    async fn get_dependency_graph(
        &self,
        rr: &ResourceRef,
        upstream: bool,
        max_depth: i32,
    ) -> StorageResult<Vec<LinkView>> {
        Ok(self.read()?.get_dependency_graph(rr, upstream, max_depth))
    }

    async fn update_resource_group(
        &self,
        change: &ResourceGroupChange,
    ) -> StorageResult<Vec<Link>> {
        let sep = self.config.path_separator(&change.tool_id).to_string();
        Ok(self.write()?.update_resource_group(change, &sep))
    }

    async fn edit_resource_group(
        &self,
        old: &ResourceGroup,
        new: &ResourceGroup,
    ) -> StorageResult<()> {
        self.write()?.edit_resource_group(old, new);
        Ok(())
    }

    async fn remove_resource_group(&self, tool_id: &str, url: &str) -> StorageResult<()> {
        self.write()?.remove_resource_group(tool_id, url);
        Ok(())
    }

    async fn mark_links_clean(&self, links: &[LinkRef], propagate: bool) -> StorageResult<()> {
        self.write()?.mark_links_clean(links, propagate);
        Ok(())
    }

    async fn mark_inferred_dirtiness_clean(
        &self,
        link: &LinkRef,
        source: &ResourceRef,
        propagate_clean: bool,
    ) -> StorageResult<Vec<(LinkRef, ResourceRef)>> {
        Ok(self
            .write()?
            .mark_inferred_dirtiness_clean(link, source, propagate_clean))
    }

    async fn save_branch_state(&self) -> StorageResult<()> {
        if self.is_tag {
            return Err(StorageError::conflict("cannot save a tag"));
        }
        self.save_now()
    }
}

/// The snapshot database: named branches plus immutable tags.
pub struct MemJsonDatabase {
    state_dir: PathBuf,
    config: Arc<DepiConfig>,
    branches: RwLock<HashMap<String, Arc<MemBranch>>>,
    tags: RwLock<HashMap<String, Arc<MemBranch>>>,
}

impl MemJsonDatabase {
    pub fn new(config: Arc<DepiConfig>) -> StorageResult<Self> {
        let db = Self {
            state_dir: PathBuf::from(&config.db.state_dir),
            config,
            branches: RwLock::new(HashMap::new()),
            tags: RwLock::new(HashMap::new()),
        };
        db.load_all_state()?;
        Ok(db)
    }

    fn load_all_state(&self) -> StorageResult<()> {
        if self.state_dir.exists() && !self.state_dir.is_dir() {
            std::fs::remove_file(&self.state_dir)?;
        }
        if !self.state_dir.exists() {
            std::fs::create_dir_all(&self.state_dir)?;
            let main = Arc::new(MemBranch::new(
                self.state_dir.clone(),
                Arc::clone(&self.config),
                false,
                BranchState::new("main"),
            ));
            main.save_now()?;
            self.lock_branches()?.insert("main".to_string(), main);
        }

        for entry in std::fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "tags" {
                continue;
            }
            if !entry.path().is_dir() {
                debug!("extraneous file in state dir: {}", name);
                continue;
            }
            let state = match latest_snapshot(&entry.path())? {
                Some(version) => load_snapshot(&entry.path(), version)?,
                None => BranchState::new(name.clone()),
            };
            self.lock_branches()?.insert(
                name,
                Arc::new(MemBranch::new(
                    self.state_dir.clone(),
                    Arc::clone(&self.config),
                    false,
                    state,
                )),
            );
        }

        let tags_dir = self.state_dir.join("tags");
        if tags_dir.exists() {
            for entry in std::fs::read_dir(&tags_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let pointer: TagPointer =
                    serde_json::from_str(&std::fs::read_to_string(entry.path())?)?;
                let state = load_snapshot(&self.state_dir.join(&pointer.branch), pointer.version)?;
                self.lock_tags()?.insert(
                    name,
                    Arc::new(MemBranch::new(
                        self.state_dir.clone(),
                        Arc::clone(&self.config),
                        true,
                        state,
                    )),
                );
            }
        }
        Ok(())
    }

    fn lock_branches(
        &self,
    ) -> StorageResult<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<MemBranch>>>> {
        self.branches
            .write()
            .map_err(|_| StorageError::database("branch table lock poisoned"))
    }

    fn lock_tags(
        &self,
    ) -> StorageResult<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<MemBranch>>>> {
        self.tags
            .write()
            .map_err(|_| StorageError::database("tag table lock poisoned"))
    }

    fn branch_arc(&self, name: &str) -> StorageResult<Arc<MemBranch>> {
        self.branches
            .read()
            .map_err(|_| StorageError::database("branch table lock poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("branch {name}")))
    }

    fn tag_arc(&self, name: &str) -> StorageResult<Arc<MemBranch>> {
        self.tags
            .read()
            .map_err(|_| StorageError::database("tag table lock poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("tag {name}")))
    }
}

fn latest_snapshot(branch_dir: &Path) -> StorageResult<Option<u64>> {
    let mut latest = None;
    for entry in std::fs::read_dir(branch_dir)? {
        let entry = entry?;
        if let Ok(version) = entry.file_name().to_string_lossy().parse::<u64>() {
            if latest.map(|v| version > v).unwrap_or(true) {
                latest = Some(version);
            }
        }
    }
    Ok(latest)
}

fn load_snapshot(branch_dir: &Path, version: u64) -> StorageResult<BranchState> {
    let path = branch_dir.join(version.to_string());
    let body = std::fs::read_to_string(&path)?;
    let state = serde_json::from_str(&body)?;
    Ok(state)
}

#[async_trait]
impl DepiDatabase for MemJsonDatabase {
    async fn branch(&self, name: &str) -> StorageResult<Arc<dyn Branch>> {
        let branch: Arc<dyn Branch> = self.branch_arc(name)?;
        Ok(branch)
    }

    async fn tag(&self, name: &str) -> StorageResult<Arc<dyn Branch>> {
        let tag: Arc<dyn Branch> = self.tag_arc(name)?;
        Ok(tag)
    }

    async fn branch_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.branch_arc(name).is_ok())
    }

    async fn tag_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.tag_arc(name).is_ok())
    }

    async fn create_branch(&self, name: &str, from_branch: &str) -> StorageResult<()> {
        if self.branch_arc(name).is_ok() {
            return Err(StorageError::conflict(format!(
                "branch {name} already exists"
            )));
        }
        let source = self.branch_arc(from_branch)?;
        let forked = source.read()?.fork(name);
        let branch = Arc::new(MemBranch::new(
            self.state_dir.clone(),
            Arc::clone(&self.config),
            false,
            forked,
        ));
        branch.save_now()?;
        self.lock_branches()?.insert(name.to_string(), branch);
        Ok(())
    }

    async fn create_branch_from_tag(&self, name: &str, from_tag: &str) -> StorageResult<()> {
        if self.branch_arc(name).is_ok() {
            return Err(StorageError::conflict(format!(
                "branch {name} already exists"
            )));
        }
        let source = self.tag_arc(from_tag)?;
        let forked = source.read()?.fork(name);
        let branch = Arc::new(MemBranch::new(
            self.state_dir.clone(),
            Arc::clone(&self.config),
            false,
            forked,
        ));
        branch.save_now()?;
        self.lock_branches()?.insert(name.to_string(), branch);
        Ok(())
    }

    async fn create_tag(&self, name: &str, from_branch: &str) -> StorageResult<()> {
        if self.tag_arc(name).is_ok() {
            return Err(StorageError::conflict(format!("tag {name} already exists")));
        }
        let source = self.branch_arc(from_branch)?;
        let (forked, source_version) = {
            let state = source.read()?;
            (state.fork(name), state.last_version)
        };
        let tag = Arc::new(MemBranch::new(
            self.state_dir.clone(),
            Arc::clone(&self.config),
            true,
            forked,
        ));
        self.lock_tags()?.insert(name.to_string(), tag);

        let tags_dir = self.state_dir.join("tags");
        std::fs::create_dir_all(&tags_dir)?;
        let pointer = TagPointer {
            branch: from_branch.to_string(),
            version: source_version,
        };
        std::fs::write(tags_dir.join(name), serde_json::to_string(&pointer)?)?;
        Ok(())
    }

    async fn branch_list(&self) -> StorageResult<Vec<String>> {
        let branches = self
            .branches
            .read()
            .map_err(|_| StorageError::database("branch table lock poisoned"))?;
        let mut names: Vec<String> = branches.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn tag_list(&self) -> StorageResult<Vec<String>> {
        let tags = self
            .tags
            .read()
            .map_err(|_| StorageError::database("tag table lock poisoned"))?;
        let mut names: Vec<String> = tags.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeType, ResourceChange};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Arc<DepiConfig> {
        let mut config = DepiConfig::default();
        config.db.state_dir = dir.path().join("state").to_string_lossy().to_string();
        config
            .tools
            .insert("git".to_string(), crate::config::ToolConfig::default());
        Arc::new(config)
    }

    fn group() -> ResourceGroup {
        ResourceGroup::new("testrepo", "git", "rg1", "v0")
    }

    fn res(url: &str) -> Resource {
        Resource::new(url.trim_start_matches('/'), url.trim_start_matches('/'), url)
    }

    fn view(url: &str) -> ResourceView {
        ResourceView::new(&group(), &res(url))
    }

    fn link_view(from: &str, to: &str) -> LinkView {
        LinkView::new(view(from), view(to))
    }

    async fn fresh_db(dir: &TempDir) -> MemJsonDatabase {
        MemJsonDatabase::new(test_config(dir)).unwrap()
    }

    #[tokio::test]
    async fn add_resource_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = fresh_db(&dir).await;
        let main = db.branch("main").await.unwrap();

        assert!(main.add_resource(&group(), Some(&res("/r1"))).await.unwrap());
        assert!(!main.add_resource(&group(), Some(&res("/r1"))).await.unwrap());
        let found = main
            .get_resource(&ResourceRef::new("git", "rg1", "/r1"), false)
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn unlink_then_relink_revives_link() {
        let dir = TempDir::new().unwrap();
        let db = fresh_db(&dir).await;
        let main = db.branch("main").await.unwrap();

        assert!(main.add_link(&link_view("/a", "/b")).await.unwrap());
        assert!(!main.add_link(&link_view("/a", "/b")).await.unwrap());

        let lref = link_view("/a", "/b").link_ref();
        assert!(main.remove_link(&lref).await.unwrap());
        assert!(main.get_all_links(false).await.unwrap().is_empty());

        assert!(main.add_link(&link_view("/a", "/b")).await.unwrap());
        let links = main.get_all_links(false).await.unwrap();
        assert_eq!(links.len(), 1);
        assert!(!links[0].deleted);
        assert!(!links[0].dirty);
    }

    #[tokio::test]
    async fn snapshots_reload_across_instances() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        {
            let db = MemJsonDatabase::new(Arc::clone(&config)).unwrap();
            let main = db.branch("main").await.unwrap();
            main.add_link(&link_view("/a", "/b")).await.unwrap();
            main.save_branch_state().await.unwrap();
        }
        let db = MemJsonDatabase::new(config).unwrap();
        let main = db.branch("main").await.unwrap();
        let links = main.get_all_links(false).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].from_res.url, "/a");
    }

    #[tokio::test]
    async fn tags_are_immutable_and_seed_branches() {
        let dir = TempDir::new().unwrap();
        let db = fresh_db(&dir).await;
        let main = db.branch("main").await.unwrap();
        main.add_link(&link_view("/a", "/b")).await.unwrap();
        main.save_branch_state().await.unwrap();

        db.create_tag("rel-1", "main").await.unwrap();
        let tag = db.tag("rel-1").await.unwrap();
        assert!(tag.add_resource(&group(), Some(&res("/c"))).await.is_err());
        assert!(tag.save_branch_state().await.is_err());

        db.create_branch_from_tag("feature", "rel-1").await.unwrap();
        let feature = db.branch("feature").await.unwrap();
        let links = feature.get_all_links(false).await.unwrap();
        assert_eq!(links.len(), 1);
    }

    #[tokio::test]
    async fn branch_copy_is_independent() {
        let dir = TempDir::new().unwrap();
        let db = fresh_db(&dir).await;
        let main = db.branch("main").await.unwrap();
        main.add_link(&link_view("/a", "/b")).await.unwrap();
        main.save_branch_state().await.unwrap();

        db.create_branch("dev", "main").await.unwrap();
        let dev = db.branch("dev").await.unwrap();
        dev.add_link(&link_view("/b", "/c")).await.unwrap();

        assert_eq!(main.get_all_links(false).await.unwrap().len(), 1);
        assert_eq!(dev.get_all_links(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn modify_dirties_only_matching_links() {
        let dir = TempDir::new().unwrap();
        let db = fresh_db(&dir).await;
        let main = db.branch("main").await.unwrap();
        main.add_link(&link_view("/r1", "/r2")).await.unwrap();
        main.add_link(&link_view("/r2", "/r3")).await.unwrap();

        let change = ResourceGroupChange::new("testrepo", "git", "rg1", "v1")
            .with_change(ResourceChange::new("r2", "r2", "/r2", ChangeType::Modified));
        let dirtied = main.update_resource_group(&change).await.unwrap();
        assert_eq!(dirtied.len(), 1);
        assert_eq!(dirtied[0].from_res.url, "/r2");
        assert_eq!(dirtied[0].last_clean_version, "v0");

        let links = main.get_all_links(false).await.unwrap();
        let r1_link = links.iter().find(|l| l.from_res.url == "/r1").unwrap();
        assert!(!r1_link.dirty);
    }

    #[tokio::test]
    async fn lookup_by_id_scans_the_group() {
        let dir = TempDir::new().unwrap();
        let db = fresh_db(&dir).await;
        let main = db.branch("main").await.unwrap();
        main.add_resource(&group(), Some(&res("/src/main.c"))).await.unwrap();

        let found = main
            .get_resource_by_id("git", "rg1", "src/main.c")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.url, "/src/main.c");
        assert!(main
            .get_resource_by_id("git", "rg1", "nope")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn pattern_queries_narrow_by_group_and_regex() {
        let dir = TempDir::new().unwrap();
        let db = fresh_db(&dir).await;
        let main = db.branch("main").await.unwrap();
        for url in ["/src/a.c", "/src/b.c", "/doc/readme.md"] {
            main.add_resource(&group(), Some(&res(url))).await.unwrap();
        }

        let all = main
            .get_resources(&[ResourceRefPattern::new("git", "rg1", ".*")], false)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let sources = main
            .get_resources(&[ResourceRefPattern::new("git", "rg1", "/src/.*\\.c")], false)
            .await
            .unwrap();
        assert_eq!(sources.len(), 2);

        let other_group = main
            .get_resources(&[ResourceRefPattern::new("git", "other", ".*")], false)
            .await
            .unwrap();
        assert!(other_group.is_empty());

        assert!(main
            .get_resources(&[ResourceRefPattern::new("git", "rg1", "(")], false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_group_update_registers_it() {
        let dir = TempDir::new().unwrap();
        let db = fresh_db(&dir).await;
        let main = db.branch("main").await.unwrap();

        let change = ResourceGroupChange::new("fresh", "git", "rg-new", "v5")
            .with_change(ResourceChange::new("a", "a", "/a", ChangeType::Added));
        let dirtied = main.update_resource_group(&change).await.unwrap();
        assert!(dirtied.is_empty());
        assert_eq!(
            main.get_resource_group_version("git", "rg-new").await.unwrap(),
            "v5"
        );
    }
}

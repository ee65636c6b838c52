//! The in-memory representation of one branch and its state transitions.
//!
//! This is the canonical form of the dirty/clean machine: the snapshot
//! backend holds its branches in this shape permanently, and the relational
//! backend materializes the affected slice of a branch into it, applies the
//! identical transition, and persists the row-level diff.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::propagate;
use crate::model::{
    InferredDirtinessView, Link, LinkRef, LinkView, Resource, ResourceGroup, ResourceGroupChange,
    ResourceLinkPattern, ResourceRef, ResourceRefPattern, ResourceView,
};

use super::error::StorageResult;

/// The complete state of one branch, in the shape it is snapshotted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BranchState {
    pub(crate) name: String,
    pub(crate) last_version: u64,
    #[serde(default)]
    pub(crate) parent_name: String,
    #[serde(default)]
    pub(crate) parent_version: u64,
    #[serde(default)]
    pub(crate) links: Vec<Link>,
    #[serde(default)]
    pub(crate) tools: BTreeMap<String, BTreeMap<String, ResourceGroup>>,
}

impl BranchState {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_version: 0,
            parent_name: String::new(),
            parent_version: 0,
            links: Vec::new(),
            tools: BTreeMap::new(),
        }
    }

    /// Deep copy for branch/tag creation; the copy starts at version 0 and
    /// records where it forked from.
    pub(crate) fn fork(&self, new_name: &str) -> Self {
        let mut copy = self.clone();
        copy.name = new_name.to_string();
        copy.last_version = 0;
        copy.parent_name = self.name.clone();
        copy.parent_version = self.last_version;
        copy
    }

    pub(crate) fn group(&self, tool_id: &str, url: &str) -> Option<&ResourceGroup> {
        self.tools.get(tool_id).and_then(|t| t.get(url))
    }

    pub(crate) fn group_mut(&mut self, tool_id: &str, url: &str) -> Option<&mut ResourceGroup> {
        self.tools.get_mut(tool_id).and_then(|t| t.get_mut(url))
    }

    pub(crate) fn insert_group(&mut self, rg: ResourceGroup) {
        self.tools
            .entry(rg.tool_id.clone())
            .or_default()
            .insert(rg.url.clone(), rg);
    }

    pub(crate) fn add_resource(&mut self, rg: &ResourceGroup, res: Option<&Resource>) -> bool {
        let tool = self.tools.entry(rg.tool_id.clone()).or_default();
        let group = tool.entry(rg.url.clone()).or_insert_with(|| rg.header());
        let Some(res) = res else {
            return false;
        };
        if let Some(existing) = group.resources.get_mut(&res.url) {
            if existing.deleted {
                existing.deleted = false;
                return true;
            }
            return false;
        }
        group.resources.insert(
            res.url.clone(),
            Resource::new(res.name.clone(), res.id.clone(), res.url.clone()),
        );
        true
    }

    pub(crate) fn add_link(&mut self, view: &LinkView) -> bool {
        self.add_resource(&view.from_res.group_header(), Some(&view.from_res.resource()));
        self.add_resource(&view.to_res.group_header(), Some(&view.to_res.resource()));

        let mut new_link = view.to_link();
        new_link.deleted = false;
        if !new_link.dirty {
            new_link.last_clean_version.clear();
        }
        let lref = new_link.link_ref();
        if let Some(existing) = self.links.iter_mut().find(|l| l.same_endpoints(&lref)) {
            if existing.deleted {
                existing.deleted = false;
                return true;
            }
            return false;
        }
        self.links.push(new_link);
        true
    }

    pub(crate) fn remove_resource(&mut self, rr: &ResourceRef) -> bool {
        let Some(group) = self.group_mut(&rr.tool_id, &rr.resource_group_url) else {
            debug!("no such resource group {} {}", rr.tool_id, rr.resource_group_url);
            return false;
        };
        let Some(res) = group.resources.get_mut(&rr.url) else {
            debug!("no such resource URL {}", rr.url);
            return false;
        };
        if res.deleted {
            return false;
        }
        res.deleted = true;
        for link in self.links.iter_mut() {
            if link.has_from_ref(rr) || link.has_to_ref(rr) {
                link.deleted = true;
            }
        }
        true
    }

    pub(crate) fn remove_link(&mut self, lref: &LinkRef) -> bool {
        let before = self.links.len();
        self.links.retain(|l| !l.same_endpoints(lref));
        before != self.links.len()
    }

    pub(crate) fn resource_view(&self, rr: &ResourceRef) -> Option<ResourceView> {
        let group = self.group(&rr.tool_id, &rr.resource_group_url)?;
        let res = group.resources.get(&rr.url)?;
        Some(ResourceView::new(group, res))
    }

    /// Materialize a ref even when the resource is no longer stored, so that
    /// notifications for tombstoned endpoints still carry coordinates.
    pub(crate) fn view_or_synthesize(&self, rr: &ResourceRef) -> ResourceView {
        if let Some(view) = self.resource_view(rr) {
            return view;
        }
        let (group_name, group_version) = match self.group(&rr.tool_id, &rr.resource_group_url) {
            Some(rg) => (rg.name.clone(), rg.version.clone()),
            None => (String::new(), String::new()),
        };
        ResourceView {
            tool_id: rr.tool_id.clone(),
            resource_group_url: rr.resource_group_url.clone(),
            resource_group_name: group_name,
            resource_group_version: group_version,
            name: String::new(),
            url: rr.url.clone(),
            id: String::new(),
            deleted: true,
        }
    }

    pub(crate) fn materialize(&self, link: &Link) -> LinkView {
        LinkView {
            from_res: self.view_or_synthesize(&link.from_res),
            to_res: self.view_or_synthesize(&link.to_res),
            dirty: link.dirty,
            deleted: link.deleted,
            last_clean_version: link.last_clean_version.clone(),
            inferred_dirtiness: link
                .inferred_dirtiness
                .iter()
                .map(|inf| InferredDirtinessView {
                    resource: self.view_or_synthesize(&inf.source),
                    last_clean_version: inf.last_clean_version.clone(),
                })
                .collect(),
        }
    }

    /// The change processor: classify each resource change, dirty source
    /// links (with folder-prefix semantics), rewrite endpoints on moves,
    /// tombstone on removals, and expand inferred dirtiness downstream.
    /// Returns the links that became dirty.
    pub(crate) fn update_resource_group(
        &mut self,
        change: &ResourceGroupChange,
        sep: &str,
    ) -> Vec<Link> {
        {
            let tool = self.tools.entry(change.tool_id.clone()).or_default();
            if !tool.contains_key(&change.url) {
                // An update for a group this branch never saw: record the
                // group, nothing can be linked to it yet.
                debug!(
                    "update for unknown resource group {} {}, registering it",
                    change.tool_id, change.url
                );
                tool.insert(change.url.clone(), change.materialize_group());
                return Vec::new();
            }
        }
        let Some(group) = self.group_mut(&change.tool_id, &change.url) else {
            return Vec::new();
        };
        let orig_version = group.version.clone();
        group.version = change.version.clone();
        let header = group.header();

        let mut dirtied: Vec<LinkRef> = Vec::new();
        let mark_dirtied = |links: &mut Vec<Link>, i: usize, dirtied: &mut Vec<LinkRef>| {
            propagate::mark_link_dirty(links, i, &orig_version);
            let lref = links[i].link_ref();
            if !dirtied.contains(&lref) {
                dirtied.push(lref);
            }
        };

        for rc in change.resources.values() {
            use crate::model::ChangeType::*;

            if matches!(rc.change_type, Added | Modified) {
                let res = rc.to_resource();
                debug!("processing add/modify change for resource {}", rc.url);
                for i in 0..self.links.len() {
                    if self.links[i].has_from_link_ext(&header, &res, sep) {
                        debug!(
                            "link {} -> {} is dirty",
                            self.links[i].from_res.url, self.links[i].to_res.url
                        );
                        mark_dirtied(&mut self.links, i, &mut dirtied);
                    }
                }
            }

            if rc.moves_resource() {
                debug!("processing rename change for resource {}", rc.url);
                let new_url = if rc.new_url.is_empty() { rc.url.clone() } else { rc.new_url.clone() };
                let new_name = if rc.new_name.is_empty() { rc.name.clone() } else { rc.new_name.clone() };
                let new_id = if rc.new_id.is_empty() { rc.id.clone() } else { rc.new_id.clone() };

                for link in self.links.iter_mut() {
                    if link.from_res.in_group(&header.tool_id, &header.url)
                        && link.from_res.url == rc.url
                    {
                        link.from_res.url = new_url.clone();
                    }
                    if link.to_res.in_group(&header.tool_id, &header.url)
                        && link.to_res.url == rc.url
                    {
                        link.to_res.url = new_url.clone();
                    }
                    for inf in link.inferred_dirtiness.iter_mut() {
                        if inf.source.in_group(&header.tool_id, &header.url)
                            && inf.source.url == rc.url
                        {
                            inf.source.url = new_url.clone();
                        }
                    }
                }
                if let Some(group) = self.group_mut(&change.tool_id, &change.url) {
                    if let Some(mut res) = group.resources.remove(&rc.url) {
                        res.name = new_name;
                        res.id = new_id;
                        res.url = new_url.clone();
                        group.resources.insert(new_url, res);
                    }
                }
            } else if rc.change_type == Removed {
                debug!("processing delete for resource {}", rc.url);
                let res = rc.to_resource();
                let removed_ref =
                    ResourceRef::new(header.tool_id.clone(), header.url.clone(), res.url.clone());
                let mut keep_tombstone = false;
                let mut links_to_remove: Vec<LinkRef> = Vec::new();

                for i in 0..self.links.len() {
                    if self.links[i].has_from_link_ext(&header, &res, sep) {
                        mark_dirtied(&mut self.links, i, &mut dirtied);
                        if self.links[i].from_res.url == res.url {
                            self.links[i].deleted = true;
                            keep_tombstone = true;
                        }
                    } else if self.links[i].has_to_link(&header, &res) {
                        self.links[i].deleted = true;
                        links_to_remove.push(self.links[i].link_ref());
                    }
                    self.links[i]
                        .inferred_dirtiness
                        .retain(|inf| inf.source != removed_ref);
                }

                self.links
                    .retain(|l| !links_to_remove.iter().any(|lr| l.same_endpoints(lr)));

                if let Some(group) = self.group_mut(&change.tool_id, &change.url) {
                    if keep_tombstone {
                        if let Some(r) = group.resources.get_mut(&res.url) {
                            r.deleted = true;
                        }
                    } else {
                        group.resources.remove(&res.url);
                    }
                }
            }
        }

        dirtied
            .iter()
            .filter_map(|lr| self.links.iter().find(|l| l.same_endpoints(lr)).cloned())
            .collect()
    }

    pub(crate) fn mark_links_clean(&mut self, clean: &[LinkRef], propagate_clean: bool) {
        for cl in clean {
            let mut links_to_delete: Vec<LinkRef> = Vec::new();
            for link in self.links.iter_mut() {
                if link.same_endpoints(cl) {
                    link.dirty = false;
                    link.last_clean_version.clear();
                    if link.deleted {
                        links_to_delete.push(link.link_ref());
                    }
                }
            }
            for lref in &links_to_delete {
                self.links.retain(|l| !l.same_endpoints(lref));
                self.prune_source_resource(&lref.from_res);
            }
            if propagate_clean {
                propagate::clean_inferred(&mut self.links, cl, &cl.from_res, true);
            }
        }
    }

    /// After a tombstoned link is physically removed, its source resource is
    /// reclaimed once no surviving link starts there, together with every
    /// inferred entry still naming it.
    fn prune_source_resource(&mut self, rr: &ResourceRef) {
        let Some(group) = self
            .tools
            .get_mut(&rr.tool_id)
            .and_then(|t| t.get_mut(&rr.resource_group_url))
        else {
            return;
        };
        let Some(res) = group.resources.get(&rr.url) else {
            return;
        };
        let mut delete_res = res.deleted;
        if delete_res {
            for link in &self.links {
                if link.from_res == *rr && !link.deleted {
                    delete_res = false;
                    break;
                }
            }
        }
        if delete_res {
            group.resources.remove(&rr.url);
            for link in self.links.iter_mut() {
                link.inferred_dirtiness.retain(|inf| inf.source != *rr);
            }
        }
    }

    pub(crate) fn mark_inferred_dirtiness_clean(
        &mut self,
        link: &LinkRef,
        source: &ResourceRef,
        propagate_clean: bool,
    ) -> Vec<(LinkRef, ResourceRef)> {
        propagate::clean_inferred(&mut self.links, link, source, propagate_clean)
    }

    pub(crate) fn edit_resource_group(&mut self, old: &ResourceGroup, new: &ResourceGroup) {
        let Some(group) = self.group_mut(&old.tool_id, &old.url) else {
            return;
        };
        if !new.version.is_empty() {
            group.version = new.version.clone();
        }
        if !new.name.is_empty() {
            group.name = new.name.clone();
        }
        let moves = (!new.tool_id.is_empty() && new.tool_id != old.tool_id)
            || (!new.url.is_empty() && new.url != old.url);
        if moves {
            group.tool_id = new.tool_id.clone();
            group.url = new.url.clone();
            let moved = self
                .tools
                .get_mut(&old.tool_id)
                .and_then(|t| t.remove(&old.url));
            if let Some(moved) = moved {
                self.tools
                    .entry(new.tool_id.clone())
                    .or_default()
                    .insert(new.url.clone(), moved);
            }
        }
    }

    pub(crate) fn remove_resource_group(&mut self, tool_id: &str, url: &str) {
        if let Some(tool) = self.tools.get_mut(tool_id) {
            tool.remove(url);
        }
        self.links
            .retain(|l| !(l.from_res.in_group(tool_id, url) || l.to_res.in_group(tool_id, url)));
        for link in self.links.iter_mut() {
            link.inferred_dirtiness
                .retain(|inf| !inf.source.in_group(tool_id, url));
        }
    }

    pub(crate) fn get_resources(
        &self,
        patterns: &[ResourceRefPattern],
        include_deleted: bool,
    ) -> StorageResult<Vec<ResourceView>> {
        let compiled = patterns
            .iter()
            .map(|p| p.compile().map(|re| (p, re)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        for (tool_id, tool) in &self.tools {
            for rg in tool.values() {
                for (pattern, re) in &compiled {
                    if pattern.tool_id != *tool_id || pattern.resource_group_url != rg.url {
                        continue;
                    }
                    for res in rg.resources.values() {
                        if res.deleted && !include_deleted {
                            continue;
                        }
                        if re.is_match(&res.url)
                            && seen.insert((tool_id.clone(), rg.url.clone(), res.url.clone()))
                        {
                            out.push(ResourceView::new(rg, res));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn get_links(
        &self,
        patterns: &[ResourceLinkPattern],
    ) -> StorageResult<Vec<LinkView>> {
        let compiled = patterns
            .iter()
            .map(|p| {
                let from = p.from_res.compile()?;
                let to = p.to_res.compile()?;
                Ok::<_, regex::Error>((p, from, to))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        let mut seen: HashSet<LinkRef> = HashSet::new();
        for link in &self.links {
            if link.deleted {
                continue;
            }
            for (pattern, from_re, to_re) in &compiled {
                if link.from_res.tool_id != pattern.from_res.tool_id
                    || link.from_res.resource_group_url != pattern.from_res.resource_group_url
                    || link.to_res.tool_id != pattern.to_res.tool_id
                    || link.to_res.resource_group_url != pattern.to_res.resource_group_url
                {
                    continue;
                }
                if from_re.is_match(&link.from_res.url)
                    && to_re.is_match(&link.to_res.url)
                    && seen.insert(link.link_ref())
                {
                    out.push(self.materialize(link));
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn get_all_links(&self, include_deleted: bool) -> Vec<LinkView> {
        self.links
            .iter()
            .filter(|l| include_deleted || !l.deleted)
            .map(|l| self.materialize(l))
            .collect()
    }

    pub(crate) fn get_dirty_links(
        &self,
        group: &ResourceGroup,
        with_inferred: bool,
    ) -> Vec<LinkView> {
        self.links
            .iter()
            .filter(|l| {
                !l.deleted
                    && l.to_res.in_group(&group.tool_id, &group.url)
                    && (l.dirty || (with_inferred && !l.inferred_dirtiness.is_empty()))
            })
            .map(|l| self.materialize(l))
            .collect()
    }

    pub(crate) fn expand_links(&self, refs: &[LinkRef]) -> Vec<LinkView> {
        refs.iter()
            .map(|lref| match self.links.iter().find(|l| l.same_endpoints(lref)) {
                Some(stored) => self.materialize(stored),
                None => self.materialize(&lref.to_link()),
            })
            .collect()
    }

    pub(crate) fn get_dependency_graph(
        &self,
        rr: &ResourceRef,
        upstream: bool,
        max_depth: i32,
    ) -> Vec<LinkView> {
        propagate::dependency_graph(&self.links, rr, upstream, max_depth)
            .into_iter()
            .map(|i| self.materialize(&self.links[i]))
            .collect()
    }
}

//! Per-user blackboard: a staging area for resource additions and link
//! proposals, promoted atomically into the main branch on save.
//!
//! The blackboard mirrors the branch shape (tool → group URL → group) for
//! staged resources, and keeps two link sets: proposals (`changed_links`)
//! and pending deletions (`deleted_links`). When a resource-group change
//! lands on main, [`Blackboard::reconcile`] rewrites the staged state to
//! match and reports the adjustments as blackboard events.

use std::collections::BTreeMap;

use crate::events::Update;
use crate::model::{
    LinkView, Resource, ResourceGroup, ResourceGroupChange, ResourceRef, ResourceView,
};

#[derive(Default)]
pub struct Blackboard {
    resources: BTreeMap<String, BTreeMap<String, ResourceGroup>>,
    changed_links: Vec<LinkView>,
    deleted_links: Vec<LinkView>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changed_links.is_empty()
            && self.deleted_links.is_empty()
            && self
                .resources
                .values()
                .all(|tool| tool.values().all(|rg| rg.resources.is_empty()))
    }

    pub fn changed_links(&self) -> &[LinkView] {
        &self.changed_links
    }

    /// All staged resources with their owning group headers.
    pub fn get_resources(&self) -> Vec<(ResourceGroup, Resource)> {
        let mut out = Vec::new();
        for tool in self.resources.values() {
            for rg in tool.values() {
                for res in rg.resources.values() {
                    out.push((rg.header(), res.clone()));
                }
            }
        }
        out
    }

    /// Stage a resource; returns false when it is already staged.
    pub fn add_resource(&mut self, rg: &ResourceGroup, res: &Resource) -> bool {
        let tool = self.resources.entry(rg.tool_id.clone()).or_default();
        let group = tool.entry(rg.url.clone()).or_insert_with(|| rg.header());
        group.add_resource(Resource::new(
            res.name.clone(),
            res.id.clone(),
            res.url.clone(),
        ))
    }

    pub fn remove_resource(&mut self, rr: &ResourceRef) -> bool {
        let Some(group) = self
            .resources
            .get_mut(&rr.tool_id)
            .and_then(|t| t.get_mut(&rr.resource_group_url))
        else {
            return false;
        };
        group.remove_resource(&rr.url)
    }

    pub fn expand_resource(
        &self,
        tool_id: &str,
        group_url: &str,
        url: &str,
    ) -> Option<(ResourceGroup, Resource)> {
        let group = self.resources.get(tool_id)?.get(group_url)?;
        let res = group.resources.get(url)?;
        Some((group.header(), res.clone()))
    }

    /// Add link proposals; a proposal cancels any pending deletion of the
    /// same link. Returns the blackboard events to publish.
    pub fn link_resources(&mut self, links: Vec<LinkView>) -> Vec<Update> {
        let mut updates = Vec::new();
        for link in links {
            let lref = link.link_ref();
            let already_changed = self.changed_links.iter().any(|l| l.same_endpoints(&lref));
            let was_deleted = self.deleted_links.iter().any(|l| l.same_endpoints(&lref));
            if !already_changed {
                self.changed_links.push(link.clone());
                self.deleted_links.retain(|l| !l.same_endpoints(&lref));
                updates.push(Update::AddLink { link });
            } else if was_deleted {
                self.deleted_links.retain(|l| !l.same_endpoints(&lref));
                updates.push(Update::AddLink { link });
            }
        }
        updates
    }

    /// Move proposals to the pending-deletion set.
    pub fn unlink_resources(&mut self, links: &[LinkView]) -> Vec<Update> {
        let mut updates = Vec::new();
        let mut kept = Vec::new();
        for cl in self.changed_links.drain(..) {
            let lref = cl.link_ref();
            if links.iter().any(|l| l.same_endpoints(&lref)) {
                if !self.deleted_links.iter().any(|l| l.same_endpoints(&lref)) {
                    updates.push(Update::RemoveLink { link: cl.clone() });
                    self.deleted_links.push(cl);
                }
            } else {
                kept.push(cl);
            }
        }
        self.changed_links = kept;
        updates
    }

    /// Rewrite staged state after a change set landed on the main branch:
    /// bump staged group versions, drop staged resources that were removed
    /// (with their links), and follow renames. Returns the blackboard
    /// events describing what was adjusted.
    pub fn reconcile(&mut self, change: &ResourceGroupChange) -> Vec<Update> {
        let mut updates = Vec::new();

        let Some(group) = self
            .resources
            .get_mut(&change.tool_id)
            .and_then(|t| t.get_mut(&change.url))
        else {
            return updates;
        };

        if group.version != change.version {
            updates.push(Update::ResourceGroupVersionChanged {
                name: change.name.clone(),
                tool_id: change.tool_id.clone(),
                url: change.url.clone(),
                version: group.version.clone(),
                new_version: change.version.clone(),
            });
            group.version = change.version.clone();
        }

        for rc in change.resources.values() {
            if !group.resources.contains_key(&rc.url) {
                continue;
            }
            if rc.change_type == crate::model::ChangeType::Removed {
                if let Some(res) = group.resources.remove(&rc.url) {
                    let view = ResourceView::new(group, &res);
                    updates.push(Update::RemoveResource {
                        resource: view.clone(),
                    });
                    let removed_ref = view.to_ref();
                    let mut kept = Vec::new();
                    for link in self.changed_links.drain(..) {
                        if link.from_res.to_ref() == removed_ref
                            || link.to_res.to_ref() == removed_ref
                        {
                            updates.push(Update::RemoveLink { link: link.clone() });
                            if !self
                                .deleted_links
                                .iter()
                                .any(|l| l.same_endpoints(&link.link_ref()))
                            {
                                self.deleted_links.push(link);
                            }
                        } else {
                            kept.push(link);
                        }
                    }
                    self.changed_links = kept;
                }
            } else if rc.moves_resource() {
                let old_ref =
                    ResourceRef::new(change.tool_id.clone(), change.url.clone(), rc.url.clone());
                for link in self.changed_links.iter_mut() {
                    let from_matches = link.from_res.to_ref() == old_ref;
                    let to_matches = link.to_res.to_ref() == old_ref;
                    if !from_matches && !to_matches {
                        continue;
                    }
                    let from_old = link.from_res.clone();
                    let to_old = link.to_res.clone();
                    if from_matches {
                        link.from_res.url = rc.new_url.clone();
                        link.from_res.name = rc.new_name.clone();
                        link.from_res.id = rc.new_id.clone();
                    }
                    if to_matches {
                        link.to_res.url = rc.new_url.clone();
                        link.to_res.name = rc.new_name.clone();
                        link.to_res.id = rc.new_id.clone();
                    }
                    updates.push(Update::RenameLink {
                        from_res: from_old,
                        from_res_new: link.from_res.clone(),
                        to_res: to_old,
                        to_res_new: link.to_res.clone(),
                    });
                }
                if let Some(mut res) = group.resources.remove(&rc.url) {
                    res.url = rc.new_url.clone();
                    res.name = rc.new_name.clone();
                    res.id = rc.new_id.clone();
                    group.resources.insert(rc.new_url.clone(), res);
                }
                updates.push(Update::RenameResource { change: rc.clone() });
            }
        }
        updates
    }

    /// Events describing a full clear: staged resources and proposals are
    /// retracted, pending deletions are restored.
    pub fn drain_updates(&self) -> Vec<Update> {
        let mut updates = Vec::new();
        for tool in self.resources.values() {
            for rg in tool.values() {
                for res in rg.resources.values() {
                    updates.push(Update::RemoveResource {
                        resource: ResourceView::new(rg, res),
                    });
                }
            }
        }
        for link in &self.deleted_links {
            updates.push(Update::AddLink { link: link.clone() });
        }
        for link in &self.changed_links {
            updates.push(Update::RemoveLink { link: link.clone() });
        }
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeType, ResourceChange};

    fn group() -> ResourceGroup {
        ResourceGroup::new("testrepo", "git", "rg1", "v0")
    }

    fn res(url: &str) -> Resource {
        Resource::new(url.trim_start_matches('/'), url.trim_start_matches('/'), url)
    }

    fn link(from: &str, to: &str) -> LinkView {
        LinkView::new(
            ResourceView::new(&group(), &res(from)),
            ResourceView::new(&group(), &res(to)),
        )
    }

    #[test]
    fn link_then_unlink_then_relink() {
        let mut bb = Blackboard::new();
        let updates = bb.link_resources(vec![link("/a", "/b")]);
        assert_eq!(updates.len(), 1);
        assert_eq!(bb.changed_links().len(), 1);

        let updates = bb.unlink_resources(&[link("/a", "/b")]);
        assert_eq!(updates.len(), 1);
        assert!(bb.changed_links().is_empty());

        let updates = bb.link_resources(vec![link("/a", "/b")]);
        assert_eq!(updates.len(), 1);
        assert_eq!(bb.changed_links().len(), 1);
        // the pending deletion was cancelled, so only the proposal drains
        assert_eq!(bb.drain_updates().len(), 1);
    }

    #[test]
    fn staged_resources_dedupe() {
        let mut bb = Blackboard::new();
        assert!(bb.add_resource(&group(), &res("/r1")));
        assert!(!bb.add_resource(&group(), &res("/r1")));
        assert_eq!(bb.get_resources().len(), 1);
    }

    #[test]
    fn reconcile_removal_drops_staged_links() {
        let mut bb = Blackboard::new();
        bb.add_resource(&group(), &res("/a"));
        bb.add_resource(&group(), &res("/b"));
        bb.link_resources(vec![link("/a", "/b")]);

        let change = ResourceGroupChange::new("testrepo", "git", "rg1", "v1")
            .with_change(ResourceChange::new("a", "a", "/a", ChangeType::Removed));
        let updates = bb.reconcile(&change);

        assert!(bb.changed_links().is_empty());
        assert_eq!(bb.get_resources().len(), 1);
        // version change + resource removal + link removal
        assert_eq!(updates.len(), 3);
    }

    #[test]
    fn reconcile_rename_rewrites_staged_state() {
        let mut bb = Blackboard::new();
        bb.add_resource(&group(), &res("/a"));
        bb.add_resource(&group(), &res("/b"));
        bb.link_resources(vec![link("/a", "/b")]);

        let change = ResourceGroupChange::new("testrepo", "git", "rg1", "v1").with_change(
            ResourceChange::new("a", "a", "/a", ChangeType::Renamed).renamed_to("a2", "a2", "/a2"),
        );
        let updates = bb.reconcile(&change);

        assert!(bb.expand_resource("git", "rg1", "/a").is_none());
        assert!(bb.expand_resource("git", "rg1", "/a2").is_some());
        assert_eq!(bb.changed_links()[0].from_res.url, "/a2");
        assert!(updates
            .iter()
            .any(|u| matches!(u, Update::RenameLink { .. })));
        assert!(updates
            .iter()
            .any(|u| matches!(u, Update::RenameResource { .. })));
    }

    #[test]
    fn unrelated_group_reconcile_is_a_noop() {
        let mut bb = Blackboard::new();
        bb.add_resource(&group(), &res("/a"));
        let change = ResourceGroupChange::new("other", "git", "rg-other", "v9")
            .with_change(ResourceChange::new("a", "a", "/a", ChangeType::Removed));
        assert!(bb.reconcile(&change).is_empty());
        assert_eq!(bb.get_resources().len(), 1);
    }
}

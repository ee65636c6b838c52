//! Pure propagation routines over a branch's link set, shared by both
//! backends: inferred-dirtiness expansion, inferred-cleanliness walks, and
//! the dependency-graph traversal.
//!
//! All walks carry a visited set keyed on link endpoints or target refs, so
//! cyclic link graphs terminate.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{Link, LinkRef, ResourceRef};

/// Mark `links[target]` dirty and push inferred dirtiness downstream.
///
/// `orig_version` is the source group's version before the change; it is
/// recorded as `last_clean_version` on the first clean-to-dirty transition
/// and on every inferred entry created by this cascade.
pub fn mark_link_dirty(links: &mut [Link], target: usize, orig_version: &str) {
    if !links[target].dirty {
        links[target].last_clean_version = orig_version.to_string();
    }
    links[target].dirty = true;

    let source = links[target].from_res.clone();
    let target_ref = links[target].link_ref();

    let mut by_source: HashMap<ResourceRef, Vec<usize>> = HashMap::new();
    for (i, link) in links.iter().enumerate() {
        by_source.entry(link.from_res.clone()).or_default().push(i);
    }

    let mut visited: HashSet<ResourceRef> = HashSet::new();
    let mut queue: VecDeque<ResourceRef> = VecDeque::new();
    queue.push_back(links[target].to_res.clone());

    while let Some(node) = queue.pop_front() {
        if !visited.insert(node.clone()) {
            continue;
        }
        let Some(indices) = by_source.get(&node) else {
            continue;
        };
        for &i in indices {
            if links[i].same_endpoints(&target_ref) {
                continue;
            }
            if links[i].add_inferred_source(source.clone(), orig_version.to_string()) {
                let next = links[i].to_res.clone();
                if !visited.contains(&next) {
                    queue.push_back(next);
                }
            }
        }
    }
}

/// Remove `source` from the inferred set of the link matching `start`, and,
/// when `propagate` is set, of every link reachable downstream from it.
/// Returns the `(link, source)` pairs actually cleaned.
pub fn clean_inferred(
    links: &mut [Link],
    start: &LinkRef,
    source: &ResourceRef,
    propagate: bool,
) -> Vec<(LinkRef, ResourceRef)> {
    let Some(target) = links.iter().position(|l| l.same_endpoints(start)) else {
        return Vec::new();
    };

    let mut cleaned = Vec::new();
    if !propagate {
        if links[target].remove_inferred_source(source) > 0 {
            cleaned.push((links[target].link_ref(), source.clone()));
        }
        return cleaned;
    }

    let mut processed: HashSet<LinkRef> = HashSet::new();
    let mut queue: VecDeque<usize> = VecDeque::new();
    queue.push_back(target);

    while let Some(i) = queue.pop_front() {
        if !processed.insert(links[i].link_ref()) {
            continue;
        }
        if links[i].remove_inferred_source(source) > 0 {
            cleaned.push((links[i].link_ref(), source.clone()));
        }
        let to = links[i].to_res.clone();
        for (j, link) in links.iter().enumerate() {
            if link.from_res == to && !processed.contains(&link.link_ref()) {
                queue.push_back(j);
            }
        }
    }
    cleaned
}

/// Breadth-first dependency traversal from `seed`. When `upstream` is set
/// the walk follows inbound edges (`to == current`), otherwise outbound
/// edges. Returns link indices in visit order; `max_depth <= 0` is
/// unbounded. Deleted links are never followed.
pub fn dependency_graph(
    links: &[Link],
    seed: &ResourceRef,
    upstream: bool,
    max_depth: i32,
) -> Vec<usize> {
    let neighbors = |rr: &ResourceRef| -> Vec<usize> {
        links
            .iter()
            .enumerate()
            .filter(|(_, l)| {
                !l.deleted && if upstream { l.to_res == *rr } else { l.from_res == *rr }
            })
            .map(|(i, _)| i)
            .collect()
    };

    let mut processed: HashSet<usize> = HashSet::new();
    let mut result = Vec::new();
    let mut work: Vec<(usize, i32)> = neighbors(seed).into_iter().map(|i| (i, 1)).collect();

    while !work.is_empty() {
        let mut next_work = Vec::new();
        for (i, depth) in work {
            if processed.contains(&i) || (max_depth > 0 && depth > max_depth) {
                continue;
            }
            processed.insert(i);
            result.push(i);
            let search = if upstream {
                links[i].from_res.clone()
            } else {
                links[i].to_res.clone()
            };
            for j in neighbors(&search) {
                if !processed.contains(&j) {
                    next_work.push((j, depth + 1));
                }
            }
        }
        work = next_work;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rr(url: &str) -> ResourceRef {
        ResourceRef::new("git", "rg1", url)
    }

    fn chain(urls: &[&str]) -> Vec<Link> {
        urls.windows(2)
            .map(|w| Link::new(rr(w[0]), rr(w[1])))
            .collect()
    }

    #[test]
    fn dirty_propagates_inferred_downstream() {
        let mut links = chain(&["/r1", "/r2", "/r3", "/r4", "/r5"]);
        // dirty r2 -> r3
        mark_link_dirty(&mut links, 1, "v0");

        assert!(links[1].dirty);
        assert_eq!(links[1].last_clean_version, "v0");
        assert!(links[1].inferred_dirtiness.is_empty());
        for i in [2, 3] {
            assert!(!links[i].dirty);
            assert_eq!(links[i].inferred_dirtiness.len(), 1);
            assert_eq!(links[i].inferred_dirtiness[0].source, rr("/r2"));
            assert_eq!(links[i].inferred_dirtiness[0].last_clean_version, "v0");
        }
        assert!(links[0].inferred_dirtiness.is_empty());
    }

    #[test]
    fn dirty_terminates_on_cycles() {
        let mut links = vec![
            Link::new(rr("/a"), rr("/b")),
            Link::new(rr("/b"), rr("/c")),
            Link::new(rr("/c"), rr("/a")),
        ];
        mark_link_dirty(&mut links, 0, "v1");
        assert!(links[0].dirty);
        assert_eq!(links[1].inferred_dirtiness.len(), 1);
        assert_eq!(links[2].inferred_dirtiness.len(), 1);
    }

    #[test]
    fn clean_inferred_walks_downstream() {
        let mut links = chain(&["/r1", "/r2", "/r3", "/r4", "/r5"]);
        mark_link_dirty(&mut links, 1, "v0");

        let start = links[1].link_ref();
        let cleaned = clean_inferred(&mut links, &start, &rr("/r2"), true);
        assert_eq!(cleaned.len(), 2);
        assert!(links.iter().all(|l| l.inferred_dirtiness.is_empty()));
    }

    #[test]
    fn clean_inferred_without_propagation_stops_at_target() {
        let mut links = chain(&["/r1", "/r2", "/r3", "/r4", "/r5"]);
        mark_link_dirty(&mut links, 1, "v0");

        let start = links[2].link_ref();
        let cleaned = clean_inferred(&mut links, &start, &rr("/r2"), false);
        assert_eq!(cleaned.len(), 1);
        assert!(links[2].inferred_dirtiness.is_empty());
        assert_eq!(links[3].inferred_dirtiness.len(), 1);
    }

    #[test]
    fn traversal_respects_depth_bound() {
        let links = chain(&["/r1", "/r2", "/r3", "/r4", "/r5"]);
        let visited = dependency_graph(&links, &rr("/r1"), false, 2);
        assert_eq!(visited, vec![0, 1]);

        let unbounded = dependency_graph(&links, &rr("/r1"), false, 0);
        assert_eq!(unbounded.len(), 4);
    }

    #[test]
    fn upstream_traversal_follows_inbound_edges() {
        let links = chain(&["/r1", "/r2", "/r3"]);
        let visited = dependency_graph(&links, &rr("/r3"), true, 0);
        assert_eq!(visited, vec![1, 0]);
    }
}

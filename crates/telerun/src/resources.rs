//! # Resource Graph
//!
//! Tracks which service vended which remote resource, so that releasing a
//! resource (or disposing its owner) tears down everything below it.
//!
//! ## Design
//!
//! An arena: a flat map from resource id to node, plus a child index keyed by
//! parent id. Nodes refer to each other by id only. Disposal is an explicit
//! walk that returns what it removed.
//!
//! ## Invariants
//! - The graph is a forest. An insert that would close a cycle is refused.
//! - A node is removed at most once. Its `ResourceState` is marked consumed
//!   when it is removed.
//! - A parent need not be a node itself: top-level services own resources
//!   without being resources.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use telerpc::RouteId;
use telerpc::ServiceId;

use crate::error::Error;
use crate::error::Result;

/// Shared between the engine and the proxy handed to user code.
#[derive(Debug, Default)]
pub struct ResourceState {
    consumed: AtomicBool,
}

impl ResourceState {
    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    /// Returns `true` for the call that flipped the flag.
    pub fn mark_consumed(&self) -> bool {
        !self.consumed.swap(true, Ordering::AcqRel)
    }
}

struct Node {
    parent: ServiceId,
    route: RouteId,
    state: Arc<ResourceState>,
}

/// A resource removed from the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub service: ServiceId,
    pub route: RouteId,
}

#[derive(Default)]
pub struct ResourceGraph {
    nodes: HashMap<ServiceId, Node>,
    children: HashMap<ServiceId, HashSet<ServiceId>>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `parent` vended `child`, reachable over `route`.
    ///
    /// Registering the same child twice returns the existing state.
    pub fn insert(&mut self, parent: &ServiceId, child: &ServiceId, route: &RouteId) -> Result<Arc<ResourceState>> {
        if let Some(node) = self.nodes.get(child) {
            return Ok(node.state.clone());
        }
        if self.is_ancestor_or_self(child, parent) {
            return Err(Error::Protocol(format!("resource {} cannot be owned by its descendant {}", child, parent)));
        }

        let state = Arc::new(ResourceState::default());
        self.nodes.insert(child.clone(), Node {
            parent: parent.clone(),
            route: route.clone(),
            state: state.clone(),
        });
        self.children.entry(parent.clone()).or_default().insert(child.clone());
        Ok(state)
    }

    fn is_ancestor_or_self(&self, candidate: &ServiceId, of: &ServiceId) -> bool {
        let mut current = Some(of);
        while let Some(id) = current {
            if id == candidate {
                return true;
            }
            current = self.nodes.get(id).map(|n| &n.parent);
        }
        false
    }

    pub fn contains(&self, service: &ServiceId) -> bool {
        self.nodes.contains_key(service)
    }

    pub fn parent_of(&self, service: &ServiceId) -> Option<&ServiceId> {
        self.nodes.get(service).map(|n| &n.parent)
    }

    pub fn children_of(&self, parent: &ServiceId) -> Vec<ServiceId> {
        self.children.get(parent).map(|c| c.iter().cloned().collect()).unwrap_or_default()
    }

    /// Removes `service` and all its descendants, descendants first.
    ///
    /// Returns nothing if `service` is not a registered resource.
    pub fn remove_subtree(&mut self, service: &ServiceId) -> Vec<Removed> {
        let Some(node) = self.nodes.get(service) else {
            return Vec::new();
        };

        let parent = node.parent.clone();
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.remove(service);
            if siblings.is_empty() {
                self.children.remove(&parent);
            }
        }

        let mut removed = Vec::new();
        self.remove_detached(service, &mut removed);
        removed
    }

    /// Removes every resource `parent` vended, leaving `parent` itself in place.
    pub fn remove_children(&mut self, parent: &ServiceId) -> Vec<Removed> {
        let mut removed = Vec::new();
        for child in self.children.remove(parent).unwrap_or_default() {
            self.remove_detached(&child, &mut removed);
        }
        removed
    }

    /// Post-order removal of a node already unlinked from its parent.
    fn remove_detached(&mut self, root: &ServiceId, removed: &mut Vec<Removed>) {
        // (id, children already expanded)
        let mut stack = vec![(root.clone(), false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                if let Some(node) = self.nodes.remove(&id) {
                    node.state.mark_consumed();
                    removed.push(Removed { service: id, route: node.route });
                }
                continue;
            }
            let kids = self.children.remove(&id).unwrap_or_default();
            stack.push((id, true));
            stack.extend(kids.into_iter().map(|k| (k, false)));
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

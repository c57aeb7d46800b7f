use std::collections::{BTreeSet, HashMap};

use crate::app::resource::{normalize_path, Resource, ResourceState};

/// One live resource: its state plus the handler that renders it.
pub(crate) struct ResourceNode<Endpoint: Send + Sync + 'static> {
    pub state: ResourceState,
    pub handler: Box<dyn Resource<Endpoint>>,
}

/// Path indexed resource tree.  Nodes live in a flat map keyed by normalized path (`""` is
/// the root); a second map indexes each path's direct children.  Intermediate paths that
/// exist only to connect deeper resources are placeholders (`None`) and are invisible to
/// lookups.
pub(crate) struct ResourceTree<Endpoint: Send + Sync + 'static> {
    nodes: HashMap<String, Option<ResourceNode<Endpoint>>>,
    children: HashMap<String, BTreeSet<String>>,
}

fn parent_of(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map_or("", |(parent, _)| parent))
}

impl<Endpoint: Send + Sync + 'static> ResourceTree<Endpoint> {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(String::new(), None);
        Self {
            nodes,
            children: HashMap::new(),
        }
    }

    /// Inserts (or replaces) a resource, creating placeholders for missing ancestors.
    pub fn insert(&mut self, state: ResourceState, handler: Box<dyn Resource<Endpoint>>) {
        let path = state.path().to_string();
        self.ensure_linked(&path);
        self.nodes
            .insert(path, Some(ResourceNode { state, handler }));
    }

    fn ensure_linked(&mut self, path: &str) {
        let mut current = path.to_string();
        while let Some(parent) = parent_of(&current).map(str::to_string) {
            let newly_linked = self
                .children
                .entry(parent.clone())
                .or_default()
                .insert(current.clone());
            self.nodes.entry(current.clone()).or_insert(None);
            if !newly_linked {
                break;
            }
            current = parent;
        }
    }

    pub fn get(&self, path: &str) -> Option<&ResourceNode<Endpoint>> {
        self.nodes.get(path).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut ResourceNode<Endpoint>> {
        self.nodes.get_mut(path).and_then(Option::as_mut)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Copies out what a handler needs so that no lock is held while it runs.
    pub fn snapshot(&self, path: &str) -> Option<(ResourceState, Box<dyn Resource<Endpoint>>)> {
        self.get(path)
            .map(|node| (node.state.clone(), dyn_clone::clone_box(&*node.handler)))
    }

    /// Longest-prefix routing for POST to a missing path: the nearest existing ancestor
    /// resource, provided it allows children.  Returns the ancestor's path and the number of
    /// path segments it matched.
    pub fn creation_parent(&self, path: &str) -> Option<(String, usize)> {
        let path = normalize_path(path);
        let mut current = parent_of(&path);
        while let Some(candidate) = current {
            if let Some(node) = self.get(candidate) {
                if !node.state.allows_children() {
                    return None;
                }
                let matched = candidate.split('/').filter(|s| !s.is_empty()).count();
                return Some((candidate.to_string(), matched));
            }
            current = parent_of(candidate);
        }
        None
    }

    /// Replaces the state of an existing resource, keeping tree-managed fields intact.
    pub fn update(&mut self, mut state: ResourceState) -> bool {
        let path = state.path().to_string();
        match self.get_mut(&path) {
            Some(node) => {
                state.adopt_managed_fields(&node.state);
                node.state = state;
                true
            }
            None => false,
        }
    }

    /// Real resources at or below `path`, parents before children.
    pub fn subtree_paths(&self, path: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(path, &mut |p, node| {
            if node.is_some() {
                out.push(p.to_string());
            }
        });
        out
    }

    fn walk<F>(&self, path: &str, visit: &mut F)
    where
        F: FnMut(&str, Option<&ResourceNode<Endpoint>>),
    {
        if let Some(node) = self.nodes.get(path) {
            visit(path, node.as_ref());
        }
        if let Some(children) = self.children.get(path) {
            for child in children {
                self.walk(child, visit);
            }
        }
    }

    /// Every real resource in depth-first, lexicographic traversal order.
    pub fn traverse(&self) -> Vec<&ResourceNode<Endpoint>> {
        let mut out = Vec::new();
        self.collect(&String::new(), &mut out);
        out
    }

    fn collect<'a>(&'a self, path: &str, out: &mut Vec<&'a ResourceNode<Endpoint>>) {
        if let Some(Some(node)) = self.nodes.get(path) {
            out.push(node);
        }
        if let Some(children) = self.children.get(path) {
            for child in children {
                self.collect(child, out);
            }
        }
    }

    /// Removes `path` and everything below it, then prunes ancestors that were left as empty
    /// placeholders.  Returns the real resources that were removed.
    pub fn remove_subtree(&mut self, path: &str) -> Vec<String> {
        let removed = self.subtree_paths(path);
        let mut all = Vec::new();
        self.walk(path, &mut |p, _| all.push(p.to_string()));
        for p in &all {
            self.nodes.remove(p);
            self.children.remove(p);
        }
        if path.is_empty() {
            self.nodes.insert(String::new(), None);
            return removed;
        }

        let mut current = path.to_string();
        while let Some(parent) = parent_of(&current).map(str::to_string) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(&current);
                if siblings.is_empty() {
                    self.children.remove(&parent);
                }
            }
            let prunable = !parent.is_empty()
                && matches!(self.nodes.get(&parent), Some(None))
                && !self.children.contains_key(&parent);
            if !prunable {
                break;
            }
            self.nodes.remove(&parent);
            current = parent;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.nodes.values().filter(|node| node.is_some()).count()
    }
}

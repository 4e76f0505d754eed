//! Requires/provides relation between resources.

use std::collections::{HashMap, HashSet};

use keel_core::ResourceIdStr;

/// Edge sets keyed by resource id.
pub type RequiresMap = HashMap<ResourceIdStr, HashSet<ResourceIdStr>>;

/// Bidirectional view of the dependency graph of the current model.
///
/// `requires[a]` holds what `a` depends on; `provides[b]` holds what depends
/// on `b`. Both directions are kept in sync by every mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequiresProvides {
    requires: RequiresMap,
    provides: RequiresMap,
}

impl RequiresProvides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_requires(requires: &RequiresMap) -> Self {
        let mut graph = Self::new();
        for (resource, deps) in requires {
            graph.update_requires(resource, deps.clone());
        }
        graph
    }

    pub fn requires_of<'a>(
        &'a self,
        resource: &str,
    ) -> impl Iterator<Item = &'a ResourceIdStr> + use<'a> {
        self.requires.get(resource).into_iter().flatten()
    }

    pub fn provides_of<'a>(
        &'a self,
        resource: &str,
    ) -> impl Iterator<Item = &'a ResourceIdStr> + use<'a> {
        self.provides.get(resource).into_iter().flatten()
    }

    pub fn requires_set(&self, resource: &str) -> HashSet<ResourceIdStr> {
        self.requires_of(resource).cloned().collect()
    }

    /// Replace the requirements of `resource`. Returns `(added, dropped)`.
    pub fn update_requires(
        &mut self,
        resource: &str,
        new: HashSet<ResourceIdStr>,
    ) -> (HashSet<ResourceIdStr>, HashSet<ResourceIdStr>) {
        let old = self.requires.remove(resource).unwrap_or_default();
        let added: HashSet<ResourceIdStr> = new.difference(&old).cloned().collect();
        let dropped: HashSet<ResourceIdStr> = old.difference(&new).cloned().collect();

        for dep in &dropped {
            self.unlink_provides(dep, resource);
        }
        for dep in &added {
            self.provides
                .entry(dep.clone())
                .or_default()
                .insert(resource.to_string());
        }
        if !new.is_empty() {
            self.requires.insert(resource.to_string(), new);
        }
        (added, dropped)
    }

    /// Drop the outgoing edges of `resource`, returning its former requirements.
    ///
    /// Incoming edges belong to the dependants and stay until they are updated.
    pub fn remove(&mut self, resource: &str) -> HashSet<ResourceIdStr> {
        let (_, dropped) = self.update_requires(resource, HashSet::new());
        dropped
    }

    fn unlink_provides(&mut self, dep: &str, resource: &str) {
        if let Some(dependants) = self.provides.get_mut(dep) {
            dependants.remove(resource);
            if dependants.is_empty() {
                self.provides.remove(dep);
            }
        }
    }

    /// Every resource reachable from `roots` through `provides`, roots included.
    pub fn transitive_dependants<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a ResourceIdStr>,
    ) -> HashSet<ResourceIdStr> {
        let mut seen: HashSet<ResourceIdStr> = HashSet::new();
        let mut stack: Vec<ResourceIdStr> = roots.into_iter().cloned().collect();
        while let Some(resource) = stack.pop() {
            if !seen.insert(resource.clone()) {
                continue;
            }
            stack.extend(self.provides_of(&resource).cloned());
        }
        seen
    }

    /// Find a dependency cycle, if any. The returned path starts and ends
    /// with the same resource.
    pub fn find_cycle(&self) -> Option<Vec<ResourceIdStr>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut roots: Vec<&str> = self.requires.keys().map(String::as_str).collect();
        roots.sort_unstable();

        for root in roots {
            if marks.contains_key(root) {
                continue;
            }
            marks.insert(root, Mark::Visiting);
            let mut stack: Vec<(&str, Vec<&str>)> = vec![(root, self.sorted_requires(root))];

            loop {
                let Some(top) = stack.last_mut() else {
                    break;
                };
                let node = top.0;
                match top.1.pop() {
                    Some(next) => match marks.get(next) {
                        Some(Mark::Visiting) => {
                            let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                            let mut cycle: Vec<ResourceIdStr> =
                                stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                            cycle.push(next.to_string());
                            return Some(cycle);
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(next, Mark::Visiting);
                            stack.push((next, self.sorted_requires(next)));
                        }
                    },
                    None => {
                        marks.insert(node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    fn sorted_requires(&self, resource: &str) -> Vec<&str> {
        let mut deps: Vec<&str> = self.requires_of(resource).map(String::as_str).collect();
        // Popped from the back, so visit in ascending order.
        deps.sort_unstable_by(|a, b| b.cmp(a));
        deps
    }
}

//! Department tree traversal.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::value::Id;

/// Direction of a tree walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow children: edges whose `parent_id` is the current node.
    Descendants,
    /// Follow parents: the mirrored comparison.
    Ancestors,
}

/// One `(id, parent_id)` row of the department projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeptEdge {
    pub id: Id,
    pub parent_id: Option<Id>,
}

/// In-memory department projection, fetched once and walked many times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeptTree {
    edges: Vec<DeptEdge>,
}

impl DeptTree {
    pub fn new(edges: Vec<DeptEdge>) -> Self {
        Self { edges }
    }

    pub fn contains(&self, id: Id) -> bool {
        self.edges.iter().any(|edge| edge.id == id)
    }

    /// All ids reachable from `root` in `direction`, including `root`.
    ///
    /// A root missing from the projection yields the empty set. Cyclic
    /// parent links terminate; each id appears once.
    pub fn resolve(&self, root: Id, direction: Direction) -> BTreeSet<Id> {
        let mut visited = BTreeSet::new();
        if !self.contains(root) {
            return visited;
        }
        visited.insert(root);
        let mut pending = vec![root];
        while let Some(current) = pending.pop() {
            for edge in &self.edges {
                let (compared, next) = match direction {
                    Direction::Descendants => (edge.parent_id, Some(edge.id)),
                    Direction::Ancestors => (Some(edge.id), edge.parent_id),
                };
                if compared != Some(current) {
                    continue;
                }
                if let Some(next) = next {
                    if self.contains(next) && visited.insert(next) {
                        pending.push(next);
                    }
                }
            }
        }
        visited
    }

    /// Union of [`DeptTree::resolve`] over several roots.
    pub fn resolve_many(
        &self,
        roots: impl IntoIterator<Item = Id>,
        direction: Direction,
    ) -> BTreeSet<Id> {
        roots
            .into_iter()
            .flat_map(|root| self.resolve(root, direction))
            .collect()
    }
}

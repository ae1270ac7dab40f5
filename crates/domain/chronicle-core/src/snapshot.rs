use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::record::{Attributes, Fact, NaturalKey};
use crate::TargetId;

/// One observed object, possibly containing others (e.g. a container and its contents).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: String,
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SnapshotNode>,
}

impl SnapshotNode {
    pub fn leaf(id: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            id: id.into(),
            attributes,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<SnapshotNode>) -> Self {
        self.children = children;
        self
    }
}

/// A freshly fetched view of one endpoint for one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub roots: Vec<SnapshotNode>,
}

impl Snapshot {
    pub fn new(roots: Vec<SnapshotNode>) -> Self {
        Self { roots }
    }

    /// Breadth-first walk producing one candidate fact per observation.
    ///
    /// Roots have no holder; every child's key is held by its parent's id.
    pub fn flatten(&self, kind: &str, target: TargetId) -> Vec<Fact> {
        let mut out = Vec::new();
        let mut queue: VecDeque<(Option<&str>, &SnapshotNode)> =
            self.roots.iter().map(|n| (None, n)).collect();

        while let Some((holder, node)) = queue.pop_front() {
            let key = NaturalKey {
                holder: holder.map(str::to_string),
                id: node.id.clone(),
            };
            out.push(Fact::observed(kind, target, key, node.attributes.clone()));
            queue.extend(node.children.iter().map(|c| (Some(node.id.as_str()), c)));
        }
        out
    }

    pub fn len(&self) -> usize {
        fn count(nodes: &[SnapshotNode]) -> usize {
            nodes.iter().map(|n| 1 + count(&n.children)).sum()
        }
        count(&self.roots)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{ConsistencyError, LookupError};

/// Index of a node in its [`NodeTree`].
pub type NodeId = usize;

/// Index of a split reference in its [`SplitTable`].
pub type SplitId = usize;

/// One unit in the geographic/demographic hierarchy being fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
}

/// The node forest for a cascade, loaded once per run and never mutated
/// while jobs execute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTree {
    nodes: Vec<Node>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node and return its id. Parent ids must refer to nodes
    /// already in the tree.
    pub fn add(&mut self, name: &str, parent: Option<NodeId>) -> NodeId {
        debug_assert!(parent.map_or(true, |p| p < self.nodes.len()));
        self.nodes.push(Node {
            name: name.to_string(),
            parent,
        });
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate()
    }

    pub fn name(&self, id: NodeId) -> Result<&str, LookupError> {
        self.nodes
            .get(id)
            .map(|n| n.name.as_str())
            .ok_or(LookupError::TableRow { table: "node", id })
    }

    pub fn node_id(&self, name: &str) -> Result<NodeId, LookupError> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| LookupError::NodeName {
                name: name.to_string(),
            })
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    /// Ids of the direct children of `id`, in table order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.parent == Some(id))
            .map(|(child_id, _)| child_id)
            .collect()
    }

    /// True when `ancestor` is reachable from `node` by walking parents.
    /// A node counts as its own ancestor.
    pub fn is_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// The node ids from `root` down to `node` inclusive.
    pub fn path_from(&self, root: NodeId, node: NodeId) -> Result<Vec<NodeId>, ConsistencyError> {
        let mut path = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            path.push(id);
            if id == root {
                path.reverse();
                return Ok(path);
            }
            current = self.parent(id);
        }
        Err(ConsistencyError::NotADescendant {
            node: self.name(node).unwrap_or("?").to_string(),
            root: self.name(root).unwrap_or("?").to_string(),
        })
    }
}

/// An orthogonal categorical dimension (e.g. sex) a node's fit may be
/// divided along. The covariate value is what the split pins the
/// corresponding covariate to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitReference {
    pub name: String,
    pub covariate_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitTable {
    refs: Vec<SplitReference>,
}

impl SplitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, covariate_value: f64) -> SplitId {
        self.refs.push(SplitReference {
            name: name.to_string(),
            covariate_value,
        });
        self.refs.len() - 1
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn get(&self, id: SplitId) -> Option<&SplitReference> {
        self.refs.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SplitId, &SplitReference)> {
        self.refs.iter().enumerate()
    }

    pub fn name(&self, id: SplitId) -> Result<&str, LookupError> {
        self.refs
            .get(id)
            .map(|r| r.name.as_str())
            .ok_or(LookupError::TableRow {
                table: "split_reference",
                id,
            })
    }

    pub fn split_id(&self, name: &str) -> Result<SplitId, LookupError> {
        self.refs
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| LookupError::SplitName {
                name: name.to_string(),
            })
    }
}

impl fmt::Display for SplitReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.covariate_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> NodeTree {
        let mut tree = NodeTree::new();
        let world = tree.add("world", None);
        let europe = tree.add("europe", Some(world));
        tree.add("asia", Some(world));
        tree.add("france", Some(europe));
        tree.add("spain", Some(europe));
        tree
    }

    #[test]
    fn children_in_table_order() {
        let tree = sample_tree();
        let europe = tree.node_id("europe").unwrap();
        let names: Vec<&str> = tree
            .children(europe)
            .into_iter()
            .map(|id| tree.name(id).unwrap())
            .collect();
        assert_eq!(names, vec!["france", "spain"]);
    }

    #[test]
    fn descendant_walk() {
        let tree = sample_tree();
        let world = tree.node_id("world").unwrap();
        let france = tree.node_id("france").unwrap();
        let asia = tree.node_id("asia").unwrap();

        assert!(tree.is_descendant(france, world));
        assert!(tree.is_descendant(world, world));
        assert!(!tree.is_descendant(france, asia));
    }

    #[test]
    fn path_from_root() {
        let tree = sample_tree();
        let world = tree.node_id("world").unwrap();
        let france = tree.node_id("france").unwrap();

        let path = tree.path_from(world, france).unwrap();
        let names: Vec<&str> = path.iter().map(|&id| tree.name(id).unwrap()).collect();
        assert_eq!(names, vec!["world", "europe", "france"]);
    }

    #[test]
    fn path_rejects_non_descendant() {
        let tree = sample_tree();
        let europe = tree.node_id("europe").unwrap();
        let asia = tree.node_id("asia").unwrap();

        let result = tree.path_from(europe, asia);
        assert!(matches!(
            result,
            Err(ConsistencyError::NotADescendant { .. })
        ));
    }

    #[test]
    fn split_table_lookup() {
        let mut splits = SplitTable::new();
        splits.add("both", 0.0);
        let female = splits.add("female", -0.5);
        splits.add("male", 0.5);

        assert_eq!(splits.split_id("female").unwrap(), female);
        assert_eq!(splits.name(female).unwrap(), "female");
        assert!(splits.split_id("other").is_err());
    }
}

//! On-disk layout of per-job databases.
//!
//! Directories nest by node name from the root down to the fit node, with
//! one extra segment where the split dimension becomes active. The mapping
//! from (node, split) to path is injective over the reachable job space and
//! stable across reruns.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rc_types::{CascadeResult, ConsistencyError, NodeId, NodeTree, SplitId, SplitTable};

use crate::store::FIT_DB_FILE;

/// Resolves job identities to database locations.
#[derive(Debug, Clone)]
pub struct DatabaseLayout {
    result_dir: PathBuf,
    tree: Arc<NodeTree>,
    splits: SplitTable,
    split_nodes: HashSet<NodeId>,
    root_node_id: NodeId,
    root_split_id: Option<SplitId>,
}

impl DatabaseLayout {
    /// Build a layout for one cascade run.
    ///
    /// Rejects a split reference named identically to any node: such a name
    /// could make two distinct jobs resolve to the same path.
    pub fn new(
        result_dir: impl AsRef<Path>,
        tree: Arc<NodeTree>,
        splits: SplitTable,
        split_nodes: HashSet<NodeId>,
        root_node_id: NodeId,
        root_split_id: Option<SplitId>,
    ) -> CascadeResult<Self> {
        for (_, split) in splits.iter() {
            if tree.iter().any(|(_, node)| node.name == split.name) {
                return Err(ConsistencyError::AmbiguousLayout {
                    name: split.name.clone(),
                }
                .into());
            }
        }
        Ok(Self {
            result_dir: result_dir.as_ref().to_path_buf(),
            tree,
            splits,
            split_nodes,
            root_node_id,
            root_split_id,
        })
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    pub fn root_node_id(&self) -> NodeId {
        self.root_node_id
    }

    pub fn root_split_id(&self) -> Option<SplitId> {
        self.root_split_id
    }

    /// Directory for the job fitting (`fit_node_id`, `fit_split_id`).
    ///
    /// Fails when the fit node is not a descendant of the root, or when the
    /// job's split differs from the root's but no split-enabled node lies on
    /// the path (no such job is reachable from the root).
    pub fn resolve_dir(
        &self,
        fit_node_id: NodeId,
        fit_split_id: Option<SplitId>,
    ) -> CascadeResult<PathBuf> {
        let path = self.tree.path_from(self.root_node_id, fit_node_id)?;
        let split_differs = fit_split_id != self.root_split_id;

        // The split segment goes directly below the first split-enabled
        // ancestor (fit node inclusive) walking upward, i.e. the deepest
        // split-enabled node on the path.
        let insert_after = if split_differs {
            match path.iter().rposition(|id| self.split_nodes.contains(id)) {
                Some(index) => Some(index),
                None => {
                    return Err(self.split_not_on_path(fit_node_id, fit_split_id).into());
                }
            }
        } else {
            None
        };

        let mut dir = self.result_dir.clone();
        for (index, &node_id) in path.iter().enumerate() {
            dir.push(self.tree.name(node_id)?);
            if insert_after == Some(index) {
                match fit_split_id {
                    Some(split_id) => dir.push(self.splits.name(split_id)?),
                    None => {
                        return Err(self.split_not_on_path(fit_node_id, fit_split_id).into());
                    }
                }
            }
        }
        Ok(dir)
    }

    /// Database file path for a job.
    pub fn resolve_db(
        &self,
        fit_node_id: NodeId,
        fit_split_id: Option<SplitId>,
    ) -> CascadeResult<PathBuf> {
        Ok(self.resolve_dir(fit_node_id, fit_split_id)?.join(FIT_DB_FILE))
    }

    fn split_not_on_path(
        &self,
        fit_node_id: NodeId,
        fit_split_id: Option<SplitId>,
    ) -> ConsistencyError {
        let node = self
            .tree
            .name(fit_node_id)
            .unwrap_or("?")
            .to_string();
        let split = fit_split_id
            .and_then(|id| self.splits.name(id).ok())
            .unwrap_or("<none>")
            .to_string();
        ConsistencyError::SplitNotOnPath { node, split }
    }
}
